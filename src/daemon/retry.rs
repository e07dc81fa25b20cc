use std::time::Duration;

use crate::models::{DaemonConfig, TransferSpec};

/// rsync exit codes worth another attempt: socket, protocol, partial
/// transfer, vanished files, and timeout errors.
const RSYNC_RETRYABLE_CODES: &[i32] = &[10, 12, 23, 24, 30, 35, 255];

/// rclone: temporary error, a retry may succeed.
const RCLONE_RETRYABLE_CODES: &[i32] = &[5];

/// Lower-cased stderr fragments that indicate a transient network failure.
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection timed out",
    "timed out",
    "broken pipe",
    "network is unreachable",
    "temporary failure in name resolution",
    "no route to host",
];

/// Exponential backoff between automatic retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }

    /// `min(base * 2^(attempt-1), cap)` for attempt = 1, 2, 3, ...
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Whether a failed attempt is worth retrying.
pub fn is_retryable(transfer: &TransferSpec, exit_code: i32, stderr_tail: &[String]) -> bool {
    let codes = match transfer {
        TransferSpec::Rsync { .. } => RSYNC_RETRYABLE_CODES,
        TransferSpec::Rclone { .. } => RCLONE_RETRYABLE_CODES,
    };
    if codes.contains(&exit_code) {
        return true;
    }
    stderr_tail.iter().any(|line| {
        let line = line.to_lowercase();
        TRANSIENT_PATTERNS.iter().any(|p| line.contains(p))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationType, RcloneOptions};

    fn rclone() -> TransferSpec {
        TransferSpec::Rclone {
            operation: OperationType::Copy,
            options: RcloneOptions::default(),
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy::default();
        let secs: Vec<u64> = (1..=9).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn test_backoff_never_overflows() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(100), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
        // Attempt zero is treated like the first retry.
        assert_eq!(policy.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_from_config() {
        let config = DaemonConfig {
            backoff_base_ms: 10,
            backoff_cap_secs: 1,
            ..DaemonConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_rsync_codes() {
        let rsync = TransferSpec::default();
        for code in [10, 12, 23, 24, 30, 35, 255] {
            assert!(is_retryable(&rsync, code, &[]), "code {}", code);
        }
        for code in [1, 2, 3, 11, 20] {
            assert!(!is_retryable(&rsync, code, &[]), "code {}", code);
        }
    }

    #[test]
    fn test_rclone_codes() {
        assert!(is_retryable(&rclone(), 5, &[]));
        assert!(!is_retryable(&rclone(), 1, &[]));
        assert!(!is_retryable(&rclone(), 23, &[]));
    }

    #[test]
    fn test_network_patterns_in_stderr() {
        let tail = vec![
            "rsync: connection unexpectedly closed".to_string(),
            "ssh: connect to host nas port 22: Connection refused".to_string(),
        ];
        assert!(is_retryable(&TransferSpec::default(), 1, &tail));

        let tail = vec!["Failed to copy: Broken pipe".to_string()];
        assert!(is_retryable(&rclone(), 1, &tail));

        let tail = vec!["rsync: change_dir \"/nope\" failed: No such file".to_string()];
        assert!(!is_retryable(&TransferSpec::default(), 3, &tail));
    }
}
