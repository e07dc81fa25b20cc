//! Progress extraction from rsync and rclone output. Lines that do not look
//! like progress yield `None`; nothing here can fail a job.

use chrono::Utc;

use crate::models::progress::{PHASE_SCANNING, PHASE_TRANSFERRING};
use crate::models::{Progress, TransferSpec};

/// Fields recovered from one output line. `None` leaves the current value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percent: Option<u8>,
    pub bytes_transferred: Option<u64>,
    pub total_bytes: Option<u64>,
    pub files_transferred: Option<u64>,
    pub files_total: Option<u64>,
    pub rate: Option<String>,
    pub eta: Option<String>,
    pub phase: Option<&'static str>,
}

impl ProgressUpdate {
    pub fn apply(self, progress: &mut Progress) {
        if let Some(percent) = self.percent {
            progress.percent = percent.min(100);
        }
        if let Some(bytes) = self.bytes_transferred {
            progress.bytes_transferred = bytes;
        }
        if self.total_bytes.is_some() {
            progress.total_bytes = self.total_bytes;
        }
        if self.files_transferred.is_some() {
            progress.files_transferred = self.files_transferred;
        }
        if self.files_total.is_some() {
            progress.files_total = self.files_total;
        }
        if self.rate.is_some() {
            progress.rate = self.rate;
        }
        if self.eta.is_some() {
            progress.eta = self.eta;
        }
        if let Some(phase) = self.phase {
            progress.phase = phase.to_string();
        }
        progress.updated_at = Utc::now();
    }
}

pub fn parse_line(transfer: &TransferSpec, line: &str) -> Option<ProgressUpdate> {
    match transfer {
        TransferSpec::Rsync { .. } => parse_rsync(line),
        TransferSpec::Rclone { .. } => parse_rclone(line),
    }
}

fn parse_rsync(line: &str) -> Option<ProgressUpdate> {
    let line = line.trim();
    if line.starts_with("sending incremental file list")
        || line.starts_with("building file list")
        || line.starts_with("receiving incremental file list")
    {
        return Some(ProgressUpdate {
            phase: Some(PHASE_SCANNING),
            ..Default::default()
        });
    }

    if let Some(rest) = line.strip_prefix("sent ") {
        let amount = rest.split(" bytes").next()?;
        return Some(ProgressUpdate {
            bytes_transferred: Some(parse_size(amount)?),
            ..Default::default()
        });
    }

    // "  1,234,567  45%  1.20MB/s    0:00:10 (xfr#3, to-chk=5/10)"
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }
    let percent = parse_percent(tokens[1])?;
    let bytes = parse_size(tokens[0])?;
    let mut update = ProgressUpdate {
        percent: Some(percent),
        bytes_transferred: Some(bytes),
        phase: Some(PHASE_TRANSFERRING),
        ..Default::default()
    };
    if let Some(rate) = tokens.get(2).filter(|t| t.ends_with("/s")) {
        update.rate = Some(rate.to_string());
    }
    if let Some(eta) = tokens.get(3).filter(|t| is_clock(t)) {
        update.eta = Some(eta.to_string());
    }
    if let Some(checks) = line.find('(').map(|i| &line[i..]) {
        for part in checks.trim_matches(|c| c == '(' || c == ')').split(',') {
            let part = part.trim();
            if let Some(n) = part.strip_prefix("xfr#") {
                update.files_transferred = n.parse().ok();
            } else if let Some(counts) = part
                .strip_prefix("to-chk=")
                .or_else(|| part.strip_prefix("ir-chk="))
            {
                update.files_total = counts.split('/').nth(1).and_then(|t| t.parse().ok());
            }
        }
    }
    Some(update)
}

fn parse_rclone(line: &str) -> Option<ProgressUpdate> {
    let line = line.trim();
    if line.starts_with("Checking:") {
        return Some(ProgressUpdate {
            phase: Some(PHASE_SCANNING),
            ..Default::default()
        });
    }
    let stats = line.strip_prefix("Transferred:")?.trim();
    let mut parts = stats.split(',').map(str::trim);
    let (done, total) = parts.next()?.split_once('/')?;
    let (done, total) = (done.trim(), total.trim());
    let percent = parts.next().and_then(parse_percent);

    // The byte line carries units ("1.5 MiB / 10 MiB"); the file line is bare counts.
    if !done.chars().any(|c| c.is_ascii_alphabetic()) {
        return Some(ProgressUpdate {
            percent,
            files_transferred: done.parse().ok(),
            files_total: total.parse().ok(),
            phase: Some(PHASE_TRANSFERRING),
            ..Default::default()
        });
    }

    let mut update = ProgressUpdate {
        percent,
        bytes_transferred: Some(parse_size(done)?),
        total_bytes: parse_size(total),
        phase: Some(PHASE_TRANSFERRING),
        ..Default::default()
    };
    for part in parts {
        if let Some(eta) = part.strip_prefix("ETA") {
            let eta = eta.trim();
            if !eta.is_empty() && eta != "-" {
                update.eta = Some(eta.to_string());
            }
        } else if part.ends_with("/s") {
            update.rate = Some(part.to_string());
        }
    }
    Some(update)
}

fn parse_percent(token: &str) -> Option<u8> {
    let value: f64 = token.strip_suffix('%')?.trim().parse().ok()?;
    Some(value.clamp(0.0, 100.0).round() as u8)
}

fn is_clock(token: &str) -> bool {
    token.split(':').count() >= 2 && token.split(':').all(|p| p.parse::<u32>().is_ok())
}

/// `1,234`, `12 B`, `1.23M`, `1.5 MiB`, `3k` as a byte count. Single-letter
/// suffixes are decimal, `*iB` suffixes binary.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim().replace(',', "");
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim().trim_end_matches("ytes") {
        "" | "B" | "b" => 1.0,
        "k" | "K" | "kB" | "KB" => 1e3,
        "M" | "MB" => 1e6,
        "G" | "GB" => 1e9,
        "T" | "TB" => 1e12,
        "Ki" | "KiB" => 1024.0,
        "Mi" | "MiB" => 1024.0 * 1024.0,
        "Gi" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        "Ti" | "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// Totals gathered from a dry run's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviewStats {
    pub files: Option<u64>,
    pub bytes: Option<u64>,
    dry_run_skips: u64,
}

impl PreviewStats {
    pub fn observe(&mut self, transfer: &TransferSpec, line: &str) {
        let line = line.trim();
        match transfer {
            TransferSpec::Rsync { .. } => {
                if let Some((label, value)) = line.split_once(':') {
                    let number = value.trim().split(' ').next().unwrap_or("");
                    match label {
                        "Number of regular files transferred" | "Number of files transferred" => {
                            self.files = parse_size(number);
                        }
                        "Total transferred file size" => self.bytes = parse_size(number),
                        _ => {}
                    }
                }
            }
            TransferSpec::Rclone { .. } => {
                if line.contains("Skipped") && line.contains("as --dry-run is set") {
                    self.dry_run_skips += 1;
                } else if let Some(update) = parse_rclone(line) {
                    if update.files_total.is_some() {
                        self.files = update.files_total;
                    }
                    if update.total_bytes.is_some() {
                        self.bytes = update.total_bytes;
                    }
                }
            }
        }
    }

    /// File count, falling back to the number of dry-run skip notices.
    pub fn files(&self) -> Option<u64> {
        self.files
            .or((self.dry_run_skips > 0).then_some(self.dry_run_skips))
    }
}

/// Seconds to move `bytes` at a bandwidth limit such as `"1000"` (KiB/s, the
/// rsync unit) or `"10M"`.
pub fn estimate_seconds(bytes: u64, bwlimit: Option<&str>) -> Option<u64> {
    let limit = bwlimit?.trim();
    let per_second = if limit.chars().all(|c| c.is_ascii_digit() || c == '.') {
        limit.parse::<f64>().ok()? * 1024.0
    } else {
        let limit = limit.trim_end_matches("/s");
        // rclone and rsync both read a bare letter suffix as binary here.
        let binary = match limit.chars().last()? {
            'k' | 'K' => 1024.0,
            'M' => 1024.0 * 1024.0,
            'G' => 1024.0 * 1024.0 * 1024.0,
            _ => return None,
        };
        limit[..limit.len() - 1].parse::<f64>().ok()? * binary
    };
    if per_second <= 0.0 {
        return None;
    }
    Some((bytes as f64 / per_second).ceil() as u64)
}
