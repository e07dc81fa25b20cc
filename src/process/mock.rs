//! Scripted process double. Each spawn consumes the next [`MockAttempt`];
//! the last one repeats once the script runs out.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{OutputLine, ProcessSignal, ProcessSpawner, TransferProcess};

/// Exit code reported after `Terminate`.
pub const TERMINATED_EXIT_CODE: i32 = 143;
/// Exit code reported after `Kill`.
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone, Default)]
pub struct MockAttempt {
    pub lines: Vec<OutputLine>,
    pub exit_code: i32,
    /// Delay before each line.
    pub line_delay_ms: u64,
    /// Keep running after the output until signalled.
    pub hold: bool,
    /// Only `Kill` ends the process.
    pub ignores_terminate: bool,
    /// Exits with `exit_code` as soon as it is suspended.
    pub exits_when_suspended: bool,
    pub spawn_error: Option<String>,
}

impl MockAttempt {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    /// Runs until stopped.
    pub fn held() -> Self {
        Self {
            hold: true,
            ..Default::default()
        }
    }

    pub fn spawn_error(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.lines.push(OutputLine::stdout(text));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.lines.push(OutputLine::stderr(text));
        self
    }

    pub fn line_delay(mut self, ms: u64) -> Self {
        self.line_delay_ms = ms;
        self
    }

    pub fn ignoring_terminate(mut self) -> Self {
        self.ignores_terminate = true;
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn exiting_when_suspended(mut self) -> Self {
        self.exits_when_suspended = true;
        self
    }
}

pub struct MockProcessSpawner {
    script: Mutex<VecDeque<MockAttempt>>,
    last: Mutex<MockAttempt>,
    spawned: Mutex<Vec<Vec<String>>>,
    supports_suspend: bool,
}

impl MockProcessSpawner {
    pub fn new(attempts: Vec<MockAttempt>) -> Self {
        Self {
            script: Mutex::new(attempts.into()),
            last: Mutex::new(MockAttempt::exit(0)),
            spawned: Mutex::new(Vec::new()),
            supports_suspend: true,
        }
    }

    /// Every spawn behaves the same way.
    pub fn always(attempt: MockAttempt) -> Self {
        Self::new(vec![attempt])
    }

    pub fn without_suspend(mut self) -> Self {
        self.supports_suspend = false;
        self
    }

    pub fn spawn_count(&self) -> usize {
        lock(&self.spawned).len()
    }

    pub fn spawned_commands(&self) -> Vec<Vec<String>> {
        lock(&self.spawned).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessSpawner for MockProcessSpawner {
    fn spawn(&self, argv: &[String]) -> anyhow::Result<Box<dyn TransferProcess>> {
        let attempt = {
            let mut script = lock(&self.script);
            match script.pop_front() {
                Some(next) => {
                    *lock(&self.last) = next.clone();
                    next
                }
                None => lock(&self.last).clone(),
            }
        };
        lock(&self.spawned).push(argv.to_vec());

        if let Some(error) = attempt.spawn_error {
            return Err(anyhow::anyhow!(error));
        }

        Ok(Box::new(MockProcess {
            lines: attempt.lines.into(),
            exit_code: attempt.exit_code,
            line_delay: Duration::from_millis(attempt.line_delay_ms),
            hold: attempt.hold,
            ignores_terminate: attempt.ignores_terminate,
            exits_when_suspended: attempt.exits_when_suspended,
            supports_suspend: self.supports_suspend,
            terminated: false,
            killed: false,
            suspended: false,
        }))
    }
}

pub struct MockProcess {
    lines: VecDeque<OutputLine>,
    exit_code: i32,
    line_delay: Duration,
    hold: bool,
    ignores_terminate: bool,
    exits_when_suspended: bool,
    supports_suspend: bool,
    terminated: bool,
    killed: bool,
    suspended: bool,
}

#[async_trait]
impl TransferProcess for MockProcess {
    async fn next_line(&mut self) -> Option<OutputLine> {
        if self.killed || self.terminated {
            return None;
        }
        if self.suspended {
            if self.exits_when_suspended {
                return None;
            }
            return std::future::pending().await;
        }
        if !self.lines.is_empty() {
            if !self.line_delay.is_zero() {
                tokio::time::sleep(self.line_delay).await;
            }
            return self.lines.pop_front();
        }
        if self.hold {
            return std::future::pending().await;
        }
        None
    }

    async fn wait(&mut self) -> io::Result<i32> {
        Ok(if self.killed {
            KILLED_EXIT_CODE
        } else if self.terminated {
            TERMINATED_EXIT_CODE
        } else {
            self.exit_code
        })
    }

    fn signal(&mut self, signal: ProcessSignal) -> io::Result<()> {
        match signal {
            ProcessSignal::Terminate => {
                if !self.ignores_terminate {
                    self.terminated = true;
                }
            }
            ProcessSignal::Kill => self.killed = true,
            ProcessSignal::Suspend | ProcessSignal::Resume if !self.supports_suspend => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "mock process does not support suspension",
                ));
            }
            ProcessSignal::Suspend => self.suspended = true,
            ProcessSignal::Resume => self.suspended = false,
        }
        Ok(())
    }

    fn supports_suspend(&self) -> bool {
        self.supports_suspend
    }
}
