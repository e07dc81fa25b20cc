//! External process transport: spawn an argv, read its output line by line,
//! signal it, and wait for its exit code.

pub mod mock;

use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

pub use mock::{MockAttempt, MockProcessSpawner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to exit (SIGTERM).
    Terminate,
    /// Force it (SIGKILL).
    Kill,
    /// SIGSTOP
    Suspend,
    /// SIGCONT
    Resume,
}

/// Trait for spawning transfer processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, argv: &[String]) -> anyhow::Result<Box<dyn TransferProcess>>;
}

/// Trait for interacting with a spawned transfer process.
#[async_trait]
pub trait TransferProcess: Send {
    /// Next line from stdout or stderr, `None` once both are closed.
    /// Cancel safe: dropping the future loses no output.
    async fn next_line(&mut self) -> Option<OutputLine>;
    async fn wait(&mut self) -> io::Result<i32>;
    fn signal(&mut self, signal: ProcessSignal) -> io::Result<()>;
    /// Whether `Suspend`/`Resume` are honored.
    fn supports_suspend(&self) -> bool;
}

// --- tokio::process implementation ---

/// Spawns real child processes with piped stdout/stderr.
pub struct TokioProcessSpawner;

impl ProcessSpawner for TokioProcessSpawner {
    fn spawn(&self, argv: &[String]) -> anyhow::Result<Box<dyn TransferProcess>> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Empty command"))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{}': {}", program, e))?;

        let (line_tx, line_rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, OutputStream::Stderr, line_tx));
        }

        Ok(Box::new(TokioProcess {
            child,
            lines: line_rx,
        }))
    }
}

/// Longest line forwarded; longer runs are split at this size.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Forward a pipe as lines. Progress meters redraw with `\r`, so both `\r`
/// and `\n` end a line.
async fn pump_lines<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Output pipe read failed: {}", e);
                break;
            }
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !flush_line(&mut pending, stream, &tx).await {
                    return;
                }
            } else {
                pending.push(byte);
                if pending.len() >= MAX_LINE_BYTES && !flush_line(&mut pending, stream, &tx).await {
                    return;
                }
            }
        }
    }
    flush_line(&mut pending, stream, &tx).await;
}

/// Send the pending bytes as one line. Returns false once the receiver is gone.
async fn flush_line(
    pending: &mut Vec<u8>,
    stream: OutputStream,
    tx: &mpsc::Sender<OutputLine>,
) -> bool {
    if pending.is_empty() {
        return true;
    }
    let text = String::from_utf8_lossy(pending).trim_end().to_string();
    pending.clear();
    if text.is_empty() {
        return true;
    }
    tx.send(OutputLine { stream, text }).await.is_ok()
}

struct TokioProcess {
    child: tokio::process::Child,
    lines: mpsc::Receiver<OutputLine>,
}

#[async_trait]
impl TransferProcess for TokioProcess {
    async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    fn signal(&mut self, signal: ProcessSignal) -> io::Result<()> {
        if signal == ProcessSignal::Kill {
            return self.child.start_kill();
        }
        #[cfg(unix)]
        {
            let Some(pid) = self.child.id() else {
                // Already reaped.
                return Ok(());
            };
            let signo = match signal {
                ProcessSignal::Terminate => libc::SIGTERM,
                ProcessSignal::Suspend => libc::SIGSTOP,
                ProcessSignal::Resume => libc::SIGCONT,
                ProcessSignal::Kill => libc::SIGKILL,
            };
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(pid as libc::pid_t, signo) };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
        #[cfg(not(unix))]
        {
            match signal {
                ProcessSignal::Terminate | ProcessSignal::Kill => self.child.start_kill(),
                ProcessSignal::Suspend | ProcessSignal::Resume => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "process suspension is not supported on this platform",
                )),
            }
        }
    }

    fn supports_suspend(&self) -> bool {
        cfg!(unix)
    }
}

/// Exit code, or 128 + signal number for a signal death on unix.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
