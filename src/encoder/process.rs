//! Encoder subprocess
//!
//! Runs the encoder as a child process talking over its stdin/stdout pipes.
//! A reaper task owns the child so its exit is observed even when nobody is
//! shutting it down, and so a forced kill can be requested from `exit()`.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use super::{EncoderCommand, EncoderInput, EncoderOutput, ExitOutcome};
use crate::error::{Error, Result};

type ExitState = Option<io::Result<ExitStatus>>;

/// Longest encoder diagnostic line logged; the rest of a longer one is dropped
const MAX_STDERR_LINE: usize = 1024;

/// Write and lifecycle half of an encoder subprocess
pub struct ProcessEncoder {
    channel: String,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<ExitState>,
    grace_period: Duration,
}

/// Read half of an encoder subprocess
pub struct ProcessOutput {
    channel: String,
    stdout: ChildStdout,
    buf: BytesMut,
    exit_rx: watch::Receiver<ExitState>,
}

impl ProcessEncoder {
    /// Start the encoder process for `channel`.
    ///
    /// `grace_period` is how long `exit()` waits after the terminate request
    /// before killing the process. Must be called inside a tokio runtime.
    pub fn spawn(
        channel: impl Into<String>,
        command: &EncoderCommand,
        grace_period: Duration,
    ) -> Result<(Self, ProcessOutput)> {
        let channel = channel.into();
        let spawn_error = |source: io::Error| Error::EncoderSpawn {
            channel: channel.clone(),
            source,
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group: terminal signals reach us, not the encoder
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stdout not captured")))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(channel.clone(), stderr));
        }
        let pid = child.id();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(reap(channel.clone(), child, kill_rx, exit_tx));

        tracing::info!(
            channel = %channel,
            program = %command.program,
            pid = ?pid,
            "Encoder started"
        );

        let encoder = Self {
            channel: channel.clone(),
            stdin,
            pid,
            kill_tx: Some(kill_tx),
            exit_rx: exit_rx.clone(),
            grace_period,
        };
        let output = ProcessOutput {
            channel,
            stdout,
            buf: BytesMut::new(),
            exit_rx,
        };
        Ok((encoder, output))
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    fn terminate(&self) {
        let Some(pid) = self.pid else { return };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(channel = %self.channel, error = %e, "Terminate request failed");
        }
    }

    fn exit_error(&self) -> Option<io::Error> {
        match &*self.exit_rx.borrow() {
            Some(Err(e)) => Some(io::Error::new(e.kind(), e.to_string())),
            _ => None,
        }
    }
}

impl EncoderInput for ProcessEncoder {
    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::EncoderDead(self.channel.clone()))?;

        if let Err(e) = stdin.write_all(frame).await {
            tracing::debug!(channel = %self.channel, error = %e, "Encoder input closed");
            self.stdin = None;
            return Err(Error::EncoderDead(self.channel.clone()));
        }
        Ok(())
    }

    async fn exit(&mut self) -> Result<ExitOutcome> {
        // Closing the input lets the encoder flush and finish on its own
        self.stdin = None;
        if !self.has_exited() {
            self.terminate();
        }

        if tokio::time::timeout(self.grace_period, wait_exited(&mut self.exit_rx))
            .await
            .is_ok()
        {
            if let Some(e) = self.exit_error() {
                return Err(Error::Io(e));
            }
            tracing::info!(channel = %self.channel, "Encoder exited");
            return Ok(ExitOutcome::Graceful);
        }

        tracing::warn!(
            channel = %self.channel,
            grace_secs = self.grace_period.as_secs_f64(),
            "Encoder ignored terminate request, killing"
        );
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        wait_exited(&mut self.exit_rx).await;

        if let Some(source) = self.exit_error() {
            return Err(Error::KillFailed {
                channel: self.channel.clone(),
                source,
            });
        }
        Ok(ExitOutcome::Killed)
    }
}

impl EncoderOutput for ProcessOutput {
    async fn read(&mut self, max_len: usize) -> Result<Bytes> {
        self.buf.reserve(max_len);
        let mut limited = (&mut self.buf).limit(max_len);

        if let Err(e) = self.stdout.read_buf(&mut limited).await {
            tracing::debug!(channel = %self.channel, error = %e, "Encoder output failed");
            return Err(Error::EncoderDead(self.channel.clone()));
        }
        Ok(self.buf.split().freeze())
    }

    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

async fn wait_exited(exit_rx: &mut watch::Receiver<ExitState>) {
    // A closed channel means the reaper is gone, which only happens after exit
    let _ = exit_rx.wait_for(Option::is_some).await;
}

async fn reap(
    channel: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<ExitState>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit kill request and when the encoder handle is dropped
        _ = kill_rx => match child.kill().await {
            Ok(()) => child.wait().await,
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Failed to kill encoder");
                Err(e)
            }
        },
    };

    if let Ok(status) = &status {
        tracing::debug!(channel = %channel, status = %status, "Encoder reaped");
    }
    exit_tx.send_replace(Some(status));
}

/// Log encoder diagnostics line by line and return how many were logged.
///
/// Progress reports end in `\r` rather than `\n`, so both end a line.
async fn forward_stderr<R>(channel: String, stderr: R) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::with_capacity(MAX_STDERR_LINE);
    let mut logged = 0;

    loop {
        let buf = match reader.fill_buf().await {
            Ok([]) | Err(_) => break,
            Ok(buf) => buf,
        };
        let (taken, ended) = match buf.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(end) => (end, true),
            None => (buf.len(), false),
        };
        let room = MAX_STDERR_LINE - line.len();
        line.extend_from_slice(&buf[..taken.min(room)]);
        reader.consume(taken + usize::from(ended));

        if ended {
            logged += log_stderr_line(&channel, &line);
            line.clear();
        }
    }

    logged + log_stderr_line(&channel, &line)
}

fn log_stderr_line(channel: &str, line: &[u8]) -> u64 {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end();
    if line.is_empty() {
        return 0;
    }
    tracing::debug!(channel = %channel, "encoder: {}", line);
    1
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    const GRACE: Duration = Duration::from_millis(300);

    fn cat() -> EncoderCommand {
        EncoderCommand::new("cat", Vec::<String>::new())
    }

    fn stubborn() -> EncoderCommand {
        EncoderCommand::new("sh", ["-c", "trap '' TERM; sleep 30"])
    }

    async fn read_exact(output: &mut ProcessOutput, len: usize) -> Vec<u8> {
        let mut data = Vec::new();
        while data.len() < len {
            let chunk = output.read(len - data.len()).await.unwrap();
            assert!(!chunk.is_empty(), "unexpected end of stream");
            data.extend_from_slice(&chunk);
        }
        data
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut encoder, mut output) = ProcessEncoder::spawn("front", &cat(), GRACE).unwrap();

        encoder.write(b"raw frame bytes").await.unwrap();
        let data = read_exact(&mut output, 15).await;

        assert_eq!(data, b"raw frame bytes");
        encoder.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_respects_max_len() {
        let (mut encoder, mut output) = ProcessEncoder::spawn("front", &cat(), GRACE).unwrap();

        encoder.write(&[7u8; 100]).await.unwrap();
        let chunk = output.read(10).await.unwrap();

        assert!(!chunk.is_empty());
        assert!(chunk.len() <= 10);
        encoder.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_exit_then_end_of_stream() {
        let (mut encoder, mut output) = ProcessEncoder::spawn("front", &cat(), GRACE).unwrap();

        let outcome = encoder.exit().await.unwrap();

        assert_eq!(outcome, ExitOutcome::Graceful);
        assert!(encoder.has_exited());
        assert!(output.has_exited());
        assert!(output.read(1024).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_kills_after_grace_period() {
        let (mut encoder, _output) = ProcessEncoder::spawn("stubborn", &stubborn(), GRACE).unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let outcome = encoder.exit().await.unwrap();

        assert_eq!(outcome, ExitOutcome::Killed);
        assert!(started.elapsed() >= GRACE);
        assert!(started.elapsed() < GRACE + Duration::from_secs(5));
        assert!(encoder.has_exited());
    }

    #[tokio::test]
    async fn test_write_after_exit_is_dead() {
        let (mut encoder, _output) = ProcessEncoder::spawn("front", &cat(), GRACE).unwrap();
        encoder.exit().await.unwrap();

        let result = encoder.write(b"late").await;

        assert!(matches!(result, Err(Error::EncoderDead(ref channel)) if channel == "front"));
    }

    #[tokio::test]
    async fn test_write_to_crashed_encoder_is_dead() {
        let command = EncoderCommand::new("sh", ["-c", "exit 1"]);
        let (mut encoder, _output) = ProcessEncoder::spawn("front", &command, GRACE).unwrap();
        tokio::time::timeout(Duration::from_secs(5), wait_exited(&mut encoder.exit_rx))
            .await
            .unwrap();

        // The pipe may absorb a small write; a frame-sized one cannot succeed
        let result = encoder.write(&vec![0u8; 1 << 20]).await;

        assert!(result.unwrap_err().is_encoder_dead());
    }

    #[tokio::test]
    async fn test_stderr_progress_lines_are_split() {
        let script = "i=0; while [ $i -lt 2000 ]; do \
            printf 'frame=%d fps=25 bitrate=1000k\\r' $i >&2; i=$((i+1)); done";
        let mut child = Command::new("sh")
            .args(["-c", script])
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stderr = child.stderr.take().unwrap();

        let logged = tokio::time::timeout(
            Duration::from_secs(10),
            forward_stderr("front".to_string(), stderr),
        )
        .await
        .unwrap();

        assert_eq!(logged, 2000);
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_mixed_endings_and_long_line() {
        let mut input = b"Input #0, rawvideo\r\nframe=1\rframe=2\n\n".to_vec();
        input.resize(input.len() + MAX_STDERR_LINE * 8, b'x');
        input.extend_from_slice(b"\nlast line without ending");

        let logged = forward_stderr("front".to_string(), input.as_slice()).await;

        assert_eq!(logged, 5);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let command = EncoderCommand::new("/nonexistent/encoder", Vec::<String>::new());

        let result = ProcessEncoder::spawn("front", &command, GRACE);

        assert!(matches!(
            result,
            Err(Error::EncoderSpawn { ref channel, .. }) if channel == "front"
        ));
    }
}
