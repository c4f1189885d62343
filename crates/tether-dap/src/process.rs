//! Spawned debug-adapter process handling.
//!
//! [`AdapterProcess`] owns the child process and exposes the surface the
//! readiness and transport layers consume: a started signal, a line-oriented
//! output feed, and (for stdio transports) the raw standard streams.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Identity of one spawned adapter process. Monotonic, never reused within a
/// process lifetime (unlike OS pids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessKey(u64);

static NEXT_PROCESS_KEY: AtomicU64 = AtomicU64::new(1);

impl ProcessKey {
    pub(crate) fn next() -> Self {
        Self(NEXT_PROCESS_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

pub struct AdapterProcess {
    key: ProcessKey,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    output_tx: broadcast::Sender<String>,
    started_rx: watch::Receiver<bool>,
    // Kept so late subscribers still observe `true` after the sender side
    // would otherwise close.
    _started_tx: watch::Sender<bool>,
    stdio: Mutex<Option<(ChildStdin, ChildStdout)>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl AdapterProcess {
    /// Spawn an adapter whose standard output is console output. Both stdout
    /// and stderr are pumped into the line feed; the transport is expected
    /// to be a socket.
    pub fn spawn_piped(command: Command) -> std::io::Result<Self> {
        Self::spawn_inner(command, false)
    }

    /// Spawn an adapter that speaks the protocol over its standard streams.
    /// stdout/stdin are reserved for the transport; only stderr feeds the
    /// output lines.
    pub fn spawn_stdio(command: Command) -> std::io::Result<Self> {
        Self::spawn_inner(command, true)
    }

    fn spawn_inner(mut command: Command, reserve_stdio: bool) -> std::io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let key = ProcessKey::next();
        let pid = child.id();
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        // The spawn succeeding is the "started" notification.
        let (started_tx, started_rx) = watch::channel(true);

        let mut pumps = Vec::new();
        let stderr = child.stderr.take().expect("stderr was piped");
        pumps.push(pump_lines(stderr, output_tx.clone()));

        let stdio = if reserve_stdio {
            let stdin = child.stdin.take().expect("stdin was piped");
            let stdout = child.stdout.take().expect("stdout was piped");
            Some((stdin, stdout))
        } else {
            let stdout = child.stdout.take().expect("stdout was piped");
            pumps.push(pump_lines(stdout, output_tx.clone()));
            None
        };

        Ok(Self {
            key,
            pid,
            child: Mutex::new(Some(child)),
            output_tx,
            started_rx,
            _started_tx: started_tx,
            stdio: Mutex::new(stdio),
            pumps: Mutex::new(pumps),
        })
    }

    pub fn key(&self) -> ProcessKey {
        self.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Subscribe to the process output as lines. Slow subscribers may miss
    /// lines once the channel backlog overflows.
    pub fn output_lines(&self) -> broadcast::Receiver<String> {
        self.output_tx.subscribe()
    }

    /// Watch channel that is `true` once the process has started.
    pub fn started(&self) -> watch::Receiver<bool> {
        self.started_rx.clone()
    }

    /// Take the standard streams reserved for a stdio transport. Returns
    /// `None` for piped spawns or when already taken.
    pub fn take_stdio(&self) -> Option<(ChildStdin, ChildStdout)> {
        self.stdio.lock().take()
    }

    /// Best-effort kill. Errors (already exited, already killed) are logged
    /// and swallowed.
    pub fn kill(&self) {
        let mut child = self.child.lock();
        if let Some(child) = child.as_mut() {
            if let Err(err) = child.start_kill() {
                tracing::debug!(target: "tether.process", pid = ?self.pid, "kill failed: {err}");
            }
        }
    }

    /// Whether the process has exited. `None` when the exit status is not
    /// yet known.
    pub fn exit_code(&self) -> Option<i32> {
        let mut child = self.child.lock();
        child
            .as_mut()
            .and_then(|c| c.try_wait().ok().flatten())
            .and_then(|status| status.code())
    }
}

impl Drop for AdapterProcess {
    fn drop(&mut self) {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
    }
}

fn pump_lines(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: broadcast::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // Send fails only when nobody is subscribed; output is then
            // simply dropped.
            let _ = tx.send(line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_keys_are_unique() {
        let a = ProcessKey::next();
        let b = ProcessKey::next();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn piped_spawn_feeds_output_lines() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("echo ready; echo done 1>&2");
        let process = AdapterProcess::spawn_piped(command).expect("spawn sh");

        let mut lines = process.output_lines();
        let mut seen = Vec::new();
        for _ in 0..2 {
            match tokio::time::timeout(std::time::Duration::from_secs(5), lines.recv()).await {
                Ok(Ok(line)) => seen.push(line),
                other => panic!("expected output line, got {other:?}"),
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["done".to_string(), "ready".to_string()]);
    }

    #[tokio::test]
    async fn stdio_spawn_reserves_standard_streams() {
        let process = AdapterProcess::spawn_stdio(Command::new("cat")).expect("spawn cat");
        assert!(process.take_stdio().is_some());
        assert!(process.take_stdio().is_none());
        process.kill();
    }
}
