//! Child process wrapper using portable-pty.
//!
//! Spawns a profile's command on a new pseudo-terminal and splits it into a
//! [`ProcessHandle`] (input, resize, terminate; callable from any task) and a
//! [`ProcessOutput`] (the output source, drained by exactly one reader). The
//! blocking read loop also reaps the child, so its end is the one place where
//! process exit is observed.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webterm_core::{Profile, WebtermError, WebtermResult};

/// Size of one blocking read from the pty master.
const READ_CHUNK: usize = 8192;

/// Chunks buffered between the blocking reader and the session task.
const OUTPUT_CHANNEL: usize = 64;

/// Child is running and nobody asked it to stop.
const RUNNING: u8 = 0;
/// `terminate` got in before the reap.
const STOP_REQUESTED: u8 = 1;
/// The read loop has reaped the child.
const REAPED: u8 = 2;

/// How the read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The child exited on its own and was reaped with this code.
    Exited(i32),
    /// The child was reaped after a stop had been requested.
    Stopped(i32),
    /// The read loop failed for a reason other than end-of-stream.
    Failed(String),
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A managed child process on a pty.
pub struct ProcessHandle {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// The master for resize operations (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    /// RUNNING, STOP_REQUESTED or REAPED; shared with the read loop.
    state: Arc<AtomicU8>,
}

/// Output source of a spawned process.
pub struct ProcessOutput {
    rx: mpsc::Receiver<Vec<u8>>,
    reaper: JoinHandle<ExitOutcome>,
}

impl ProcessOutput {
    /// Next chunk of raw output; `None` once the process side has closed.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Wait for the reaped exit outcome. Call after `next_chunk` returned `None`.
    pub async fn finish(self) -> ExitOutcome {
        drop(self.rx);
        match self.reaper.await {
            Ok(outcome) => outcome,
            Err(e) => ExitOutcome::Failed(format!("reader task failed: {e}")),
        }
    }
}

impl ProcessHandle {
    /// Spawn `profile`'s command in `cwd` on a new pty of the given size.
    ///
    /// The child inherits the server environment with the profile's overlay
    /// applied on top.
    pub fn spawn(
        profile: &Profile,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> WebtermResult<(Self, ProcessOutput)> {
        if profile.command.trim().is_empty() {
            return Err(WebtermError::Spawn("empty command".into()));
        }
        if !cwd.is_dir() {
            return Err(WebtermError::Spawn(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| WebtermError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&profile.command);
        cmd.args(&profile.args);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &profile.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| WebtermError::Spawn(format!("{}: {e}", profile.command)))?;
        // The parent must not hold the slave side open, or EOF never arrives.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = match pair.master.try_clone_reader() {
            Ok(r) => r,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WebtermError::Spawn(format!("failed to clone PTY reader: {e}")));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(w) => w,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WebtermError::Spawn(format!("failed to take PTY writer: {e}")));
            }
        };

        info!(pid, command = %profile.display_command(), cols, rows, "process spawned");

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL);
        let (exited_tx, exited_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(RUNNING));
        let reaper_state = state.clone();
        let reaper = tokio::task::spawn_blocking(move || {
            let outcome = read_until_eof(reader, &tx, &mut *child, &reaper_state);
            let _ = exited_tx.send(true);
            outcome
        });

        let handle = Self {
            writer: Arc::new(Mutex::new(writer)),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            pid,
            exited: exited_rx,
            state,
        };
        Ok((handle, ProcessOutput { rx, reaper }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Write to the process input. Fails once the process is gone.
    pub async fn write(&self, data: Vec<u8>) -> WebtermResult<()> {
        if self.has_exited() {
            return Err(WebtermError::ProcessExited("process has exited".into()));
        }
        if data.is_empty() {
            return Ok(());
        }
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut writer = lock(&writer);
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| WebtermError::Other(format!("join error: {e}")))??;
        Ok(())
    }

    /// Resize the pty. A no-op once the process has exited.
    pub fn resize(&self, cols: u16, rows: u16) -> WebtermResult<()> {
        if cols == 0 || rows == 0 {
            return Err(WebtermError::InvalidMessage(format!(
                "invalid terminal size {cols}x{rows}"
            )));
        }
        if self.has_exited() {
            return Ok(());
        }
        lock(&self.master)
            .resize(pty_size(cols, rows))
            .map_err(|e| WebtermError::Other(format!("PTY resize failed: {e}")))?;
        debug!(pid = self.pid, cols, rows, "PTY resized");
        Ok(())
    }

    /// Stop the process: hang up and SIGTERM its process group, then kill it
    /// if it is still alive after `grace`. With `force`, kill immediately.
    ///
    /// Returns `false` without signalling when the child was already reaped;
    /// its own exit stands. Otherwise the read loop reports
    /// [`ExitOutcome::Stopped`], and this returns once the child has been
    /// reaped or the kill was delivered.
    pub async fn terminate(&self, force: bool, grace: Duration) -> WebtermResult<bool> {
        match self
            .state
            .compare_exchange(RUNNING, STOP_REQUESTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(REAPED) => return Ok(false),
            // A stop is already under way.
            Err(_) => {}
        }

        if !force {
            if let Some(pid) = self.pid {
                let group = Pid::from_raw(pid as i32);
                for signal in [Signal::SIGHUP, Signal::SIGTERM] {
                    if let Err(e) = killpg(group, signal) {
                        debug!(pid, ?signal, error = %e, "signal delivery failed");
                    }
                }
            }
            if self.wait_exited(grace).await {
                debug!(pid = self.pid, "process ended after graceful signal");
                return Ok(true);
            }
            warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "process ignored graceful signal, killing");
        }

        match lock(&self.killer).kill() {
            Ok(()) => {}
            // Already gone between the check and the kill.
            Err(e) if self.has_exited() => debug!(error = %e, "kill after exit"),
            Err(e) => return Err(WebtermError::Other(format!("kill failed: {e}"))),
        }
        self.wait_exited(grace.max(Duration::from_secs(1))).await;
        Ok(true)
    }

    /// Wait up to `timeout` for the reader to reap the child.
    async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.state.load(Ordering::SeqCst) != REAPED {
            debug!(pid = self.pid, "dropping live process handle, killing child");
            let _ = lock(&self.killer).kill();
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Blocking read loop: forward chunks until end-of-stream, then reap.
fn read_until_eof(
    mut reader: Box<dyn Read + Send>,
    tx: &mpsc::Sender<Vec<u8>>,
    child: &mut (dyn Child + Send + Sync),
    state: &AtomicU8,
) -> ExitOutcome {
    let mut buf = vec![0u8; READ_CHUNK];
    let failure = loop {
        match reader.read(&mut buf) {
            Ok(0) => break None,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    // Nobody is draining output any more; the session is being torn down.
                    let _ = child.kill();
                    break None;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Linux reports a closed slave side as EIO rather than EOF.
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EIO as i32) => break None,
            Err(e) => {
                let _ = child.kill();
                break Some(format!("PTY read failed: {e}"));
            }
        }
    };

    let status = child.wait();
    let stop_requested = state.swap(REAPED, Ordering::SeqCst) == STOP_REQUESTED;
    match (failure, status) {
        (Some(reason), _) => ExitOutcome::Failed(reason),
        (None, Ok(status)) => {
            let code = i32::try_from(status.exit_code()).unwrap_or(-1);
            info!(pid = child.process_id(), code, stop_requested, "process exited");
            if stop_requested {
                ExitOutcome::Stopped(code)
            } else {
                ExitOutcome::Exited(code)
            }
        }
        (None, Err(e)) => ExitOutcome::Failed(format!("wait failed: {e}")),
    }
}
