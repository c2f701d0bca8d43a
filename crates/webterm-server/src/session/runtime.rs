//! One session: a process, its output fan-out and its lifecycle.
//!
//! The reader task spawned by [`SessionRuntime::start`] is the only place a
//! running session leaves `running` on its own. `terminate` may race it;
//! whether the child was reaped before or after the stop request is decided
//! by the process handle, and every transition goes through the same
//! check-and-set, so whichever comes first wins and the other is a no-op.

use super::broadcaster::{OutputBroadcaster, StatusUpdate, Subscription};
use super::pty::{ExitOutcome, ProcessHandle, ProcessOutput};
use super::ring_buffer::EventPayload;
use super::store::{LogStore, SessionStore};
use crate::config::RuntimeSettings;
use crate::git::{self, RepoInspector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use webterm_core::codec::Utf8Decoder;
use webterm_core::{
    GitStatusEntry, SessionRecord, SessionStatus, SessionSummary, WebtermError, WebtermResult,
};

/// How long `terminate` waits for the reader to record the exit itself.
const READER_SETTLE: Duration = Duration::from_secs(2);

const LOG_CLEARED: &str = "\r\n[log cleared]\r\n";

const BACKSPACE: char = '\u{8}';
const DELETE: char = '\u{7f}';
const CTRL_C: char = '\u{3}';

/// Collaborators shared by every runtime of a registry.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub logs: Arc<dyn LogStore>,
    pub git: Arc<dyn RepoInspector>,
    pub settings: RuntimeSettings,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionRuntime {
    id: String,
    record: Mutex<SessionRecord>,
    broadcaster: OutputBroadcaster,
    /// Present from spawn until the reader has reaped the child.
    process: Mutex<Option<Arc<ProcessHandle>>>,
    /// Serializes input writes and owns the tracked command line.
    input: tokio::sync::Mutex<String>,
    /// Serializes record saves so the file always holds the latest status.
    persist: tokio::sync::Mutex<()>,
    /// Held while output goes to the log and the broadcaster, and while both
    /// are cleared, so they never disagree about what was cleared.
    output_gate: tokio::sync::Mutex<()>,
    /// A stop that arrived before the process was spawned.
    stop_before_start: AtomicBool,
    /// Flips to true once the reader task has recorded the process end.
    finished: watch::Sender<bool>,
    /// Replay seeding from the persisted log, for sessions without a process.
    seeded: OnceCell<()>,
    deps: RuntimeDeps,
}

impl SessionRuntime {
    /// A fresh session in `created`; call [`start`](Self::start) next.
    pub fn new(record: SessionRecord, deps: RuntimeDeps) -> Arc<Self> {
        Self::build(record, deps, OnceCell::new_with(Some(())))
    }

    /// A session restored from the store. It never gets a process; viewers
    /// are served the persisted log and the recorded status.
    pub fn historical(record: SessionRecord, deps: RuntimeDeps) -> Arc<Self> {
        Self::build(record, deps, OnceCell::new())
    }

    fn build(record: SessionRecord, deps: RuntimeDeps, seeded: OnceCell<()>) -> Arc<Self> {
        let status = StatusUpdate {
            status: record.status,
            exit_code: record.exit_code,
        };
        let broadcaster = OutputBroadcaster::new(
            deps.settings.replay_buffer_bytes,
            deps.settings.subscriber_queue,
            status,
        );
        let (finished, _) = watch::channel(record.status.is_terminal());
        Arc::new(Self {
            id: record.id.clone(),
            record: Mutex::new(record),
            broadcaster,
            process: Mutex::new(None),
            input: tokio::sync::Mutex::new(String::new()),
            persist: tokio::sync::Mutex::new(()),
            output_gate: tokio::sync::Mutex::new(()),
            stop_before_start: AtomicBool::new(false),
            finished,
            seeded,
            deps,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn record(&self) -> SessionRecord {
        lock(&self.record).clone()
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.record).status
    }

    /// Whether a process is attached and still running.
    pub fn is_live(&self) -> bool {
        self.live_process().is_some()
    }

    fn live_process(&self) -> Option<Arc<ProcessHandle>> {
        lock(&self.process).clone().filter(|p| !p.has_exited())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            record: self.record(),
            viewers: self.broadcaster.viewers(),
            live: self.is_live(),
        }
    }

    /// Persist the record, spawn the process and start the reader task.
    ///
    /// A spawn failure moves the session to `error` and is returned.
    pub async fn start(self: &Arc<Self>) -> WebtermResult<()> {
        self.save().await;
        let (profile, cwd) = {
            let record = lock(&self.record);
            (record.profile.clone(), record.cwd.clone())
        };
        let settings = &self.deps.settings;

        let (handle, output) = match ProcessHandle::spawn(&profile, &cwd, settings.cols, settings.rows) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "session failed to start");
                lock(&self.record).error = Some(e.to_string());
                self.emit_text(&format!("\r\n[{e}]\r\n")).await;
                self.transition(SessionStatus::Error, None).await;
                self.finish_stream().await;
                return Err(e);
            }
        };

        let handle = Arc::new(handle);
        let stop_pending = {
            let mut process = lock(&self.process);
            *process = Some(handle.clone());
            self.stop_before_start.load(Ordering::SeqCst)
        };
        self.transition(SessionStatus::Running, None).await;
        info!(session_id = %self.id, pid = handle.pid(), command = %profile.display_command(), "session started");

        tokio::spawn(self.clone().read_loop(output));

        if stop_pending {
            let grace = settings.terminate_grace;
            if let Err(e) = handle.terminate(false, grace).await {
                warn!(session_id = %self.id, error = %e, "failed to stop freshly spawned process");
            }
        }
        Ok(())
    }

    /// Drain process output into the log and the broadcaster, then record
    /// how the process ended.
    async fn read_loop(self: Arc<Self>, mut output: ProcessOutput) {
        let mut decoder = Utf8Decoder::new();
        while let Some(chunk) = output.next_chunk().await {
            let _gate = self.output_gate.lock().await;
            if let Err(e) = self.deps.logs.append(&self.id, &chunk).await {
                error!(session_id = %self.id, error = %e, "failed to append session log");
            }
            let text = decoder.feed(&chunk);
            if !text.is_empty() {
                self.broadcaster.publish(EventPayload::output(text));
            }
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            self.broadcaster.publish(EventPayload::output(tail));
        }

        let outcome = output.finish().await;
        // Reaped: drop the handle so the pty master and writer are closed.
        lock(&self.process).take();

        let (status, exit_code) = match outcome {
            ExitOutcome::Exited(code) => {
                self.emit_text(&format!("\r\nProcess finished with code {code}\r\n")).await;
                (SessionStatus::from_exit_code(code), Some(code))
            }
            ExitOutcome::Stopped(code) => {
                self.emit_text(&format!("\r\nProcess finished with code {code}\r\n")).await;
                (SessionStatus::Stopped, Some(code))
            }
            ExitOutcome::Failed(reason) => {
                error!(session_id = %self.id, reason = %reason, "session reader failed");
                lock(&self.record).error = Some(reason);
                (SessionStatus::Error, Some(-1))
            }
        };

        self.transition(status, exit_code).await;
        self.finish_stream().await;
        info!(session_id = %self.id, status = %self.status(), "session reader finished");
    }

    async fn finish_stream(&self) {
        self.broadcaster.close();
        self.deps.logs.release(&self.id).await;
        self.finished.send_replace(true);
    }

    /// Check-and-set the status, then notify viewers and persist.
    ///
    /// Returns false (and changes nothing) when the move is not legal, which
    /// is how the loser of a terminate/exit race is discarded.
    async fn transition(&self, next: SessionStatus, exit_code: Option<i32>) -> bool {
        let _persist = self.persist.lock().await;
        let snapshot = {
            let mut record = lock(&self.record);
            if let Err(e) = record.transition(next, exit_code) {
                debug!(session_id = %self.id, error = %e, "status transition skipped");
                return false;
            }
            record.clone()
        };
        self.broadcaster.publish_status(StatusUpdate {
            status: snapshot.status,
            exit_code: snapshot.exit_code,
        });
        info!(
            session_id = %self.id,
            status = %snapshot.status,
            exit_code = snapshot.exit_code,
            "session status changed"
        );
        if let Err(e) = self.deps.sessions.save(&snapshot).await {
            error!(session_id = %self.id, error = %e, "failed to persist session record");
        }
        true
    }

    async fn save(&self) {
        let _persist = self.persist.lock().await;
        let snapshot = self.record();
        if let Err(e) = self.deps.sessions.save(&snapshot).await {
            error!(session_id = %self.id, error = %e, "failed to persist session record");
        }
    }

    /// Publish a synthesized line to viewers and the log.
    async fn emit_text(&self, text: &str) {
        let _gate = self.output_gate.lock().await;
        if let Err(e) = self.deps.logs.append(&self.id, text.as_bytes()).await {
            error!(session_id = %self.id, error = %e, "failed to append session log");
        }
        self.broadcaster.publish(EventPayload::output(text));
    }

    /// Register a viewer. It receives the replay, the current status, then
    /// live events until the session ends.
    pub async fn subscribe(&self, label: impl Into<String>) -> Subscription {
        self.seeded.get_or_init(|| self.seed_from_log()).await;
        self.broadcaster.subscribe(label)
    }

    async fn seed_from_log(&self) {
        match self.deps.logs.read_all(&self.id).await {
            Ok(bytes) if !bytes.is_empty() => {
                let budget = self.deps.settings.replay_buffer_bytes;
                let mut start = bytes.len().saturating_sub(budget);
                // Do not start inside a multi-byte character.
                while start < bytes.len() && bytes[start] & 0b1100_0000 == 0b1000_0000 {
                    start += 1;
                }
                let text = String::from_utf8_lossy(&bytes[start..]).into_owned();
                self.broadcaster.publish(EventPayload::output(text));
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %self.id, error = %e, "failed to read log for replay"),
        }
        self.broadcaster.close();
        debug!(session_id = %self.id, "historical replay seeded");
    }

    /// Forward client input to the process.
    ///
    /// Unless the profile forwards raw keystrokes, the pending command line
    /// is tracked, and a carriage return in a repository is bracketed by git
    /// snapshots whose difference is published as a delta event.
    pub async fn send_input(&self, data: &str) -> WebtermResult<()> {
        let process = self
            .live_process()
            .ok_or_else(|| WebtermError::ProcessExited(self.id.clone()))?;
        let mut line = self.input.lock().await;

        let passthrough = lock(&self.record).profile.passthrough;
        if passthrough {
            return process.write(data.as_bytes().to_vec()).await;
        }

        let mut pending = String::new();
        for ch in data.chars() {
            match ch {
                BACKSPACE | DELETE => {
                    line.pop();
                    pending.push(ch);
                }
                CTRL_C => {
                    line.clear();
                    pending.push(ch);
                    flush(&process, &mut pending).await?;
                }
                '\r' | '\n' => {
                    flush(&process, &mut pending).await?;
                    let command = std::mem::take(&mut *line);
                    self.submit_line(&process, ch, command.trim()).await?;
                }
                _ => {
                    line.push(ch);
                    pending.push(ch);
                }
            }
        }
        flush(&process, &mut pending).await
    }

    async fn submit_line(&self, process: &ProcessHandle, terminator: char, command: &str) -> WebtermResult<()> {
        let git = &self.deps.settings.git;
        let cwd = lock(&self.record).cwd.clone();
        let before = if terminator == '\r' && git.enabled && self.deps.git.is_repository(&cwd) {
            self.deps.git.status_short(&cwd).await
        } else {
            None
        };

        process.write(terminator.to_string().into_bytes()).await?;

        let Some(before) = before else {
            return Ok(());
        };
        self.wait_quiescent(git.quiet_window, git.max_wait).await;
        let Some(after) = self.deps.git.status_short(&cwd).await else {
            return Ok(());
        };
        let delta = git::diff(&before, &after, Some(command.to_string()));
        if !delta.is_empty() {
            debug!(session_id = %self.id, command, "publishing git delta");
            self.broadcaster.publish(EventPayload::GitDelta(Arc::new(delta)));
        }
        Ok(())
    }

    /// Wait until no output was published for `quiet`, or `max_wait` passed.
    async fn wait_quiescent(&self, quiet: Duration, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;
        let mut last_seq = self.broadcaster.next_seq();
        loop {
            let now = Instant::now();
            if now >= deadline || self.broadcaster.is_closed() {
                return;
            }
            tokio::time::sleep(quiet.min(deadline - now)).await;
            let seq = self.broadcaster.next_seq();
            if seq == last_seq {
                return;
            }
            last_seq = seq;
        }
    }

    /// Resize the terminal; a no-op without a live process.
    pub fn resize(&self, cols: u16, rows: u16) -> WebtermResult<()> {
        match self.live_process() {
            Some(process) => process.resize(cols, rows),
            None => Ok(()),
        }
    }

    /// Stop the process. Returns whether the stop took effect, in which case
    /// the session ends as `stopped`.
    ///
    /// A process that was already reaped keeps its own exit status and this
    /// returns false. A session still in `created` is stopped as soon as its
    /// process is spawned.
    pub async fn terminate(&self, force: bool) -> WebtermResult<bool> {
        let process = {
            let process = lock(&self.process);
            match process.as_ref() {
                Some(process) => process.clone(),
                None => {
                    let pending = self.status() == SessionStatus::Created;
                    if pending {
                        self.stop_before_start.store(true, Ordering::SeqCst);
                    }
                    return Ok(pending);
                }
            }
        };
        if !process.terminate(force, self.deps.settings.terminate_grace).await? {
            debug!(session_id = %self.id, "process already exited, nothing to stop");
            return Ok(false);
        }
        info!(session_id = %self.id, force, "session terminated");

        let mut finished = self.finished.subscribe();
        if tokio::time::timeout(READER_SETTLE, finished.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(session_id = %self.id, "reader did not settle after terminate");
        }
        self.transition(SessionStatus::Stopped, None).await;
        Ok(true)
    }

    /// Full persisted log, decoded lossily.
    pub async fn log(&self) -> WebtermResult<String> {
        let bytes = self.deps.logs.read_all(&self.id).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Truncate the log and the replay history; live viewers get a marker.
    pub async fn clear_log(&self) -> WebtermResult<()> {
        let _gate = self.output_gate.lock().await;
        self.deps.logs.clear(&self.id).await?;
        self.broadcaster.restart_replay(EventPayload::output(LOG_CLEARED));
        info!(session_id = %self.id, "session log cleared");
        Ok(())
    }

    /// `git status --short` rows and `git diff --stat` for the session cwd,
    /// or `None` when it is not a repository.
    pub async fn git_changes(&self) -> Option<(Vec<GitStatusEntry>, Option<String>)> {
        let cwd = lock(&self.record).cwd.clone();
        if !self.deps.git.is_repository(&cwd) {
            return None;
        }
        let status = self.deps.git.status_short(&cwd).await?;
        let diff_stat = self.deps.git.diff_stat(&cwd).await;
        Some((status, diff_stat))
    }

    /// Drop the replay and close the stream (the session is being deleted).
    pub fn close(&self) {
        self.broadcaster.close();
    }
}

async fn flush(process: &ProcessHandle, pending: &mut String) -> WebtermResult<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let bytes = std::mem::take(pending).into_bytes();
    process.write(bytes).await
}

#[cfg(test)]
mod tests {
    use super::super::broadcaster::Received;
    use super::super::ring_buffer::OutputEvent;
    use super::super::store::memory::{MemoryLogStore, MemorySessionStore};
    use super::*;
    use crate::git::tests::FakeRepo;
    use crate::git::GitCli;
    use std::path::PathBuf;
    use webterm_core::{GitStatusEntry, Profile};

    struct Harness {
        sessions: Arc<MemorySessionStore>,
        logs: Arc<MemoryLogStore>,
        deps: RuntimeDeps,
    }

    fn harness_with(git: Arc<dyn RepoInspector>) -> Harness {
        let sessions = Arc::new(MemorySessionStore::default());
        let logs = Arc::new(MemoryLogStore::default());
        let mut settings = RuntimeSettings::default();
        settings.terminate_grace = Duration::from_millis(300);
        settings.git.quiet_window = Duration::from_millis(50);
        settings.git.max_wait = Duration::from_millis(500);
        let deps = RuntimeDeps {
            sessions: sessions.clone(),
            logs: logs.clone(),
            git,
            settings,
        };
        Harness { sessions, logs, deps }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(GitCli::new(Duration::from_secs(2))))
    }

    fn record(id: &str, profile: Profile) -> SessionRecord {
        SessionRecord::new(id.into(), profile, std::env::temp_dir(), PathBuf::from("memory"))
    }

    fn text_of(events: &[OutputEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Output(t) => Some(t.to_string()),
                EventPayload::GitDelta(_) => None,
            })
            .collect()
    }

    /// Collect everything until the stream ends; returns (text, last status).
    async fn follow(mut sub: Subscription) -> (String, Option<StatusUpdate>) {
        let mut text = String::new();
        let mut last = None;
        let deadline = Duration::from_secs(10);
        while let Ok(Some(item)) = tokio::time::timeout(deadline, sub.recv()).await {
            match item {
                Received::Replay(events) => text.push_str(&text_of(&events)),
                Received::Event(e) => text.push_str(&text_of(&[e])),
                Received::Status(s) => last = Some(s),
                Received::Gap { .. } => {}
            }
        }
        (text, last)
    }

    #[tokio::test]
    async fn echo_hello_completes_with_exit_code_zero() {
        let h = harness();
        let rt = SessionRuntime::new(record("echo1", Profile::new("echo", "echo").with_args(["hello"])), h.deps.clone());
        let sub = rt.subscribe("viewer").await;
        rt.start().await.unwrap();

        let (text, last) = follow(sub).await;
        assert!(text.contains("hello"), "got {text:?}");
        assert!(text.contains("Process finished with code 0"));
        assert_eq!(
            last,
            Some(StatusUpdate {
                status: SessionStatus::Completed,
                exit_code: Some(0)
            })
        );

        let saved = h.sessions.get("echo1").unwrap();
        assert_eq!(saved.status, SessionStatus::Completed);
        assert_eq!(saved.exit_code, Some(0));
        assert!(saved.finished_at.is_some());
        let log = rt.log().await.unwrap();
        assert!(log.contains("hello"));
    }

    #[tokio::test]
    async fn spawn_failure_goes_to_error() {
        let h = harness();
        let rt = SessionRuntime::new(record("bad", Profile::new("bad", "__webterm_missing__")), h.deps.clone());
        let err = rt.start().await.unwrap_err();
        assert!(matches!(err, WebtermError::Spawn(_)));
        let saved = h.sessions.get("bad").unwrap();
        assert_eq!(saved.status, SessionStatus::Error);
        assert_eq!(saved.exit_code, Some(127));
        assert!(saved.error.is_some());
        assert!(!rt.is_live());
        assert!(rt.send_input("x").await.is_err());
    }

    #[tokio::test]
    async fn shell_exit_then_reconnect_replays_output() {
        let h = harness();
        let rt = SessionRuntime::new(record("sh1", Profile::new("sh", "/bin/sh")), h.deps.clone());
        let first = rt.subscribe("first").await;
        rt.start().await.unwrap();

        rt.send_input("echo replay-marker\r").await.unwrap();
        rt.send_input("exit\r").await.unwrap();
        let (live_text, last) = follow(first).await;
        assert!(live_text.contains("replay-marker"));
        assert_eq!(last.map(|s| s.status), Some(SessionStatus::Completed));

        // A viewer attaching after the end gets the history and the final status.
        let mut late = rt.subscribe("late").await;
        let Some(Received::Replay(events)) = late.recv().await else {
            panic!("expected replay first");
        };
        assert!(text_of(&events).contains("replay-marker"));
        assert!(matches!(
            late.recv().await,
            Some(Received::Status(StatusUpdate { status: SessionStatus::Completed, .. }))
        ));
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminate_stops_running_session_once() {
        let h = harness();
        let rt = SessionRuntime::new(record("sleep1", Profile::new("sleep", "sleep").with_args(["30"])), h.deps.clone());
        let sub = rt.subscribe("viewer").await;
        rt.start().await.unwrap();
        assert!(rt.is_live());

        assert!(rt.terminate(false).await.unwrap());
        let (_, last) = follow(sub).await;
        assert_eq!(last.map(|s| s.status), Some(SessionStatus::Stopped));
        assert_eq!(rt.status(), SessionStatus::Stopped);
        assert_eq!(rt.record().exit_code, None);

        // Second terminate finds nothing to stop and changes nothing.
        assert!(!rt.terminate(true).await.unwrap());
        assert_eq!(h.sessions.get("sleep1").unwrap().status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn terminate_racing_natural_exit_yields_one_transition() {
        for round in 0..5 {
            let h = harness();
            let id = format!("race{round}");
            let rt = SessionRuntime::new(
                record(&id, Profile::new("sh", "/bin/sh").with_args(["-c", "sleep 0.05"])),
                h.deps.clone(),
            );
            let mut sub = rt.subscribe("viewer").await;
            rt.start().await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
            let _ = rt.terminate(false).await;

            let mut terminal = Vec::new();
            while let Ok(Some(item)) = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
                if let Received::Status(s) = item {
                    if s.status.is_terminal() {
                        terminal.push(s.status);
                    }
                }
            }
            assert_eq!(terminal.len(), 1, "round {round}: {terminal:?}");
            assert_eq!(h.sessions.get(&id).unwrap().status, terminal[0]);
        }
    }

    #[tokio::test]
    async fn terminate_after_natural_exit_keeps_exit_code() {
        for round in 0..20 {
            let h = harness();
            let id = format!("exited{round}");
            let rt = SessionRuntime::new(record(&id, Profile::new("true", "true")), h.deps.clone());
            let sub = rt.subscribe("viewer").await;
            rt.start().await.unwrap();
            while rt.is_live() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            assert!(!rt.terminate(false).await.unwrap(), "round {round}");
            let (_, last) = follow(sub).await;
            assert_eq!(
                last,
                Some(StatusUpdate {
                    status: SessionStatus::Completed,
                    exit_code: Some(0)
                }),
                "round {round}"
            );
            assert_eq!(h.sessions.get(&id).unwrap().exit_code, Some(0));
        }
    }

    #[tokio::test]
    async fn stop_before_start_is_applied_on_spawn() {
        let h = harness();
        let rt = SessionRuntime::new(record("early", Profile::new("sleep", "sleep").with_args(["30"])), h.deps.clone());
        assert!(rt.terminate(false).await.unwrap());
        let sub = rt.subscribe("viewer").await;
        rt.start().await.unwrap();
        let (_, last) = follow(sub).await;
        assert_eq!(last.map(|s| s.status), Some(SessionStatus::Stopped));
        assert_eq!(h.sessions.get("early").unwrap().status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn finished_sessions_release_their_process() {
        let h = harness();
        let mut started = Vec::new();
        for i in 0..8 {
            let rt = SessionRuntime::new(
                record(&format!("rel{i}"), Profile::new("sleep", "sleep").with_args(["0.3"])),
                h.deps.clone(),
            );
            let sub = rt.subscribe("viewer").await;
            rt.start().await.unwrap();
            let handle = lock(&rt.process).as_ref().map(Arc::downgrade).expect("process attached");
            started.push((rt, sub, handle));
        }
        for (rt, sub, handle) in started {
            let (_, last) = follow(sub).await;
            assert_eq!(last.map(|s| s.status), Some(SessionStatus::Completed));
            // The runtime stays around as history; the pty does not.
            assert!(handle.upgrade().is_none(), "{} still holds its pty", rt.id());
            assert!(lock(&rt.process).is_none());
        }
    }

    #[tokio::test]
    async fn clear_log_during_output_keeps_log_and_replay_in_step() {
        let h = harness();
        let script = "i=0; while [ $i -lt 3000 ]; do echo line-$i; i=$((i+1)); done";
        let rt = SessionRuntime::new(
            record("busy", Profile::new("sh", "/bin/sh").with_args(["-c", script])),
            h.deps.clone(),
        );
        let mut sub = rt.subscribe("viewer").await;
        rt.start().await.unwrap();
        while let Some(item) = sub.recv().await {
            if matches!(item, Received::Event(_)) {
                break;
            }
        }
        rt.clear_log().await.unwrap();
        follow(sub).await;

        let mut late = rt.subscribe("late").await;
        let Some(Received::Replay(events)) = late.recv().await else {
            panic!("expected replay");
        };
        let log = rt.log().await.unwrap();
        assert!(log.contains("Process finished with code 0"));
        assert_eq!(text_of(&events), format!("{LOG_CLEARED}{log}"));
    }

    #[tokio::test]
    async fn write_after_exit_is_an_error_without_status_change() {
        let h = harness();
        let rt = SessionRuntime::new(record("done", Profile::new("true", "true")), h.deps.clone());
        let sub = rt.subscribe("v").await;
        rt.start().await.unwrap();
        follow(sub).await;
        let err = rt.send_input("ls\r").await.unwrap_err();
        assert!(err.is_write_failure());
        assert_eq!(rt.status(), SessionStatus::Completed);
        // Resize without a process is a no-op.
        rt.resize(100, 40).unwrap();
    }

    #[tokio::test]
    async fn historical_session_replays_persisted_log() {
        let h = harness();
        h.logs.append("old", b"previous run output\r\n").await.unwrap();
        let mut rec = record("old", Profile::new("sh", "/bin/sh"));
        rec.transition(SessionStatus::Interrupted, None).unwrap();
        let rt = SessionRuntime::historical(rec, h.deps.clone());

        let (text, last) = follow(rt.subscribe("v").await).await;
        assert_eq!(text, "previous run output\r\n");
        assert_eq!(last.map(|s| s.status), Some(SessionStatus::Interrupted));
        assert!(!rt.is_live());
        // A second viewer gets the same replay.
        let (again, _) = follow(rt.subscribe("v2").await).await;
        assert_eq!(again, text);
    }

    #[tokio::test]
    async fn clear_log_truncates_and_notifies() {
        let h = harness();
        let rt = SessionRuntime::new(record("cl", Profile::new("sh", "/bin/sh")), h.deps.clone());
        rt.start().await.unwrap();
        rt.send_input("echo before\r").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        rt.clear_log().await.unwrap();
        assert!(rt.log().await.unwrap().is_empty());
        let mut sub = rt.subscribe("v").await;
        let Some(Received::Replay(events)) = sub.recv().await else {
            panic!("expected replay");
        };
        assert_eq!(text_of(&events), "\r\n[log cleared]\r\n");
        rt.terminate(true).await.unwrap();
    }

    #[tokio::test]
    async fn command_boundary_publishes_git_delta() {
        let before = vec![];
        let after = vec![GitStatusEntry {
            status: "??".into(),
            path: "new.txt".into(),
        }];
        let h = harness_with(Arc::new(FakeRepo::new(vec![before, after])));
        let rt = SessionRuntime::new(record("git1", Profile::new("sh", "/bin/sh")), h.deps.clone());
        rt.start().await.unwrap();
        let mut sub = rt.subscribe("v").await;

        rt.send_input("echo new.tc\u{7f}xt\r").await.unwrap();

        let mut delta = None;
        while let Ok(Some(item)) = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await {
            if let Received::Event(OutputEvent {
                payload: EventPayload::GitDelta(d),
                ..
            }) = item
            {
                delta = Some(d);
                break;
            }
        }
        let delta = delta.expect("git delta published");
        assert_eq!(delta.command.as_deref(), Some("echo new.txt"));
        assert_eq!(delta.added, vec!["new.txt (??)"]);
        rt.terminate(true).await.unwrap();
    }

    #[tokio::test]
    async fn passthrough_profile_skips_git_snapshots() {
        let repo = Arc::new(FakeRepo::new(vec![vec![], vec![]]));
        let h = harness_with(repo.clone());
        let mut profile = Profile::new("raw", "/bin/sh");
        profile.passthrough = true;
        let rt = SessionRuntime::new(record("raw1", profile), h.deps.clone());
        rt.start().await.unwrap();
        rt.send_input("true\r").await.unwrap();
        assert_eq!(repo.snapshots.lock().unwrap().len(), 2);
        rt.terminate(true).await.unwrap();
    }
}
