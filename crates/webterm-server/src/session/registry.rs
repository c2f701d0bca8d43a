//! Session registry: the process-wide table of session runtimes.
//!
//! Owns creation (id allocation, profile snapshot, spawn), lookup, listing,
//! deletion, and the startup reconciliation of records left behind by a
//! previous server process.

use super::runtime::{RuntimeDeps, SessionRuntime};
use crate::profiles::ProfileStore;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webterm_core::{SessionRecord, SessionStatus, SessionSummary, WebtermError, WebtermResult};

/// Upper bound for one `create_many` call.
pub const MAX_BATCH: u8 = 10;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionRuntime>>>,
    profiles: Arc<dyn ProfileStore>,
    deps: RuntimeDeps,
    default_cwd: PathBuf,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Load persisted sessions and reconcile them before anything is served.
    ///
    /// A record still `created` or `running` belonged to a process that died
    /// with the previous server; it is marked `interrupted` and never respawned.
    pub async fn open(
        profiles: Arc<dyn ProfileStore>,
        deps: RuntimeDeps,
        default_cwd: PathBuf,
        max_sessions: usize,
    ) -> WebtermResult<Self> {
        let records = deps.sessions.load_all().await?;
        let mut sessions = HashMap::with_capacity(records.len());
        let mut reconciled = 0usize;

        for mut record in records {
            if !record.status.is_terminal() {
                let previous = record.status;
                record.transition(SessionStatus::Interrupted, None)?;
                deps.sessions.save(&record).await?;
                reconciled += 1;
                warn!(session_id = %record.id, previous = %previous, "session interrupted by restart");
            }
            let id = record.id.clone();
            sessions.insert(id, SessionRuntime::historical(record, deps.clone()));
        }

        info!(sessions = sessions.len(), reconciled, "session registry opened");
        Ok(Self {
            sessions: RwLock::new(sessions),
            profiles,
            deps,
            default_cwd,
            max_sessions,
        })
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileStore> {
        &self.profiles
    }

    /// Create a session from a profile and start its process.
    ///
    /// A process that fails to spawn still yields a session, in `error`.
    pub async fn create(&self, profile_id: &str) -> WebtermResult<Arc<SessionRuntime>> {
        let profile = self.profiles.get(profile_id)?;
        let cwd = profile.cwd.clone().unwrap_or_else(|| self.default_cwd.clone());

        let runtime = {
            let mut sessions = self.sessions.write().await;
            let live = sessions
                .values()
                .filter(|s| !s.status().is_terminal())
                .count();
            if live >= self.max_sessions {
                return Err(WebtermError::LimitReached(format!(
                    "max sessions ({}) reached",
                    self.max_sessions
                )));
            }

            let id = loop {
                let candidate = generate_session_id();
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            };
            let log_path = self.deps.logs.path_for(&id);
            let record = SessionRecord::new(id.clone(), profile, cwd, log_path);
            let runtime = SessionRuntime::new(record, self.deps.clone());
            sessions.insert(id, runtime.clone());
            runtime
        };
        info!(session_id = %runtime.id(), profile_id, "session created");

        if let Err(e) = runtime.start().await {
            debug!(session_id = %runtime.id(), error = %e, "session registered in error state");
        }
        Ok(runtime)
    }

    /// Create `quantity` sessions from one profile (1..=10).
    pub async fn create_many(&self, profile_id: &str, quantity: u8) -> WebtermResult<Vec<Arc<SessionRuntime>>> {
        if quantity == 0 || quantity > MAX_BATCH {
            return Err(WebtermError::InvalidMessage(format!(
                "quantity must be between 1 and {MAX_BATCH}"
            )));
        }
        let mut created = Vec::with_capacity(quantity as usize);
        for _ in 0..quantity {
            created.push(self.create(profile_id).await?);
        }
        Ok(created)
    }

    pub async fn get(&self, session_id: &str) -> WebtermResult<Arc<SessionRuntime>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| WebtermError::SessionNotFound(session_id.to_string()))
    }

    /// Every known session, newest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let runtimes: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut list: Vec<_> = runtimes.iter().map(|r| r.summary()).collect();
        list.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        list
    }

    /// Stop a session's process; the session stays listed as `stopped`.
    pub async fn stop(&self, session_id: &str) -> WebtermResult<bool> {
        let runtime = self.get(session_id).await?;
        runtime.terminate(false).await
    }

    /// Unregister a session, stop it, and remove its record and log.
    pub async fn delete(&self, session_id: &str) -> WebtermResult<()> {
        let runtime = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| WebtermError::SessionNotFound(session_id.to_string()))?;

        if let Err(e) = runtime.terminate(false).await {
            warn!(session_id, error = %e, "failed to stop session being deleted");
        }
        runtime.close();
        self.deps.sessions.delete(session_id).await?;
        self.deps.logs.discard(session_id).await?;
        info!(session_id, "session deleted");
        Ok(())
    }

    /// Stop every live session, recording each as `stopped`.
    pub async fn shutdown(&self) {
        let live: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|r| r.is_live())
            .cloned()
            .collect();
        if live.is_empty() {
            return;
        }
        info!(count = live.len(), "stopping live sessions");
        let results = join_all(live.iter().map(|r| r.terminate(false))).await;
        for (runtime, result) in live.iter().zip(results) {
            if let Err(e) = result {
                warn!(session_id = %runtime.id(), error = %e, "failed to stop session on shutdown");
            }
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}
