use std::collections::HashMap;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::ServerError;
use crate::models::{CreateSessionRequest, ServerEvent, SessionInfo, UpdateSessionRequest};
use crate::session::{merge_metadata, run_reader, Changes, PtySession};

const EVENT_CHANNEL_SIZE: usize = 1024;

/// Session registry shared by the REST handlers and both socket kinds.
pub struct AppState {
    sessions: RwLock<HashMap<String, Arc<PtySession>>>,
    terminal_counter: Mutex<u32>,
    event_tx: broadcast::Sender<ServerEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalReport {
    pub status: &'static str,
    pub signal: i32,
    pub sent_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            sessions: RwLock::new(HashMap::new()),
            terminal_counter: Mutex::new(0),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    pub fn broadcast_event(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn get(&self, id: &str) -> Result<Arc<PtySession>, ServerError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::SessionNotFound(id.to_string()))
    }

    /// Whether this exact session (not just its id) is still registered.
    pub fn contains(&self, session: &Arc<PtySession>) -> bool {
        self.sessions
            .read()
            .get(&session.id)
            .is_some_and(|s| Arc::ptr_eq(s, session))
    }

    fn next_terminal_name(&self, shell: &str) -> String {
        let mut counter = self.terminal_counter.lock();
        *counter += 1;
        // "/bin/zsh" -> "zsh"
        let shell_name = std::path::Path::new(shell)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("shell");
        format!("{} {}", shell_name, *counter)
    }

    /// All sessions, exited ones included, ordered by index.
    pub fn ordered_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read();
        let mut infos: Vec<_> = sessions.values().map(|s| s.to_info()).collect();
        infos.sort_by_key(|s| s.index);
        infos
    }

    pub fn state_sync(&self) -> ServerEvent {
        ServerEvent::StateSync {
            terminals: self.ordered_sessions(),
        }
    }

    /// Close gaps left by deletions so indices stay `0..n`.
    fn reindex_sessions(&self) {
        let sessions = self.sessions.read();
        let mut order: Vec<_> = sessions
            .values()
            .map(|s| (s.index(), s.id.clone()))
            .collect();
        order.sort();
        for (i, (_, id)) in order.iter().enumerate() {
            if let Some(session) = sessions.get(id) {
                session.set_index(i);
            }
        }
    }

    pub fn create_session(
        self: &Arc<Self>,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, ServerError> {
        let id = match &request.id {
            Some(id) if id.trim().is_empty() => {
                return Err(ServerError::InvalidRequest("id must not be empty".into()))
            }
            Some(id) => id.clone(),
            None => Uuid::new_v4().to_string(),
        };
        if self.sessions.read().contains_key(&id) {
            return Err(ServerError::SessionExists(id));
        }

        let name = request
            .name
            .clone()
            .unwrap_or_else(|| self.next_terminal_name(&request.shell));
        let index = self.session_count();
        let (session, reader) = PtySession::spawn(id.clone(), name, index, &request)?;

        let session_count = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                drop(sessions);
                session.kill();
                return Err(ServerError::SessionExists(id));
            }
            sessions.insert(id.clone(), session.clone());
            sessions.len()
        };
        self.reindex_sessions();

        let info = session.to_info();
        info!(
            "[sessions] Created {} (shell: {}, pid: {:?}, total: {})",
            id, info.shell, info.pid, session_count
        );

        tokio::spawn(run_reader(session, reader, self.clone()));

        self.broadcast_event(ServerEvent::PtyCreated {
            terminal: info.clone(),
            creator_client_id: request.client_id,
        });
        Ok(info)
    }

    /// Apply a rename, move and/or metadata merge. Emits `pty_updated` when
    /// anything changed.
    pub fn update_session(
        &self,
        id: &str,
        request: UpdateSessionRequest,
    ) -> Result<SessionInfo, ServerError> {
        let session = self.get(id)?;
        let mut changes = Changes::new();

        if let Some(name) = request.name {
            if name != session.name() {
                session.set_name(name.clone());
                changes.insert("name".to_string(), serde_json::json!(name));
            }
        }

        if let Some(index) = request.index {
            if let Some(new_index) = self.move_session(&session, index) {
                changes.insert("index".to_string(), serde_json::json!(new_index));
            }
        }

        if let Some(metadata) = request.metadata {
            let merged = merge_metadata(session.metadata(), metadata);
            changes.insert(
                "metadata".to_string(),
                merged.clone().unwrap_or(serde_json::Value::Null),
            );
            session.set_metadata(merged);
        }

        let info = session.to_info();
        if !changes.is_empty() {
            self.broadcast_event(ServerEvent::PtyUpdated {
                terminal: info.clone(),
                changes,
            });
        }
        Ok(info)
    }

    /// Move `session` to `index` (clamped), shifting the sessions in between.
    /// Returns the new index if it moved.
    fn move_session(&self, session: &Arc<PtySession>, index: usize) -> Option<usize> {
        let moved = {
            let sessions = self.sessions.read();
            let old_index = session.index();
            let new_index = index.min(sessions.len().saturating_sub(1));

            if new_index == old_index {
                None
            } else {
                for s in sessions.values() {
                    if s.id == session.id {
                        continue;
                    }
                    let idx = s.index();
                    if new_index < old_index && idx >= new_index && idx < old_index {
                        s.set_index(idx + 1);
                    } else if new_index > old_index && idx > old_index && idx <= new_index {
                        s.set_index(idx - 1);
                    }
                }
                session.set_index(new_index);
                Some(new_index)
            }
        };
        self.reindex_sessions();
        moved
    }

    /// Reorder and announce the whole new ordering.
    pub fn reorder_session(&self, id: &str, index: usize) -> Result<(), ServerError> {
        let session = self.get(id)?;
        self.move_session(&session, index);
        self.broadcast_event(self.state_sync());
        Ok(())
    }

    pub fn resize_session(&self, id: &str, cols: u16, rows: u16) -> Result<SessionInfo, ServerError> {
        let session = self.get(id)?;
        session.resize(cols, rows)?;
        let info = session.to_info();

        let mut changes = Changes::new();
        changes.insert("cols".to_string(), serde_json::json!(cols));
        changes.insert("rows".to_string(), serde_json::json!(rows));
        self.broadcast_event(ServerEvent::PtyUpdated {
            terminal: info.clone(),
            changes,
        });
        Ok(info)
    }

    /// Kill the process and drop the session.
    pub fn delete_session(&self, id: &str) -> Result<(), ServerError> {
        let (session, remaining) = {
            let mut sessions = self.sessions.write();
            let session = sessions.remove(id).ok_or_else(|| {
                warn!("[sessions] Session not found: {}", id);
                ServerError::SessionNotFound(id.to_string())
            })?;
            (session, sessions.len())
        };

        session.kill();
        self.reindex_sessions();
        self.broadcast_event(ServerEvent::PtyDeleted {
            pty_id: id.to_string(),
        });
        info!("[sessions] Deleted {} (remaining: {})", id, remaining);
        Ok(())
    }

    /// Send `signum` to one session or to every live one.
    pub fn signal(&self, signum: i32, session_id: Option<&str>) -> Result<SignalReport, ServerError> {
        let signal = Signal::try_from(signum)
            .map_err(|_| ServerError::InvalidRequest(format!("invalid signal number: {signum}")))?;

        let targets: Vec<Arc<PtySession>> = match session_id {
            Some(id) => vec![self.get(id)?],
            None => self.sessions.read().values().cloned().collect(),
        };

        let mut sent_count = 0;
        let mut errors = Vec::new();
        for session in targets {
            let status = session.status();
            let Some(pid) = status.pid.filter(|_| status.alive) else {
                continue;
            };
            match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) => {
                    info!("[signal] Sent {} to session {} (pid {})", signal, session.id, pid);
                    sent_count += 1;
                }
                Err(e) => {
                    warn!(
                        "[signal] Failed to send {} to session {} (pid {}): {}",
                        signal, session.id, pid, e
                    );
                    errors.push(format!("{}: {}", session.id, e));
                }
            }
        }

        Ok(SignalReport {
            status: if errors.is_empty() { "ok" } else { "partial" },
            signal: signum,
            sent_count,
            errors,
        })
    }

    /// Kill every session. Used on server shutdown.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.kill();
        }
        if !sessions.is_empty() {
            info!("[sessions] Killed {} sessions on shutdown", sessions.len());
        }
    }
}
