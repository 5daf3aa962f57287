//! Room session scope.
//!
//! A [`RoomSession`] is one orchestrator for one (local peer, room) pair.
//! [`SessionRegistry`] guarantees at most one live session per pair: starting
//! a session for an occupied pair fully tears the previous one down first, so
//! two orchestrators never share a subscription or race connection attempts.

use crate::errors::MeshError;
use crate::orchestrator::{OrchestratorActor, OrchestratorHandle, OrchestratorParts};
use signal_protocol::{PeerId, RoomId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Time allowed for a session to tear down before its task is aborted.
pub const SESSION_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub local: PeerId,
    pub room: RoomId,
}

/// A running orchestrator and its task.
pub struct RoomSession {
    key: SessionKey,
    handle: OrchestratorHandle,
    task: JoinHandle<()>,
}

impl RoomSession {
    /// Spawn an orchestrator for `parts`.
    #[must_use]
    pub fn start(parts: OrchestratorParts, cancel_token: CancellationToken) -> Self {
        let key = SessionKey {
            local: parts.api.identity().clone(),
            room: parts.room.clone(),
        };
        let (handle, task) = OrchestratorActor::spawn(parts, cancel_token);
        info!(target: "mesh.session", room_id = %key.room, peer_id = %key.local, "Session started");
        Self { key, handle, task }
    }

    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    #[must_use]
    pub fn handle(&self) -> &OrchestratorHandle {
        &self.handle
    }

    /// Tear down and wait for the orchestrator task to exit.
    ///
    /// Falls back to cancellation, then abort, if the deadline passes.
    ///
    /// # Errors
    ///
    /// `Internal` if the task panicked or had to be aborted.
    pub async fn shutdown(self, deadline: Duration) -> Result<(), MeshError> {
        let Self { key, handle, task } = self;
        let abort = task.abort_handle();

        match tokio::time::timeout(deadline, handle.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(target: "mesh.session", room_id = %key.room, error = %e, "Orchestrator already stopped");
            }
            Err(_) => {
                warn!(target: "mesh.session", room_id = %key.room, "Teardown timed out, cancelling");
                handle.cancel();
            }
        }

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(())) => {
                info!(target: "mesh.session", room_id = %key.room, peer_id = %key.local, "Session stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(target: "mesh.session", room_id = %key.room, error = %e, "Orchestrator task failed");
                Err(MeshError::Internal(format!("orchestrator task failed: {e}")))
            }
            Err(_) => {
                error!(target: "mesh.session", room_id = %key.room, "Orchestrator did not stop, aborting");
                abort.abort();
                Err(MeshError::Internal(
                    "orchestrator did not stop within deadline".to_string(),
                ))
            }
        }
    }
}

/// Owner of every live session.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, RoomSession>>,
    cancel_token: CancellationToken,
}

impl SessionRegistry {
    /// Sessions get child tokens of `cancel_token`.
    #[must_use]
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            cancel_token,
        }
    }

    /// Start a session, replacing any session for the same (peer, room).
    ///
    /// The previous session is fully torn down before the new one subscribes.
    pub async fn start(&self, parts: OrchestratorParts) -> OrchestratorHandle {
        let key = SessionKey {
            local: parts.api.identity().clone(),
            room: parts.room.clone(),
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(&key) {
            info!(target: "mesh.session", room_id = %key.room, peer_id = %key.local, "Replacing existing session");
            if let Err(e) = previous.shutdown(SESSION_SHUTDOWN_DEADLINE).await {
                warn!(target: "mesh.session", room_id = %key.room, error = %e, "Previous session teardown incomplete");
            }
        }

        let session = RoomSession::start(parts, self.cancel_token.child_token());
        let handle = session.handle().clone();
        sessions.insert(key, session);
        handle
    }

    /// Handle of the live session for (`local`, `room`).
    pub async fn get(&self, local: &PeerId, room: &RoomId) -> Option<OrchestratorHandle> {
        let key = SessionKey {
            local: local.clone(),
            room: room.clone(),
        };
        self.sessions
            .lock()
            .await
            .get(&key)
            .map(|session| session.handle().clone())
    }

    /// Stop the session for (`local`, `room`). Returns `false` if none was live.
    ///
    /// # Errors
    ///
    /// `Internal` if teardown did not complete cleanly.
    pub async fn stop(&self, local: &PeerId, room: &RoomId) -> Result<bool, MeshError> {
        let key = SessionKey {
            local: local.clone(),
            room: room.clone(),
        };
        let session = self.sessions.lock().await.remove(&key);
        match session {
            Some(session) => session.shutdown(SESSION_SHUTDOWN_DEADLINE).await.map(|()| true),
            None => Ok(false),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Stop every session, logging failures.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<RoomSession> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        info!(target: "mesh.session", sessions = sessions.len(), "Stopping all sessions");

        for session in sessions {
            let room = session.key().room.clone();
            if let Err(e) = session.shutdown(SESSION_SHUTDOWN_DEADLINE).await {
                error!(target: "mesh.session", room_id = %room, error = %e, "Session teardown failed");
            }
        }
    }
}
