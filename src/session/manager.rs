//! # Session Registry
//!
//! Tracks every live conversation. One `SessionManager` is built at startup,
//! stored in `AppState`, and drained at shutdown.
//!
//! ## Locking:
//! - the registry map sits behind one `RwLock`: lookups share it, create and
//!   remove take it exclusively
//! - every session sits behind its own `Mutex`, so audio for one user never
//!   waits on another
//! - the registry lock is never held while a session lock is taken; teardown
//!   of removed sessions happens after the map lock is released

use crate::audio::buffer::AudioChunk;
use crate::conversation::StatsSnapshot;
use crate::error::{AudioFormatError, SessionError};
use crate::session::realtime::{RealtimeConfig, RealtimeSession, RealtimeStatus, SessionCallbacks};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// One registered conversation.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    /// Set while a transport is streaming audio into the session.
    attached: AtomicBool,
    realtime: Mutex<RealtimeSession>,
}

impl Session {
    fn new(id: String, realtime: RealtimeSession) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity: Mutex::new(now),
            attached: AtomicBool::new(false),
            realtime: Mutex::new(realtime),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    fn touch_at(&self, at: DateTime<Utc>) {
        let mut last = self.last_activity.lock();
        if at > *last {
            *last = at;
        }
    }

    /// Claim the session for one transport. Returns false if another
    /// transport already holds it.
    pub fn try_attach(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Lock the realtime session and count it as activity.
    pub fn lock(&self) -> MutexGuard<'_, RealtimeSession> {
        self.touch();
        self.realtime.lock()
    }

    pub fn process_audio_chunk(&self, chunk: AudioChunk) -> Result<(), AudioFormatError> {
        self.lock().process_audio_chunk(chunk)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity(),
            status: self.realtime.lock().status(),
        }
    }

    fn close(&self) {
        self.realtime.lock().close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

/// Status returned by the management API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: RealtimeStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionManagerSummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<String, usize>,
    pub totals: StatsSnapshot,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_concurrent_sessions: usize,
    default_config: RwLock<RealtimeConfig>,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize, default_config: RealtimeConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
            default_config: RwLock::new(default_config),
        }
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent_sessions
    }

    /// Config applied to sessions created from now on.
    pub fn set_default_config(&self, config: RealtimeConfig) {
        *self.default_config.write() = config;
    }

    pub fn default_config(&self) -> RealtimeConfig {
        self.default_config.read().clone()
    }

    /// Register a new session. A missing or blank id gets a UUID.
    pub fn create_session(
        &self,
        session_id: Option<String>,
        callbacks: SessionCallbacks,
    ) -> Result<Arc<Session>, SessionError> {
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let config = self.default_config();

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session_id) {
            return Err(SessionError::Duplicate(session_id));
        }
        if sessions.len() >= self.max_concurrent_sessions {
            return Err(SessionError::LimitReached(self.max_concurrent_sessions));
        }

        let realtime = RealtimeSession::new(session_id.clone(), config, callbacks);
        let session = Arc::new(Session::new(session_id.clone(), realtime));
        sessions.insert(session_id.clone(), Arc::clone(&session));

        info!(session_id = %session_id, active = sessions.len(), "Session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn require_session(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.get_session(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Remove and tear down a session. Returns false if it was already gone.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id);
        match removed {
            Some(session) => {
                session.close();
                info!(session_id = %session_id, "Session removed");
                true
            }
            None => false,
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Remove sessions idle for longer than `max_idle_seconds`.
    pub fn cleanup_idle(&self, max_idle_seconds: u64) -> Vec<String> {
        self.cleanup_idle_at(Utc::now(), max_idle_seconds)
    }

    pub fn cleanup_idle_at(&self, now: DateTime<Utc>, max_idle_seconds: u64) -> Vec<String> {
        let candidates: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let expired: Vec<String> = candidates
            .iter()
            .filter(|session| {
                now.signed_duration_since(session.last_activity()).num_seconds()
                    > max_idle_seconds as i64
            })
            .map(|session| session.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for session_id in expired {
            // Re-check under the write lock: traffic may have arrived since.
            let taken = {
                let mut sessions = self.sessions.write();
                let still_idle = sessions.get(&session_id).is_some_and(|session| {
                    now.signed_duration_since(session.last_activity()).num_seconds()
                        > max_idle_seconds as i64
                });
                if still_idle {
                    sessions.remove(&session_id)
                } else {
                    None
                }
            };
            if let Some(session) = taken {
                session.close();
                removed.push(session_id);
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "Cleaned up idle sessions");
        }
        removed
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn summary(&self) -> SessionManagerSummary {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();

        let mut state_counts = HashMap::new();
        let mut totals = StatsSnapshot::default();
        for session in &sessions {
            let status = session.realtime.lock().status();
            *state_counts.entry(status.state.as_str().to_string()).or_insert(0) += 1;
            totals.merge(&status.stats);
        }

        SessionManagerSummary {
            total_sessions: sessions.len(),
            max_sessions: self.max_concurrent_sessions,
            state_counts,
            totals,
        }
    }

    /// Remove every session, cancelling in-flight work. Used at shutdown.
    pub fn drain(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
            debug!(session_id = %session.id, "Session drained");
        }
        drained.len()
    }
}
