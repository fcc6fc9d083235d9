//! Session Store
//!
//! Holds the current session, the participant list with each participant's
//! provisioning state, and the local user's own activity. The store is plain
//! data; concurrent access goes through `SharedStore`, which serializes every
//! read and write behind one async mutex.

use crate::gateway::CharacterHandle;
use crate::models::{ActivityEvent, Session, SessionCache, VerifiedSet};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// The store shared between the session client and the realtime engine.
pub type SharedStore = Arc<Mutex<SessionStore>>;

/// Identifies one entry of the participant list.
///
/// Two entries for the same user id get distinct ids, so each can be
/// removed without touching the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(u64);

/// A remote user known to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub user_id: String,
    pub character: Option<CharacterHandle>,
}

/// A participant added ahead of the service confirming it.
///
/// Exactly one of `commit` or `rollback` consumes it once the request
/// resolves.
#[derive(Debug)]
#[must_use = "a tentative participant must be committed or rolled back"]
pub struct TentativeParticipant {
    id: ParticipantId,
    user_id: String,
}

impl TentativeParticipant {
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Keeps the participant and records its user id as verified.
    /// Returns `true` if the id was newly added to the verified set.
    pub fn commit(self, store: &mut SessionStore) -> bool {
        store.cache.verified_user_ids.insert(&self.user_id)
    }

    /// Removes this participant entry and only this one.
    pub fn rollback(self, store: &mut SessionStore) -> Option<Participant> {
        store.remove_participant(self.id)
    }
}

/// Where the session cache lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    pub folder: PathBuf,
    pub file_name: String,
}

impl CacheLocation {
    pub fn new(folder: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            file_name: file_name.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.folder.join(&self.file_name)
    }
}

/// A copy of the session cache bound for disk.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    path: PathBuf,
    cache: SessionCache,
}

impl CacheSnapshot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&self.cache)?;
        tokio::fs::write(&self.path, serialized)
            .await
            .with_context(|| format!("Failed to write session cache to {}", self.path.display()))?;
        info!(path = %self.path.display(), "Session cache saved");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    cache: SessionCache,
    participants: Vec<Participant>,
    self_activity: ActivityEvent,
    cache_path: Option<PathBuf>,
    next_participant: u64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores the store from `location`, creating the folder if needed.
    ///
    /// A missing, unreadable or corrupt cache file yields an empty cache. Only
    /// a failure to create the folder is reported, and even then the returned
    /// store is usable in memory. Call this before taking the `SharedStore`
    /// lock and swap the result in afterwards.
    pub async fn load(location: &CacheLocation) -> Self {
        let path = location.path();
        if let Err(e) = tokio::fs::create_dir_all(&location.folder).await {
            warn!(folder = %location.folder.display(), error = %e, "Failed to create cache folder");
        }

        let cache = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<SessionCache>(&text) {
                Ok(cache) => {
                    info!(path = %path.display(), has_session = cache.session.is_active(), "Session cache restored");
                    cache
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Session cache is corrupt, starting empty");
                    SessionCache::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No session cache found, starting empty");
                SessionCache::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read session cache, starting empty");
                SessionCache::default()
            }
        };

        Self {
            cache,
            cache_path: Some(path),
            ..Self::default()
        }
    }

    /// Copies the cache and its destination so the write can happen after
    /// the lock is released.
    pub fn snapshot(&self) -> Result<CacheSnapshot> {
        let path = self
            .cache_path
            .clone()
            .context("Session cache location is not set; load the cache first")?;
        Ok(CacheSnapshot {
            path,
            cache: self.cache.clone(),
        })
    }

    pub fn cache_path(&self) -> Option<&Path> {
        self.cache_path.as_deref()
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    // --- Session ---

    pub fn has_session(&self) -> bool {
        self.cache.session.is_active()
    }

    /// The current session id, if a session is active.
    pub fn session_id(&self) -> Option<&str> {
        self.has_session()
            .then_some(self.cache.session.session_id.as_str())
    }

    pub fn session(&self) -> &Session {
        &self.cache.session
    }

    pub fn set_session(&mut self, session: Session) {
        self.cache.session = session;
    }

    /// Drops the session. Verified ids and participants are kept.
    pub fn reset_session(&mut self) {
        self.cache.session = Session::default();
    }

    pub fn verified(&self) -> &VerifiedSet {
        &self.cache.verified_user_ids
    }

    pub fn linked_external_id(&self) -> &str {
        &self.cache.linked_external_id
    }

    pub fn set_linked_external_id(&mut self, external_id: impl Into<String>) {
        self.cache.linked_external_id = external_id.into();
    }

    // --- Participants ---

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Appends a participant that needs no confirmation.
    pub fn add_participant(&mut self, user_id: impl Into<String>) -> ParticipantId {
        let id = self.allocate_id();
        self.participants.push(Participant {
            id,
            user_id: user_id.into(),
            character: None,
        });
        id
    }

    /// Appends a participant that stays in the list until the returned
    /// handle is committed or rolled back.
    pub fn add_tentative(&mut self, user_id: impl Into<String>) -> TentativeParticipant {
        let user_id = user_id.into();
        let id = self.add_participant(user_id.clone());
        TentativeParticipant { id, user_id }
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: ParticipantId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    /// First participant entry for `user_id`.
    pub fn find_by_user(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn remove_participant(&mut self, id: ParticipantId) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.id == id)?;
        Some(self.participants.remove(index))
    }

    /// User ids of all participants, in list order.
    pub fn participant_user_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.user_id.clone()).collect()
    }

    // --- Self activity ---

    pub fn self_activity(&self) -> &ActivityEvent {
        &self.self_activity
    }

    pub fn set_self_activity(&mut self, voice_activity: f32, action: impl Into<String>) {
        self.self_activity = ActivityEvent::outbound(voice_activity, action);
    }

    fn allocate_id(&mut self) -> ParticipantId {
        self.next_participant += 1;
        ParticipantId(self.next_participant)
    }
}
