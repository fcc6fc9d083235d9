//! Wire and Persistence Models
//!
//! This module defines the data structures exchanged with the remote service
//! (session payloads, avatar batches, activity events) and the `SessionCache`
//! snapshot written to durable storage.

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// A session issued by the remote service after a successful verification.
///
/// `session_id` authorizes every session-scoped call. An empty id means
/// "no session".
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: String,
}

impl Session {
    pub fn is_active(&self) -> bool {
        !self.session_id.is_empty()
    }
}

/// Ordered set of user ids the remote service has confirmed as joinable.
///
/// Insertion keeps first-seen order and ignores duplicates. Deserializing
/// goes through the same insert path.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct VerifiedSet(Vec<String>);

impl From<Vec<String>> for VerifiedSet {
    fn from(user_ids: Vec<String>) -> Self {
        let mut set = Self::default();
        for user_id in &user_ids {
            set.insert(user_id);
        }
        set
    }
}

impl From<VerifiedSet> for Vec<String> {
    fn from(set: VerifiedSet) -> Self {
        set.0
    }
}

impl VerifiedSet {
    /// Inserts `user_id`, returning `false` if it was already present.
    pub fn insert(&mut self, user_id: &str) -> bool {
        if self.contains(user_id) {
            return false;
        }
        self.0.push(user_id.to_string());
        true
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.0.iter().any(|id| id == user_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// The persisted snapshot of a client's session state.
///
/// Unknown or missing fields fall back to their defaults so older cache
/// files keep loading.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCache {
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub verified_user_ids: VerifiedSet,
    #[serde(default)]
    pub linked_external_id: String,
}

/// Response body of `verify/{userId}`; the session id is only present once
/// the verification has been completed.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct VerificationReply {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// A single named image of an avatar, base64 encoded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AvatarImage {
    pub filename: String,
    #[serde(rename = "base64")]
    pub encoded_image: String,
}

impl AvatarImage {
    /// Decodes the image payload into raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(self.encoded_image.as_bytes())
            .with_context(|| format!("Avatar image '{}' is not valid base64", self.filename))
    }
}

/// A batch of images making up one participant's avatar.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AvatarAsset {
    #[serde(default)]
    pub avatars: Vec<AvatarImage>,
}

impl AvatarAsset {
    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.avatars.iter().map(|a| a.filename.as_str())
    }
}

/// A real-time voice/expression update.
///
/// Outbound events leave `user_id` empty and the server attaches the sender's
/// identity before relaying them to peers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ActivityEvent {
    #[serde(rename = "userid", default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    pub voice_activity: f32,
    #[serde(default)]
    pub action: String,
}

impl ActivityEvent {
    /// Builds a self-originated event with no user id attached.
    pub fn outbound(voice_activity: f32, action: impl Into<String>) -> Self {
        Self {
            user_id: String::new(),
            voice_activity,
            action: action.into(),
        }
    }
}
