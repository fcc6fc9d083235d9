//! External Collaborators
//!
//! The session core hands avatar data to a Character Provisioning Gateway and
//! reads locally cached avatar files from an `AvatarSource`. Both are passed in
//! at construction so the core never reaches for global state.

use crate::models::{ActivityEvent, AvatarAsset};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Opaque reference to a visual representation owned by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacterHandle(pub u64);

/// Turns avatar data into a renderable character and drives it afterwards.
///
/// `create_character` and `update_character` run while the session store is
/// locked, so implementations should hand heavy work off rather than block.
#[cfg_attr(test, mockall::automock)]
pub trait CharacterGateway: Send + Sync {
    /// Creates a new representation for a participant's first avatar.
    fn create_character(&self, user_id: &str, asset: &AvatarAsset) -> Result<CharacterHandle>;

    /// Replaces the sprites of an existing representation.
    fn update_character(&self, handle: CharacterHandle, asset: &AvatarAsset) -> Result<()>;

    /// Applies a peer's activity update to its representation.
    fn apply_activity(&self, handle: CharacterHandle, event: &ActivityEvent);
}

/// Lists avatar images cached on this machine for upload.
#[cfg_attr(test, mockall::automock)]
pub trait AvatarSource: Send + Sync {
    fn cached_avatar_paths(&self) -> Result<Vec<PathBuf>>;
}

/// An `AvatarSource` backed by a plain directory of image files.
#[derive(Debug, Clone)]
pub struct DirectoryAvatarSource {
    root: PathBuf,
}

impl DirectoryAvatarSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AvatarSource for DirectoryAvatarSource {
    /// Returns every regular file in the directory, sorted by name. A missing
    /// directory means nothing has been cached yet.
    fn cached_avatar_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read avatar directory {}", self.root.display()))?
        {
            let path = entry?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}
