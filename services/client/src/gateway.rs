//! A Character Provisioning Gateway for headless use.
//!
//! Rendering is not available from the command line, so this gateway only
//! allocates handles and logs what a renderer would have been asked to do.

use anyhow::Result;
use avatar_sync_core::{CharacterGateway, CharacterHandle};
use avatar_sync_core::models::{ActivityEvent, AvatarAsset};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct LoggingGateway {
    next_handle: AtomicU64,
}

impl LoggingGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CharacterGateway for LoggingGateway {
    fn create_character(&self, user_id: &str, asset: &AvatarAsset) -> Result<CharacterHandle> {
        let handle = CharacterHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        for image in &asset.avatars {
            // Every image must decode before a handle is issued.
            image.decode()?;
        }
        info!(%user_id, ?handle, images = asset.avatars.len(), "Character created");
        Ok(handle)
    }

    fn update_character(&self, handle: CharacterHandle, asset: &AvatarAsset) -> Result<()> {
        for image in &asset.avatars {
            image.decode()?;
        }
        info!(?handle, images = asset.avatars.len(), "Character sprites replaced");
        Ok(())
    }

    fn apply_activity(&self, handle: CharacterHandle, event: &ActivityEvent) {
        debug!(
            ?handle,
            user_id = %event.user_id,
            voice_activity = event.voice_activity,
            action = %event.action,
            "Peer activity"
        );
    }
}
