//! Avatar Sync Core
//!
//! Session lifecycle and real-time activity sync against the avatar sync
//! service: the session store and its on-disk cache, the request/response
//! transport, the session client that drives verification and avatar
//! exchange, and the realtime engine that streams voice/expression updates
//! between participants.

pub mod client;
pub mod gateway;
pub mod models;
pub mod realtime;
pub mod store;
pub mod transport;

pub use client::{RequestOutcome, SessionClient};
pub use gateway::{AvatarSource, CharacterGateway, CharacterHandle, DirectoryAvatarSource};
pub use realtime::{ConnectionState, RealtimeEngine};
pub use store::{CacheLocation, CacheSnapshot, SessionStore, SharedStore};
pub use transport::{ApiTransport, HttpTransport, ServiceEndpoint};
