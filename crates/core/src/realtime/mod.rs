//! Realtime Sync
//!
//! Streams activity updates between session participants over one duplex
//! connection:
//!
//! - `protocol`: the command-prefixed text framing and connection path.
//! - `engine`: connection lifecycle, the fixed-cadence broadcaster and
//!   inbound dispatch into the session store.

pub mod engine;
pub mod protocol;

pub use engine::{ConnectionState, Dispatch, RealtimeEngine};
