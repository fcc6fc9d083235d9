//! Avatar Sync Client Library Crate
//!
//! Configuration, application wiring and the headless character gateway used
//! by the `sync-client` binary. The binary itself is a thin wrapper around
//! this library.

pub mod config;
pub mod gateway;
pub mod state;
