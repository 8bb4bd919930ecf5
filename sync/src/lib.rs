//! Manifold Sync
//!
//! Nodes never share state by reference. They exchange copies:
//! - `DataManager` exposes known state and merges a peer's into the local store
//! - `SyncMessage` is the wire protocol on the `sync/state` and `sync/commit` ports
//! - `SyncService` answers state requests and drives two-phase remote commits

pub mod manager;
pub mod protocol;
pub mod service;

pub use manager::*;
pub use protocol::*;
pub use service::*;
