//! Manifold State Management
//! 
//! Multi-version key-value storage with point-in-time snapshots.
//! Every key maps to a chain of versions ordered by `VersionStamp`; readers pin
//! a stamp and see the newest version at or before it.

pub mod clock;
pub mod store;
pub mod memory;
pub mod snapshot;
pub mod registry;

pub use clock::*;
pub use store::*;
pub use memory::*;
pub use snapshot::*;
pub use registry::*;
