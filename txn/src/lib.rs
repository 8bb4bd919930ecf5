//! Manifold Transactions
//!
//! Optimistic transactions over a `ComboSnapshot`:
//! - range locks are exclusive and held until commit or abort
//! - reads resolve against the snapshot pinned at begin
//! - commit validates the locked ranges and publishes at a fresh stamp

pub mod lock;
pub mod engine;
pub mod transaction;
pub mod view;

pub use lock::*;
pub use engine::*;
pub use transaction::*;
pub use view::*;
