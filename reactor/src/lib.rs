//! Manifold Reactor
//! 
//! A single-threaded cooperative scheduler. Work is expressed as tasks and
//! continuations instead of blocking calls:
//! - `TaskQueue` holds ready tasks (FIFO) and deferred continuations
//! - `Reactor` runs tasks, routes fabric deliveries to port listeners
//! - `Fabric` carries codec-encoded messages between reactors
//! - `ReactorDriver` waits for deliveries without blocking the runtime

pub mod task;
pub mod queue;
pub mod codec;
pub mod fabric;
pub mod reactor;
pub mod driver;

pub use task::*;
pub use queue::*;
pub use codec::*;
pub use fabric::*;
pub use reactor::*;
pub use driver::*;
