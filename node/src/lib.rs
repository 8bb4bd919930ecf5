//! Manifold Node Implementation
//! 
//! Wires the core crates into running nodes:
//! - `ReactorNode` owns one reactor thread's store, engine and sync service
//! - `NodeRuntime` starts one OS thread per thread-class reactor
//! - `LocalCluster` runs several nodes on the calling thread
//! - `run_demo` scripts transactions and a merge over a local cluster

mod client;
mod cluster;
mod demo;
mod node;
mod runtime;
mod worker;

pub use client::*;
pub use cluster::*;
pub use demo::*;
pub use node::*;
pub use runtime::*;
pub use worker::*;
