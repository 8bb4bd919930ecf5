//! Manifold Core Library
//! 
//! Value types, error taxonomy, configuration and the boundary traits shared by
//! every Manifold crate. Nothing in here performs I/O or scheduling.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
