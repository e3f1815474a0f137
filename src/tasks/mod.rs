//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a cache is alive.
//!
//! # Tasks
//! - TTL Cleanup: Removes expired cache entries at configured intervals

mod sweeper;

pub use sweeper::{SweepFn, SweepReport, Sweeper};
