//! Allocation accounting for Arrow buffers.
//!
//! [`TrackingPool`] hands out `arrow_buffer::Buffer`s whose storage is counted
//! until the last reference goes away, which makes keep-alive and release
//! behaviour of zero-copy exchanges observable.

pub mod tracking_pool;

pub use tracking_pool::{PoolStats, TrackingPool};
