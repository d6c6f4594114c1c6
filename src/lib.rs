//! Columnar bridge: zero-copy exchange of Arrow arrays across a C ABI.
//!
//! Re-exports the exchange bridge ([`arrow_interop`]) and the allocation
//! accounting pool ([`memory_manager`]) used to observe buffer lifetimes.

pub use arrow_interop;
pub use memory_manager;

pub use arrow_interop::{
    export_array, export_field, export_record_batch, import_array, import_array_from_raw,
    import_array_with_type, import_record_batch, move_array, release_violations, Bridge,
    BridgeConfig, BridgeError, FFI_ArrowArray, Format, ImportedArray,
};
pub use memory_manager::{PoolStats, TrackingPool};
