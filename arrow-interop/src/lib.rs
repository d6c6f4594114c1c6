//! Zero-copy exchange of Arrow arrays through a C ABI structure.
//!
//! An array is exported as a tree of [`FFI_ArrowArray`] nodes whose buffer
//! pointers alias the source array's memory. Each node carries a release
//! callback; the receiver calls it once, when it no longer needs the data.
//! Importing does the reverse: the buffers of the resulting `ArrayData`
//! alias the node's memory and the node is released when the last of them
//! is dropped.
//!
//! ```text
//! ArrayData ──export──▶ FFI_ArrowArray tree ──import──▶ ArrayData
//!     │                       │ release()                   │
//!     └── kept alive by ──────┘        ◀── fired on last drop
//! ```
//!
//! # Layout contract
//!
//! Each node carries `n_buffers` buffer pointers and `n_children` child
//! nodes, fixed by the category of its format string (see [`layout`]).
//! `buffers[0]` is the validity bitmap (or null) for every category except
//! unions and the null type, where it is unused.

pub mod config;
pub mod error;
mod export;
pub mod ffi;
pub mod format;
mod import;
pub mod layout;
pub mod metadata;
mod record_batch_convert;
mod release;
pub mod schema_utils;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use export::{export_array, export_field};
pub use ffi::{move_array, FFI_ArrowArray};
pub use format::Format;
pub use import::{import_array, import_array_from_raw, import_array_with_type, ImportedArray};
pub use release::release_violations;
pub use schema_utils::{FieldExt, FLAG_DICTIONARY_ORDERED, FLAG_MAP_KEYS_SORTED, FLAG_NULLABLE};

use arrow_array::RecordBatch;
use arrow_data::ArrayData;
use arrow_schema::{DataType, Field};

use export::Exporter;
use import::Importer;

/// Exporter and importer sharing one [`BridgeConfig`].
#[derive(Debug, Clone, Default)]
pub struct Bridge {
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn export_array(&self, data: &ArrayData) -> Result<FFI_ArrowArray> {
        Exporter::new(&self.config).export_array(data)
    }

    pub fn export_field(&self, field: &Field, data: &ArrayData) -> Result<FFI_ArrowArray> {
        Exporter::new(&self.config).export_field(field, data)
    }

    pub fn import_array(&self, array: &mut FFI_ArrowArray) -> Result<ImportedArray> {
        Importer::new(&self.config).import_array(array)
    }

    pub fn import_array_with_type(
        &self,
        array: &mut FFI_ArrowArray,
        expected: &DataType,
    ) -> Result<ImportedArray> {
        Importer::new(&self.config).import_array_with_type(array, expected)
    }

    /// Export a batch as a non-nullable struct node.
    pub fn export_record_batch(&self, batch: &RecordBatch) -> Result<FFI_ArrowArray> {
        record_batch_convert::export_record_batch(&Exporter::new(&self.config), batch)
    }

    /// Import a struct node without top-level nulls as a batch.
    pub fn import_record_batch(&self, array: &mut FFI_ArrowArray) -> Result<RecordBatch> {
        record_batch_convert::import_record_batch(&Importer::new(&self.config), array)
    }
}

/// Export a batch with the default configuration.
pub fn export_record_batch(batch: &RecordBatch) -> Result<FFI_ArrowArray> {
    Bridge::default().export_record_batch(batch)
}

/// Import a batch with the default configuration.
pub fn import_record_batch(array: &mut FFI_ArrowArray) -> Result<RecordBatch> {
    Bridge::default().import_record_batch(array)
}
