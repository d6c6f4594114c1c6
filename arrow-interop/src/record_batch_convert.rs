//! Record batches travel as a non-nullable struct node whose children are the
//! columns and whose metadata is the schema metadata.

use arrow_array::{Array, RecordBatch, RecordBatchOptions, StructArray};
use arrow_schema::{DataType, Schema};
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::export::Exporter;
use crate::ffi::FFI_ArrowArray;
use crate::import::Importer;

// ---------------------------------------------------------------------------
// RecordBatch → node
// ---------------------------------------------------------------------------

pub(crate) fn export_record_batch(
    exporter: &Exporter<'_>,
    batch: &RecordBatch,
) -> Result<FFI_ArrowArray> {
    let schema = batch.schema();
    let data = StructArray::from(batch.clone()).into_data();
    exporter.export_node("", 0, schema.metadata(), &data, 0)
}

// ---------------------------------------------------------------------------
// node → RecordBatch
// ---------------------------------------------------------------------------

pub(crate) fn import_record_batch(
    importer: &Importer<'_>,
    array: &mut FFI_ArrowArray,
) -> Result<RecordBatch> {
    let imported = importer.import_array(array)?;
    if !matches!(imported.data.data_type(), DataType::Struct(_)) {
        return Err(BridgeError::invalid(format!(
            "record batch must be a struct array, got {}",
            imported.data.data_type()
        )));
    }
    if imported.data.null_count() > 0 {
        return Err(BridgeError::invalid(
            "record batch struct array has top-level nulls",
        ));
    }

    let row_count = imported.data.len();
    let metadata = imported.field.metadata().clone();
    let (fields, columns, _) = StructArray::from(imported.data).into_parts();
    let schema = Arc::new(Schema::new(fields).with_metadata(metadata));
    let options = RecordBatchOptions::new().with_row_count(Some(row_count));
    RecordBatch::try_new_with_options(schema, columns, &options)
        .map_err(|e| BridgeError::invalid(format!("imported record batch is malformed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use arrow_array::{Int32Array, StringArray};
    use arrow_schema::Field;
    use std::collections::HashMap;

    fn batch() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ])
        .with_metadata(HashMap::from([("origin".to_string(), "test".to_string())]));
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_record_batch_round_trip() {
        let config = BridgeConfig::default();
        let batch = batch();
        let mut node = export_record_batch(&Exporter::new(&config), &batch).unwrap();
        assert_eq!(node.format().unwrap().to_str().unwrap(), "+s");
        assert_eq!(node.flags, 0);
        assert_eq!(node.n_children, 2);

        let imported = import_record_batch(&Importer::new(&config), &mut node).unwrap();
        assert!(node.is_released());
        assert_eq!(imported, batch);
        assert_eq!(imported.schema().metadata().get("origin").unwrap(), "test");
    }

    #[test]
    fn test_empty_batch_keeps_row_count() {
        let config = BridgeConfig::default();
        let batch = RecordBatch::try_new_with_options(
            Arc::new(Schema::empty()),
            vec![],
            &RecordBatchOptions::new().with_row_count(Some(4)),
        )
        .unwrap();
        let mut node = export_record_batch(&Exporter::new(&config), &batch).unwrap();
        let imported = import_record_batch(&Importer::new(&config), &mut node).unwrap();
        assert_eq!(imported.num_rows(), 4);
        assert_eq!(imported.num_columns(), 0);
    }

    #[test]
    fn test_non_struct_rejected() {
        let config = BridgeConfig::default();
        let mut node = Exporter::new(&config)
            .export_array(&Int32Array::from(vec![1]).to_data())
            .unwrap();
        let err = import_record_batch(&Importer::new(&config), &mut node).unwrap_err();
        assert!(err.is_invalid());
        assert!(node.is_released());
    }
}
