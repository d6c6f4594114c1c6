use std::sync::Arc;

use anyhow::Result;
use arrow_array::{Array, ArrayRef, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field};
use columnar_bridge::{
    export_array, export_field, export_record_batch, import_array, import_record_batch, Bridge,
    BridgeConfig, TrackingPool,
};
use tracing::{info, warn, Level};

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    info!("Columnar bridge - Rust examples");

    // Example 1: Export an array and import it back
    round_trip_example()?;

    // Example 2: Field names, nullability and metadata travel with the node
    field_example()?;

    // Example 3: Record batches
    record_batch_example()?;

    // Example 4: Watch buffer lifetimes with a tracking pool
    lifetime_example()?;

    // Example 5: Configuration and error handling
    config_example()?;

    Ok(())
}

fn round_trip_example() -> Result<()> {
    info!("=== Example 1: Round trip ===");

    let source = Int32Array::from(vec![Some(1), Some(2), None, Some(4)]);
    let mut node = export_array(&source.to_data())?;
    info!(
        "Exported node: format={:?} length={} null_count={} n_buffers={}",
        node.format(),
        node.length,
        node.null_count,
        node.n_buffers
    );

    let imported = import_array(&mut node)?;
    info!("Node released after import: {}", node.is_released());

    let values = Int32Array::from(imported.data);
    info!("Imported values: {:?}", values);
    info!(
        "Data buffer shared with source: {}",
        values.values().inner().as_ptr() == source.values().inner().as_ptr()
    );

    Ok(())
}

fn field_example() -> Result<()> {
    info!("=== Example 2: Field ===");

    let field = Field::new("city", DataType::Utf8, false)
        .with_metadata([("origin".to_string(), "census".to_string())].into());
    let data = StringArray::from(vec!["Lyon", "Porto"]).to_data();

    let mut node = export_field(&field, &data)?;
    let imported = import_array(&mut node)?;
    info!("Imported field: {:?}", imported.field);

    Ok(())
}

fn record_batch_example() -> Result<()> {
    info!("=== Example 3: Record batch ===");

    let batch = RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(vec![10, 20, 30])) as ArrayRef),
        (
            "label",
            Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])) as ArrayRef,
        ),
    ])?;

    let mut node = export_record_batch(&batch)?;
    let imported = import_record_batch(&mut node)?;
    info!(
        "Imported batch: {} rows, {} columns, schema {:?}",
        imported.num_rows(),
        imported.num_columns(),
        imported.schema()
    );

    Ok(())
}

fn lifetime_example() -> Result<()> {
    info!("=== Example 4: Buffer lifetimes ===");

    let pool = TrackingPool::new();
    let tracked = pool.track_array(&Int64Array::from_iter_values(0..1024).to_data())?;
    info!("Tracked bytes: {}", pool.bytes_allocated());

    let mut node = export_array(&tracked)?;
    drop(tracked);
    info!("Source dropped, node alive: {} bytes", pool.bytes_allocated());

    let imported = import_array(&mut node)?.into_array();
    let slice = imported.slice(10, 5);
    drop(imported);
    info!("Only a slice left: {} bytes", pool.bytes_allocated());

    drop(slice);
    info!("Everything released: {} bytes", pool.bytes_allocated());
    info!("Pool stats: {:?}", pool.stats());

    Ok(())
}

fn config_example() -> Result<()> {
    info!("=== Example 5: Configuration ===");

    let bridge = Bridge::new(BridgeConfig {
        realign_validity: false,
        ..Default::default()
    });

    // The slice's values start at offset 0 but its validity bits start at bit 1,
    // so the bitmap cannot be shared without copying it.
    let sliced = Int32Array::from(vec![Some(1), None, Some(3), None]).slice(1, 3);
    match bridge.export_array(&sliced.to_data()) {
        Ok(_) => info!("Exported without realignment"),
        Err(e) => warn!("Expected error: {}", e),
    }

    let mut node = Bridge::default().export_array(&sliced.to_data())?;
    let imported = bridge.import_array(&mut node)?;
    info!("Default bridge realigned the bitmap: {:?}", imported.into_array());

    Ok(())
}
