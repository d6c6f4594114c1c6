//! Heap accounting around export and release.
//!
//! Lives in its own test binary because it installs a global allocator. Bytes
//! are counted per thread so the harness's own allocations do not interfere.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::Arc;

use arrow_array::types::Int32Type;
use arrow_array::{Array, ArrayRef, Int32Array, ListArray, StringArray, StructArray};
use arrow_data::ArrayData;
use arrow_schema::{DataType, Field};

use columnar_bridge::{export_array, import_array};

struct CountingAllocator;

thread_local! {
    static LIVE_BYTES: Cell<isize> = const { Cell::new(0) };
}

fn record(delta: isize) {
    let _ = LIVE_BYTES.try_with(|bytes| bytes.set(bytes.get() + delta));
}

fn live_bytes() -> isize {
    LIVE_BYTES.with(Cell::get)
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        record(-(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            record(new_size as isize - layout.size() as isize);
        }
        new_ptr
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

fn nested() -> ArrayData {
    let tags = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![
        Some(vec![Some(1), Some(2)]),
        None,
        Some(vec![Some(3)]),
    ]);
    StructArray::from(vec![
        (
            Arc::new(Field::new("name", DataType::Utf8, true)),
            Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])) as ArrayRef,
        ),
        (
            Arc::new(Field::new("tags", tags.data_type().clone(), true)),
            Arc::new(tags) as ArrayRef,
        ),
    ])
    .into_data()
}

#[test]
fn test_export_allocates_and_release_frees() {
    for data in [Int32Array::from(vec![Some(1), None, Some(3)]).to_data(), nested()] {
        // First round initialises any lazily allocated logging state.
        export_array(&data).unwrap().release();

        let before = live_bytes();
        let mut node = export_array(&data).unwrap();
        let exported = live_bytes();
        assert!(exported > before, "export must allocate its node state");

        node.release();
        assert_eq!(live_bytes(), before);
    }
}

#[test]
fn test_import_then_drop_frees_everything() {
    let data = nested();
    import_array(&mut export_array(&data).unwrap()).unwrap();

    let before = live_bytes();
    let mut node = export_array(&data).unwrap();
    let imported = import_array(&mut node).unwrap();
    assert!(live_bytes() > before);

    drop(imported);
    drop(node);
    assert_eq!(live_bytes(), before);
}
