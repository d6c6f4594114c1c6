//! Release capsule installed on exported nodes.

use std::ffi::{c_char, c_void, CString};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow_buffer::Buffer;
use arrow_data::ArrayData;
use tracing::{error, trace};

use crate::ffi::FFI_ArrowArray;

static RELEASE_VIOLATIONS: AtomicUsize = AtomicUsize::new(0);

/// Number of times a release callback installed by this crate was invoked on
/// a null or already released node, since process start.
pub fn release_violations() -> usize {
    RELEASE_VIOLATIONS.load(Ordering::Relaxed)
}

fn report_violation(message: &str) {
    RELEASE_VIOLATIONS.fetch_add(1, Ordering::Relaxed);
    error!("{}", message);
}

/// Scalar fields of an exported node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeHeader {
    pub flags: i64,
    pub length: i64,
    pub null_count: i64,
    pub offset: i64,
}

/// Everything an exported node points into. Lives in `private_data` until
/// the node's release callback runs.
pub(crate) struct ExportedPrivateData {
    format: CString,
    name: CString,
    metadata: Option<Vec<u8>>,
    buffers: Box<[*const c_void]>,
    children: Box<[*mut FFI_ArrowArray]>,
    dictionary: *mut FFI_ArrowArray,
    _realigned_validity: Option<Buffer>,
    _keep_alive: ArrayData,
}

impl ExportedPrivateData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        format: CString,
        name: CString,
        metadata: Option<Vec<u8>>,
        buffers: Vec<*const c_void>,
        children: Vec<FFI_ArrowArray>,
        dictionary: Option<FFI_ArrowArray>,
        realigned_validity: Option<Buffer>,
        keep_alive: ArrayData,
    ) -> Self {
        Self {
            format,
            name,
            metadata,
            buffers: buffers.into_boxed_slice(),
            children: children
                .into_iter()
                .map(|child| Box::into_raw(Box::new(child)))
                .collect(),
            dictionary: dictionary.map_or(ptr::null_mut(), |d| Box::into_raw(Box::new(d))),
            _realigned_validity: realigned_validity,
            _keep_alive: keep_alive,
        }
    }

    /// Box the capsule and build the Live node that points into it.
    pub fn into_node(self, header: NodeHeader) -> FFI_ArrowArray {
        let mut private = Box::new(self);
        let metadata = private
            .metadata
            .as_ref()
            .map_or(ptr::null(), |m| m.as_ptr() as *const c_char);
        let children = if private.children.is_empty() {
            ptr::null_mut()
        } else {
            private.children.as_mut_ptr()
        };

        FFI_ArrowArray {
            format: private.format.as_ptr(),
            name: private.name.as_ptr(),
            metadata,
            flags: header.flags,
            length: header.length,
            null_count: header.null_count,
            offset: header.offset,
            n_buffers: private.buffers.len() as i64,
            n_children: private.children.len() as i64,
            buffers: private.buffers.as_mut_ptr(),
            children,
            dictionary: private.dictionary,
            release: Some(release_exported),
            private_data: Box::into_raw(private) as *mut c_void,
        }
    }
}

impl Drop for ExportedPrivateData {
    fn drop(&mut self) {
        // Subtrees go before the data they were exported from.
        for child in self.children.iter() {
            // SAFETY: created by `Box::into_raw` in `new` and freed only here.
            drop(unsafe { Box::from_raw(*child) });
        }
        if !self.dictionary.is_null() {
            // SAFETY: as above.
            drop(unsafe { Box::from_raw(self.dictionary) });
        }
    }
}

/// Release callback of every exported node.
///
/// A second invocation on the same node is a contract violation: it is
/// logged and counted in [`release_violations`], and never touches freed
/// memory. Must not unwind.
pub(crate) unsafe extern "C" fn release_exported(array: *mut FFI_ArrowArray) {
    if array.is_null() {
        report_violation("release callback invoked with a null array pointer");
        return;
    }
    let array = &mut *array;
    if array.release.is_none() || array.private_data.is_null() {
        report_violation("release callback invoked on an array that was already released");
        return;
    }

    let private = Box::from_raw(array.private_data as *mut ExportedPrivateData);
    trace!(
        "Releasing exported array ({} buffers, {} children)",
        private.buffers.len(),
        private.children.len()
    );
    array.format = ptr::null();
    array.name = ptr::null();
    array.metadata = ptr::null();
    array.buffers = ptr::null_mut();
    array.children = ptr::null_mut();
    array.dictionary = ptr::null_mut();
    array.release = None;
    array.private_data = ptr::null_mut();
    drop(private);
}
