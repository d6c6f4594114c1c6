//! The exchange node and its move primitives.
#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_void, CStr};
use std::ptr;

use crate::error::{BridgeError, Result};

/// One node of an exported array tree, laid out for the C ABI.
///
/// A node is Live while `format` is non-null and Released afterwards.
/// Released is terminal: every pointer is null and dropping the node does
/// nothing. Children and the dictionary are separate allocations, so moving
/// a node never moves its subtree.
#[repr(C)]
#[derive(Debug)]
pub struct FFI_ArrowArray {
    pub format: *const c_char,
    pub name: *const c_char,
    pub metadata: *const c_char,
    pub flags: i64,
    pub length: i64,
    pub null_count: i64,
    pub offset: i64,
    pub n_buffers: i64,
    pub n_children: i64,
    pub buffers: *mut *const c_void,
    pub children: *mut *mut FFI_ArrowArray,
    pub dictionary: *mut FFI_ArrowArray,
    pub release: Option<unsafe extern "C" fn(array: *mut FFI_ArrowArray)>,
    pub private_data: *mut c_void,
}

// The producer's release callback may run on any thread; the exchange
// contract requires it to be thread-safe and the node owns its subtree.
unsafe impl Send for FFI_ArrowArray {}
unsafe impl Sync for FFI_ArrowArray {}

impl FFI_ArrowArray {
    /// A Released node, suitable as a move destination.
    pub fn empty() -> Self {
        Self {
            format: ptr::null(),
            name: ptr::null(),
            metadata: ptr::null(),
            flags: 0,
            length: 0,
            null_count: 0,
            offset: 0,
            n_buffers: 0,
            n_children: 0,
            buffers: ptr::null_mut(),
            children: ptr::null_mut(),
            dictionary: ptr::null_mut(),
            release: None,
            private_data: ptr::null_mut(),
        }
    }

    pub fn is_released(&self) -> bool {
        self.format.is_null()
    }

    pub fn format(&self) -> Option<&CStr> {
        // SAFETY: a Live node's format is a NUL-terminated string owned by the node.
        (!self.format.is_null()).then(|| unsafe { CStr::from_ptr(self.format) })
    }

    pub fn name(&self) -> Option<&CStr> {
        // SAFETY: as for `format`.
        (!self.name.is_null()).then(|| unsafe { CStr::from_ptr(self.name) })
    }

    pub fn n_buffers(&self) -> usize {
        self.n_buffers.max(0) as usize
    }

    pub fn n_children(&self) -> usize {
        self.n_children.max(0) as usize
    }

    /// Raw address of buffer `index`, null when absent or out of range.
    pub fn buffer(&self, index: usize) -> *const c_void {
        if self.buffers.is_null() || index >= self.n_buffers() {
            return ptr::null();
        }
        // SAFETY: `buffers` holds `n_buffers` entries while the node is Live.
        unsafe { *self.buffers.add(index) }
    }

    pub fn child(&self, index: usize) -> Option<&FFI_ArrowArray> {
        let child = self.child_ptr(index)?;
        // SAFETY: child pointers of a Live node point at Live or Released nodes it owns.
        Some(unsafe { &*child })
    }

    pub fn dictionary(&self) -> Option<&FFI_ArrowArray> {
        // SAFETY: as for `child`.
        (!self.dictionary.is_null()).then(|| unsafe { &*self.dictionary })
    }

    fn child_ptr(&self, index: usize) -> Option<*mut FFI_ArrowArray> {
        if self.children.is_null() || index >= self.n_children() {
            return None;
        }
        // SAFETY: `children` holds `n_children` entries while the node is Live.
        let child = unsafe { *self.children.add(index) };
        (!child.is_null()).then_some(child)
    }

    /// Invoke the release callback if the node is Live, then leave it
    /// Released. Does nothing on a Released node.
    pub fn release(&mut self) {
        if self.is_released() {
            return;
        }
        if let Some(release) = self.release {
            // SAFETY: the node is Live and its callback was installed by its producer.
            unsafe { release(self) };
        }
        self.format = ptr::null();
        self.release = None;
        self.private_data = ptr::null_mut();
    }

    /// Move the node out, leaving `self` Released.
    pub fn take(&mut self) -> FFI_ArrowArray {
        std::mem::replace(self, FFI_ArrowArray::empty())
    }

    /// Move child `index` out of this node.
    ///
    /// The parent keeps a Released node in that slot, so releasing the parent
    /// later frees its own buffers and remaining children but leaves the
    /// extracted subtree alone.
    pub fn take_child(&mut self, index: usize) -> Result<FFI_ArrowArray> {
        if self.is_released() {
            return Err(BridgeError::invalid("cannot move a child out of a released array"));
        }
        let child = self.child_ptr(index).ok_or_else(|| {
            BridgeError::invalid(format!(
                "child index {index} out of range for array with {} children",
                self.n_children
            ))
        })?;
        // SAFETY: `child` is a node owned by this Live parent; replacing it in
        // place keeps the parent's child table valid.
        let child = unsafe { &mut *child };
        if child.is_released() {
            return Err(BridgeError::invalid(format!("child {index} was already released")));
        }
        Ok(child.take())
    }
}

impl Drop for FFI_ArrowArray {
    fn drop(&mut self) {
        self.release();
    }
}

/// Move a node between two C-owned locations.
///
/// `src` is left Released; `dst` is overwritten without being released.
///
/// # Safety
///
/// Both pointers must be valid and aligned, and `dst` must not hold a Live
/// node, otherwise that node leaks.
pub unsafe fn move_array(src: *mut FFI_ArrowArray, dst: *mut FFI_ArrowArray) {
    let node = ptr::replace(src, FFI_ArrowArray::empty());
    ptr::write(dst, node);
}
