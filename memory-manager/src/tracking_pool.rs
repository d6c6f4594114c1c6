use anyhow::{bail, Context, Result};
use arrow_buffer::{BooleanBuffer, Buffer, MutableBuffer, NullBuffer};
use arrow_data::ArrayData;
use parking_lot::Mutex;
use std::panic::RefUnwindSafe;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, trace};

/// Allocation-tracking pool for Arrow buffers
///
/// Every buffer handed out by the pool owns a dedicated allocation. Its size is
/// added to the pool counters when the buffer is created and removed when the
/// last `Buffer` (or slice, or clone) referencing it is dropped, on whichever
/// thread that happens.
#[derive(Clone, Default)]
pub struct TrackingPool {
    counters: Arc<Counters>,
    limit: Option<usize>,
}

/// Snapshot of the pool counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub bytes_allocated: usize,
    pub num_allocations: usize,
    pub peak_bytes: usize,
}

#[derive(Default)]
struct Counters(Mutex<PoolStats>);

// parking_lot mutexes do not poison and every update completes under the lock.
impl RefUnwindSafe for Counters {}

struct TrackedAllocation {
    _storage: Buffer,
    size: usize,
    counters: Arc<Counters>,
}

impl Drop for TrackedAllocation {
    fn drop(&mut self) {
        let mut stats = self.counters.0.lock();
        stats.bytes_allocated -= self.size;
        stats.num_allocations -= 1;
        trace!("Freed {} tracked bytes ({} still allocated)", self.size, stats.bytes_allocated);
    }
}

impl TrackingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that refuses allocations once `max_bytes` are outstanding.
    pub fn with_limit(max_bytes: usize) -> Self {
        debug!("Creating tracking pool with a {} byte limit", max_bytes);
        Self {
            counters: Arc::default(),
            limit: Some(max_bytes),
        }
    }

    /// Copy `bytes` into a new tracked, 64-byte aligned allocation.
    pub fn allocate(&self, bytes: &[u8]) -> Result<Buffer> {
        let size = bytes.len();
        {
            let mut stats = self.counters.0.lock();
            if let Some(limit) = self.limit {
                if stats.bytes_allocated + size > limit {
                    bail!(
                        "Allocation of {} bytes exceeds pool limit ({} of {} bytes in use)",
                        size,
                        stats.bytes_allocated,
                        limit
                    );
                }
            }
            stats.bytes_allocated += size;
            stats.num_allocations += 1;
            stats.peak_bytes = stats.peak_bytes.max(stats.bytes_allocated);
        }

        let mut storage = MutableBuffer::new(size);
        storage.extend_from_slice(bytes);
        let storage: Buffer = storage.into();
        let ptr = NonNull::new(storage.as_ptr() as *mut u8)
            .context("Tracked allocation returned a null pointer")?;

        let owner = Arc::new(TrackedAllocation {
            _storage: storage,
            size,
            counters: Arc::clone(&self.counters),
        });
        trace!("Allocated {} tracked bytes", size);

        // SAFETY: `ptr` points at `size` initialised bytes kept alive by `owner`.
        Ok(unsafe { Buffer::from_custom_allocation(ptr, size, owner) })
    }

    /// Re-home every buffer, validity bitmap and child of `data` into tracked
    /// allocations. Offsets and null counts are preserved.
    pub fn track_array(&self, data: &ArrayData) -> Result<ArrayData> {
        let buffers = data
            .buffers()
            .iter()
            .map(|b| self.allocate(b.as_slice()))
            .collect::<Result<Vec<_>>>()?;

        let nulls = match data.nulls() {
            Some(nulls) => {
                let bitmap = self.allocate(nulls.buffer().as_slice())?;
                Some(NullBuffer::new(BooleanBuffer::new(
                    bitmap,
                    nulls.offset(),
                    nulls.len(),
                )))
            }
            None => None,
        };

        let children = data
            .child_data()
            .iter()
            .map(|child| self.track_array(child))
            .collect::<Result<Vec<_>>>()?;

        data.clone()
            .into_builder()
            .buffers(buffers)
            .nulls(nulls)
            .child_data(children)
            .build()
            .context("Rebuilding array over tracked buffers")
    }

    pub fn bytes_allocated(&self) -> usize {
        self.counters.0.lock().bytes_allocated
    }

    pub fn num_allocations(&self) -> usize {
        self.counters.0.lock().num_allocations
    }

    pub fn stats(&self) -> PoolStats {
        *self.counters.0.lock()
    }
}
