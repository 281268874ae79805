//! Emulated accelerator context.
//!
//! A `DeviceContext` owns a table of device-resident buffers. Handles to those
//! buffers (`DeviceBuffer`) stay valid until the last clone is dropped or the
//! context is released, whichever comes first. After `release()` every access
//! through the context or any of its buffers fails with `IllegalState`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{NnrtError, Result};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct BufferTable {
    released: bool,
    next_id: u64,
    slots: HashMap<u64, Arc<[f32]>>,
    bytes: usize,
    peak_bytes: usize,
    uploads: u64,
    downloads: u64,
}

impl BufferTable {
    fn insert(&mut self, data: Arc<[f32]>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.bytes += data.len() * std::mem::size_of::<f32>();
        self.peak_bytes = self.peak_bytes.max(self.bytes);
        self.slots.insert(id, data);
        id
    }
}

struct ContextInner {
    id: u64,
    table: Mutex<BufferTable>,
}

impl ContextInner {
    fn ensure_live(table: &BufferTable, op: &str) -> Result<()> {
        if table.released {
            return Err(NnrtError::IllegalState(format!(
                "{op} on a released device context"
            )));
        }
        Ok(())
    }
}

/// Snapshot of a context's allocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub live_buffers: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    /// Host→device transfers.
    pub uploads: u64,
    /// Device→host transfers.
    pub downloads: u64,
}

/// Explicit handle to a device context. Clones share the same context.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

impl DeviceContext {
    pub fn new() -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = id, "device context created");
        Self {
            inner: Arc::new(ContextInner {
                id,
                table: Mutex::new(BufferTable::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_released(&self) -> bool {
        self.inner.table.lock().released
    }

    /// Fail with `IllegalState` if the context has been released.
    pub fn ensure_live(&self) -> Result<()> {
        let table = self.inner.table.lock();
        ContextInner::ensure_live(&table, "access")
    }

    /// Copy host values onto the device.
    pub fn upload(&self, data: &[f32]) -> Result<DeviceBuffer> {
        let mut table = self.inner.table.lock();
        ContextInner::ensure_live(&table, "upload")?;
        table.uploads += 1;
        let id = table.insert(Arc::from(data));
        Ok(self.handle(id, data.len()))
    }

    /// Take ownership of values produced on the device (kernel results).
    /// Not counted as a transfer.
    pub fn adopt(&self, data: Vec<f32>) -> Result<DeviceBuffer> {
        let len = data.len();
        let mut table = self.inner.table.lock();
        ContextInner::ensure_live(&table, "allocation")?;
        let id = table.insert(Arc::from(data));
        Ok(self.handle(id, len))
    }

    /// Release every buffer and invalidate the context.
    pub fn release(&self) -> Result<()> {
        let mut table = self.inner.table.lock();
        ContextInner::ensure_live(&table, "release")?;
        let freed = table.slots.len();
        table.slots.clear();
        table.bytes = 0;
        table.released = true;
        tracing::info!(context = self.inner.id, freed, "device context released");
        Ok(())
    }

    pub fn stats(&self) -> DeviceStats {
        let table = self.inner.table.lock();
        DeviceStats {
            live_buffers: table.slots.len(),
            live_bytes: table.bytes,
            peak_bytes: table.peak_bytes,
            uploads: table.uploads,
            downloads: table.downloads,
        }
    }

    fn handle(&self, id: u64, len: usize) -> DeviceBuffer {
        DeviceBuffer {
            handle: Arc::new(BufferHandle {
                ctx: Arc::clone(&self.inner),
                id,
                len,
            }),
        }
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.table.lock();
        f.debug_struct("DeviceContext")
            .field("id", &self.inner.id)
            .field("buffers", &table.slots.len())
            .field("released", &table.released)
            .finish()
    }
}

struct BufferHandle {
    ctx: Arc<ContextInner>,
    id: u64,
    len: usize,
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        let mut table = self.ctx.table.lock();
        if let Some(slot) = table.slots.remove(&self.id) {
            table.bytes -= slot.len() * std::mem::size_of::<f32>();
        }
    }
}

/// Opaque handle to a device-resident buffer.
#[derive(Clone)]
pub struct DeviceBuffer {
    handle: Arc<BufferHandle>,
}

impl DeviceBuffer {
    pub fn len(&self) -> usize {
        self.handle.len
    }

    pub fn is_empty(&self) -> bool {
        self.handle.len == 0
    }

    /// Id of the owning context.
    pub fn context_id(&self) -> u64 {
        self.handle.ctx.id
    }

    /// Device-side read access for kernels. No transfer is recorded.
    pub fn view(&self) -> Result<Arc<[f32]>> {
        let table = self.handle.ctx.table.lock();
        ContextInner::ensure_live(&table, "buffer read")?;
        table.slots.get(&self.handle.id).cloned().ok_or_else(|| {
            NnrtError::IllegalState(format!("device buffer {} was freed", self.handle.id))
        })
    }

    /// Copy the buffer back to the host. This is a synchronization point.
    pub fn to_host(&self) -> Result<Vec<f32>> {
        let data = self.view()?;
        self.handle.ctx.table.lock().downloads += 1;
        Ok(data.to_vec())
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("context", &self.handle.ctx.id)
            .field("id", &self.handle.id)
            .field("len", &self.handle.len)
            .finish()
    }
}
