//! Device seam: accelerator operations behind a trait
//!
//! Dense tile kernels and DMA engines are external collaborators; this
//! module only fixes the contract the runtime needs from them: raw
//! copies between host and device buffers and compute-queue
//! synchronisation. [`StagedDevice`] is a host-memory-backed
//! implementation, so device coherence states, batch marshalling, and
//! queue accounting run (and are tested) on machines with no
//! accelerator.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Operations a device backend must provide
pub trait DeviceOps: Send + Sync + 'static {
    /// Device index within the registry
    fn index(&self) -> u32;

    /// Human-readable name
    fn name(&self) -> String {
        format!("device {}", self.index())
    }

    /// Copy `bytes` from a host buffer to a device buffer
    fn copy_to_device(&self, src: *const u8, dst: *mut u8, bytes: usize, queue: usize);

    /// Copy `bytes` from a device buffer to a host buffer
    fn copy_from_device(&self, src: *const u8, dst: *mut u8, bytes: usize, queue: usize);

    /// Block until every operation issued on `queue` has completed
    fn sync_queue(&self, queue: usize);
}

/// Host-staged device: device memory is ordinary host memory.
///
/// Copies are synchronous memcpys and queue sync is a counter update;
/// everything else about the device path (separate coherence instances,
/// batched pointer arrays, per-queue serialisation) behaves as it would
/// with a real accelerator.
pub struct StagedDevice {
    index: u32,
    syncs: AtomicUsize,
}

impl StagedDevice {
    /// Create a staged device with the given index
    pub fn new(index: u32) -> Self {
        Self {
            index,
            syncs: AtomicUsize::new(0),
        }
    }

    /// Number of queue syncs issued so far (test observability)
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::Relaxed)
    }
}

impl DeviceOps for StagedDevice {
    fn index(&self) -> u32 {
        self.index
    }

    fn copy_to_device(&self, src: *const u8, dst: *mut u8, bytes: usize, _queue: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, bytes) }
    }

    fn copy_from_device(&self, src: *const u8, dst: *mut u8, bytes: usize, _queue: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, bytes) }
    }

    fn sync_queue(&self, _queue: usize) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }
}

/// The set of devices visible to one process
///
/// Queue slots are `(device, queue_index)`; algorithms size the queue
/// count to `3 + lookahead` before entering their task graphs.
pub struct DeviceRegistry {
    devices: Vec<Arc<dyn DeviceOps>>,
    num_queues: AtomicUsize,
}

impl DeviceRegistry {
    /// A registry with no devices; all tiles stay on the host
    pub fn host_only() -> Self {
        Self {
            devices: Vec::new(),
            num_queues: AtomicUsize::new(4),
        }
    }

    /// A registry of `n` host-staged devices
    pub fn staged(n: u32) -> Self {
        Self {
            devices: (0..n)
                .map(|i| Arc::new(StagedDevice::new(i)) as Arc<dyn DeviceOps>)
                .collect(),
            num_queues: AtomicUsize::new(4),
        }
    }

    /// A registry over caller-supplied backends
    pub fn from_devices(devices: Vec<Arc<dyn DeviceOps>>) -> Self {
        Self {
            devices,
            num_queues: AtomicUsize::new(4),
        }
    }

    /// Number of devices
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Look up a device by index
    pub fn device(&self, index: u32) -> &Arc<dyn DeviceOps> {
        &self.devices[index as usize]
    }

    /// Resize the per-device compute-queue count (`3 + lookahead`)
    pub fn set_num_queues(&self, n: usize) {
        self.num_queues.store(n.max(1), Ordering::Relaxed);
    }

    /// Current per-device compute-queue count
    pub fn num_queues(&self) -> usize {
        self.num_queues.load(Ordering::Relaxed)
    }

    /// Map a logical queue index into the configured range
    pub fn queue_slot(&self, queue: usize) -> usize {
        queue % self.num_queues()
    }

    /// Sync one `(device, queue)` slot
    pub fn sync(&self, device: u32, queue: usize) {
        self.device(device).sync_queue(self.queue_slot(queue));
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceRegistry {{ devices: {}, queues: {} }}",
            self.devices.len(),
            self.num_queues()
        )
    }
}
