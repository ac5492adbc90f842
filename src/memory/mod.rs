//! Reference-Counted Memory Arena
//!
//! This module tracks every buffer the runtime allocates, across three
//! disjoint lifetime spaces:
//! - **Device**: global memory on the compute device (input, partials, results)
//! - **Local**: group-shared staging memory reserved per kernel launch
//! - **Host**: host-side copies of device results
//!
//! A [`MemBlock`] is a shared handle: cloning it (or [`MemBlock::assign`])
//! adds an owner, and the underlying resource is freed only when the last
//! owner releases it. Each space keeps current and peak byte counters that
//! live in the [`DeviceArena`] rather than in global state, so independent
//! arenas (one per engine, one per test) never observe each other.
//!
//! # Usage
//! ```ignore
//! use segsum::memory::{DeviceArena, MemorySpace};
//!
//! let arena = DeviceArena::new(false);
//! let partials = arena.alloc_device(&device, 4096)?;
//! let mut next_input = MemBlock::null(MemorySpace::Device);
//! next_input.assign(&partials); // two owners, no copy
//! drop(partials);
//! assert_eq!(next_input.owner_count(), 1);
//! ```

use crate::error::{Result, SegsumError};
use crate::kernels::backend::ComputeDevice;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Memory Spaces
// =============================================================================

/// The lifetime space a block belongs to. Blocks never cross spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// Device-global memory
    Device,
    /// Device-local (group-shared) memory
    Local,
    /// Host memory
    Host,
}

impl MemorySpace {
    pub const ALL: [MemorySpace; 3] = [MemorySpace::Device, MemorySpace::Local, MemorySpace::Host];

    pub fn name(&self) -> &'static str {
        match self {
            MemorySpace::Device => "device",
            MemorySpace::Local => "local",
            MemorySpace::Host => "host",
        }
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Usage Counters
// =============================================================================

/// Snapshot of one space's byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Bytes currently held by live blocks
    pub current: u64,
    /// High water mark of `current`
    pub peak: u64,
}

#[derive(Debug, Default)]
struct UsageCounter {
    current: AtomicU64,
    peak: AtomicU64,
}

impl UsageCounter {
    /// Returns the new current usage and whether it set a new peak.
    fn add(&self, bytes: u64) -> (u64, bool) {
        let now = self.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let previous_peak = self.peak.fetch_max(now, Ordering::AcqRel);
        (now, now > previous_peak)
    }

    fn sub(&self, bytes: u64) -> u64 {
        self.current.fetch_sub(bytes, Ordering::AcqRel) - bytes
    }

    fn snapshot(&self) -> SpaceUsage {
        SpaceUsage {
            current: self.current.load(Ordering::Acquire),
            peak: self.peak.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Default)]
struct ArenaState {
    device: UsageCounter,
    local: UsageCounter,
    host: UsageCounter,
    detail_memory: bool,
}

impl ArenaState {
    fn counter(&self, space: MemorySpace) -> &UsageCounter {
        match space {
            MemorySpace::Device => &self.device,
            MemorySpace::Local => &self.local,
            MemorySpace::Host => &self.host,
        }
    }
}

/// Peak usage of all three spaces, printed at shutdown by the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaReport {
    pub device: SpaceUsage,
    pub local: SpaceUsage,
    pub host: SpaceUsage,
}

impl fmt::Display for ArenaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Peak memory usage for space 'device': {} bytes.", self.device.peak)?;
        writeln!(f, "Peak memory usage for space 'local': {} bytes.", self.local.peak)?;
        write!(f, "Peak memory usage for space 'host': {} bytes.", self.host.peak)
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Owner of the per-space usage counters and factory for [`MemBlock`]s.
///
/// Cloning the arena shares the counters.
#[derive(Debug, Clone, Default)]
pub struct DeviceArena {
    state: Arc<ArenaState>,
}

impl DeviceArena {
    /// Create an arena with zeroed counters. `detail_memory` traces every
    /// allocation and release at debug level.
    pub fn new(detail_memory: bool) -> Self {
        Self {
            state: Arc::new(ArenaState {
                detail_memory,
                ..ArenaState::default()
            }),
        }
    }

    /// Current and peak usage of one space.
    pub fn usage(&self, space: MemorySpace) -> SpaceUsage {
        self.state.counter(space).snapshot()
    }

    pub fn report(&self) -> ArenaReport {
        ArenaReport {
            device: self.usage(MemorySpace::Device),
            local: self.usage(MemorySpace::Local),
            host: self.usage(MemorySpace::Host),
        }
    }

    /// Allocate a block of `bytes` in `space`.
    ///
    /// `create` receives the physical size to request, which is never zero:
    /// a zero-byte block is backed by a one-byte resource. The counters track
    /// the logical size. A failing `create` becomes
    /// [`SegsumError::Allocation`] and leaves the counters untouched.
    pub fn alloc<H, F>(&self, space: MemorySpace, bytes: usize, create: F) -> Result<MemBlock<H>>
    where
        F: FnOnce(usize) -> Result<H>,
    {
        let handle = create(bytes.max(1)).map_err(|e| SegsumError::Allocation {
            space,
            bytes,
            status: e.to_string(),
        })?;
        Ok(self.track(space, bytes, handle))
    }

    fn track<H>(&self, space: MemorySpace, bytes: usize, handle: H) -> MemBlock<H> {
        let (now, new_peak) = self.state.counter(space).add(bytes as u64);
        if self.state.detail_memory {
            tracing::debug!(
                space = %space,
                bytes,
                allocated = now,
                new_peak,
                "allocated block"
            );
        }
        MemBlock {
            space,
            inner: Some(Arc::new(BlockInner {
                handle,
                bytes,
                space,
                state: Arc::clone(&self.state),
            })),
        }
    }

    /// Allocate a zero-filled `i32` buffer of `len` elements on `device`.
    pub fn alloc_device<D: ComputeDevice>(&self, device: &D, len: usize) -> Result<MemBlock<D::Buffer>> {
        let bytes = len * std::mem::size_of::<i32>();
        self.alloc(MemorySpace::Device, bytes, |physical| {
            device.alloc_zeroed(physical.div_ceil(std::mem::size_of::<i32>()))
        })
    }

    /// Upload host data into a new device block.
    pub fn upload<D: ComputeDevice>(&self, device: &D, data: &[i32]) -> Result<MemBlock<D::Buffer>> {
        let bytes = std::mem::size_of_val(data);
        self.alloc(MemorySpace::Device, bytes, |_| device.upload(data))
    }

    /// Account for `bytes` of group-shared staging memory.
    pub fn alloc_local(&self, bytes: usize) -> MemBlock<()> {
        // the device reserves the memory at launch time
        self.track(MemorySpace::Local, bytes, ())
    }

    /// Allocate a zero-filled host vector of `len` elements.
    pub fn alloc_host(&self, len: usize) -> MemBlock<Vec<i32>> {
        let bytes = len * std::mem::size_of::<i32>();
        self.track(MemorySpace::Host, bytes, vec![0i32; len])
    }
}

// =============================================================================
// Memory Blocks
// =============================================================================

struct BlockInner<H> {
    handle: H,
    bytes: usize,
    space: MemorySpace,
    state: Arc<ArenaState>,
}

impl<H> Drop for BlockInner<H> {
    fn drop(&mut self) {
        let now = self.state.counter(self.space).sub(self.bytes as u64);
        if self.state.detail_memory {
            tracing::debug!(space = %self.space, bytes = self.bytes, allocated = now, "freed block");
        }
    }
}

/// A shared, reference-counted handle to an allocation in one space.
///
/// A null block has zero owners, no handle and zero size. Dropping a block
/// releases it.
pub struct MemBlock<H> {
    space: MemorySpace,
    inner: Option<Arc<BlockInner<H>>>,
}

impl<H> MemBlock<H> {
    /// A block with no owners and no resource.
    pub fn null(space: MemorySpace) -> Self {
        Self { space, inner: None }
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Number of logical owners sharing the underlying resource.
    pub fn owner_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }

    /// Logical size in bytes.
    pub fn size(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.bytes)
    }

    pub fn handle(&self) -> Option<&H> {
        self.inner.as_ref().map(|inner| &inner.handle)
    }

    /// The handle, or a `NullBlock` error for a released block.
    pub fn buffer(&self) -> Result<&H> {
        self.handle()
            .ok_or(SegsumError::NullBlock { space: self.space })
    }

    /// Mutable access to the handle, available only to a sole owner.
    pub fn handle_mut(&mut self) -> Option<&mut H> {
        self.inner
            .as_mut()
            .and_then(Arc::get_mut)
            .map(|inner| &mut inner.handle)
    }

    /// Add an owner and return the new handle to the same resource.
    pub fn retain(&self) -> Self {
        Self {
            space: self.space,
            inner: self.inner.clone(),
        }
    }

    /// Make `self` alias `src`, releasing whatever `self` held before.
    ///
    /// Assigning a block to itself leaves the owner count unchanged.
    pub fn assign(&mut self, src: &MemBlock<H>) {
        debug_assert_eq!(self.space, src.space, "blocks never cross spaces");
        let shared = src.inner.clone();
        self.release();
        self.inner = shared;
    }

    /// Drop this owner. The resource is freed when the last owner releases.
    pub fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            let remaining = Arc::strong_count(&inner) - 1;
            if inner.state.detail_memory {
                tracing::debug!(space = %self.space, remaining, "unreferencing block");
            }
        }
    }
}

impl<H> Clone for MemBlock<H> {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<H> Drop for MemBlock<H> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<H> fmt::Debug for MemBlock<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlock")
            .field("space", &self.space)
            .field("owner_count", &self.owner_count())
            .field("bytes", &self.size())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
