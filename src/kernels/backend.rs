//! Device Abstraction Layer
//!
//! Every device that can run the reduction kernels implements
//! [`ComputeDevice`]: it owns its buffers, compiles (or emulates) the kernel
//! program, and enqueues launches described by [`TransposeLaunch`] and
//! [`ReductionLaunch`]. Plans and the driver are written once against the
//! trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ComputeDevice Trait                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!        ┌─────────────┐               ┌──────────────┐
//!        │  CpuDevice  │               │ OpenCLDevice │
//!        └─────────────┘               └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use segsum::kernels::backend::{init_backend, BackendPreference};
//! use segsum::config::DeviceSelector;
//!
//! let backend = init_backend(BackendPreference::Auto, &DeviceSelector::default())?;
//! println!("Using device: {}", backend.name());
//! ```

use crate::error::{Result, SegsumError};
use crate::kernels::cpu::{CpuBuffer, CpuDevice};
use crate::kernels::kernel_names;
use crate::kernels::transpose::TransposeKind;
use std::fmt::Debug;

#[cfg(feature = "opencl")]
use crate::config::DeviceSelector as Selector;
#[cfg(feature = "opencl")]
use crate::kernels::opencl::OpenCLDevice;

/// Hardware limits a configuration must be clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest work-group the device accepts.
    pub max_group_size: usize,
    /// Number of threads that execute in lockstep without a barrier.
    pub lockstep_width: usize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_group_size: 1024,
            lockstep_width: 1,
        }
    }
}

/// Global and local work sizes of a launch, in threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGrid {
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl LaunchGrid {
    /// A one-dimensional grid of `num_groups` groups of `group_size` threads.
    pub fn linear(num_groups: usize, group_size: usize) -> Self {
        Self {
            global: [num_groups * group_size, 1, 1],
            local: [group_size, 1, 1],
        }
    }

    /// Number of groups along each dimension.
    pub fn groups(&self) -> [usize; 3] {
        [
            self.global[0] / self.local[0].max(1),
            self.global[1] / self.local[1].max(1),
            self.global[2] / self.local[2].max(1),
        ]
    }

    pub fn total_groups(&self) -> usize {
        self.groups().iter().product()
    }

    /// Launches with no threads are skipped rather than enqueued.
    pub fn is_empty(&self) -> bool {
        self.global.iter().any(|&g| g == 0)
    }
}

/// One enqueue of a tiled transpose kernel. Offsets and counts are in
/// elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransposeLaunch {
    pub kind: TransposeKind,
    pub grid: LaunchGrid,
    pub tile: usize,
    pub dst_offset: usize,
    pub src_offset: usize,
    pub width: usize,
    pub height: usize,
    pub in_count: usize,
    pub out_count: usize,
}

impl TransposeLaunch {
    pub fn kernel_name(&self) -> &'static str {
        match self.kind {
            TransposeKind::Square => kernel_names::TRANSPOSE,
            TransposeKind::LowWidth { .. } => kernel_names::TRANSPOSE_LOWWIDTH,
            TransposeKind::LowHeight { .. } => kernel_names::TRANSPOSE_LOWHEIGHT,
        }
    }

    /// Group-local scratch: one padded tile.
    pub fn local_bytes(&self) -> usize {
        self.tile * (self.tile + 1) * std::mem::size_of::<i32>()
    }

    /// One past the largest element index or thread id the kernel computes.
    pub fn index_extent(&self) -> usize {
        let threads = self.grid.global.iter().fold(1usize, |acc, &g| acc.saturating_mul(g));
        let reads = self.src_offset.saturating_add(self.in_count.max(self.width.saturating_mul(self.height)));
        let writes = self.dst_offset.saturating_add(self.out_count);
        threads.max(reads).max(writes)
    }
}

/// The reduction kernels and their scalar arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionKernel {
    /// One thread per segment over column-major input.
    RowSerial { segments: usize, segment_len: usize },
    /// One group per segment, strided reads, tree reduction.
    GroupTree { segments: usize, segment_len: usize },
    /// One group per segment, contiguous per-thread chunks.
    ChunkedOne {
        segments: usize,
        segment_len: usize,
        elements_per_thread: usize,
    },
    /// Several groups per segment, one partial sum per group.
    ChunkedMany {
        segments: usize,
        segment_len: usize,
        elements_per_thread: usize,
        groups_per_segment: usize,
        threads_within_segment: usize,
    },
    /// Several short segments packed into one group, segmented scan.
    SmallComm {
        segments: usize,
        segment_len: usize,
        segments_per_group: usize,
        active_threads_per_group: usize,
        active_threads_last_group: usize,
        last_group: usize,
    },
}

impl ReductionKernel {
    pub fn name(&self) -> &'static str {
        match self {
            ReductionKernel::RowSerial { .. } => kernel_names::ROW_SERIAL_SUM,
            ReductionKernel::GroupTree { .. } => kernel_names::GROUP_TREE_SUM,
            ReductionKernel::ChunkedOne { .. } => kernel_names::CHUNKED_SUM_ONE,
            ReductionKernel::ChunkedMany { .. } => kernel_names::CHUNKED_SUM_MANY,
            ReductionKernel::SmallComm { .. } => kernel_names::SMALL_COMM_SCAN,
        }
    }

    /// Group-local scratch the kernel needs for `group_size` threads.
    pub fn local_bytes(&self, group_size: usize) -> usize {
        match self {
            ReductionKernel::RowSerial { .. } => 0,
            ReductionKernel::SmallComm { .. } => group_size * (1 + std::mem::size_of::<i32>()),
            _ => group_size * std::mem::size_of::<i32>(),
        }
    }
}

/// One enqueue of a reduction kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionLaunch {
    pub kernel: ReductionKernel,
    pub num_groups: usize,
    pub group_size: usize,
}

impl ReductionLaunch {
    pub fn grid(&self) -> LaunchGrid {
        LaunchGrid::linear(self.num_groups, self.group_size)
    }

    /// One past the largest element index or thread id the kernel computes.
    /// Devices with 32-bit index arithmetic must reject launches whose
    /// extent does not fit.
    pub fn index_extent(&self) -> usize {
        let threads = self.num_groups.saturating_mul(self.group_size);
        let elements = match self.kernel {
            ReductionKernel::RowSerial { segments, segment_len }
            | ReductionKernel::GroupTree { segments, segment_len }
            | ReductionKernel::ChunkedOne { segments, segment_len, .. }
            | ReductionKernel::SmallComm { segments, segment_len, .. } => segments.saturating_mul(segment_len),
            ReductionKernel::ChunkedMany {
                segments,
                segment_len,
                elements_per_thread,
                threads_within_segment,
                ..
            } => segments
                .saturating_mul(segment_len)
                .max(elements_per_thread.saturating_mul(threads_within_segment)),
        };
        threads.max(elements)
    }
}

/// Trait for devices that run the reduction kernels.
///
/// Launches are asynchronous with respect to the host: only
/// [`ComputeDevice::download`] and [`ComputeDevice::finish`] wait for
/// queued work.
pub trait ComputeDevice: Send + Sync + Debug {
    /// Device buffer of `i32` elements.
    type Buffer: Send + Sync;

    /// Human-readable device name.
    fn name(&self) -> &str;

    fn limits(&self) -> DeviceLimits;

    /// Allocate `len` zeroed elements.
    fn alloc_zeroed(&self, len: usize) -> Result<Self::Buffer>;

    /// Allocate a buffer holding a copy of `data`.
    fn upload(&self, data: &[i32]) -> Result<Self::Buffer>;

    /// Blocking read of the first `out.len()` elements of `src`.
    fn download(&self, src: &Self::Buffer, out: &mut [i32]) -> Result<()>;

    /// Device-to-device copy of `len` elements.
    fn copy(
        &self,
        dst: &Self::Buffer,
        dst_offset: usize,
        src: &Self::Buffer,
        src_offset: usize,
        len: usize,
    ) -> Result<()>;

    fn launch_transpose(&self, launch: &TransposeLaunch, dst: &Self::Buffer, src: &Self::Buffer) -> Result<()>;

    fn launch_reduction(&self, launch: &ReductionLaunch, input: &Self::Buffer, output: &Self::Buffer) -> Result<()>;

    /// Wait for all queued work.
    fn finish(&self) -> Result<()>;
}

// =============================================================================
// Backend Selection
// =============================================================================

/// Backend preference for device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// Automatically select the best available device (GPU first)
    #[default]
    Auto,
    /// Force the CPU emulator
    Cpu,
    /// Force OpenCL
    #[cfg(feature = "opencl")]
    OpenCL,
}

/// Dynamic device wrapper for runtime backend selection.
#[derive(Debug)]
pub enum Backend {
    Cpu(CpuDevice),
    #[cfg(feature = "opencl")]
    OpenCL(OpenCLDevice),
}

/// Buffer of whichever device a [`Backend`] wraps.
#[derive(Debug)]
pub enum BackendBuffer {
    Cpu(CpuBuffer),
    #[cfg(feature = "opencl")]
    OpenCL(ocl::Buffer<i32>),
}

fn foreign_buffer(call: &'static str) -> SegsumError {
    SegsumError::device(call, "buffer belongs to a different backend")
}

impl Backend {
    /// Short backend identifier.
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Cpu(_) => "cpu",
            #[cfg(feature = "opencl")]
            Backend::OpenCL(_) => "opencl",
        }
    }
}

impl ComputeDevice for Backend {
    type Buffer = BackendBuffer;

    fn name(&self) -> &str {
        match self {
            Backend::Cpu(d) => d.name(),
            #[cfg(feature = "opencl")]
            Backend::OpenCL(d) => d.name(),
        }
    }

    fn limits(&self) -> DeviceLimits {
        match self {
            Backend::Cpu(d) => d.limits(),
            #[cfg(feature = "opencl")]
            Backend::OpenCL(d) => d.limits(),
        }
    }

    fn alloc_zeroed(&self, len: usize) -> Result<BackendBuffer> {
        match self {
            Backend::Cpu(d) => d.alloc_zeroed(len).map(BackendBuffer::Cpu),
            #[cfg(feature = "opencl")]
            Backend::OpenCL(d) => d.alloc_zeroed(len).map(BackendBuffer::OpenCL),
        }
    }

    fn upload(&self, data: &[i32]) -> Result<BackendBuffer> {
        match self {
            Backend::Cpu(d) => d.upload(data).map(BackendBuffer::Cpu),
            #[cfg(feature = "opencl")]
            Backend::OpenCL(d) => d.upload(data).map(BackendBuffer::OpenCL),
        }
    }

    fn download(&self, src: &BackendBuffer, out: &mut [i32]) -> Result<()> {
        match (self, src) {
            (Backend::Cpu(d), BackendBuffer::Cpu(b)) => d.download(b, out),
            #[cfg(feature = "opencl")]
            (Backend::OpenCL(d), BackendBuffer::OpenCL(b)) => d.download(b, out),
            #[allow(unreachable_patterns)]
            _ => Err(foreign_buffer("download")),
        }
    }

    fn copy(
        &self,
        dst: &BackendBuffer,
        dst_offset: usize,
        src: &BackendBuffer,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        match (self, dst, src) {
            (Backend::Cpu(d), BackendBuffer::Cpu(o), BackendBuffer::Cpu(i)) => {
                d.copy(o, dst_offset, i, src_offset, len)
            }
            #[cfg(feature = "opencl")]
            (Backend::OpenCL(d), BackendBuffer::OpenCL(o), BackendBuffer::OpenCL(i)) => {
                d.copy(o, dst_offset, i, src_offset, len)
            }
            #[allow(unreachable_patterns)]
            _ => Err(foreign_buffer("copy")),
        }
    }

    fn launch_transpose(&self, launch: &TransposeLaunch, dst: &BackendBuffer, src: &BackendBuffer) -> Result<()> {
        match (self, dst, src) {
            (Backend::Cpu(d), BackendBuffer::Cpu(o), BackendBuffer::Cpu(i)) => d.launch_transpose(launch, o, i),
            #[cfg(feature = "opencl")]
            (Backend::OpenCL(d), BackendBuffer::OpenCL(o), BackendBuffer::OpenCL(i)) => {
                d.launch_transpose(launch, o, i)
            }
            #[allow(unreachable_patterns)]
            _ => Err(foreign_buffer("launch_transpose")),
        }
    }

    fn launch_reduction(&self, launch: &ReductionLaunch, input: &BackendBuffer, output: &BackendBuffer) -> Result<()> {
        match (self, input, output) {
            (Backend::Cpu(d), BackendBuffer::Cpu(i), BackendBuffer::Cpu(o)) => d.launch_reduction(launch, i, o),
            #[cfg(feature = "opencl")]
            (Backend::OpenCL(d), BackendBuffer::OpenCL(i), BackendBuffer::OpenCL(o)) => {
                d.launch_reduction(launch, i, o)
            }
            #[allow(unreachable_patterns)]
            _ => Err(foreign_buffer("launch_reduction")),
        }
    }

    fn finish(&self) -> Result<()> {
        match self {
            Backend::Cpu(d) => d.finish(),
            #[cfg(feature = "opencl")]
            Backend::OpenCL(d) => d.finish(),
        }
    }
}

/// Initialize a device based on preference.
///
/// `Auto` tries OpenCL first (when compiled in) and falls back to the CPU
/// emulator. An explicit preference fails if that device cannot be opened.
#[cfg(feature = "opencl")]
pub fn init_backend(preference: BackendPreference, selector: &Selector) -> Result<Backend> {
    match preference {
        BackendPreference::Auto => match OpenCLDevice::new(selector) {
            Ok(device) => Ok(Backend::OpenCL(device)),
            Err(e) => {
                tracing::warn!("OpenCL unavailable ({e}), falling back to the CPU emulator");
                Ok(Backend::Cpu(CpuDevice::new()))
            }
        },
        BackendPreference::Cpu => Ok(Backend::Cpu(CpuDevice::new())),
        BackendPreference::OpenCL => Ok(Backend::OpenCL(OpenCLDevice::new(selector)?)),
    }
}

/// Initialize a device based on preference.
///
/// Without the `opencl` feature every preference resolves to the CPU
/// emulator.
#[cfg(not(feature = "opencl"))]
pub fn init_backend(preference: BackendPreference, _selector: &crate::config::DeviceSelector) -> Result<Backend> {
    match preference {
        BackendPreference::Auto | BackendPreference::Cpu => Ok(Backend::Cpu(CpuDevice::new())),
    }
}
