//! OpenCL Device
//!
//! Runs the transpose and reduction kernels on any OpenCL 1.2 device.
//!
//! # Usage
//!
//! ```ignore
//! use segsum::config::DeviceSelector;
//! use segsum::kernels::opencl::OpenCLDevice;
//!
//! let selector = DeviceSelector {
//!     platform: Some("NVIDIA".into()),
//!     ..DeviceSelector::default()
//! };
//! let device = OpenCLDevice::new(&selector)?;
//! println!("Using OpenCL device: {}", device.device_name());
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       OpenCLDevice                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │ Context      │  │ Queue        │  │ Program      │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! │          │          (in order)             │                │
//! │          └────────────────┼────────────────┘                │
//! │                           ▼                                 │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │  transpose_i32 / _lowwidth / _lowheight              │   │
//! │  │  row_serial_sum    group_tree_sum                    │   │
//! │  │  chunked_sum_one   chunked_sum_many  small_comm_scan │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The queue is in-order, so a second pass never starts before the first
//! pass's writes are visible.

pub mod kernels;

use crate::config::DeviceSelector;
use crate::error::{Result, SegsumError};
use crate::kernels::backend::{ComputeDevice, DeviceLimits, ReductionKernel, ReductionLaunch, TransposeLaunch};
use crate::kernels::transpose::TransposeKind;
use crate::kernels::SCAN_BLOCK;
use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::flags::DeviceType;
use ocl::{Buffer, Context, Device, Kernel, Platform, Program, Queue};

/// Platform whose GPUs run 64-wide wavefronts in lockstep.
const AMD_PLATFORM: &str = "AMD Accelerated Parallel Processing";
const AMD_WAVEFRONT: usize = 64;

/// One OpenCL device, found by [`OpenCLDevice::list_devices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub platform_name: String,
    pub device_name: String,
    pub is_gpu: bool,
}

/// OpenCL device with a compiled kernel program.
pub struct OpenCLDevice {
    #[allow(dead_code)]
    context: Context,
    queue: Queue,
    program: Program,
    device_name: String,
    platform_name: String,
    limits: DeviceLimits,
}

impl std::fmt::Debug for OpenCLDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenCLDevice")
            .field("device_name", &self.device_name)
            .field("platform_name", &self.platform_name)
            .field("limits", &self.limits)
            .finish()
    }
}

fn is_gpu(device: &Device) -> bool {
    matches!(
        device.info(DeviceInfo::Type),
        Ok(DeviceInfoResult::Type(kind)) if kind.contains(DeviceType::GPU)
    )
}

fn all_devices() -> Vec<(Platform, Device)> {
    let mut all = Vec::new();
    for platform in Platform::list() {
        if let Ok(devices) = Device::list_all(platform) {
            for device in devices {
                all.push((platform, device));
            }
        }
    }
    all
}

/// The kernels index with `int`; larger launches would wrap.
fn check_index_extent(kernel: &'static str, extent: usize) -> Result<()> {
    if extent > i32::MAX as usize {
        return Err(SegsumError::launch(
            kernel,
            format!("index range {extent} exceeds the 32-bit kernel arguments"),
        ));
    }
    Ok(())
}

impl OpenCLDevice {
    /// Check if any OpenCL platform is installed.
    pub fn is_available() -> bool {
        !Platform::list().is_empty()
    }

    /// Every device of every platform, in enumeration order.
    pub fn list_devices() -> Vec<DeviceDescription> {
        all_devices()
            .iter()
            .map(|(platform, device)| DeviceDescription {
                platform_name: platform.name().unwrap_or_else(|_| "Unknown Platform".to_string()),
                device_name: device.name().unwrap_or_else(|_| "Unknown Device".to_string()),
                is_gpu: is_gpu(device),
            })
            .collect()
    }

    /// Open the device chosen by `selector` and build the kernel program.
    ///
    /// Platform and device names are matched by substring; among the
    /// matches GPUs come first, and `selector.index` picks one of them.
    pub fn new(selector: &DeviceSelector) -> Result<Self> {
        let mut candidates: Vec<(Platform, Device, String, String)> = all_devices()
            .into_iter()
            .filter_map(|(platform, device)| {
                let platform_name = platform.name().ok()?;
                let device_name = device.name().ok()?;
                let platform_ok = selector.platform.as_deref().map_or(true, |p| platform_name.contains(p));
                let device_ok = selector.device.as_deref().map_or(true, |d| device_name.contains(d));
                (platform_ok && device_ok).then_some((platform, device, platform_name, device_name))
            })
            .collect();
        candidates.sort_by_key(|(_, device, _, _)| !is_gpu(device));

        let count = candidates.len();
        let (platform, device, platform_name, device_name) = candidates
            .into_iter()
            .nth(selector.index)
            .ok_or_else(|| SegsumError::NoDevice(format!("{count} matching OpenCL devices, index {} requested", selector.index)))?;

        tracing::info!("Using platform: {}", platform_name);
        tracing::info!("Using device: {}", device_name);

        let max_group_size = device.max_wg_size().map_err(|e| SegsumError::device("clGetDeviceInfo", e))?;
        let lockstep_width = if platform_name == AMD_PLATFORM && is_gpu(&device) {
            AMD_WAVEFRONT
        } else {
            1
        };
        let limits = DeviceLimits {
            max_group_size,
            lockstep_width,
        };

        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(|e| SegsumError::device("clCreateContext", e))?;

        let queue = Queue::new(&context, device, None).map_err(|e| SegsumError::device("clCreateCommandQueue", e))?;

        let source = match &selector.load_program {
            Some(path) => {
                tracing::info!("Loading OpenCL program from {}", path.display());
                std::fs::read_to_string(path)?
            }
            None => kernels::OPENCL_KERNELS_SOURCE.to_string(),
        };
        if let Some(path) = &selector.dump_program {
            tracing::info!("Dumping OpenCL program to {}", path.display());
            std::fs::write(path, &source)?;
        }

        let options = format!("-DLOCKSTEP_WIDTH={lockstep_width} -DSCAN_BLOCK={SCAN_BLOCK}");
        tracing::debug!("Building OpenCL program with options: {}", options);
        let program = Program::builder()
            .src(source)
            .devices(device)
            .cmplr_opt(options)
            .build(&context)
            .map_err(|e| SegsumError::Build { log: e.to_string() })?;

        Ok(Self {
            context,
            queue,
            program,
            device_name,
            platform_name,
            limits,
        })
    }

    /// Get the name of the OpenCL device.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Get the name of the OpenCL platform.
    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    // =========================================================================
    // GPU Kernel Launches
    // =========================================================================

    fn launch_reduction_kernel(&self, launch: &ReductionLaunch, input: &Buffer<i32>, output: &Buffer<i32>) -> Result<()> {
        let name = launch.kernel.name();
        check_index_extent(name, launch.index_extent())?;
        let grid = launch.grid();
        let gs = launch.group_size;

        let mut builder = Kernel::builder();
        builder
            .program(&self.program)
            .name(name)
            .queue(self.queue.clone())
            .global_work_size(grid.global[0])
            .local_work_size(grid.local[0]);

        match launch.kernel {
            ReductionKernel::RowSerial { segments, segment_len } => {
                builder.arg(&(segments as i32)).arg(&(segment_len as i32));
            }
            ReductionKernel::GroupTree { segments, segment_len } => {
                builder
                    .arg_local::<i32>(gs)
                    .arg(&(segments as i32))
                    .arg(&(segment_len as i32));
            }
            ReductionKernel::ChunkedOne {
                segments,
                segment_len,
                elements_per_thread,
            } => {
                builder
                    .arg_local::<i32>(gs)
                    .arg(&(segments as i32))
                    .arg(&(segment_len as i32))
                    .arg(&(elements_per_thread as i32));
            }
            ReductionKernel::ChunkedMany {
                segments,
                segment_len,
                elements_per_thread,
                groups_per_segment,
                threads_within_segment,
            } => {
                builder
                    .arg_local::<i32>(gs)
                    .arg(&(segments as i32))
                    .arg(&(segment_len as i32))
                    .arg(&(elements_per_thread as i32))
                    .arg(&(groups_per_segment as i32))
                    .arg(&(threads_within_segment as i32));
            }
            ReductionKernel::SmallComm {
                segments,
                segment_len,
                segments_per_group,
                active_threads_per_group,
                active_threads_last_group,
                last_group,
            } => {
                builder
                    .arg_local::<u8>(gs)
                    .arg_local::<i32>(gs)
                    .arg(&(segments as i32))
                    .arg(&(segment_len as i32))
                    .arg(&(segments_per_group as i32))
                    .arg(&(active_threads_per_group as i32))
                    .arg(&(active_threads_last_group as i32))
                    .arg(&(last_group as i32));
            }
        }

        let kernel = builder
            .arg(input)
            .arg(output)
            .build()
            .map_err(|e| SegsumError::launch(name, e))?;

        unsafe {
            kernel.enq().map_err(|e| SegsumError::launch(name, e))?;
        }
        Ok(())
    }

    fn launch_transpose_kernel(&self, launch: &TransposeLaunch, dst: &Buffer<i32>, src: &Buffer<i32>) -> Result<()> {
        let name = launch.kernel_name();
        check_index_extent(name, launch.index_extent())?;
        let mul = match launch.kind {
            TransposeKind::Square => 1,
            TransposeKind::LowWidth { muly } => muly,
            TransposeKind::LowHeight { mulx } => mulx,
        };

        let kernel = Kernel::builder()
            .program(&self.program)
            .name(name)
            .queue(self.queue.clone())
            .global_work_size(launch.grid.global)
            .local_work_size(launch.grid.local)
            .arg(dst)
            .arg(&(launch.dst_offset as i32))
            .arg(src)
            .arg(&(launch.src_offset as i32))
            .arg(&(launch.width as i32))
            .arg(&(launch.height as i32))
            .arg(&(launch.in_count as i32))
            .arg(&(launch.out_count as i32))
            .arg(&(mul as i32))
            .arg_local::<i32>(launch.tile * (launch.tile + 1))
            .build()
            .map_err(|e| SegsumError::launch(name, e))?;

        unsafe {
            kernel.enq().map_err(|e| SegsumError::launch(name, e))?;
        }
        Ok(())
    }
}

impl ComputeDevice for OpenCLDevice {
    type Buffer = Buffer<i32>;

    fn name(&self) -> &str {
        &self.device_name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn alloc_zeroed(&self, len: usize) -> Result<Buffer<i32>> {
        Buffer::<i32>::builder()
            .queue(self.queue.clone())
            .len(len.max(1))
            .fill_val(0i32)
            .build()
            .map_err(|e| SegsumError::device("clCreateBuffer", e))
    }

    fn upload(&self, data: &[i32]) -> Result<Buffer<i32>> {
        if data.is_empty() {
            return self.alloc_zeroed(1);
        }
        Buffer::<i32>::builder()
            .queue(self.queue.clone())
            .len(data.len())
            .copy_host_slice(data)
            .build()
            .map_err(|e| SegsumError::device("clCreateBuffer", e))
    }

    fn download(&self, src: &Buffer<i32>, out: &mut [i32]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        src.read(out)
            .enq()
            .map_err(|e| SegsumError::device("clEnqueueReadBuffer", e))
    }

    fn copy(&self, dst: &Buffer<i32>, dst_offset: usize, src: &Buffer<i32>, src_offset: usize, len: usize) -> Result<()> {
        src.cmd()
            .offset(src_offset)
            .copy(dst, Some(dst_offset), Some(len))
            .enq()
            .map_err(|e| SegsumError::device("clEnqueueCopyBuffer", e))
    }

    fn launch_transpose(&self, launch: &TransposeLaunch, dst: &Buffer<i32>, src: &Buffer<i32>) -> Result<()> {
        self.launch_transpose_kernel(launch, dst, src)
    }

    fn launch_reduction(&self, launch: &ReductionLaunch, input: &Buffer<i32>, output: &Buffer<i32>) -> Result<()> {
        self.launch_reduction_kernel(launch, input, output)
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish().map_err(|e| SegsumError::device("clFinish", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::cpu::CpuDevice;
    use crate::kernels::dispatch::PlanKind;
    use crate::driver::RowSumEngine;
    use crate::config::SegsumConfig;
    use ndarray::Array2;

    fn device() -> Option<OpenCLDevice> {
        if !OpenCLDevice::is_available() {
            eprintln!("OpenCL not available, skipping test");
            return None;
        }
        OpenCLDevice::new(&DeviceSelector::default()).ok()
    }

    #[test]
    fn test_index_extent_limit() {
        assert!(check_index_extent("row_serial_sum", i32::MAX as usize).is_ok());
        let err = check_index_extent("row_serial_sum", i32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, SegsumError::Launch { kernel: "row_serial_sum", .. }));
    }

    #[test]
    #[ignore] // Requires OpenCL runtime
    fn test_opencl_device_creation() {
        let Some(device) = device() else { return };
        assert!(!device.device_name().is_empty());
        assert!(device.limits().max_group_size > 0);
    }

    #[test]
    #[ignore] // Requires OpenCL runtime
    fn test_opencl_round_trip() {
        let Some(device) = device() else { return };
        let buf = device.upload(&[4, 5, 6]).unwrap();
        let mut out = [0; 3];
        device.download(&buf, &mut out).unwrap();
        assert_eq!(out, [4, 5, 6]);
    }

    #[test]
    #[ignore] // Requires OpenCL runtime
    fn test_opencl_matches_cpu_for_every_plan() {
        let Some(device) = device() else { return };
        let gpu = RowSumEngine::new(device, SegsumConfig::default().with_group_size(64));
        let cpu = RowSumEngine::new(CpuDevice::new(), SegsumConfig::default().with_group_size(64));
        let m = Array2::from_shape_fn((37, 50), |(r, c)| (r * 13 + c) as i32 - 300);
        for kind in PlanKind::ALL {
            let expected = cpu.row_sums_with(m.view(), Some(kind)).unwrap();
            let actual = gpu.row_sums_with(m.view(), Some(kind)).unwrap();
            assert_eq!(actual, expected, "plan {kind}");
        }
    }
}
