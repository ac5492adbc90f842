//! CPU emulation of the device kernels.
//!
//! [`CpuDevice`] executes every launch group by group. Within a group the
//! threads run phase by phase, exactly where the device code places its
//! barriers, using the primitives from [`crate::kernels`]. Groups never
//! communicate, so with the `parallel` feature they are spread over the
//! rayon pool; each group returns its global writes, which are applied once
//! every group has finished.
//!
//! Out-of-range reads or writes are reported as launch errors rather than
//! silently clamped, so a geometry bug in a plan fails loudly in tests.

use crate::error::{Result, SegsumError};
use crate::kernels::backend::{ComputeDevice, DeviceLimits, ReductionKernel, ReductionLaunch, TransposeLaunch};
use crate::kernels::transpose::TransposeKind;
use crate::kernels::{group_tree_reduce, segmented_combine, segmented_scan, serial_sum, SegmentedValue, SCAN_BLOCK};
use std::sync::{Arc, Mutex, RwLock};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Global-memory writes produced by one group.
type GroupWrites = Vec<(usize, i32)>;

/// Device buffer of the CPU emulator.
#[derive(Debug, Clone)]
pub struct CpuBuffer(Arc<RwLock<Vec<i32>>>);

impl CpuBuffer {
    fn new(data: Vec<i32>) -> Self {
        Self(Arc::new(RwLock::new(data)))
    }

    fn same(&self, other: &CpuBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of elements backing the buffer.
    pub fn len(&self) -> usize {
        self.0.read().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Device that runs the kernels on the host CPU.
#[derive(Debug)]
pub struct CpuDevice {
    limits: DeviceLimits,
    launch_log: Mutex<Vec<&'static str>>,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    /// Emulate a device with the given limits; the lockstep width changes
    /// how the tree reduction schedules its rounds.
    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            launch_log: Mutex::new(Vec::new()),
        }
    }

    /// Names of the kernels launched so far, in order.
    pub fn launch_log(&self) -> Vec<&'static str> {
        self.launch_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn clear_launch_log(&self) {
        if let Ok(mut log) = self.launch_log.lock() {
            log.clear();
        }
    }

    fn record(&self, kernel: &'static str) {
        if let Ok(mut log) = self.launch_log.lock() {
            log.push(kernel);
        }
    }

    /// Run `num_groups` groups and apply their writes to `output`.
    fn run_groups<F>(&self, kernel: &'static str, num_groups: usize, output: &CpuBuffer, group: F) -> Result<()>
    where
        F: Fn(usize) -> std::result::Result<GroupWrites, String> + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        let writes: std::result::Result<Vec<GroupWrites>, String> = (0..num_groups).into_par_iter().map(group).collect();
        #[cfg(not(feature = "parallel"))]
        let writes: std::result::Result<Vec<GroupWrites>, String> = (0..num_groups).map(group).collect();

        let writes = writes.map_err(|e| SegsumError::launch(kernel, e))?;
        let mut out = output.0.write().map_err(|_| SegsumError::launch(kernel, "output buffer poisoned"))?;
        for (index, value) in writes.into_iter().flatten() {
            let len = out.len();
            let slot = out
                .get_mut(index)
                .ok_or_else(|| SegsumError::launch(kernel, format!("write at {index} outside buffer of {len}")))?;
            *slot = value;
        }
        Ok(())
    }
}

fn out_of_range(index: usize) -> String {
    format!("read at {index} outside input buffer")
}

fn read(data: &[i32], index: usize) -> std::result::Result<i32, String> {
    data.get(index).copied().ok_or_else(|| out_of_range(index))
}

// =============================================================================
// Transpose
// =============================================================================

/// Global coordinates a thread loads from (phase 1) and stores to (phase 2).
fn transpose_coords(kind: TransposeKind, tile: usize, group: (usize, usize), lid: (usize, usize)) -> [(usize, usize); 2] {
    let (gx, gy) = group;
    let (lx, ly) = lid;
    match kind {
        TransposeKind::Square => [
            (gx * tile + lx, gy * tile + ly),
            (gy * tile + lx, gx * tile + ly),
        ],
        TransposeKind::LowWidth { muly } => [
            (gx * tile + lx / muly, gy * tile * muly + ly + (lx % muly) * tile),
            (gy * tile * muly + lx + (ly % muly) * tile, gx * tile + ly / muly),
        ],
        TransposeKind::LowHeight { mulx } => [
            (gx * tile * mulx + lx + (ly % mulx) * tile, gy * tile + ly / mulx),
            (gy * tile + lx / mulx, gx * tile * mulx + ly + (lx % mulx) * tile),
        ],
    }
}

fn transpose_group(launch: &TransposeLaunch, input: &[i32], group: usize) -> std::result::Result<GroupWrites, String> {
    let tile = launch.tile;
    let [groups_x, groups_y, _] = launch.grid.groups();
    let gx = group % groups_x;
    let gy = (group / groups_x) % groups_y;
    let gz = group / (groups_x * groups_y);
    let array_offset = gz * launch.width * launch.height;
    let pitch = tile + 1;

    let mut block = vec![0i32; tile * pitch];
    for ly in 0..tile {
        for lx in 0..tile {
            let [(x, y), _] = transpose_coords(launch.kind, tile, (gx, gy), (lx, ly));
            let index_in = y * launch.width + x;
            if x < launch.width && y < launch.height && index_in < launch.in_count {
                block[ly * pitch + lx] = read(input, launch.src_offset + array_offset + index_in)?;
            }
        }
    }

    // barrier
    let mut writes = Vec::new();
    for ly in 0..tile {
        for lx in 0..tile {
            let [_, (x, y)] = transpose_coords(launch.kind, tile, (gx, gy), (lx, ly));
            let index_out = y * launch.height + x;
            if x < launch.height && y < launch.width && index_out < launch.out_count {
                writes.push((launch.dst_offset + array_offset + index_out, block[lx * pitch + ly]));
            }
        }
    }
    Ok(writes)
}

// =============================================================================
// Reductions
// =============================================================================

impl CpuDevice {
    /// Strided per-thread accumulation followed by a group tree reduction.
    /// `thread_sum(tid)` is the thread's private partial sum.
    fn tree_group<F>(&self, group_size: usize, thread_sum: F) -> std::result::Result<i32, String>
    where
        F: Fn(usize) -> std::result::Result<i32, usize>,
    {
        let mut local = (0..group_size)
            .map(|tid| thread_sum(tid).map_err(out_of_range))
            .collect::<std::result::Result<Vec<i32>, String>>()?;
        Ok(group_tree_reduce(&mut local, self.limits.lockstep_width, i32::wrapping_add).unwrap_or(0))
    }

    fn reduction_group(&self, launch: &ReductionLaunch, input: &[i32], group: usize) -> std::result::Result<GroupWrites, String> {
        let gs = launch.group_size;
        match launch.kernel {
            ReductionKernel::RowSerial { segments, segment_len } => {
                let mut writes = Vec::new();
                for tid in 0..gs {
                    let row = group * gs + tid;
                    if row < segments {
                        let sum = serial_sum(input, row, segments, segment_len).map_err(out_of_range)?;
                        writes.push((row, sum));
                    }
                }
                Ok(writes)
            }
            ReductionKernel::GroupTree { segments, segment_len } => {
                if group >= segments {
                    return Ok(Vec::new());
                }
                let sum = self.tree_group(gs, |tid| {
                    let count = segment_len.saturating_sub(tid).div_ceil(gs);
                    serial_sum(input, group * segment_len + tid, gs, count)
                })?;
                Ok(vec![(group, sum)])
            }
            ReductionKernel::ChunkedOne {
                segments,
                segment_len,
                elements_per_thread,
            } => {
                if group >= segments {
                    return Ok(Vec::new());
                }
                let sum = self.tree_group(gs, |tid| {
                    let remaining = (segment_len + gs - 1 - tid) / gs;
                    let chunk = elements_per_thread.min(remaining);
                    serial_sum(input, group * segment_len + tid, gs, chunk)
                })?;
                Ok(vec![(group, sum)])
            }
            ReductionKernel::ChunkedMany {
                segments,
                segment_len,
                elements_per_thread,
                groups_per_segment,
                threads_within_segment,
            } => {
                let segment = group / groups_per_segment.max(1);
                if segment >= segments {
                    return Ok(Vec::new());
                }
                let group_in_segment = group % groups_per_segment.max(1);
                let sum = self.tree_group(gs, |tid| {
                    let index = group_in_segment * gs + tid;
                    let remaining = (segment_len + threads_within_segment - 1).saturating_sub(index) / threads_within_segment.max(1);
                    let chunk = elements_per_thread.min(remaining);
                    serial_sum(input, segment * segment_len + index, threads_within_segment, chunk)
                })?;
                Ok(vec![(group, sum)])
            }
            ReductionKernel::SmallComm {
                segments,
                segment_len,
                segments_per_group,
                active_threads_per_group,
                active_threads_last_group,
                last_group,
            } => {
                let len = segment_len.max(1);
                let active = if group == last_group {
                    active_threads_last_group
                } else {
                    active_threads_per_group
                };
                let mut local = (0..gs)
                    .map(|tid| {
                        let segment = tid / len + group * segments_per_group;
                        let value = if tid < active {
                            read(input, tid % len + len * segment)?
                        } else {
                            0
                        };
                        Ok(SegmentedValue::new(tid % len == 0, value))
                    })
                    .collect::<std::result::Result<Vec<_>, String>>()?;

                segmented_scan(&mut local, SCAN_BLOCK, segmented_combine(i32::wrapping_add));

                let mut writes = Vec::new();
                for (tid, scanned) in local.iter().enumerate().take(active) {
                    let segment = tid / len + group * segments_per_group;
                    if tid % len == len - 1 && segment < segments {
                        writes.push((segment, scanned.value));
                    }
                }
                Ok(writes)
            }
        }
    }
}

impl ComputeDevice for CpuDevice {
    type Buffer = CpuBuffer;

    fn name(&self) -> &str {
        "cpu-emulator"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn alloc_zeroed(&self, len: usize) -> Result<CpuBuffer> {
        Ok(CpuBuffer::new(vec![0; len.max(1)]))
    }

    fn upload(&self, data: &[i32]) -> Result<CpuBuffer> {
        if data.is_empty() {
            return self.alloc_zeroed(1);
        }
        Ok(CpuBuffer::new(data.to_vec()))
    }

    fn download(&self, src: &CpuBuffer, out: &mut [i32]) -> Result<()> {
        let data = src.0.read().map_err(|_| SegsumError::device("download", "buffer poisoned"))?;
        let available = data.len();
        let slice = data.get(..out.len()).ok_or_else(|| {
            SegsumError::device("download", format!("read of {} elements from buffer of {available}", out.len()))
        })?;
        out.copy_from_slice(slice);
        Ok(())
    }

    fn copy(&self, dst: &CpuBuffer, dst_offset: usize, src: &CpuBuffer, src_offset: usize, len: usize) -> Result<()> {
        if dst.same(src) {
            let mut data = dst.0.write().map_err(|_| SegsumError::device("copy", "buffer poisoned"))?;
            if src_offset + len > data.len() || dst_offset + len > data.len() {
                return Err(SegsumError::device("copy", "range outside buffer"));
            }
            data.copy_within(src_offset..src_offset + len, dst_offset);
            return Ok(());
        }
        let from = src.0.read().map_err(|_| SegsumError::device("copy", "buffer poisoned"))?;
        let mut to = dst.0.write().map_err(|_| SegsumError::device("copy", "buffer poisoned"))?;
        let source = from
            .get(src_offset..src_offset + len)
            .ok_or_else(|| SegsumError::device("copy", "source range outside buffer"))?;
        let target = to
            .get_mut(dst_offset..dst_offset + len)
            .ok_or_else(|| SegsumError::device("copy", "destination range outside buffer"))?;
        target.copy_from_slice(source);
        Ok(())
    }

    fn launch_transpose(&self, launch: &TransposeLaunch, dst: &CpuBuffer, src: &CpuBuffer) -> Result<()> {
        let kernel = launch.kernel_name();
        if dst.same(src) {
            return Err(SegsumError::launch(kernel, "transpose cannot run in place"));
        }
        self.record(kernel);
        let input = src.0.read().map_err(|_| SegsumError::launch(kernel, "input buffer poisoned"))?;
        self.run_groups(kernel, launch.grid.total_groups(), dst, |group| {
            transpose_group(launch, &input, group)
        })
    }

    fn launch_reduction(&self, launch: &ReductionLaunch, input: &CpuBuffer, output: &CpuBuffer) -> Result<()> {
        let kernel = launch.kernel.name();
        if input.same(output) {
            return Err(SegsumError::launch(kernel, "input and output must be distinct buffers"));
        }
        if launch.group_size == 0 {
            return Err(SegsumError::launch(kernel, "group size must be positive"));
        }
        self.record(kernel);
        let data = input.0.read().map_err(|_| SegsumError::launch(kernel, "input buffer poisoned"))?;
        self.run_groups(kernel, launch.num_groups, output, |group| {
            self.reduction_group(launch, &data, group)
        })
    }

    fn finish(&self) -> Result<()> {
        // every launch has completed by the time it returns
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(device: &CpuDevice, launch: ReductionLaunch, input: &[i32], out_len: usize) -> Vec<i32> {
        let src = device.upload(input).unwrap();
        let dst = device.alloc_zeroed(out_len).unwrap();
        device.launch_reduction(&launch, &src, &dst).unwrap();
        let mut out = vec![0; out_len];
        device.download(&dst, &mut out).unwrap();
        out
    }

    #[test]
    fn test_row_serial_reads_column_major() {
        let device = CpuDevice::new();
        // 3 rows of length 2, stored column-major
        let input = [1, 2, 3, 10, 20, 30];
        let launch = ReductionLaunch {
            kernel: ReductionKernel::RowSerial {
                segments: 3,
                segment_len: 2,
            },
            num_groups: 1,
            group_size: 4,
        };
        assert_eq!(run(&device, launch, &input, 3), vec![11, 22, 33]);
    }

    #[test]
    fn test_group_tree_sum() {
        let device = CpuDevice::new();
        let input: Vec<i32> = (1..=20).collect();
        let launch = ReductionLaunch {
            kernel: ReductionKernel::GroupTree {
                segments: 2,
                segment_len: 10,
            },
            num_groups: 2,
            group_size: 4,
        };
        assert_eq!(run(&device, launch, &input, 2), vec![55, 155]);
    }

    #[test]
    fn test_chunked_sum_one() {
        let device = CpuDevice::new();
        let input = vec![1; 37];
        let launch = ReductionLaunch {
            kernel: ReductionKernel::ChunkedOne {
                segments: 1,
                segment_len: 37,
                elements_per_thread: 10,
            },
            num_groups: 1,
            group_size: 4,
        };
        assert_eq!(run(&device, launch, &input, 1), vec![37]);
    }

    #[test]
    fn test_chunked_sum_many_partials() {
        let device = CpuDevice::new();
        let input: Vec<i32> = (0..40).collect();
        let launch = ReductionLaunch {
            kernel: ReductionKernel::ChunkedMany {
                segments: 2,
                segment_len: 20,
                elements_per_thread: 3,
                groups_per_segment: 2,
                threads_within_segment: 8,
            },
            num_groups: 4,
            group_size: 4,
        };
        let partials = run(&device, launch, &input, 4);
        assert_eq!(partials[0] + partials[1], (0..20).sum::<i32>());
        assert_eq!(partials[2] + partials[3], (20..40).sum::<i32>());
    }

    #[test]
    fn test_small_comm_scan() {
        let device = CpuDevice::new();
        let input: Vec<i32> = (1..=10).collect();
        // 5 segments of length 2, 3 per group of 8 threads
        let launch = ReductionLaunch {
            kernel: ReductionKernel::SmallComm {
                segments: 5,
                segment_len: 2,
                segments_per_group: 3,
                active_threads_per_group: 6,
                active_threads_last_group: 4,
                last_group: 1,
            },
            num_groups: 2,
            group_size: 8,
        };
        assert_eq!(run(&device, launch, &input, 5), vec![3, 7, 11, 15, 19]);
    }

    #[test]
    fn test_lockstep_width_does_not_change_sums() {
        let input: Vec<i32> = (0..300).map(|v| v * 3 - 100).collect();
        let launch = ReductionLaunch {
            kernel: ReductionKernel::GroupTree {
                segments: 3,
                segment_len: 100,
            },
            num_groups: 3,
            group_size: 128,
        };
        let expected = run(&CpuDevice::new(), launch, &input, 3);
        for wave in [2, 32, 64] {
            let device = CpuDevice::with_limits(DeviceLimits {
                max_group_size: 1024,
                lockstep_width: wave,
            });
            assert_eq!(run(&device, launch, &input, 3), expected);
        }
    }

    #[test]
    fn test_out_of_range_read_is_an_error() {
        let device = CpuDevice::new();
        let src = device.upload(&[1, 2, 3]).unwrap();
        let dst = device.alloc_zeroed(1).unwrap();
        let launch = ReductionLaunch {
            kernel: ReductionKernel::GroupTree {
                segments: 1,
                segment_len: 10,
            },
            num_groups: 1,
            group_size: 4,
        };
        let err = device.launch_reduction(&launch, &src, &dst).unwrap_err();
        assert!(matches!(err, SegsumError::Launch { .. }));
    }

    #[test]
    fn test_launch_log() {
        let device = CpuDevice::new();
        let launch = ReductionLaunch {
            kernel: ReductionKernel::GroupTree {
                segments: 1,
                segment_len: 1,
            },
            num_groups: 1,
            group_size: 1,
        };
        run(&device, launch, &[5], 1);
        assert_eq!(device.launch_log(), vec!["group_tree_sum"]);
        device.clear_launch_log();
        assert!(device.launch_log().is_empty());
    }

    #[test]
    fn test_empty_upload_is_backed() {
        let device = CpuDevice::new();
        let buf = device.upload(&[]).unwrap();
        assert_eq!(buf.len(), 1);
    }
}
