//! Reduction kernels and the group-level primitives they are built from.
//!
//! The functions in this module describe what one thread-group computes,
//! phase by phase, over its group-local scratch memory. The CPU device runs
//! them directly; the OpenCL program in `opencl` encodes the same phases
//! with real barriers.

use ndarray::{Array1, ArrayView2};

pub mod backend;
pub mod cpu;
pub mod dispatch;
pub mod transpose;

#[cfg(feature = "opencl")]
pub mod opencl;

#[cfg(test)]
mod tests;

/// Width of the blocks used by the two-level segmented scan. A group can
/// hold at most `SCAN_BLOCK * SCAN_BLOCK` threads.
pub const SCAN_BLOCK: usize = 32;

/// Kernel names, shared by every backend for logging and profiling.
pub mod kernel_names {
    pub const TRANSPOSE: &str = "transpose_i32";
    pub const TRANSPOSE_LOWWIDTH: &str = "transpose_lowwidth_i32";
    pub const TRANSPOSE_LOWHEIGHT: &str = "transpose_lowheight_i32";
    pub const ROW_SERIAL_SUM: &str = "row_serial_sum";
    pub const GROUP_TREE_SUM: &str = "group_tree_sum";
    pub const CHUNKED_SUM_ONE: &str = "chunked_sum_one";
    pub const CHUNKED_SUM_MANY: &str = "chunked_sum_many";
    pub const SMALL_COMM_SCAN: &str = "small_comm_scan";
}

/// Straightforward sequential row sums, the reference every plan must match.
pub fn reference_row_sums(matrix: ArrayView2<i32>) -> Array1<i32> {
    matrix
        .rows()
        .into_iter()
        .map(|row| row.iter().fold(0i32, |acc, &v| acc.wrapping_add(v)))
        .collect()
}

/// Serially accumulate `count` values starting at `offset`, `stride` apart.
///
/// Returns the first out-of-range index if the walk leaves `data`.
pub fn serial_sum(data: &[i32], offset: usize, stride: usize, count: usize) -> Result<i32, usize> {
    let mut acc = 0i32;
    for i in 0..count {
        let index = offset + i * stride;
        let value = *data.get(index).ok_or(index)?;
        acc = acc.wrapping_add(value);
    }
    Ok(acc)
}

/// Reduce one group's scratch values to a single result held by thread 0.
///
/// Threads first combine inside their wave with a butterfly that needs no
/// barrier (`wave` must be a power of two), then the first thread of every
/// wave combines across waves with a barrier between rounds. `local[tid]`
/// holds thread `tid`'s running value throughout.
pub fn group_tree_reduce<T, F>(local: &mut [T], wave: usize, op: F) -> Option<T>
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    let group_size = local.len();
    if group_size == 0 {
        return None;
    }
    let wave = wave.max(1);

    let mut offset = 1;
    while offset < wave {
        for tid in 0..group_size {
            if tid + offset < group_size && ((tid % wave) & (2 * offset - 1)) == 0 {
                local[tid] = op(local[tid], local[tid + offset]);
            }
        }
        offset *= 2;
    }

    let num_waves = group_size.div_ceil(wave);
    let mut skip_waves = 1;
    while skip_waves < num_waves {
        // barrier
        let other = skip_waves * wave;
        for tid in (0..group_size).step_by(wave) {
            if ((tid / wave) & (2 * skip_waves - 1)) == 0 && tid + other < group_size {
                local[tid] = op(local[tid], local[tid + other]);
            }
        }
        skip_waves *= 2;
    }

    Some(local[0])
}

/// A value tagged with "this element starts a segment".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentedValue<T> {
    pub flag: bool,
    pub value: T,
}

impl<T> SegmentedValue<T> {
    pub fn new(flag: bool, value: T) -> Self {
        Self { flag, value }
    }
}

/// Lift `op` to the flag-carrying operator of a segmented scan: the running
/// value restarts whenever the right operand begins a segment.
pub fn segmented_combine<T, F>(op: F) -> impl Fn(SegmentedValue<T>, SegmentedValue<T>) -> SegmentedValue<T>
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    move |left, right| SegmentedValue {
        flag: left.flag || right.flag,
        value: if right.flag {
            right.value
        } else {
            op(left.value, right.value)
        },
    }
}

/// Inclusive Hillis-Steele scan inside each `block`-wide slice of `local`.
fn scan_blocks<T, F>(local: &mut [T], block: usize, combine: &F)
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    let mut skip = 1;
    while skip < block {
        // Descending order reads every left operand before its own update,
        // which is what the lockstep/barrier schedule guarantees on device.
        for tid in (0..local.len()).rev() {
            if tid % block >= skip {
                local[tid] = combine(local[tid - skip], local[tid]);
            }
        }
        skip *= 2;
    }
}

/// Two-level inclusive scan of one group's scratch memory.
///
/// 1. every `block`-wide slice is scanned independently;
/// 2. the last thread of each full block publishes its value as a carry;
/// 3. the carries are scanned by the first block;
/// 4. every thread outside the first block folds in the carry of the block
///    before it.
///
/// With [`segmented_combine`] this is the segmented scan used to pack short
/// segments into one group.
pub fn segmented_scan<T, F>(local: &mut [T], block: usize, combine: F)
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    let block = block.max(1);
    scan_blocks(local, block, &combine);

    let mut carries: Vec<T> = local
        .chunks(block)
        .filter(|chunk| chunk.len() == block)
        .map(|chunk| chunk[block - 1])
        .collect();
    scan_blocks(&mut carries, block, &combine);

    for tid in block..local.len() {
        let carry = carries[tid / block - 1];
        local[tid] = combine(carry, local[tid]);
    }
}
