//! OpenCL Kernel Sources
//!
//! OpenCL C source for the transpose and reduction kernels. The program is
//! compiled with two defines:
//!
//! - `LOCKSTEP_WIDTH`: threads that execute in lockstep, so the innermost
//!   reduction and scan rounds may skip their barriers
//! - `SCAN_BLOCK`: width of the first level of the segmented scan
//!
//! # Kernel Overview
//!
//! - `transpose_i32`, `transpose_lowwidth_i32`, `transpose_lowheight_i32`:
//!   tiled transpose through padded local memory; the tile edge is the local
//!   work size
//! - `row_serial_sum`: one thread per row over a column-major matrix
//! - `group_tree_sum`: one group per row, strided reads
//! - `chunked_sum_one`: one group per row, bounded per-thread chunks
//! - `chunked_sum_many`: several groups per row, one partial per group
//! - `small_comm_scan`: several rows per group, segmented scan

/// OpenCL C source code for all kernels.
pub const OPENCL_KERNELS_SOURCE: &str = r#"
#ifndef LOCKSTEP_WIDTH
#define LOCKSTEP_WIDTH 1
#endif

#ifndef SCAN_BLOCK
#define SCAN_BLOCK 32
#endif

// =============================================================================
// Transpose Kernels
// =============================================================================
// Global: [round_up(w', T), round_up(h', T), batch], local: [T, T, 1].
// `block` holds T * (T + 1) ints; the padding column keeps the transposed
// read free of bank conflicts.

__kernel void transpose_i32(
    __global int* dst, const int dst_offset,
    __global const int* src, const int src_offset,
    const int width, const int height,
    const int in_count, const int out_count,
    const int mul,
    __local int* block
) {
    const int tile = get_local_size(0);
    const int lx = get_local_id(0);
    const int ly = get_local_id(1);
    const int gx = get_group_id(0);
    const int gy = get_group_id(1);
    const int array_offset = get_global_id(2) * width * height;

    int x = gx * tile + lx;
    int y = gy * tile + ly;
    const int index_in = y * width + x;
    if (x < width && y < height && index_in < in_count) {
        block[ly * (tile + 1) + lx] = src[src_offset + array_offset + index_in];
    }
    barrier(CLK_LOCAL_MEM_FENCE);

    x = gy * tile + lx;
    y = gx * tile + ly;
    const int index_out = y * height + x;
    if (x < height && y < width && index_out < out_count) {
        dst[dst_offset + array_offset + index_out] = block[lx * (tile + 1) + ly];
    }
}

__kernel void transpose_lowwidth_i32(
    __global int* dst, const int dst_offset,
    __global const int* src, const int src_offset,
    const int width, const int height,
    const int in_count, const int out_count,
    const int muly,
    __local int* block
) {
    const int tile = get_local_size(0);
    const int lx = get_local_id(0);
    const int ly = get_local_id(1);
    const int gx = get_group_id(0);
    const int gy = get_group_id(1);
    const int array_offset = get_global_id(2) * width * height;

    int x = gx * tile + lx / muly;
    int y = gy * tile * muly + ly + (lx % muly) * tile;
    const int index_in = y * width + x;
    if (x < width && y < height && index_in < in_count) {
        block[ly * (tile + 1) + lx] = src[src_offset + array_offset + index_in];
    }
    barrier(CLK_LOCAL_MEM_FENCE);

    x = gy * tile * muly + lx + (ly % muly) * tile;
    y = gx * tile + ly / muly;
    const int index_out = y * height + x;
    if (x < height && y < width && index_out < out_count) {
        dst[dst_offset + array_offset + index_out] = block[lx * (tile + 1) + ly];
    }
}

__kernel void transpose_lowheight_i32(
    __global int* dst, const int dst_offset,
    __global const int* src, const int src_offset,
    const int width, const int height,
    const int in_count, const int out_count,
    const int mulx,
    __local int* block
) {
    const int tile = get_local_size(0);
    const int lx = get_local_id(0);
    const int ly = get_local_id(1);
    const int gx = get_group_id(0);
    const int gy = get_group_id(1);
    const int array_offset = get_global_id(2) * width * height;

    int x = gx * tile * mulx + lx + (ly % mulx) * tile;
    int y = gy * tile + ly / mulx;
    const int index_in = y * width + x;
    if (x < width && y < height && index_in < in_count) {
        block[ly * (tile + 1) + lx] = src[src_offset + array_offset + index_in];
    }
    barrier(CLK_LOCAL_MEM_FENCE);

    x = gy * tile + lx / mulx;
    y = gx * tile * mulx + ly + (lx % mulx) * tile;
    const int index_out = y * height + x;
    if (x < height && y < width && index_out < out_count) {
        dst[dst_offset + array_offset + index_out] = block[lx * (tile + 1) + ly];
    }
}

// =============================================================================
// Group Primitives
// =============================================================================
// Must be reached by every thread of the group.

int group_reduce_sum(__local volatile int* scratch, int x) {
    const int tid = get_local_id(0);
    const int group_size = get_local_size(0);

    barrier(CLK_LOCAL_MEM_FENCE);
    scratch[tid] = x;
    barrier(CLK_LOCAL_MEM_FENCE);

    // inside a wave: lockstep, no barrier
    for (int offset = 1; offset < LOCKSTEP_WIDTH; offset *= 2) {
        if (tid + offset < group_size && ((tid % LOCKSTEP_WIDTH) & (2 * offset - 1)) == 0) {
            x += scratch[tid + offset];
            scratch[tid] = x;
        }
    }

    const int num_waves = (group_size + LOCKSTEP_WIDTH - 1) / LOCKSTEP_WIDTH;
    for (int skip_waves = 1; skip_waves < num_waves; skip_waves *= 2) {
        barrier(CLK_LOCAL_MEM_FENCE);
        const int other = skip_waves * LOCKSTEP_WIDTH;
        if (tid % LOCKSTEP_WIDTH == 0
            && ((tid / LOCKSTEP_WIDTH) & (2 * skip_waves - 1)) == 0
            && tid + other < group_size) {
            x += scratch[tid + other];
            scratch[tid] = x;
        }
    }
    return x;
}

// (xf, xv) combined into (yf, yv): the sum restarts where yf is set.
#define SEG_COMBINE(xf, xv, yf, yv) \
    do { yv = (yf) ? (yv) : (xv) + (yv); yf = (xf) || (yf); } while (0)

// Hillis-Steele scan inside SCAN_BLOCK-wide blocks. The thread's running
// value lives in (*yf, *yv) and is mirrored in (flags, vals).
void scan_blocks(__local volatile char* flags, __local volatile int* vals,
                 const int participate, char* yf, int* yv) {
    const int tid = get_local_id(0);
    const int lane = tid % SCAN_BLOCK;
    for (int skip = 1; skip < SCAN_BLOCK; skip *= 2) {
        const int go = participate && lane >= skip;
        if (go) {
            const char xf = flags[tid - skip];
            const int xv = vals[tid - skip];
            SEG_COMBINE(xf, xv, *yf, *yv);
        }
        if (LOCKSTEP_WIDTH <= skip) {
            barrier(CLK_LOCAL_MEM_FENCE);
        }
        if (go) {
            flags[tid] = *yf;
            vals[tid] = *yv;
        }
        if (LOCKSTEP_WIDTH <= skip) {
            barrier(CLK_LOCAL_MEM_FENCE);
        }
    }
}

// =============================================================================
// Reduction Kernels
// =============================================================================

__kernel void row_serial_sum(
    const int segments, const int segment_len,
    __global const int* input, __global int* output
) {
    const int row = get_global_id(0);
    if (row >= segments) {
        return;
    }
    int acc = 0;
    for (int i = 0; i < segment_len; i++) {
        acc += input[i * segments + row];
    }
    output[row] = acc;
}

__kernel void group_tree_sum(
    __local volatile int* scratch,
    const int segments, const int segment_len,
    __global const int* input, __global int* output
) {
    const int tid = get_local_id(0);
    const int group_size = get_local_size(0);
    const int segment = get_group_id(0);

    int acc = 0;
    if (segment < segments) {
        for (int i = tid; i < segment_len; i += group_size) {
            acc += input[segment * segment_len + i];
        }
    }
    acc = group_reduce_sum(scratch, acc);
    if (tid == 0 && segment < segments) {
        output[segment] = acc;
    }
}

__kernel void chunked_sum_one(
    __local volatile int* scratch,
    const int segments, const int segment_len, const int elements_per_thread,
    __global const int* input, __global int* output
) {
    const int tid = get_local_id(0);
    const int group_size = get_local_size(0);
    const int segment = get_group_id(0);

    int acc = 0;
    if (segment < segments) {
        const int offset = segment * segment_len + tid;
        const int remaining = (segment_len - tid + group_size - 1) / group_size;
        const int chunk = min(elements_per_thread, remaining);
        for (int i = 0; i < chunk; i++) {
            acc += input[offset + i * group_size];
        }
    }
    acc = group_reduce_sum(scratch, acc);
    if (tid == 0 && segment < segments) {
        output[segment] = acc;
    }
}

__kernel void chunked_sum_many(
    __local volatile int* scratch,
    const int segments, const int segment_len, const int elements_per_thread,
    const int groups_per_segment, const int threads_within_segment,
    __global const int* input, __global int* partials
) {
    const int tid = get_local_id(0);
    const int group_size = get_local_size(0);
    const int group = get_group_id(0);
    const int segment = group / groups_per_segment;
    const int index = (group % groups_per_segment) * group_size + tid;

    int acc = 0;
    if (segment < segments) {
        const int offset = segment * segment_len + index;
        const int remaining = (segment_len - index + threads_within_segment - 1) / threads_within_segment;
        const int chunk = min(elements_per_thread, remaining);
        for (int i = 0; i < chunk; i++) {
            acc += input[offset + i * threads_within_segment];
        }
    }
    acc = group_reduce_sum(scratch, acc);
    if (tid == 0 && segment < segments) {
        partials[group] = acc;
    }
}

__kernel void small_comm_scan(
    __local volatile char* flags, __local volatile int* vals,
    const int segments, const int segment_len, const int segments_per_group,
    const int active_threads_per_group, const int active_threads_last_group,
    const int last_group,
    __global const int* input, __global int* output
) {
    const int tid = get_local_id(0);
    const int group = get_group_id(0);
    const int len = max(segment_len, 1);
    const int active = tid < (group == last_group ? active_threads_last_group : active_threads_per_group);
    const int index_within = tid % len;
    const int segment = tid / len + group * segments_per_group;

    char yf = index_within == 0;
    int yv = active ? input[index_within + len * segment] : 0;
    flags[tid] = yf;
    vals[tid] = yv;
    barrier(CLK_LOCAL_MEM_FENCE);

    scan_blocks(flags, vals, 1, &yf, &yv);
    barrier(CLK_LOCAL_MEM_FENCE);

    // the last lane of every block publishes its carry into slot `block`
    if (tid % SCAN_BLOCK == SCAN_BLOCK - 1) {
        flags[tid / SCAN_BLOCK] = yf;
        vals[tid / SCAN_BLOCK] = yv;
    }
    barrier(CLK_LOCAL_MEM_FENCE);

    char cf = 0;
    int cv = 0;
    if (tid < SCAN_BLOCK) {
        cf = flags[tid];
        cv = vals[tid];
    }
    scan_blocks(flags, vals, tid < SCAN_BLOCK, &cf, &cv);
    barrier(CLK_LOCAL_MEM_FENCE);

    if (tid >= SCAN_BLOCK) {
        const char xf = flags[tid / SCAN_BLOCK - 1];
        const int xv = vals[tid / SCAN_BLOCK - 1];
        SEG_COMBINE(xf, xv, yf, yv);
    }

    if (active && index_within == len - 1 && segment < segments) {
        output[segment] = yv;
    }
}
"#;

/// Kernel names (must match the `__kernel` functions above).
pub use crate::kernels::kernel_names;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kernel_is_defined() {
        for name in [
            kernel_names::TRANSPOSE,
            kernel_names::TRANSPOSE_LOWWIDTH,
            kernel_names::TRANSPOSE_LOWHEIGHT,
            kernel_names::ROW_SERIAL_SUM,
            kernel_names::GROUP_TREE_SUM,
            kernel_names::CHUNKED_SUM_ONE,
            kernel_names::CHUNKED_SUM_MANY,
            kernel_names::SMALL_COMM_SCAN,
        ] {
            let signature = format!("__kernel void {name}(");
            assert!(OPENCL_KERNELS_SOURCE.contains(&signature), "missing {name}");
        }
    }
}
