//! Tiled matrix transpose.
//!
//! Transposes `batch` stacked `height x width` row-major matrices. Each
//! group stages one tile through padded local memory so that both the read
//! and the write are coalesced. Matrices much narrower (or shorter) than a
//! tile fold several tile rows into one group so the group stays busy.
//!
//! | shape                                   | kernel                      |
//! |-----------------------------------------|-----------------------------|
//! | one row or one column, contiguous       | plain copy                  |
//! | `width <= tile / 2` and `height > tile` | `transpose_lowwidth_i32`    |
//! | `height <= tile / 2` and `width > tile` | `transpose_lowheight_i32`   |
//! | otherwise                               | `transpose_i32`             |

use crate::error::Result;
use crate::kernels::backend::{ComputeDevice, LaunchGrid, TransposeLaunch};

/// Tile layout variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransposeKind {
    Square,
    /// `muly` tile rows are folded into one group.
    LowWidth { muly: usize },
    /// `mulx` tile columns are folded into one group.
    LowHeight { mulx: usize },
}

/// Geometry of one transpose request. Offsets and counts are in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransposeRequest {
    pub dst_offset: usize,
    pub src_offset: usize,
    pub batch: usize,
    pub width: usize,
    pub height: usize,
    pub in_count: usize,
    pub out_count: usize,
}

impl TransposeRequest {
    /// A single `rows x cols` matrix, with no offsets.
    pub fn matrix(rows: usize, cols: usize) -> Self {
        Self {
            dst_offset: 0,
            src_offset: 0,
            batch: 1,
            width: cols,
            height: rows,
            in_count: rows * cols,
            out_count: rows * cols,
        }
    }
}

/// What a transpose request turns into on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransposePlan {
    /// The transpose is a no-op on the layout; copy `len` elements.
    Copy { len: usize },
    Tiled(TransposeLaunch),
}

fn round_up(x: usize, multiple: usize) -> usize {
    x.div_ceil(multiple) * multiple
}

/// Choose the copy or tiled kernel for a request.
pub fn plan_transpose(req: &TransposeRequest, tile: usize) -> TransposePlan {
    let tile = tile.max(1);
    let TransposeRequest {
        batch,
        width,
        height,
        in_count,
        out_count,
        ..
    } = *req;

    if in_count == out_count && (batch == 1 || width * height == in_count) && (width == 1 || height == 1) {
        return TransposePlan::Copy { len: in_count };
    }

    let (kind, groups_x, groups_y) = if width <= tile / 2 && tile < height {
        let muly = tile / width.max(1);
        (TransposeKind::LowWidth { muly }, width, height.div_ceil(muly))
    } else if height <= tile / 2 && tile < width {
        let mulx = tile / height.max(1);
        (TransposeKind::LowHeight { mulx }, width.div_ceil(mulx), height)
    } else {
        (TransposeKind::Square, width, height)
    };

    TransposePlan::Tiled(TransposeLaunch {
        kind,
        grid: LaunchGrid {
            global: [round_up(groups_x, tile), round_up(groups_y, tile), batch],
            local: [tile, tile, 1],
        },
        tile,
        dst_offset: req.dst_offset,
        src_offset: req.src_offset,
        width,
        height,
        in_count,
        out_count,
    })
}

/// Transpose `src` into `dst` on the device.
pub fn transpose<D: ComputeDevice>(
    device: &D,
    dst: &D::Buffer,
    src: &D::Buffer,
    req: &TransposeRequest,
    tile: usize,
) -> Result<()> {
    match plan_transpose(req, tile) {
        TransposePlan::Copy { len } => {
            if len > 0 {
                device.copy(dst, req.dst_offset, src, req.src_offset, len)?;
            }
            Ok(())
        }
        TransposePlan::Tiled(launch) => {
            if launch.grid.is_empty() {
                return Ok(());
            }
            tracing::debug!(
                "Launching {} with global work size {:?} and local work size {:?}",
                launch.kernel_name(),
                launch.grid.global,
                launch.grid.local
            );
            device.launch_transpose(&launch, dst, src)
        }
    }
}
