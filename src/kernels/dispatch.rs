//! Reduction Plan Selection
//!
//! Picks one of five plans for summing `N` segments of length `M`, in
//! priority order:
//!
//! | plan            | when                                            | launches |
//! |-----------------|-------------------------------------------------|----------|
//! | `OuterParallel` | `N > threshold`                                 | transpose + 1 |
//! | `IntraGroup`    | `N * group_size > threshold`                    | 1        |
//! | `LargeCommOne`  | `group_size / 2 < M`, one group per segment     | 1        |
//! | `LargeCommMany` | `group_size / 2 < M`, several groups per segment| 2        |
//! | `SmallComm`     | otherwise: several segments per group           | 1        |
//!
//! The second pass of `LargeCommMany` reduces `groups_per_segment` partials
//! per segment with the same `group_size / 2` test: `LargeCommOne`-style if
//! the partials outnumber half a group, `SmallComm`-style otherwise.
//!
//! # Usage
//!
//! ```ignore
//! use segsum::kernels::dispatch::{select_plan, DispatchParams, Shape};
//!
//! let plan = select_plan(Shape::new(37, 4), &DispatchParams::default());
//! for stage in plan.stages(Shape::new(37, 4), 256) {
//!     // launch stage.launch, reading stage.input
//! }
//! ```

use crate::config::{DEFAULT_GROUP_SIZE, DEFAULT_LARGE_GRID_THRESHOLD, DEFAULT_NUM_GROUPS};
use crate::error::{Result, SegsumError};
use crate::kernels::backend::{ReductionKernel, ReductionLaunch};
use std::fmt;
use std::str::FromStr;

/// `N` segments of `M` elements each, stored row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub segments: usize,
    pub segment_len: usize,
}

impl Shape {
    pub fn new(segments: usize, segment_len: usize) -> Self {
        Self { segments, segment_len }
    }

    pub fn elements(&self) -> usize {
        self.segments * self.segment_len
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.segments, self.segment_len)
    }
}

/// Tuning constants the selection depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchParams {
    pub group_size: usize,
    pub num_groups_hint: usize,
    pub large_grid_threshold: usize,
}

impl Default for DispatchParams {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            num_groups_hint: DEFAULT_NUM_GROUPS,
            large_grid_threshold: DEFAULT_LARGE_GRID_THRESHOLD,
        }
    }
}

// =============================================================================
// Plan Kinds
// =============================================================================

/// The five reduction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanKind {
    OuterParallel,
    IntraGroup,
    LargeCommOne,
    LargeCommMany,
    SmallComm,
}

impl PlanKind {
    pub const ALL: [PlanKind; 5] = [
        PlanKind::OuterParallel,
        PlanKind::IntraGroup,
        PlanKind::LargeCommOne,
        PlanKind::LargeCommMany,
        PlanKind::SmallComm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PlanKind::OuterParallel => "outer-parallel",
            PlanKind::IntraGroup => "intra-group",
            PlanKind::LargeCommOne => "large-comm-one",
            PlanKind::LargeCommMany => "large-comm-many",
            PlanKind::SmallComm => "small-comm",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PlanKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PlanKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<_> = PlanKind::ALL.iter().map(|k| k.name()).collect();
                format!("unknown plan '{s}', expected one of: {}", names.join(", "))
            })
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Geometry derived from the shape before a plan is chosen: how the group
/// count hint spreads one segment over groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchGeometry {
    pub elements_per_thread: usize,
    pub groups_per_segment: usize,
    pub threads_within_segment: usize,
    pub num_groups: usize,
}

impl LaunchGeometry {
    /// Spread each segment over `ceil(hint / N)` groups; if that leaves one
    /// element per thread, use just enough groups to cover `M`.
    pub fn derive(shape: Shape, params: &DispatchParams) -> Self {
        let gs = params.group_size.max(1);
        let m = shape.segment_len;
        let hint = params.num_groups_hint.div_ceil(shape.segments.max(1)).max(1);
        let elements_per_thread = m.div_ceil(gs * hint);
        let groups_per_segment = if elements_per_thread == 1 { m.div_ceil(gs) } else { hint };
        Self {
            elements_per_thread,
            groups_per_segment,
            threads_within_segment: gs * groups_per_segment,
            num_groups: shape.segments * groups_per_segment,
        }
    }
}

/// Geometry of a small-comm launch packing short segments into groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallCommGeometry {
    pub segments_per_group: usize,
    pub num_groups: usize,
    pub active_threads_per_group: usize,
    pub active_threads_last_group: usize,
}

impl SmallCommGeometry {
    /// Requires `segment_len <= group_size`.
    pub fn new(segments: usize, segment_len: usize, group_size: usize) -> Self {
        let segments_per_group = (group_size / segment_len.max(1)).max(1);
        let num_groups = segments.div_ceil(segments_per_group);
        let remainder = segments % segments_per_group;
        let last_count = if remainder == 0 { segments_per_group } else { remainder };
        Self {
            segments_per_group,
            num_groups,
            active_threads_per_group: segment_len * segments_per_group,
            active_threads_last_group: segment_len * last_count,
        }
    }

    fn kernel(&self, segments: usize, segment_len: usize) -> ReductionKernel {
        ReductionKernel::SmallComm {
            segments,
            segment_len,
            segments_per_group: self.segments_per_group,
            active_threads_per_group: self.active_threads_per_group,
            active_threads_last_group: self.active_threads_last_group,
            last_group: self.num_groups.saturating_sub(1),
        }
    }
}

/// How the partial sums of a multi-group plan are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondPass {
    LargeCommOne { elements_per_thread: usize },
    SmallComm(SmallCommGeometry),
}

impl SecondPass {
    /// Same half-group test as the first level, applied to the partials.
    pub fn select(segments: usize, groups_per_segment: usize, group_size: usize) -> Self {
        if group_size / 2 < groups_per_segment {
            SecondPass::LargeCommOne {
                elements_per_thread: groups_per_segment.div_ceil(group_size),
            }
        } else {
            SecondPass::SmallComm(SmallCommGeometry::new(segments, groups_per_segment, group_size))
        }
    }
}

// =============================================================================
// Plans
// =============================================================================

/// A selected plan, carrying only its derived geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionPlan {
    OuterParallel { num_groups: usize },
    IntraGroup { num_groups: usize },
    LargeCommOne { elements_per_thread: usize },
    LargeCommMany { first: LaunchGeometry, second: SecondPass },
    SmallComm(SmallCommGeometry),
}

/// Where a stage reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
    /// The row-major input matrix.
    Matrix,
    /// The column-major copy made by the transpose.
    Transposed,
    /// The previous stage's output.
    Partials,
}

/// One kernel launch of a plan and the length of the buffer it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub input: StageInput,
    pub launch: ReductionLaunch,
    pub output_len: usize,
}

impl ReductionPlan {
    pub fn kind(&self) -> PlanKind {
        match self {
            ReductionPlan::OuterParallel { .. } => PlanKind::OuterParallel,
            ReductionPlan::IntraGroup { .. } => PlanKind::IntraGroup,
            ReductionPlan::LargeCommOne { .. } => PlanKind::LargeCommOne,
            ReductionPlan::LargeCommMany { .. } => PlanKind::LargeCommMany,
            ReductionPlan::SmallComm(_) => PlanKind::SmallComm,
        }
    }

    /// Whether the matrix must be transposed to column-major first.
    pub fn needs_transpose(&self) -> bool {
        matches!(self, ReductionPlan::OuterParallel { .. })
    }

    /// The reduction launches of this plan, in queue order.
    pub fn stages(&self, shape: Shape, group_size: usize) -> Vec<Stage> {
        let Shape { segments, segment_len } = shape;
        let launch = |kernel, num_groups| ReductionLaunch {
            kernel,
            num_groups,
            group_size,
        };

        match *self {
            ReductionPlan::OuterParallel { num_groups } => vec![Stage {
                input: StageInput::Transposed,
                launch: launch(ReductionKernel::RowSerial { segments, segment_len }, num_groups),
                output_len: segments,
            }],
            ReductionPlan::IntraGroup { num_groups } => vec![Stage {
                input: StageInput::Matrix,
                launch: launch(ReductionKernel::GroupTree { segments, segment_len }, num_groups),
                output_len: segments,
            }],
            ReductionPlan::LargeCommOne { elements_per_thread } => vec![Stage {
                input: StageInput::Matrix,
                launch: launch(
                    ReductionKernel::ChunkedOne {
                        segments,
                        segment_len,
                        elements_per_thread,
                    },
                    segments,
                ),
                output_len: segments,
            }],
            ReductionPlan::LargeCommMany { first, second } => {
                let partials = first.groups_per_segment;
                let merge = match second {
                    SecondPass::LargeCommOne { elements_per_thread } => launch(
                        ReductionKernel::ChunkedOne {
                            segments,
                            segment_len: partials,
                            elements_per_thread,
                        },
                        segments,
                    ),
                    SecondPass::SmallComm(geometry) => {
                        launch(geometry.kernel(segments, partials), geometry.num_groups)
                    }
                };
                vec![
                    Stage {
                        input: StageInput::Matrix,
                        launch: launch(
                            ReductionKernel::ChunkedMany {
                                segments,
                                segment_len,
                                elements_per_thread: first.elements_per_thread,
                                groups_per_segment: first.groups_per_segment,
                                threads_within_segment: first.threads_within_segment,
                            },
                            first.num_groups,
                        ),
                        output_len: first.num_groups,
                    },
                    Stage {
                        input: StageInput::Partials,
                        launch: merge,
                        output_len: segments,
                    },
                ]
            }
            ReductionPlan::SmallComm(geometry) => vec![Stage {
                input: StageInput::Matrix,
                launch: launch(geometry.kernel(segments, segment_len), geometry.num_groups),
                output_len: segments,
            }],
        }
    }
}

/// Select the plan for `shape`, following the priority order above.
pub fn select_plan(shape: Shape, params: &DispatchParams) -> ReductionPlan {
    let gs = params.group_size.max(1);
    let threshold = params.large_grid_threshold;
    let Shape { segments, segment_len } = shape;

    if segments > threshold {
        return outer_parallel(segments, gs);
    }
    if segments * gs > threshold {
        return ReductionPlan::IntraGroup { num_groups: segments };
    }
    if gs / 2 < segment_len {
        let geometry = LaunchGeometry::derive(shape, params);
        if geometry.groups_per_segment == 1 {
            return large_comm_one(segment_len, gs);
        }
        return large_comm_many(geometry, segments, gs);
    }
    ReductionPlan::SmallComm(SmallCommGeometry::new(segments, segment_len, gs))
}

/// Build the plan of a given kind for `shape`, bypassing the priority order.
///
/// Every kind covers every shape except `SmallComm`, which needs segments
/// no longer than a group.
pub fn force_plan(kind: PlanKind, shape: Shape, params: &DispatchParams) -> Result<ReductionPlan> {
    let gs = params.group_size.max(1);
    let Shape { segments, segment_len } = shape;

    Ok(match kind {
        PlanKind::OuterParallel => outer_parallel(segments, gs),
        PlanKind::IntraGroup => ReductionPlan::IntraGroup { num_groups: segments },
        PlanKind::LargeCommOne => large_comm_one(segment_len, gs),
        PlanKind::LargeCommMany => large_comm_many(LaunchGeometry::derive(shape, params), segments, gs),
        PlanKind::SmallComm => {
            if segment_len > gs {
                return Err(SegsumError::IneligiblePlan {
                    plan: kind.name(),
                    reason: format!("segment length {segment_len} exceeds group size {gs}"),
                });
            }
            ReductionPlan::SmallComm(SmallCommGeometry::new(segments, segment_len, gs))
        }
    })
}

fn outer_parallel(segments: usize, group_size: usize) -> ReductionPlan {
    ReductionPlan::OuterParallel {
        num_groups: segments.div_ceil(group_size),
    }
}

fn large_comm_one(segment_len: usize, group_size: usize) -> ReductionPlan {
    ReductionPlan::LargeCommOne {
        elements_per_thread: segment_len.div_ceil(group_size),
    }
}

fn large_comm_many(first: LaunchGeometry, segments: usize, group_size: usize) -> ReductionPlan {
    ReductionPlan::LargeCommMany {
        first,
        second: SecondPass::select(segments, first.groups_per_segment, group_size),
    }
}
