//! Execution Driver
//!
//! [`RowSumEngine`] owns a device, its clamped configuration and a memory
//! arena. It uploads a matrix, selects (or is told) a plan, enqueues the
//! plan's launches, waits once, and reads the result back.
//!
//! # Usage
//!
//! ```ignore
//! use segsum::driver::RowSumEngine;
//! use segsum::kernels::cpu::CpuDevice;
//! use segsum::config::SegsumConfig;
//!
//! let engine = RowSumEngine::new(CpuDevice::new(), SegsumConfig::default());
//! let sums = engine.row_sums(matrix.view())?;
//! ```
//!
//! # Buffer flow
//!
//! ```text
//!  input ──[transpose]──▶ transposed ──▶ stage 1 ──▶ partials ──▶ stage 2 ──▶ result
//!                          (OuterParallel only)         (LargeCommMany only)
//! ```
//!
//! Each stage output is handed to the next stage with [`MemBlock::assign`],
//! so intermediates are released as soon as nothing refers to them and only
//! the result block survives the call.

mod profile;

pub use profile::{KernelProfile, KernelStats, ProfileReport};

use crate::config::SegsumConfig;
use crate::error::{Result, SegsumError};
use crate::kernels::backend::{ComputeDevice, ReductionLaunch};
use crate::kernels::dispatch::{force_plan, select_plan, PlanKind, ReductionPlan, Shape, StageInput};
use crate::kernels::transpose::{plan_transpose, transpose, TransposePlan, TransposeRequest};
use crate::memory::{DeviceArena, MemBlock, MemorySpace};
use ndarray::{Array1, ArrayView2};
use std::time::Instant;

/// Row-sum engine bound to one device.
#[derive(Debug)]
pub struct RowSumEngine<D: ComputeDevice> {
    device: D,
    config: SegsumConfig,
    arena: DeviceArena,
    profile: KernelProfile,
}

impl<D: ComputeDevice> RowSumEngine<D> {
    /// Create an engine; the configuration is clamped to the device limits.
    pub fn new(device: D, config: SegsumConfig) -> Self {
        let config = config.clamp_to(&device.limits());
        let arena = DeviceArena::new(config.detail_memory);
        Self {
            device,
            config,
            arena,
            profile: KernelProfile::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// The configuration after clamping.
    pub fn config(&self) -> &SegsumConfig {
        &self.config
    }

    pub fn arena(&self) -> &DeviceArena {
        &self.arena
    }

    /// Per-kernel statistics; only populated in debug mode.
    pub fn profile(&self) -> &KernelProfile {
        &self.profile
    }

    /// Plan the engine would pick for `shape`, or the forced one.
    pub fn plan_for(&self, shape: Shape, forced: Option<PlanKind>) -> Result<ReductionPlan> {
        let params = self.config.dispatch_params();
        match forced {
            Some(kind) => force_plan(kind, shape, &params),
            None => Ok(select_plan(shape, &params)),
        }
    }

    /// Sum every row of `matrix`.
    pub fn row_sums(&self, matrix: ArrayView2<i32>) -> Result<Array1<i32>> {
        self.row_sums_with(matrix, None)
    }

    /// Sum every row of `matrix`, optionally forcing a plan.
    pub fn row_sums_with(&self, matrix: ArrayView2<i32>, forced: Option<PlanKind>) -> Result<Array1<i32>> {
        let shape = Shape::new(matrix.nrows(), matrix.ncols());
        let plan = self.plan_for(shape, forced)?;
        if shape.segments == 0 {
            return Ok(Array1::zeros(0));
        }

        let data = matrix.as_standard_layout();
        let values = data.as_slice().ok_or_else(|| SegsumError::Shape {
            expected: "contiguous row-major matrix".to_string(),
            actual: format!("{shape} view with strides {:?}", matrix.strides()),
        })?;

        let input = self.arena.upload(&self.device, values)?;
        let result = self.reduce(&input, shape, &plan)?;
        self.download(&result, shape.segments)
    }

    /// Run `plan` over a device-resident row-major matrix.
    ///
    /// Returns a block of `shape.segments` sums owned by the caller. All
    /// launches are queued; the only wait is the one after the last launch.
    pub fn reduce(&self, input: &MemBlock<D::Buffer>, shape: Shape, plan: &ReductionPlan) -> Result<MemBlock<D::Buffer>> {
        tracing::info!(plan = %plan.kind(), shape = %shape, "reducing");
        if shape.segments == 0 {
            return self.arena.alloc_device(&self.device, 0);
        }

        let mut transposed = MemBlock::null(MemorySpace::Device);
        if plan.needs_transpose() {
            let block = self.arena.alloc_device(&self.device, shape.elements())?;
            self.transpose_to_columns(&block, input, shape)?;
            transposed.assign(&block);
        }

        let mut current = MemBlock::null(MemorySpace::Device);
        for stage in plan.stages(shape, self.config.group_size) {
            let output = self.arena.alloc_device(&self.device, stage.output_len)?;
            let source = match stage.input {
                StageInput::Matrix => input,
                StageInput::Transposed => &transposed,
                StageInput::Partials => &current,
            };
            self.launch(&stage.launch, source, &output)?;
            current.assign(&output);
        }
        transposed.release();

        self.device.finish()?;
        Ok(current)
    }

    /// Read the first `len` elements of a device block into a host vector.
    pub fn download(&self, block: &MemBlock<D::Buffer>, len: usize) -> Result<Array1<i32>> {
        let mut host = self.arena.alloc_host(len);
        let values = host.handle_mut().ok_or(SegsumError::NullBlock {
            space: MemorySpace::Host,
        })?;
        self.device.download(block.buffer()?, values)?;
        Ok(Array1::from_vec(std::mem::take(values)))
    }

    fn transpose_to_columns(&self, dst: &MemBlock<D::Buffer>, src: &MemBlock<D::Buffer>, shape: Shape) -> Result<()> {
        let request = TransposeRequest::matrix(shape.segments, shape.segment_len);
        let tile = self.config.tile_size;
        let (name, _scratch) = match plan_transpose(&request, tile) {
            TransposePlan::Copy { .. } => ("copy", None),
            TransposePlan::Tiled(launch) => (launch.kernel_name(), Some(self.arena.alloc_local(launch.local_bytes()))),
        };
        let start = Instant::now();
        transpose(&self.device, dst.buffer()?, src.buffer()?, &request, tile)?;
        self.after_launch(name, start)
    }

    fn launch(&self, launch: &ReductionLaunch, input: &MemBlock<D::Buffer>, output: &MemBlock<D::Buffer>) -> Result<()> {
        let grid = launch.grid();
        if grid.is_empty() {
            return Ok(());
        }
        let _scratch = self.arena.alloc_local(launch.kernel.local_bytes(launch.group_size));
        tracing::debug!(
            "Launching {} with global work size {:?} and local work size {:?}",
            launch.kernel.name(),
            grid.global,
            grid.local
        );
        let start = Instant::now();
        self.device.launch_reduction(launch, input.buffer()?, output.buffer()?)?;
        self.after_launch(launch.kernel.name(), start)
    }

    fn after_launch(&self, kernel: &'static str, start: Instant) -> Result<()> {
        if self.config.debug {
            self.device.finish()?;
            let elapsed = start.elapsed();
            tracing::debug!("Kernel {} runtime: {}us", kernel, elapsed.as_micros());
            self.profile.record(kernel, elapsed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::cpu::CpuDevice;
    use crate::kernels::reference_row_sums;
    use ndarray::Array2;

    fn matrix(rows: usize, cols: usize) -> Array2<i32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| (r * 31 + c * 7) as i32 % 97 - 48)
    }

    fn engine(group_size: usize) -> RowSumEngine<CpuDevice> {
        RowSumEngine::new(CpuDevice::new(), SegsumConfig::default().with_group_size(group_size))
    }

    #[test]
    fn test_single_value() {
        let engine = engine(256);
        let sums = engine.row_sums(ndarray::array![[5]].view()).unwrap();
        assert_eq!(sums.to_vec(), vec![5]);
    }

    #[test]
    fn test_no_rows() {
        let engine = engine(256);
        let sums = engine.row_sums(Array2::<i32>::zeros((0, 7)).view()).unwrap();
        assert!(sums.is_empty());
        assert!(engine.device().launch_log().is_empty());
        assert_eq!(engine.arena().usage(MemorySpace::Device).peak, 0);
    }

    #[test]
    fn test_empty_rows() {
        let engine = engine(256);
        let sums = engine.row_sums(Array2::<i32>::zeros((4, 0)).view()).unwrap();
        assert_eq!(sums.to_vec(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_every_plan_matches_reference() {
        let engine = engine(32);
        let m = matrix(9, 20);
        let expected = reference_row_sums(m.view());
        for kind in PlanKind::ALL {
            let sums = engine.row_sums_with(m.view(), Some(kind)).unwrap();
            assert_eq!(sums, expected, "plan {kind}");
        }
    }

    #[test]
    fn test_intermediates_released() {
        let engine = engine(256);
        let m = matrix(2, 100_000);
        let sums = engine.row_sums_with(m.view(), Some(PlanKind::LargeCommMany)).unwrap();
        assert_eq!(sums, reference_row_sums(m.view()));
        assert_eq!(engine.arena().usage(MemorySpace::Device).current, 0);
        assert_eq!(engine.arena().usage(MemorySpace::Local).current, 0);
        assert_eq!(engine.arena().usage(MemorySpace::Host).current, 0);
        assert!(engine.arena().usage(MemorySpace::Device).peak > 0);
    }

    #[test]
    fn test_reduce_returns_owned_result() {
        let engine = engine(64);
        let m = matrix(10, 300);
        let shape = Shape::new(10, 300);
        let input = engine.arena().upload(engine.device(), m.as_slice().unwrap()).unwrap();
        let plan = engine.plan_for(shape, Some(PlanKind::LargeCommMany)).unwrap();
        let result = engine.reduce(&input, shape, &plan).unwrap();
        assert_eq!(result.owner_count(), 1);
        assert_eq!(input.owner_count(), 1);
        // input and result are the only live device blocks
        let live = engine.arena().usage(MemorySpace::Device).current;
        assert_eq!(live as usize, (10 * 300 + 10) * 4);
        assert_eq!(engine.download(&result, 10).unwrap(), reference_row_sums(m.view()));
    }

    #[test]
    fn test_large_comm_many_runs_two_launches() {
        let engine = engine(256);
        let m = matrix(2, 40_000);
        engine.row_sums(m.view()).unwrap();
        assert_eq!(engine.device().launch_log(), vec!["chunked_sum_many", "small_comm_scan"]);
    }

    #[test]
    fn test_outer_parallel_transposes_first() {
        let engine = RowSumEngine::new(
            CpuDevice::new(),
            SegsumConfig::default().with_large_grid_threshold(8),
        );
        let m = matrix(20, 5);
        let sums = engine.row_sums(m.view()).unwrap();
        assert_eq!(sums, reference_row_sums(m.view()));
        assert_eq!(engine.device().launch_log(), vec!["transpose_lowwidth_i32", "row_serial_sum"]);
    }

    #[test]
    fn test_debug_mode_profiles_kernels() {
        let engine = RowSumEngine::new(CpuDevice::new(), SegsumConfig::default().with_debug(true));
        engine.row_sums(matrix(3, 10).view()).unwrap();
        let report = engine.profile().snapshot();
        assert_eq!(report.total_runs(), 1);
        assert_eq!(report.kernels[0].0, "small_comm_scan");
    }

    #[test]
    fn test_non_contiguous_view() {
        let engine = engine(16);
        let m = matrix(6, 8);
        let transposed = m.t();
        let sums = engine.row_sums(transposed).unwrap();
        assert_eq!(sums, reference_row_sums(transposed));
    }

    #[test]
    fn test_forced_small_comm_rejected() {
        let engine = engine(16);
        let err = engine.row_sums_with(matrix(2, 40).view(), Some(PlanKind::SmallComm)).unwrap_err();
        assert!(matches!(err, SegsumError::IneligiblePlan { .. }));
    }
}
