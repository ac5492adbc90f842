//! End-to-end row-sum tests on the CPU emulator
//!
//! Every test drives the full path: upload, plan selection (or a forced
//! plan), kernel launches, read-back. Results are compared against the
//! sequential reference.

use ndarray::{array, Array2};
use proptest::prelude::*;
use segsum::kernels::reference_row_sums;
use segsum::{CpuDevice, MemorySpace, PlanKind, RowSumEngine, SegsumConfig, SegsumError, Shape};

fn engine(config: SegsumConfig) -> RowSumEngine<CpuDevice> {
    RowSumEngine::new(CpuDevice::new(), config)
}

fn test_matrix(rows: usize, cols: usize) -> Array2<i32> {
    // deterministic, mixed signs
    Array2::from_shape_fn((rows, cols), |(r, c)| ((r * 7919 + c * 104_729) % 2001) as i32 - 1000)
}

// =============================================================================
// Boundary scenarios
// =============================================================================

#[test]
fn test_single_element() {
    let engine = engine(SegsumConfig::default());
    let sums = engine.row_sums(array![[5]].view()).unwrap();
    assert_eq!(sums, array![5]);
}

#[test]
fn test_empty_rows_give_zeros() {
    let engine = engine(SegsumConfig::default());
    let m = Array2::<i32>::zeros((4, 0));
    assert_eq!(engine.row_sums(m.view()).unwrap(), array![0, 0, 0, 0]);
    for kind in PlanKind::ALL {
        let sums = engine.row_sums_with(m.view(), Some(kind)).unwrap();
        assert_eq!(sums, array![0, 0, 0, 0], "plan {kind}");
    }
}

#[test]
fn test_many_short_rows() {
    let engine = engine(SegsumConfig::default());
    let m = test_matrix(100_000, 3);
    let shape = Shape::new(100_000, 3);
    assert_eq!(engine.plan_for(shape, None).unwrap().kind(), PlanKind::OuterParallel);
    assert_eq!(engine.row_sums(m.view()).unwrap(), reference_row_sums(m.view()));
}

#[test]
fn test_many_short_rows_intra_group() {
    let engine = engine(SegsumConfig::default().with_group_size(32));
    let m = test_matrix(100_000, 3);
    let sums = engine.row_sums_with(m.view(), Some(PlanKind::IntraGroup)).unwrap();
    assert_eq!(sums, reference_row_sums(m.view()));
}

#[test]
fn test_two_long_rows() {
    let engine = engine(SegsumConfig::default());
    let m = test_matrix(2, 1_000_000);
    let shape = Shape::new(2, 1_000_000);
    assert_eq!(engine.plan_for(shape, None).unwrap().kind(), PlanKind::LargeCommMany);
    assert_eq!(engine.row_sums(m.view()).unwrap(), reference_row_sums(m.view()));
    assert_eq!(engine.device().launch_log(), vec!["chunked_sum_many", "small_comm_scan"]);
}

#[test]
fn test_packed_rows_with_partial_last_group() {
    let engine = engine(SegsumConfig::default().with_group_size(16));
    let m = test_matrix(37, 4);
    assert_eq!(engine.plan_for(Shape::new(37, 4), None).unwrap().kind(), PlanKind::SmallComm);
    assert_eq!(engine.row_sums(m.view()).unwrap(), reference_row_sums(m.view()));
}

// =============================================================================
// Plan coverage
// =============================================================================

#[test]
fn test_large_comm_one() {
    let engine = engine(SegsumConfig::default());
    let m = test_matrix(128, 500);
    assert_eq!(engine.plan_for(Shape::new(128, 500), None).unwrap().kind(), PlanKind::LargeCommOne);
    assert_eq!(engine.row_sums(m.view()).unwrap(), reference_row_sums(m.view()));
}

#[test]
fn test_large_comm_many_with_large_second_pass() {
    // 1 row spread over 300 groups of 64: the merge uses the chunked kernel
    let engine = engine(SegsumConfig::default().with_group_size(64).with_num_groups(300));
    let m = test_matrix(1, 200_000);
    assert_eq!(engine.row_sums(m.view()).unwrap(), reference_row_sums(m.view()));
    assert_eq!(engine.device().launch_log(), vec!["chunked_sum_many", "chunked_sum_one"]);
}

#[test]
fn test_overflow_wraps() {
    let engine = engine(SegsumConfig::default().with_group_size(8));
    let m = Array2::from_elem((3, 40), i32::MAX);
    let expected = reference_row_sums(m.view());
    for kind in PlanKind::ALL {
        if kind == PlanKind::SmallComm {
            continue;
        }
        assert_eq!(engine.row_sums_with(m.view(), Some(kind)).unwrap(), expected, "plan {kind}");
    }
}

#[test]
fn test_cross_strategy_consistency() {
    let engine = engine(SegsumConfig::default().with_group_size(64));
    for (rows, cols) in [(1, 1), (3, 64), (17, 33), (50, 10), (5, 1000)] {
        let m = test_matrix(rows, cols);
        let expected = reference_row_sums(m.view());
        for kind in PlanKind::ALL {
            match engine.row_sums_with(m.view(), Some(kind)) {
                Ok(sums) => assert_eq!(sums, expected, "plan {kind} on {rows}x{cols}"),
                Err(SegsumError::IneligiblePlan { .. }) => assert!(cols > 64),
                Err(e) => panic!("plan {kind} on {rows}x{cols} failed: {e}"),
            }
        }
    }
}

#[test]
fn test_lockstep_devices_agree() {
    let m = test_matrix(20, 700);
    let expected = reference_row_sums(m.view());
    for wave in [1, 32, 64] {
        let device = CpuDevice::with_limits(segsum::DeviceLimits {
            max_group_size: 1024,
            lockstep_width: wave,
        });
        let engine = RowSumEngine::new(device, SegsumConfig::default());
        for kind in [PlanKind::IntraGroup, PlanKind::LargeCommOne, PlanKind::LargeCommMany] {
            assert_eq!(engine.row_sums_with(m.view(), Some(kind)).unwrap(), expected, "wave {wave}");
        }
    }
}

#[test]
fn test_group_size_clamped_to_device() {
    let device = CpuDevice::with_limits(segsum::DeviceLimits {
        max_group_size: 64,
        lockstep_width: 1,
    });
    let engine = RowSumEngine::new(device, SegsumConfig::default());
    assert_eq!(engine.config().group_size, 64);
    assert_eq!(engine.config().tile_size, 8);
    let m = test_matrix(9, 300);
    assert_eq!(engine.row_sums(m.view()).unwrap(), reference_row_sums(m.view()));
}

#[test]
fn test_repeated_runs_release_memory() {
    let engine = engine(SegsumConfig::default());
    let m = test_matrix(40, 3000);
    let first = engine.row_sums(m.view()).unwrap();
    let peak = engine.arena().usage(MemorySpace::Device).peak;
    for _ in 0..3 {
        assert_eq!(engine.row_sums(m.view()).unwrap(), first);
    }
    assert_eq!(engine.arena().usage(MemorySpace::Device).current, 0);
    assert_eq!(engine.arena().usage(MemorySpace::Device).peak, peak);
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_auto_plan_matches_reference(
        rows in 0usize..60,
        cols in 0usize..400,
        group_size in prop::sample::select(vec![1usize, 3, 16, 32, 64, 256]),
        threshold in prop::sample::select(vec![16usize, 65_536]),
        seed in any::<i32>(),
    ) {
        let config = SegsumConfig::default()
            .with_group_size(group_size)
            .with_large_grid_threshold(threshold);
        let engine = engine(config);
        let m = Array2::from_shape_fn((rows, cols), |(r, c)| seed.wrapping_mul(r as i32 + 1).wrapping_add(c as i32));
        let sums = engine.row_sums(m.view()).unwrap();
        prop_assert_eq!(sums.len(), rows);
        prop_assert_eq!(sums, reference_row_sums(m.view()));
    }

    #[test]
    fn prop_forced_plans_agree(
        rows in 1usize..30,
        cols in 0usize..200,
        group_size in prop::sample::select(vec![2usize, 8, 32, 128]),
    ) {
        let engine = engine(SegsumConfig::default().with_group_size(group_size));
        let m = test_matrix(rows, cols);
        let expected = reference_row_sums(m.view());
        for kind in PlanKind::ALL {
            if kind == PlanKind::SmallComm && cols > group_size {
                continue;
            }
            let sums = engine.row_sums_with(m.view(), Some(kind)).unwrap();
            prop_assert_eq!(&sums, &expected, "plan {}", kind);
        }
    }
}
