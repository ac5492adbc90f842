use super::*;
use ndarray::array;

fn sequential_segmented_scan(values: &[SegmentedValue<i32>]) -> Vec<i32> {
    let mut out = Vec::with_capacity(values.len());
    let mut acc = 0i32;
    for v in values {
        acc = if v.flag { v.value } else { acc.wrapping_add(v.value) };
        out.push(acc);
    }
    out
}

#[test]
fn test_reference_row_sums() {
    let m = array![[1, 2, 3], [4, 5, 6]];
    assert_eq!(reference_row_sums(m.view()), array![6, 15]);
}

#[test]
fn test_reference_row_sums_wraps() {
    let m = array![[i32::MAX, 1], [i32::MIN, -1]];
    assert_eq!(reference_row_sums(m.view()), array![i32::MIN, i32::MAX]);
}

#[test]
fn test_serial_sum() {
    let data = [1, 10, 2, 20, 3, 30];
    assert_eq!(serial_sum(&data, 0, 2, 3), Ok(6));
    assert_eq!(serial_sum(&data, 1, 2, 3), Ok(60));
    assert_eq!(serial_sum(&data, 5, 2, 0), Ok(0));
    assert_eq!(serial_sum(&data, 1, 2, 4), Err(7));
}

#[test]
fn test_group_tree_reduce() {
    for group_size in [1, 2, 3, 7, 16, 33, 100, 256] {
        for wave in [1, 2, 4, 32, 64] {
            let mut local: Vec<i32> = (1..=group_size as i32).collect();
            let expected: i32 = local.iter().sum();
            let result = group_tree_reduce(&mut local, wave, i32::wrapping_add);
            assert_eq!(result, Some(expected), "group {group_size}, wave {wave}");
        }
    }
}

#[test]
fn test_group_tree_reduce_empty() {
    let mut local: Vec<i32> = Vec::new();
    assert_eq!(group_tree_reduce(&mut local, 1, i32::wrapping_add), None);
}

#[test]
fn test_segmented_combine() {
    let combine = segmented_combine(i32::wrapping_add);
    let a = SegmentedValue::new(true, 3);
    let b = SegmentedValue::new(false, 4);
    let c = SegmentedValue::new(true, 10);
    assert_eq!(combine(a, b), SegmentedValue::new(true, 7));
    assert_eq!(combine(a, c), SegmentedValue::new(true, 10));
    assert_eq!(combine(b, b), SegmentedValue::new(false, 8));
}

#[test]
fn test_segmented_scan_matches_sequential() {
    for group_size in [1, 5, 32, 33, 64, 100, 256, 1024] {
        for segment_len in [1, 2, 3, 7, 32, 50] {
            let mut local: Vec<SegmentedValue<i32>> = (0..group_size)
                .map(|tid| SegmentedValue::new(tid % segment_len == 0, tid as i32 - 40))
                .collect();
            let expected = sequential_segmented_scan(&local);
            segmented_scan(&mut local, SCAN_BLOCK, segmented_combine(i32::wrapping_add));
            let actual: Vec<i32> = local.iter().map(|v| v.value).collect();
            assert_eq!(actual, expected, "group {group_size}, segment {segment_len}");
        }
    }
}

#[test]
fn test_segmented_scan_small_blocks() {
    // 4-wide blocks exercise the carry pass with many blocks
    let mut local: Vec<SegmentedValue<i32>> = (0..16).map(|tid| SegmentedValue::new(tid % 6 == 0, 1)).collect();
    let expected = sequential_segmented_scan(&local);
    segmented_scan(&mut local, 4, segmented_combine(i32::wrapping_add));
    let actual: Vec<i32> = local.iter().map(|v| v.value).collect();
    assert_eq!(actual, expected);
}

#[test]
fn test_plain_scan() {
    let mut local: Vec<i32> = vec![1; 70];
    segmented_scan(&mut local, SCAN_BLOCK, i32::wrapping_add);
    let expected: Vec<i32> = (1..=70).collect();
    assert_eq!(local, expected);
}
