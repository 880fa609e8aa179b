//! Property-based tests for SlidingWindow invariants.
//!
//! Validates:
//! 1. Count matches a reference model: points count toward the window via
//!    the timestamp of the bucket they coalesced into
//! 2. Coalescing preserves total count: near-simultaneous points all count
//! 3. A span narrower than the window never evicts
//! 4. Spacing wider than the window leaves exactly one live bucket
//! 5. Clear resets to empty

use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use diagpipe_core::sliding_window::SlidingWindow;

const BASE_SECS: i64 = 1_700_000_000;
const COALESCE_MS: i64 = 1_000;

fn at_ms(offset_ms: i64) -> chrono::DateTime<chrono::Utc> {
    Utc.timestamp_millis_opt(BASE_SECS * 1_000 + offset_ms).unwrap()
}

/// Sorted millisecond offsets.
fn arb_offsets() -> impl Strategy<Value = Vec<i64>> {
    proptest::collection::vec(0_i64..120_000, 1..60).prop_map(|mut v| {
        v.sort_unstable();
        v
    })
}

/// Reference model mirroring the documented bucket semantics.
fn model_count(offsets: &[i64], window_ms: i64) -> u64 {
    let mut buckets: Vec<(i64, u64)> = Vec::new();
    for &offset in offsets {
        match buckets.last_mut() {
            Some((start, count)) if offset - *start < COALESCE_MS => *count += 1,
            _ => buckets.push((offset, 1)),
        }
        let latest = offset;
        buckets.retain(|(start, _)| *start >= latest - window_ms);
    }
    buckets.iter().map(|(_, count)| count).sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn count_matches_reference_model(
        offsets in arb_offsets(),
        window_secs in 2_u64..60,
    ) {
        let mut window = SlidingWindow::new(Duration::from_secs(window_secs));
        for &offset in &offsets {
            window.add_data_point(at_ms(offset));
        }
        let expected = model_count(&offsets, (window_secs * 1_000) as i64);
        prop_assert_eq!(window.count(), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn coalescing_preserves_total_count(
        offsets in proptest::collection::vec(0_i64..900, 1..40),
    ) {
        // All inside one coalescing interval: one bucket, full count.
        let mut sorted = offsets;
        sorted.sort_unstable();
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        for &offset in &sorted {
            window.add_data_point(at_ms(offset));
        }
        prop_assert_eq!(window.count(), sorted.len() as u64);
    }

    #[test]
    fn narrow_span_never_evicts(offsets in arb_offsets()) {
        let span = offsets.last().unwrap() - offsets.first().unwrap();
        let window_ms = span + 1_000;
        let mut window = SlidingWindow::new(Duration::from_millis(window_ms as u64));
        for &offset in &offsets {
            window.add_data_point(at_ms(offset));
        }
        prop_assert_eq!(window.count(), offsets.len() as u64);
    }

    #[test]
    fn wide_spacing_keeps_one_bucket(
        count in 2_usize..10,
        window_secs in 1_u64..10,
    ) {
        let spacing_ms = (window_secs * 1_000 + 1_500) as i64;
        let mut window = SlidingWindow::new(Duration::from_secs(window_secs));
        for i in 0..count {
            window.add_data_point(at_ms(i as i64 * spacing_ms));
            prop_assert_eq!(window.count(), 1);
        }
    }

    #[test]
    fn clear_resets(offsets in arb_offsets()) {
        let mut window = SlidingWindow::new(Duration::from_secs(30));
        for &offset in &offsets {
            window.add_data_point(at_ms(offset));
        }
        window.clear();
        prop_assert_eq!(window.count(), 0);
    }
}
