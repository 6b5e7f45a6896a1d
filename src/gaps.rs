use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRange {
    pub start_ms: i64,
    pub end_ms: i64,
    pub timestamps: Vec<i64>,
}

/// Most recent fully closed grid point at or before `now_ms`, on the grid that
/// passes through `anchor_ms`.
pub fn latest_closed_boundary(now_ms: i64, step_ms: i64, anchor_ms: i64) -> i64 {
    let residue = anchor_ms.rem_euclid(step_ms);
    now_ms - (now_ms - residue).rem_euclid(step_ms) - step_ms
}

pub fn retention_floor(latest_closed_ms: i64, step_ms: i64, history_limit: usize) -> i64 {
    let span = (history_limit.max(1) as i64 - 1).saturating_mul(step_ms);
    latest_closed_ms.saturating_sub(span)
}

/// Returns grid points that should exist but do not, newest first.
pub fn detect_missing_timestamps(
    desc_timestamps: &[i64],
    step_ms: i64,
    now_ms: i64,
    history_limit: usize,
) -> Vec<i64> {
    detect_missing_since(desc_timestamps, step_ms, now_ms, history_limit, i64::MIN)
}

/// Same as [`detect_missing_timestamps`], but never walks below `floor_ms`.
pub fn detect_missing_since(
    desc_timestamps: &[i64],
    step_ms: i64,
    now_ms: i64,
    history_limit: usize,
    floor_ms: i64,
) -> Vec<i64> {
    if desc_timestamps.is_empty() || step_ms <= 0 || history_limit <= 1 {
        return Vec::new();
    }

    let mut missing = BTreeSet::new();
    let newest = desc_timestamps[0];

    let latest_closed = latest_closed_boundary(now_ms, step_ms, newest);
    let mut ts = latest_closed;
    while ts > newest && ts >= floor_ms {
        missing.insert(ts);
        ts -= step_ms;
    }

    for pair in desc_timestamps.windows(2) {
        let (newer, older) = (pair[0], pair[1]);
        if newer <= floor_ms {
            break;
        }
        let mut ts = newer - step_ms;
        while ts > older && ts >= floor_ms {
            missing.insert(ts);
            ts -= step_ms;
        }
    }

    missing.into_iter().rev().collect()
}

pub fn group_missing_ranges(missing: &[i64], step_ms: i64) -> Vec<MissingRange> {
    if missing.is_empty() || step_ms <= 0 {
        return Vec::new();
    }

    let mut ordered = missing.to_vec();
    ordered.sort_unstable_by(|a, b| b.cmp(a));
    ordered.dedup();

    let mut ranges = Vec::new();
    let mut current = vec![ordered[0]];
    for ts in ordered.into_iter().skip(1) {
        let prev = current[current.len() - 1];
        if prev - ts == step_ms {
            current.push(ts);
            continue;
        }
        ranges.push(close_range(std::mem::replace(&mut current, vec![ts]), step_ms));
    }
    ranges.push(close_range(current, step_ms));
    ranges
}

fn close_range(timestamps: Vec<i64>, step_ms: i64) -> MissingRange {
    let newest = timestamps[0];
    let oldest = timestamps[timestamps.len() - 1];
    MissingRange {
        start_ms: oldest,
        end_ms: newest + step_ms - 1,
        timestamps,
    }
}

impl MissingRange {
    pub fn page_windows(&self, step_ms: i64, page: usize) -> Vec<MissingRange> {
        self.timestamps
            .chunks(page.max(1))
            .map(|chunk| close_range(chunk.to_vec(), step_ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    #[test]
    fn contiguous_history_only_reports_trailing_gap() {
        let missing = detect_missing_timestamps(&[180_000, 120_000, 60_000], MIN, 301_000, 5);
        assert_eq!(missing, vec![240_000]);
    }

    #[test]
    fn interior_holes_are_reported_alongside_trailing_gap() {
        let missing = detect_missing_timestamps(&[180_000, 120_000, 0], MIN, 301_000, 5);
        assert_eq!(missing, vec![240_000, 60_000]);
    }

    #[test]
    fn up_to_date_history_has_no_gaps() {
        let missing = detect_missing_timestamps(&[240_000, 180_000], MIN, 301_000, 5);
        assert!(missing.is_empty());
    }

    #[test]
    fn degenerate_inputs_yield_nothing() {
        assert!(detect_missing_timestamps(&[], MIN, 301_000, 5).is_empty());
        assert!(detect_missing_timestamps(&[0, -120_000], 0, 301_000, 5).is_empty());
        assert!(detect_missing_timestamps(&[0, -120_000], MIN, 301_000, 1).is_empty());
    }

    #[test]
    fn grid_residue_follows_stored_points() {
        // Points offset by 7s from the epoch-aligned grid.
        let stored = [127_000, 67_000];
        let missing = detect_missing_timestamps(&stored, MIN, 310_000, 5);
        assert_eq!(missing, vec![247_000, 187_000]);
        assert!(missing.iter().all(|ts| ts.rem_euclid(MIN) == 7_000));
    }

    #[test]
    fn floor_bounds_trailing_walk_after_long_outage() {
        let now = 10_000 * MIN + 1;
        let latest_closed = latest_closed_boundary(now, MIN, 0);
        let floor = retention_floor(latest_closed, MIN, 5);

        let missing = detect_missing_since(&[0], MIN, now, 5, floor);
        assert_eq!(missing, (9_995..10_000).rev().map(|m| m * MIN).collect::<Vec<_>>());

        let unbounded = detect_missing_timestamps(&[0], MIN, now, 5);
        assert_eq!(unbounded.len(), 9_999);
        let filtered: Vec<i64> = unbounded.into_iter().filter(|ts| *ts >= floor).collect();
        assert_eq!(filtered, missing);
    }

    #[test]
    fn floor_bounds_interior_holes() {
        let stored = [600_000, 420_000, 0];
        let missing = detect_missing_since(&stored, MIN, 661_000, 10, 300_000);
        assert_eq!(missing, vec![540_000, 480_000, 360_000, 300_000]);
    }

    #[test]
    fn filled_grid_is_contiguous_for_varied_gap_patterns() {
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move |bound: u64| {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (seed >> 33) % bound
        };

        for _ in 0..200 {
            let residue = next(MIN as u64) as i64;
            let oldest = 1_000 * MIN + residue;
            let mut stored = vec![oldest];
            let mut ts = oldest;
            for _ in 0..next(12) {
                ts += (next(4) as i64 + 1) * MIN;
                stored.push(ts);
            }
            stored.reverse();
            let newest = stored[0];
            let now = newest + next(8 * MIN as u64) as i64;

            let missing = detect_missing_timestamps(&stored, MIN, now, 1_000);
            let mut grid: Vec<i64> = stored.iter().copied().chain(missing).collect();
            grid.sort_unstable_by(|a, b| b.cmp(a));

            let latest_closed = latest_closed_boundary(now, MIN, newest);
            assert_eq!(grid[0], latest_closed.max(newest), "{stored:?} at {now}");
            assert_eq!(*grid.last().unwrap(), oldest);
            assert!(
                grid.windows(2).all(|w| w[0] - w[1] == MIN),
                "{stored:?} at {now}"
            );
        }
    }

    #[test]
    fn latest_closed_boundary_handles_exact_boundary() {
        assert_eq!(latest_closed_boundary(300_000, MIN, 0), 240_000);
        assert_eq!(latest_closed_boundary(299_999, MIN, 0), 180_000);
    }

    #[test]
    fn retention_floor_spans_history_limit_points() {
        assert_eq!(retention_floor(600_000, MIN, 5), 360_000);
        assert_eq!(retention_floor(600_000, MIN, 1), 600_000);
    }

    #[test]
    fn grouping_splits_on_non_adjacent_points() {
        let ranges = group_missing_ranges(&[60_000, 240_000, 300_000, 180_000], MIN);
        assert_eq!(
            ranges,
            vec![
                MissingRange {
                    start_ms: 180_000,
                    end_ms: 359_999,
                    timestamps: vec![300_000, 240_000, 180_000],
                },
                MissingRange {
                    start_ms: 60_000,
                    end_ms: 119_999,
                    timestamps: vec![60_000],
                },
            ]
        );
    }

    #[test]
    fn grouping_covers_every_input_point_once() {
        let input = vec![600_000, 540_000, 360_000, 300_000, 240_000, 0];
        let ranges = group_missing_ranges(&input, MIN);
        let flattened: Vec<i64> = ranges.iter().flat_map(|r| r.timestamps.clone()).collect();
        assert_eq!(flattened, input);
        for range in &ranges {
            assert!(range.timestamps.windows(2).all(|w| w[0] - w[1] == MIN));
        }
    }

    #[test]
    fn page_windows_chunk_long_runs() {
        let run = group_missing_ranges(&[300_000, 240_000, 180_000, 120_000, 60_000], MIN);
        let windows = run[0].page_windows(MIN, 2);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start_ms, 240_000);
        assert_eq!(windows[0].end_ms, 359_999);
        assert_eq!(windows[2].timestamps, vec![60_000]);
    }
}
