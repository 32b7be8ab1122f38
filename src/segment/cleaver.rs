use chrono::{DateTime, Utc};

use super::{CellPassStacks, SegmentInfo};

/// Split points that cut `times` (sorted) into runs of at most `max_passes`.
///
/// A split never falls between two equal timestamps, so a run can exceed
/// the limit only when a single instant holds more passes than it.
pub fn plan_split_times(times: &[DateTime<Utc>], max_passes: usize) -> Vec<DateTime<Utc>> {
    let mut splits = Vec::new();
    if max_passes == 0 {
        return splits;
    }

    let mut start = 0;
    while times.len() - start > max_passes {
        let mut cut = start + max_passes;
        while cut > start && times[cut] == times[cut - 1] {
            cut -= 1;
        }
        if cut == start {
            cut = start + max_passes;
            while cut < times.len() && times[cut] == times[cut - 1] {
                cut += 1;
            }
            if cut == times.len() {
                break;
            }
        }

        splits.push(times[cut]);
        start = cut;
    }
    splits
}

/// Cuts one segment at `split_times` (ascending, strictly inside the
/// segment). The returned pieces partition the original range.
pub fn split_segment(
    info: &SegmentInfo,
    mut passes: CellPassStacks,
    split_times: &[DateTime<Utc>],
) -> Vec<(SegmentInfo, CellPassStacks)> {
    let mut uppers = Vec::with_capacity(split_times.len());
    for time in split_times.iter().rev() {
        uppers.push((*time, passes.split_off(*time)));
    }
    uppers.reverse();

    let mut pieces = Vec::with_capacity(split_times.len() + 1);
    let mut start = info.start_time;
    let mut lower = passes;
    for (time, upper) in uppers {
        let mut piece = SegmentInfo::new(start, time);
        piece.form = info.form;
        piece.pass_count = lower.pass_count();
        pieces.push((piece, lower));
        start = time;
        lower = upper;
    }

    let mut last = SegmentInfo::new(start, info.end_time);
    last.form = info.form;
    last.pass_count = lower.pass_count();
    pieces.push((last, lower));
    pieces
}
