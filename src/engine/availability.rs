use chrono::TimeDelta;

use crate::model::*;

/// Free spans of a resource-day inside `window`, given its indexed slots.
/// Gaps shorter than `min_duration` are dropped.
pub fn free_spans(slots: &DaySlots, window: &Span, min_duration: Option<TimeDelta>) -> Vec<Span> {
    let mut taken: Vec<Span> = slots
        .overlapping(window)
        .filter(|e| e.status.holds_slot())
        .map(|e| e.span)
        .collect();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);

    let mut free = subtract_intervals(&[*window], &taken);
    if let Some(min) = min_duration {
        free.retain(|s| s.duration() >= min);
    }
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
