//! Free functions over ordered, disjoint `Range<u64>` lists, used to track
//! which bytes of a file are still missing during a transfer.

use std::ops::Range;

/// The overlap of `a` and `b`, or `None` if they don't overlap.
pub fn intersect(a: &Range<u64>, b: &Range<u64>) -> Option<Range<u64>> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    if start < end {
        Some(start..end)
    } else {
        None
    }
}

/// Subtract `remove` from every range in `ranges`, returning a new ordered,
/// disjoint list. `ranges` is assumed already ordered and disjoint.
pub fn exclude(ranges: &[Range<u64>], remove: &Range<u64>) -> Vec<Range<u64>> {
    if remove.start >= remove.end {
        return ranges.to_vec();
    }
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for r in ranges {
        if remove.end <= r.start || remove.start >= r.end {
            out.push(r.clone());
            continue;
        }
        if r.start < remove.start {
            out.push(r.start..remove.start);
        }
        if remove.end < r.end {
            out.push(remove.end..r.end);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_overlap() {
        assert_eq!(intersect(&(0..10), &(5..15)), Some(5..10));
    }

    #[test]
    fn intersect_disjoint() {
        assert_eq!(intersect(&(0..5), &(5..10)), None);
    }

    #[test]
    fn exclude_middle_splits_range() {
        let ranges = vec![0..100];
        let result = exclude(&ranges, &(40..60));
        assert_eq!(result, vec![0..40, 60..100]);
    }

    #[test]
    fn exclude_whole_range_removes_it() {
        let ranges = vec![0..100];
        let result = exclude(&ranges, &(0..100));
        assert_eq!(result, Vec::<Range<u64>>::new());
    }

    #[test]
    fn exclude_no_overlap_is_noop() {
        let ranges = vec![0..10, 50..60];
        let result = exclude(&ranges, &(20..30));
        assert_eq!(result, ranges);
    }

    #[test]
    fn exclude_across_multiple_ranges() {
        let ranges = vec![0..10, 10..20, 30..40];
        let result = exclude(&ranges, &(5..35));
        assert_eq!(result, vec![0..5, 35..40]);
    }

    #[test]
    fn sum_of_lengths_conserved() {
        let ranges = vec![0..1000];
        let mut remaining = ranges.clone();
        let mut removed_total = 0u64;
        for chunk_start in (0..1000).step_by(65536.min(1000)) {
            let chunk_end = (chunk_start + 300).min(1000);
            remaining = exclude(&remaining, &(chunk_start..chunk_end));
            removed_total += chunk_end - chunk_start;
        }
        let remaining_len: u64 = remaining.iter().map(|r| r.end - r.start).sum();
        assert_eq!(remaining_len + removed_total.min(1000), 1000);
    }
}
