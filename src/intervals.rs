//! Reconciles fuzzy chunk-boundary proposals into a contiguous partition.
//!
//! Segmentation prompts run over overlapping batches of paragraphs, so the
//! model's interval proposals disagree near batch edges. Boundary voting
//! plus fuzzy clustering turns those proposals into one deterministic
//! partition of `[1, n]`.

use serde_json::Value;

use crate::config::MergeOptions;

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f.trunc() as i64),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.trunc() as i64),
        _ => None,
    }
}

// Recursively collect [s, e] pairs from any nested array structure.
fn collect_pairs(node: &Value, acc: &mut Vec<(i64, i64)>) {
    let Value::Array(items) = node else {
        return;
    };
    if items.len() == 2 {
        if let (Some(s), Some(e)) = (coerce_int(&items[0]), coerce_int(&items[1])) {
            acc.push((s, e));
            return;
        }
    }
    for child in items {
        collect_pairs(child, acc);
    }
}

// Swap reversed pairs, clamp to [1, n], dedupe, sort by start then end.
fn normalize(pairs: Vec<(i64, i64)>, n: usize) -> Vec<(usize, usize)> {
    let n = n as i64;
    let mut norm: Vec<(usize, usize)> = Vec::new();
    for (mut s, mut e) in pairs {
        if s > e {
            std::mem::swap(&mut s, &mut e);
        }
        s = s.clamp(1, n);
        e = e.clamp(1, n);
        if s > e {
            continue;
        }
        let pair = (s as usize, e as usize);
        if !norm.contains(&pair) {
            norm.push(pair);
        }
    }
    norm.sort();
    norm
}

fn fallback_chunks(n: usize, size: usize) -> Vec<(usize, usize)> {
    let k = size.max(1);
    let mut out = Vec::new();
    let mut start = 1;
    while start <= n {
        out.push((start, n.min(start + k - 1)));
        start += k;
    }
    out
}

// Boundary k means a cut after paragraph k, for k in [0, n].
fn boundary_votes(intervals: &[(usize, usize)], n: usize) -> Vec<u32> {
    let mut counts = vec![0u32; n + 1];
    for &(s, e) in intervals {
        counts[s - 1] += 1;
        counts[e] += 1;
    }
    counts
}

// Cluster voted boundaries within the fuzz radius and pick one
// representative per cluster: vote-weighted mean, snapped to the nearest
// member. Ties break toward the higher vote count, then the lower index.
fn select_boundaries(counts: &[u32], fuzz: usize, n: usize) -> Vec<usize> {
    let positions: Vec<usize> = (0..=n).filter(|&k| counts[k] > 0).collect();
    if positions.is_empty() {
        return vec![0, n];
    }

    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut current = vec![positions[0]];
    for &p in &positions[1..] {
        if p - *current.last().unwrap() <= fuzz {
            current.push(p);
        } else {
            clusters.push(std::mem::replace(&mut current, vec![p]));
        }
    }
    clusters.push(current);

    let mut chosen: Vec<usize> = Vec::new();
    for cluster in clusters {
        if cluster.len() == 1 {
            chosen.push(cluster[0]);
            continue;
        }
        let sum_w: u64 = cluster.iter().map(|&p| counts[p] as u64).sum();
        let sum_wp: u64 = cluster.iter().map(|&p| counts[p] as u64 * p as u64).sum();
        let mean = if sum_w > 0 {
            (sum_wp as f64 / sum_w as f64).round() as i64
        } else {
            (cluster.iter().sum::<usize>() as f64 / cluster.len() as f64).round() as i64
        };

        let mut best = cluster[0];
        let mut best_dist = i64::MAX;
        let mut best_votes = counts[best];
        for &p in &cluster {
            let dist = (p as i64 - mean).abs();
            let votes = counts[p];
            if dist < best_dist
                || (dist == best_dist && votes > best_votes)
                || (dist == best_dist && votes == best_votes && p < best)
            {
                best = p;
                best_dist = dist;
                best_votes = votes;
            }
        }
        chosen.push(best);
    }

    if !chosen.contains(&0) {
        chosen.push(0);
    }
    if !chosen.contains(&n) {
        chosen.push(n);
    }
    chosen.sort_unstable();
    chosen.dedup();
    chosen
}

fn intervals_from_boundaries(boundaries: &[usize]) -> Vec<(usize, usize)> {
    boundaries
        .windows(2)
        .filter_map(|w| {
            let (s, e) = (w[0] + 1, w[1]);
            (s <= e).then_some((s, e))
        })
        .collect()
}

// Repair gaps and overlaps into a strict partition of [1, n]. Overlaps trim
// the later interval's start; gaps extend the previous interval.
fn sanitize_contiguity(intervals: Vec<(usize, usize)>, n: usize) -> Vec<(usize, usize)> {
    let mut sorted = intervals;
    sorted.sort();

    let mut fixed: Vec<(usize, usize)> = Vec::new();
    let mut expected_start = 1;

    for (mut s, mut e) in sorted {
        if e < expected_start {
            // Entirely covered by what came before.
            continue;
        }

        if s > expected_start {
            if let Some(prev) = fixed.last_mut() {
                log::warn!(
                    "Gap before [{}, {}]: extending previous interval to end at {}",
                    s,
                    e,
                    s - 1
                );
                prev.1 = s - 1;
            } else {
                log::warn!("Leading gap: synthesizing [{}, {}]", expected_start, s - 1);
                fixed.push((expected_start, s - 1));
            }
        }

        if s < expected_start {
            log::warn!(
                "Overlap: trimming start of [{}, {}] to {}",
                s,
                e,
                expected_start
            );
            s = expected_start;
        }

        s = s.clamp(1, n);
        e = e.clamp(1, n);
        if s <= e {
            fixed.push((s, e));
            expected_start = e + 1;
        }
    }

    if expected_start <= n {
        log::warn!("Trailing gap: synthesizing [{}, {}]", expected_start, n);
        fixed.push((expected_start, n));
    }

    let mut coalesced: Vec<(usize, usize)> = Vec::new();
    for (s, e) in fixed {
        match coalesced.last_mut() {
            Some(last) if last.1 + 1 != s && last.1 >= s => last.1 = last.1.max(e),
            _ => coalesced.push((s, e)),
        }
    }
    coalesced
}

/// Merges the model's segmentation proposals into a contiguous partition of
/// `[1, total_paragraphs]` (1-indexed, inclusive).
///
/// `proposals` may be arbitrarily nested JSON; any 2-element array whose
/// members coerce to integers counts as an interval. When no usable
/// interval survives normalization the result falls back to fixed-size
/// chunks. Deterministic for a given input.
///
/// # Panics
///
/// Panics if `total_paragraphs` is zero; callers only segment non-empty
/// pages.
pub fn merge_fuzzy_intervals(
    total_paragraphs: usize,
    proposals: &Value,
    opts: MergeOptions,
) -> Vec<(usize, usize)> {
    assert!(total_paragraphs >= 1, "total_paragraphs must be positive");
    let n = total_paragraphs;

    let mut raw_pairs = Vec::new();
    collect_pairs(proposals, &mut raw_pairs);
    if raw_pairs.is_empty() {
        log::warn!("Unable to read segmentation proposals, using fallback chunking");
        return fallback_chunks(n, opts.fallback_chunk_size);
    }

    let intervals = normalize(raw_pairs, n);
    if intervals.is_empty() {
        log::warn!("Unable to read segmentation proposals, using fallback chunking");
        return fallback_chunks(n, opts.fallback_chunk_size);
    }

    let counts = boundary_votes(&intervals, n);
    let boundaries = select_boundaries(&counts, opts.fuzz_radius, n);
    let prelim = intervals_from_boundaries(&boundaries);
    let merged = sanitize_contiguity(prelim, n);

    if merged.is_empty() {
        log::warn!("Unable to read segmentation proposals, using fallback chunking");
        return fallback_chunks(n, opts.fallback_chunk_size);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts() -> MergeOptions {
        MergeOptions::default()
    }

    fn assert_partition(intervals: &[(usize, usize)], n: usize) {
        assert!(!intervals.is_empty());
        assert_eq!(intervals[0].0, 1);
        assert_eq!(intervals.last().unwrap().1, n);
        for pair in intervals.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + 1, "not contiguous: {:?}", intervals);
        }
        for &(s, e) in intervals {
            assert!(s <= e);
        }
    }

    #[test]
    fn agreeing_proposals_pass_through() {
        let merged = merge_fuzzy_intervals(10, &json!([[1, 4], [5, 10]]), opts());
        assert_eq!(merged, vec![(1, 4), (5, 10)]);
    }

    #[test]
    fn nearby_boundaries_cluster_by_votes() {
        let merged = merge_fuzzy_intervals(10, &json!([[1, 5], [1, 4], [6, 10]]), opts());
        assert_eq!(merged, vec![(1, 5), (6, 10)]);
    }

    #[test]
    fn gap_between_proposals_is_absorbed() {
        let merged = merge_fuzzy_intervals(10, &json!([[1, 3], [5, 10]]), opts());
        assert_partition(&merged, 10);
    }

    #[test]
    fn reversed_and_out_of_range_pairs_are_normalized() {
        let merged = merge_fuzzy_intervals(10, &json!([[4, 1], [5, 99]]), opts());
        assert_partition(&merged, 10);
    }

    #[test]
    fn malformed_proposals_use_fallback() {
        let merged = merge_fuzzy_intervals(
            10,
            &json!({"boundaries": "none"}),
            MergeOptions {
                fuzz_radius: 2,
                fallback_chunk_size: 3,
            },
        );
        assert_eq!(merged, vec![(1, 3), (4, 6), (7, 9), (10, 10)]);
    }

    #[test]
    fn empty_proposals_use_fallback() {
        let merged = merge_fuzzy_intervals(5, &json!([]), opts());
        assert_eq!(merged, vec![(1, 5)]);
    }

    #[test]
    fn nested_and_stringly_pairs_are_collected() {
        let merged = merge_fuzzy_intervals(10, &json!([[["1", 4]], [[5, 10.7]]]), opts());
        assert_eq!(merged, vec![(1, 4), (5, 10)]);
    }

    #[test]
    fn result_is_idempotent() {
        let first = merge_fuzzy_intervals(20, &json!([[1, 7], [6, 13], [14, 20]]), opts());
        assert_partition(&first, 20);

        let as_json = json!(first
            .iter()
            .map(|&(s, e)| vec![s, e])
            .collect::<Vec<_>>());
        let second = merge_fuzzy_intervals(20, &as_json, opts());
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic]
    fn zero_paragraphs_is_a_contract_violation() {
        merge_fuzzy_intervals(0, &json!([[1, 2]]), opts());
    }
}
