//! Heap statistics aggregation.
//!
//! Pure functions over caller-supplied counters; no I/O, no shared state.

use crate::report::{
    DuplicatedString, HeapSnapshot, MemoryAnalysis, StringAnalysis, TopMemoryConsumers,
    TypeConsumer,
};

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(100.0 * part as f64 / total as f64)
    }
}

/// Escape control characters so a displayed sample stays scannable and the
/// report JSON stays valid.
fn escape_sample(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => out.push_str(&format!("\\u{{{:04x}}}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn is_url_shaped(value: &str) -> bool {
    value
        .split_once("://")
        .is_some_and(|(scheme, rest)| {
            !scheme.is_empty()
                && !rest.is_empty()
                && scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
        })
}

/// Derive ranked memory and string summaries from a heap snapshot.
pub fn analyze(snapshot: &HeapSnapshot, top_n: usize) -> MemoryAnalysis {
    let mut by_size: Vec<TypeConsumer> = snapshot
        .type_stats
        .iter()
        .map(|(name, stat)| TypeConsumer {
            type_name: name.clone(),
            count: stat.count,
            total_size: stat.total_size,
            largest_instance: stat.largest_instance,
            percent_of_heap: percent(stat.total_size, snapshot.total_size),
        })
        .collect();

    let mut by_count = by_size.clone();
    by_size.sort_by(|a, b| b.total_size.cmp(&a.total_size).then(a.type_name.cmp(&b.type_name)));
    by_count.sort_by(|a, b| b.count.cmp(&a.count).then(a.type_name.cmp(&b.type_name)));
    by_size.truncate(top_n);
    by_count.truncate(top_n);

    let fragmentation_ratio = if snapshot.total_size > 0 {
        snapshot.free_size as f64 / snapshot.total_size as f64
    } else {
        0.0
    };

    let consumers = TopMemoryConsumers {
        total_heap_size: snapshot.total_size,
        free_size: snapshot.free_size,
        fragmentation_ratio,
        total_object_count: snapshot.total_count,
        by_size,
        by_count,
    };

    // Partition of the distinct values: unique + duplicated covers them all.
    let unique_strings = snapshot.string_stats.values().filter(|s| s.count == 1).count() as u64;
    let duplicated_strings =
        snapshot.string_stats.values().filter(|s| s.count >= 2).count() as u64;

    let mut top_duplicates: Vec<DuplicatedString> = snapshot
        .string_stats
        .iter()
        .filter(|(_, stat)| stat.count >= 2)
        .map(|(value, stat)| {
            let average = stat.total_bytes / stat.count;
            DuplicatedString {
                sample: escape_sample(value),
                count: stat.count,
                total_bytes: stat.total_bytes,
                wasted_bytes: (stat.count - 1) * average,
                suggestion: is_url_shaped(value).then(|| {
                    "value looks like a URL; consider interning or caching it".to_string()
                }),
            }
        })
        .collect();
    top_duplicates.sort_by(|a, b| b.wasted_bytes.cmp(&a.wasted_bytes).then(a.sample.cmp(&b.sample)));
    top_duplicates.truncate(top_n);

    let wasted_bytes: u64 = snapshot
        .string_stats
        .values()
        .filter(|s| s.count >= 2)
        .map(|s| (s.count - 1) * (s.total_bytes / s.count))
        .sum();

    let strings = StringAnalysis {
        unique_strings,
        duplicated_strings,
        total_strings: snapshot.string_total_count,
        total_bytes: snapshot.string_total_size,
        wasted_bytes,
        wasted_percent: percent(wasted_bytes, snapshot.string_total_size),
        top_duplicates,
    };

    MemoryAnalysis {
        consumers,
        strings,
        large_objects: snapshot.large_objects.clone(),
        faulted_tasks: snapshot.faulted_tasks.clone(),
        state_machines: snapshot.state_machines.clone(),
        async_summary: snapshot.async_summary.clone(),
        string_length_distribution: snapshot.string_length_distribution.clone(),
        // Provenance only; never part of the arithmetic above.
        was_aborted: snapshot.was_aborted,
        elapsed_ms: snapshot.elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{StringStat, TypeStat};
    use std::collections::BTreeMap;

    fn type_stat(count: u64, total_size: u64) -> TypeStat {
        TypeStat {
            count,
            total_size,
            largest_instance: if count > 0 { total_size / count } else { 0 },
            method_table: None,
        }
    }

    #[test]
    fn empty_heap_produces_zeroes_not_nan() {
        let snapshot = HeapSnapshot {
            type_stats: [("System.String".to_string(), type_stat(10, 400))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let analysis = analyze(&snapshot, 5);
        assert_eq!(analysis.consumers.fragmentation_ratio, 0.0);
        assert_eq!(analysis.consumers.by_size[0].percent_of_heap, 0.0);
        assert_eq!(analysis.strings.wasted_percent, 0.0);
    }

    #[test]
    fn percentages_round_to_two_decimals() {
        let snapshot = HeapSnapshot {
            type_stats: [
                ("A".to_string(), type_stat(1, 333)),
                ("B".to_string(), type_stat(1, 667)),
            ]
            .into_iter()
            .collect(),
            total_size: 1000,
            free_size: 250,
            ..Default::default()
        };
        let analysis = analyze(&snapshot, 5);
        assert_eq!(analysis.consumers.by_size[0].type_name, "B");
        assert_eq!(analysis.consumers.by_size[0].percent_of_heap, 66.7);
        assert_eq!(analysis.consumers.by_size[1].percent_of_heap, 33.3);
        assert_eq!(analysis.consumers.fragmentation_ratio, 0.25);
    }

    #[test]
    fn size_and_count_rankings_are_independent() {
        let snapshot = HeapSnapshot {
            type_stats: [
                ("Big".to_string(), type_stat(2, 10_000)),
                ("Many".to_string(), type_stat(5_000, 1_000)),
            ]
            .into_iter()
            .collect(),
            total_size: 11_000,
            ..Default::default()
        };
        let analysis = analyze(&snapshot, 1);
        assert_eq!(analysis.consumers.by_size[0].type_name, "Big");
        assert_eq!(analysis.consumers.by_count[0].type_name, "Many");
    }

    #[test]
    fn unique_plus_duplicated_accounting() {
        let string_stats: BTreeMap<String, StringStat> = [
            ("a".to_string(), StringStat { count: 1, total_bytes: 10 }),
            ("b".to_string(), StringStat { count: 3, total_bytes: 30 }),
            ("c".to_string(), StringStat { count: 2, total_bytes: 40 }),
        ]
        .into_iter()
        .collect();
        let distinct = string_stats.len() as u64;
        let snapshot = HeapSnapshot {
            string_stats,
            string_total_size: 80,
            string_total_count: 6,
            ..Default::default()
        };
        let analysis = analyze(&snapshot, 5);
        assert_eq!(analysis.strings.unique_strings, 1);
        assert_eq!(analysis.strings.duplicated_strings, 2);
        assert_eq!(
            analysis.strings.unique_strings + analysis.strings.duplicated_strings,
            distinct
        );
        // b wastes 2 * 10, c wastes 1 * 20.
        assert_eq!(analysis.strings.wasted_bytes, 40);
        assert_eq!(analysis.strings.wasted_percent, 50.0);
    }

    #[test]
    fn url_shaped_duplicates_get_a_suggestion() {
        let snapshot = HeapSnapshot {
            string_stats: [
                (
                    "https://example.com/api".to_string(),
                    StringStat { count: 50, total_bytes: 1000 },
                ),
                ("plain".to_string(), StringStat { count: 4, total_bytes: 20 }),
            ]
            .into_iter()
            .collect(),
            string_total_size: 1020,
            ..Default::default()
        };
        let analysis = analyze(&snapshot, 5);
        let url = &analysis.strings.top_duplicates[0];
        assert!(url.sample.contains("example.com"));
        assert!(url.suggestion.as_ref().unwrap().contains("URL"));
        assert!(analysis.strings.top_duplicates[1].suggestion.is_none());
    }

    #[test]
    fn control_characters_are_escaped_in_samples() {
        let snapshot = HeapSnapshot {
            string_stats: [(
                "line1\nline2\tend\u{0001}".to_string(),
                StringStat { count: 2, total_bytes: 40 },
            )]
            .into_iter()
            .collect(),
            string_total_size: 40,
            ..Default::default()
        };
        let analysis = analyze(&snapshot, 5);
        let sample = &analysis.strings.top_duplicates[0].sample;
        assert!(sample.contains("\\n"));
        assert!(sample.contains("\\t"));
        assert!(!sample.contains('\n'));
        assert!(sample.contains("\\u{0001}"));
    }

    #[test]
    fn provenance_passes_through_unchanged() {
        let snapshot = HeapSnapshot {
            was_aborted: true,
            elapsed_ms: 1234,
            ..Default::default()
        };
        let analysis = analyze(&snapshot, 5);
        assert!(analysis.was_aborted);
        assert_eq!(analysis.elapsed_ms, 1234);
    }
}
