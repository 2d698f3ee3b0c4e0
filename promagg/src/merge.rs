//! Type-aware combination of metric families.
//!
//! Families are merged with a linear merge-join over their label-ordered
//! metric sequences, so the output is label-ordered too. That makes family
//! merge associative: the snapshot assembler can fold already-merged
//! results together without re-sorting.

use itertools::{EitherOrBoth, Itertools};

use crate::error::Error;
use crate::metric::{Bucket, Metric, MetricFamily, MetricValue};

/// What to do when both operands carry a metric with the same label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Combine the two numerically. Used across distinct sources and at
    /// export, where contributions are additive.
    Sum,
    /// Keep the newer operand's metric. Used for repeated pushes from the
    /// same source: a re-push is a refreshed observation, not an additional
    /// one, so summing would double count.
    Overwrite,
}

/// Merges `incoming` into `existing`. Both must be canonicalized.
///
/// Fails when the declared types differ; the caller discards the whole
/// incoming batch in that case rather than applying it partially.
pub fn merge_family(
    existing: MetricFamily,
    incoming: MetricFamily,
    mode: MergeMode,
) -> Result<MetricFamily, Error> {
    if existing.kind != incoming.kind {
        return Err(Error::TypeMismatch {
            family: existing.name,
            existing: existing.kind,
            incoming: incoming.kind,
        });
    }

    let MetricFamily {
        name,
        help,
        kind,
        metrics: existing_metrics,
    } = existing;

    let metrics = existing_metrics
        .into_iter()
        .merge_join_by(incoming.metrics, |a, b| a.labels.cmp(&b.labels))
        .filter_map(|pair| match pair {
            EitherOrBoth::Left(m) | EitherOrBoth::Right(m) => Some(m),
            EitherOrBoth::Both(a, b) => match mode {
                MergeMode::Overwrite => Some(b),
                MergeMode::Sum => merge_metric(a, b),
            },
        })
        .collect();

    Ok(MetricFamily {
        name,
        help,
        kind,
        metrics,
    })
}

/// Combines two metrics with equal label sets. Returns `None` for payloads
/// that cannot be merged (summaries), dropping the series from the result.
fn merge_metric(a: Metric, b: Metric) -> Option<Metric> {
    use MetricValue::*;

    let value = match (a.value, b.value) {
        (Counter(x), Counter(y)) => Counter(x + y),
        // Gauges are not truly additive. Summing is the best approximation
        // when N independent pushers report the same logical series, and it
        // is why gauges alone are subject to staleness pruning.
        (Gauge(x), Gauge(y)) => Gauge(x + y),
        (Untyped(x), Untyped(y)) => Untyped(x + y),
        (
            Histogram {
                sample_count: ca,
                sample_sum: sa,
                buckets: ba,
            },
            Histogram {
                sample_count: cb,
                sample_sum: sb,
                buckets: bb,
            },
        ) => Histogram {
            sample_count: ca + cb,
            sample_sum: sa + sb,
            buckets: merge_buckets(ba, bb),
        },
        // No way of merging summaries; drop the series.
        (Summary { .. }, Summary { .. }) => return None,
        // Mixed payloads cannot occur: the family type check above already
        // rejected them.
        _ => return None,
    };

    Some(Metric {
        labels: a.labels,
        value,
        timestamp_ms: None,
    })
}

/// Sorted merge of two cumulative bucket sequences by upper bound. Equal
/// bounds sum their counts; disjoint bounds pass through unchanged.
///
/// When the two inputs were configured with different boundaries the result
/// is structurally valid but the passed-through buckets undercount the true
/// cumulative totals. Rejecting such merges would refuse pushes from
/// heterogeneous client fleets, so the interleaved result is kept.
fn merge_buckets(a: Vec<Bucket>, b: Vec<Bucket>) -> Vec<Bucket> {
    a.into_iter()
        .merge_join_by(b, |x, y| x.upper_bound.total_cmp(&y.upper_bound))
        .map(|pair| match pair {
            EitherOrBoth::Left(bucket) | EitherOrBoth::Right(bucket) => bucket,
            EitherOrBoth::Both(x, y) => Bucket {
                upper_bound: x.upper_bound,
                cumulative_count: x.cumulative_count + y.cumulative_count,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::metric::MetricType;

    fn counter(labels: Labels, value: f64) -> Metric {
        Metric {
            labels,
            value: MetricValue::Counter(value),
            timestamp_ms: None,
        }
    }

    fn counters(metrics: Vec<Metric>) -> MetricFamily {
        MetricFamily {
            name: "c".into(),
            help: None,
            kind: MetricType::Counter,
            metrics,
        }
    }

    fn counter_value(m: &Metric) -> f64 {
        match m.value {
            MetricValue::Counter(v) => v,
            _ => panic!("not a counter"),
        }
    }

    #[test]
    fn test_merge_counters_sums() {
        let a = counters(vec![counter(Labels::default(), 31.0)]);
        let b = counters(vec![counter(Labels::default(), 29.0)]);
        let merged = merge_family(a, b, MergeMode::Sum).unwrap();
        assert_eq!(merged.metrics.len(), 1);
        assert_eq!(counter_value(&merged.metrics[0]), 60.0);
    }

    #[test]
    fn test_merge_is_commutative_and_associative() {
        let m = |v| counters(vec![counter(Labels::new([("l", "x")]), v)]);

        let ab = merge_family(m(1.0), m(2.0), MergeMode::Sum).unwrap();
        let ba = merge_family(m(2.0), m(1.0), MergeMode::Sum).unwrap();
        assert_eq!(ab, ba);

        let ab_c = merge_family(ab, m(4.0), MergeMode::Sum).unwrap();
        let bc = merge_family(m(2.0), m(4.0), MergeMode::Sum).unwrap();
        let a_bc = merge_family(m(1.0), bc, MergeMode::Sum).unwrap();
        assert_eq!(ab_c, a_bc);
        assert_eq!(counter_value(&ab_c.metrics[0]), 7.0);
    }

    #[test]
    fn test_merge_disjoint_labels_passes_through_sorted() {
        let a = counters(vec![
            counter(Labels::new([("x", "1")]), 1.0),
            counter(Labels::new([("x", "3")]), 3.0),
        ]);
        let b = counters(vec![counter(Labels::new([("x", "2")]), 2.0)]);
        let merged = merge_family(a, b, MergeMode::Sum).unwrap();
        let order: Vec<_> = merged
            .metrics
            .iter()
            .map(|m| m.labels.get("x").unwrap().to_owned())
            .collect();
        assert_eq!(order, ["1", "2", "3"]);
        assert!(merged
            .metrics
            .windows(2)
            .all(|w| w[0].labels < w[1].labels));
    }

    #[test]
    fn test_merge_overwrite_keeps_incoming() {
        let a = counters(vec![counter(Labels::default(), 10.0)]);
        let b = counters(vec![counter(Labels::default(), 4.0)]);
        let merged = merge_family(a, b, MergeMode::Overwrite).unwrap();
        assert_eq!(counter_value(&merged.metrics[0]), 4.0);
    }

    #[test]
    fn test_merge_type_mismatch() {
        let a = counters(vec![]);
        let mut b = counters(vec![]);
        b.kind = MetricType::Gauge;
        let err = merge_family(a, b, MergeMode::Sum).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot merge family 'c': type counter != gauge"
        );
    }

    fn histogram(count: u64, sum: f64, buckets: &[(f64, u64)]) -> MetricFamily {
        MetricFamily {
            name: "h".into(),
            help: None,
            kind: MetricType::Histogram,
            metrics: vec![Metric {
                labels: Labels::default(),
                value: MetricValue::Histogram {
                    sample_count: count,
                    sample_sum: sum,
                    buckets: buckets
                        .iter()
                        .map(|&(upper_bound, cumulative_count)| Bucket {
                            upper_bound,
                            cumulative_count,
                        })
                        .collect(),
                },
                timestamp_ms: None,
            }],
        }
    }

    #[test]
    fn test_merge_histograms_identical_bounds() {
        let a = histogram(1, 2.5, &[(3.0, 3), (f64::INFINITY, 4)]);
        let b = histogram(1, 4.5, &[(3.0, 4), (f64::INFINITY, 5)]);
        let merged = merge_family(a, b, MergeMode::Sum).unwrap();
        match &merged.metrics[0].value {
            MetricValue::Histogram {
                sample_count,
                sample_sum,
                buckets,
            } => {
                assert_eq!(*sample_count, 2);
                assert_eq!(*sample_sum, 7.0);
                assert_eq!(buckets.len(), 2);
                assert_eq!(buckets[0].cumulative_count, 7);
                assert_eq!(buckets[1].cumulative_count, 9);
                assert!(buckets[1].upper_bound.is_infinite());
            }
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_histograms_disjoint_bounds_interleave() {
        let a = histogram(1, 1.0, &[(1.0, 1), (f64::INFINITY, 1)]);
        let b = histogram(1, 2.0, &[(2.0, 1), (f64::INFINITY, 1)]);
        let merged = merge_family(a, b, MergeMode::Sum).unwrap();
        match &merged.metrics[0].value {
            MetricValue::Histogram { buckets, .. } => {
                let bounds: Vec<_> = buckets.iter().map(|b| b.upper_bound).collect();
                assert_eq!(bounds, [1.0, 2.0, f64::INFINITY]);
                assert_eq!(buckets[2].cumulative_count, 2);
            }
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_summaries_drops_colliding_series() {
        let summary = |sum| MetricFamily {
            name: "s".into(),
            help: None,
            kind: MetricType::Summary,
            metrics: vec![Metric {
                labels: Labels::default(),
                value: MetricValue::Summary {
                    sample_count: 1,
                    sample_sum: sum,
                    quantiles: vec![],
                },
                timestamp_ms: None,
            }],
        };
        let merged = merge_family(summary(1.0), summary(2.0), MergeMode::Sum).unwrap();
        assert!(merged.metrics.is_empty());
    }
}
