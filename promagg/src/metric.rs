use strum::{Display, EnumString};

use crate::labels::Labels;

/// Declared type of a metric family, as written on a `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

/// One cumulative histogram bucket: everything `<= upper_bound`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quantile {
    pub quantile: f64,
    pub value: f64,
}

/// The payload of one metric, tagged by the family's declared type.
///
/// Summaries are carried through ingestion and export unchanged but are
/// not combinable; two summary series with equal labels cancel out of the
/// merged result instead of erroring the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Untyped(f64),
    Histogram {
        sample_count: u64,
        sample_sum: f64,
        buckets: Vec<Bucket>,
    },
    Summary {
        sample_count: u64,
        sample_sum: f64,
        quantiles: Vec<Quantile>,
    },
}

/// One time series within a family.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub labels: Labels,
    pub value: MetricValue,
    /// Explicit sample timestamp from the wire, if any. Dropped when two
    /// metrics are numerically combined.
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub kind: MetricType,
    pub metrics: Vec<Metric>,
}

impl MetricFamily {
    /// Sorts the family's metrics into the label-set order.
    ///
    /// Every incoming family goes through this before validation and merge;
    /// the merge-join assumes both operands are sorted. Labels inside each
    /// metric are already sorted by construction ([`Labels::new`]).
    pub fn canonicalize(&mut self) {
        self.metrics.sort_by(|a, b| a.labels.cmp(&b.labels));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn untyped(labels: Labels, value: f64) -> Metric {
        Metric {
            labels,
            value: MetricValue::Untyped(value),
            timestamp_ms: None,
        }
    }

    #[test]
    fn test_metric_type_strings() {
        assert_eq!(MetricType::Counter.to_string(), "counter");
        assert_eq!("histogram".parse::<MetricType>().ok(), Some(MetricType::Histogram));
        assert!("nonsense".parse::<MetricType>().is_err());
    }

    #[test]
    fn test_canonicalize_sorts_metrics() {
        let mut family = MetricFamily {
            name: "m".into(),
            help: None,
            kind: MetricType::Untyped,
            metrics: vec![
                untyped(Labels::new([("x", "2")]), 1.0),
                untyped(Labels::new([("x", "1")]), 2.0),
                untyped(Labels::default(), 3.0),
            ],
        };
        family.canonicalize();
        let order: Vec<_> = family
            .metrics
            .iter()
            .map(|m| m.labels.get("x").unwrap_or("-").to_owned())
            .collect();
        assert_eq!(order, ["-", "1", "2"]);

        // already sorted input is a no-op
        let before = family.metrics.clone();
        family.canonicalize();
        assert_eq!(before, family.metrics);
    }
}
