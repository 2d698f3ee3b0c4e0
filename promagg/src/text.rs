//! Plaintext exposition format (version 0.0.4) codec.
//!
//! Pushers send the same text format a Prometheus client library exposes
//! for scraping. Histograms and summaries arrive flattened into
//! `name_bucket` / `name_sum` / `name_count` sample lines and are
//! reassembled here into structured metrics, keyed by their labels minus
//! the `le` / `quantile` component.

use std::collections::BTreeMap;
use std::fmt::Write;

use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::labels::Labels;
use crate::metric::{Bucket, Metric, MetricFamily, MetricType, MetricValue, Quantile};

pub const BUCKET_LABEL: &str = "le";
pub const QUANTILE_LABEL: &str = "quantile";

/// Parses a pushed payload into metric families, in first-seen order.
pub fn parse(input: &str) -> Result<Vec<MetricFamily>, Error> {
    let mut parser = Parser::default();
    for (idx, raw) in input.lines().enumerate() {
        parser.line(idx + 1, raw)?;
    }
    Ok(parser.finish())
}

#[derive(Default)]
struct Parser {
    order: Vec<String>,
    families: FxHashMap<String, FamilyBuilder>,
}

#[derive(Default)]
struct FamilyBuilder {
    help: Option<String>,
    kind: Option<MetricType>,
    scalars: Vec<Metric>,
    /// Histogram/summary series under reassembly, keyed by the labels
    /// without their `le`/`quantile` component.
    series: BTreeMap<Labels, SeriesBuilder>,
}

impl FamilyBuilder {
    fn has_samples(&self) -> bool {
        !self.scalars.is_empty() || !self.series.is_empty()
    }
}

#[derive(Default)]
struct SeriesBuilder {
    sample_count: u64,
    sample_sum: f64,
    buckets: Vec<Bucket>,
    quantiles: Vec<Quantile>,
}

impl Parser {
    fn line(&mut self, line: usize, raw: &str) -> Result<(), Error> {
        let text = raw.trim();
        if text.is_empty() {
            return Ok(());
        }
        if let Some(comment) = text.strip_prefix('#') {
            let comment = comment.trim_start();
            if let Some(rest) = comment.strip_prefix("HELP ") {
                return self.help_line(line, rest);
            }
            if let Some(rest) = comment.strip_prefix("TYPE ") {
                return self.type_line(line, rest);
            }
            // plain comment
            return Ok(());
        }
        let sample = parse_sample(line, text)?;
        self.sample(line, sample)
    }

    fn help_line(&mut self, line: usize, rest: &str) -> Result<(), Error> {
        let rest = rest.trim_start();
        let (name, doc) = match rest.split_once(char::is_whitespace) {
            Some((name, doc)) => (name, doc),
            None => (rest, ""),
        };
        if !is_metric_name(name) {
            return Err(Error::parse(line, format!("invalid metric name '{name}'")));
        }
        self.family_mut(name).help = Some(unescape_help(doc));
        Ok(())
    }

    fn type_line(&mut self, line: usize, rest: &str) -> Result<(), Error> {
        let rest = rest.trim_start();
        let (name, kind) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::parse(line, "expected '# TYPE <name> <type>'"))?;
        if !is_metric_name(name) {
            return Err(Error::parse(line, format!("invalid metric name '{name}'")));
        }
        let kind: MetricType = kind
            .trim()
            .parse()
            .map_err(|_| Error::parse(line, format!("unknown metric type '{}'", kind.trim())))?;
        let family = self.family_mut(name);
        if family.kind.is_some() {
            return Err(Error::parse(line, format!("second TYPE line for '{name}'")));
        }
        if family.has_samples() {
            return Err(Error::parse(
                line,
                format!("TYPE line for '{name}' after its samples"),
            ));
        }
        family.kind = Some(kind);
        Ok(())
    }

    fn family_mut(&mut self, name: &str) -> &mut FamilyBuilder {
        if !self.families.contains_key(name) {
            self.order.push(name.to_owned());
        }
        self.families.entry(name.to_owned()).or_default()
    }

    fn declared(&self, name: &str) -> Option<MetricType> {
        self.families.get(name).and_then(|f| f.kind)
    }

    fn sample(&mut self, line: usize, sample: Sample) -> Result<(), Error> {
        let Sample {
            name,
            mut labels,
            value,
            timestamp_ms,
        } = sample;

        match self.declared(&name) {
            Some(MetricType::Counter) => {
                self.push_scalar(line, name, labels, MetricValue::Counter(value), timestamp_ms)
            }
            Some(MetricType::Gauge) => {
                self.push_scalar(line, name, labels, MetricValue::Gauge(value), timestamp_ms)
            }
            Some(MetricType::Untyped) => {
                self.push_scalar(line, name, labels, MetricValue::Untyped(value), timestamp_ms)
            }
            Some(MetricType::Summary) => {
                let quantile = take_label(&mut labels, QUANTILE_LABEL).ok_or_else(|| {
                    Error::parse(line, format!("summary sample '{name}' without quantile label"))
                })?;
                let quantile = parse_float(line, &quantile)?;
                let series = self.series_mut(line, &name, labels)?;
                series.quantiles.push(Quantile { quantile, value });
                Ok(())
            }
            Some(MetricType::Histogram) => Err(Error::parse(
                line,
                format!("histogram '{name}' samples must be {name}_bucket, {name}_sum or {name}_count"),
            )),
            None => {
                if let Some(base) = name.strip_suffix("_bucket") {
                    if self.declared(base) == Some(MetricType::Histogram) {
                        let base = base.to_owned();
                        let le = take_label(&mut labels, BUCKET_LABEL).ok_or_else(|| {
                            Error::parse(line, format!("bucket sample '{name}' without le label"))
                        })?;
                        let upper_bound = parse_float(line, &le)?;
                        let series = self.series_mut(line, &base, labels)?;
                        series.buckets.push(Bucket {
                            upper_bound,
                            cumulative_count: value as u64,
                        });
                        return Ok(());
                    }
                }
                if let Some(base) = name.strip_suffix("_sum") {
                    if matches!(
                        self.declared(base),
                        Some(MetricType::Histogram) | Some(MetricType::Summary)
                    ) {
                        let base = base.to_owned();
                        self.series_mut(line, &base, labels)?.sample_sum = value;
                        return Ok(());
                    }
                }
                if let Some(base) = name.strip_suffix("_count") {
                    if matches!(
                        self.declared(base),
                        Some(MetricType::Histogram) | Some(MetricType::Summary)
                    ) {
                        let base = base.to_owned();
                        self.series_mut(line, &base, labels)?.sample_count = value as u64;
                        return Ok(());
                    }
                }
                self.push_scalar(line, name, labels, MetricValue::Untyped(value), timestamp_ms)
            }
        }
    }

    fn push_scalar(
        &mut self,
        line: usize,
        name: String,
        labels: Vec<(String, String)>,
        value: MetricValue,
        timestamp_ms: Option<i64>,
    ) -> Result<(), Error> {
        let labels = checked_labels(line, labels)?;
        self.family_mut(&name).scalars.push(Metric {
            labels,
            value,
            timestamp_ms,
        });
        Ok(())
    }

    fn series_mut(
        &mut self,
        line: usize,
        family: &str,
        labels: Vec<(String, String)>,
    ) -> Result<&mut SeriesBuilder, Error> {
        let labels = checked_labels(line, labels)?;
        Ok(self.family_mut(family).series.entry(labels).or_default())
    }

    fn finish(mut self) -> Vec<MetricFamily> {
        let mut out = Vec::with_capacity(self.order.len());
        for name in std::mem::take(&mut self.order) {
            let Some(builder) = self.families.remove(&name) else {
                continue;
            };
            let kind = builder.kind.unwrap_or(MetricType::Untyped);
            let metrics = match kind {
                MetricType::Histogram => builder
                    .series
                    .into_iter()
                    .map(|(labels, series)| {
                        let mut buckets = series.buckets;
                        buckets.sort_by(|a, b| a.upper_bound.total_cmp(&b.upper_bound));
                        Metric {
                            labels,
                            value: MetricValue::Histogram {
                                sample_count: series.sample_count,
                                sample_sum: series.sample_sum,
                                buckets,
                            },
                            timestamp_ms: None,
                        }
                    })
                    .collect(),
                MetricType::Summary => builder
                    .series
                    .into_iter()
                    .map(|(labels, series)| {
                        let mut quantiles = series.quantiles;
                        quantiles.sort_by(|a, b| a.quantile.total_cmp(&b.quantile));
                        Metric {
                            labels,
                            value: MetricValue::Summary {
                                sample_count: series.sample_count,
                                sample_sum: series.sample_sum,
                                quantiles,
                            },
                            timestamp_ms: None,
                        }
                    })
                    .collect(),
                _ => builder.scalars,
            };
            out.push(MetricFamily {
                name,
                help: builder.help,
                kind,
                metrics,
            });
        }
        out
    }
}

fn checked_labels(line: usize, labels: Vec<(String, String)>) -> Result<Labels, Error> {
    let labels = Labels::new(labels);
    if labels.has_duplicate_names() {
        return Err(Error::parse(line, format!("duplicate label name in {labels}")));
    }
    Ok(labels)
}

fn take_label(labels: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let index = labels.iter().position(|(n, _)| n == name)?;
    Some(labels.remove(index).1)
}

struct Sample {
    name: String,
    labels: Vec<(String, String)>,
    value: f64,
    timestamp_ms: Option<i64>,
}

fn parse_sample(line: usize, text: &str) -> Result<Sample, Error> {
    let mut cursor = Cursor { line, text, pos: 0 };

    let name = cursor.eat_metric_name();
    if name.is_empty() {
        return Err(cursor.error("expected metric name"));
    }
    let name = name.to_owned();

    let mut labels = Vec::new();
    cursor.skip_ws();
    if cursor.peek() == Some('{') {
        cursor.bump();
        loop {
            cursor.skip_ws();
            if cursor.peek() == Some('}') {
                cursor.bump();
                break;
            }
            let label_name = cursor.eat_label_name();
            if label_name.is_empty() {
                return Err(cursor.error("expected label name"));
            }
            let label_name = label_name.to_owned();
            cursor.skip_ws();
            cursor.expect('=')?;
            cursor.skip_ws();
            let label_value = cursor.eat_quoted_string()?;
            labels.push((label_name, label_value));
            cursor.skip_ws();
            match cursor.peek() {
                Some(',') => {
                    cursor.bump();
                }
                Some('}') => {
                    cursor.bump();
                    break;
                }
                _ => return Err(cursor.error("expected ',' or '}' after label value")),
            }
        }
    }

    cursor.skip_ws();
    let value_token = cursor.eat_token();
    if value_token.is_empty() {
        return Err(cursor.error("expected sample value"));
    }
    let value = parse_float(line, value_token)?;

    cursor.skip_ws();
    let timestamp_token = cursor.eat_token();
    let timestamp_ms = if timestamp_token.is_empty() {
        None
    } else {
        Some(timestamp_token.parse::<i64>().map_err(|_| {
            Error::parse(line, format!("invalid timestamp '{timestamp_token}'"))
        })?)
    };

    cursor.skip_ws();
    if cursor.peek().is_some() {
        return Err(cursor.error("trailing garbage after sample"));
    }

    Ok(Sample {
        name,
        labels,
        value,
        timestamp_ms,
    })
}

/// Accepts the exposition spellings `+Inf`, `-Inf` and `NaN` along with
/// everything `f64::from_str` takes.
fn parse_float(line: usize, token: &str) -> Result<f64, Error> {
    token
        .parse::<f64>()
        .map_err(|_| Error::parse(line, format!("invalid float '{token}'")))
}

struct Cursor<'a> {
    line: usize,
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.bump();
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), Error> {
        if self.peek() == Some(expected) {
            self.bump();
            Ok(())
        } else {
            Err(self.error(format!("expected '{expected}'")))
        }
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
        &self.text[start..self.pos]
    }

    fn eat_metric_name(&mut self) -> &'a str {
        self.eat_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
    }

    fn eat_label_name(&mut self) -> &'a str {
        self.eat_while(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn eat_token(&mut self) -> &'a str {
        self.eat_while(|c| c != ' ' && c != '\t')
    }

    fn eat_quoted_string(&mut self) -> Result<String, Error> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated label value")),
                Some('"') => {
                    self.bump();
                    return Ok(out);
                }
                Some('\\') => {
                    self.bump();
                    match self.peek() {
                        Some('\\') => out.push('\\'),
                        Some('"') => out.push('"'),
                        Some('n') => out.push('\n'),
                        _ => return Err(self.error("invalid escape in label value")),
                    }
                    self.bump();
                }
                Some(c) => {
                    out.push(c);
                    self.bump();
                }
            }
        }
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::parse(self.line, reason)
    }
}

fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn unescape_help(doc: &str) -> String {
    let mut out = String::with_capacity(doc.len());
    let mut chars = doc.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn escape_help(doc: &str) -> String {
    doc.replace('\\', r"\\").replace('\n', r"\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', r#"\""#)
        .replace('\n', r"\n")
}

fn fmt_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_owned()
    } else if value == f64::INFINITY {
        "+Inf".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_owned()
    } else {
        format!("{value}")
    }
}

/// Encodes one family back into exposition text, metrics in stored order.
pub fn encode(out: &mut String, family: &MetricFamily) {
    if let Some(help) = &family.help {
        let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(help));
    }
    let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind);

    for metric in &family.metrics {
        match &metric.value {
            MetricValue::Counter(v) | MetricValue::Gauge(v) | MetricValue::Untyped(v) => {
                encode_sample(out, &family.name, &metric.labels, None, &fmt_value(*v), metric.timestamp_ms);
            }
            MetricValue::Histogram {
                sample_count,
                sample_sum,
                buckets,
            } => {
                let bucket_name = format!("{}_bucket", family.name);
                for bucket in buckets {
                    encode_sample(
                        out,
                        &bucket_name,
                        &metric.labels,
                        Some((BUCKET_LABEL, fmt_value(bucket.upper_bound))),
                        &bucket.cumulative_count.to_string(),
                        None,
                    );
                }
                let sum_name = format!("{}_sum", family.name);
                encode_sample(out, &sum_name, &metric.labels, None, &fmt_value(*sample_sum), None);
                let count_name = format!("{}_count", family.name);
                encode_sample(out, &count_name, &metric.labels, None, &sample_count.to_string(), None);
            }
            MetricValue::Summary {
                sample_count,
                sample_sum,
                quantiles,
            } => {
                for q in quantiles {
                    encode_sample(
                        out,
                        &family.name,
                        &metric.labels,
                        Some((QUANTILE_LABEL, fmt_value(q.quantile))),
                        &fmt_value(q.value),
                        None,
                    );
                }
                let sum_name = format!("{}_sum", family.name);
                encode_sample(out, &sum_name, &metric.labels, None, &fmt_value(*sample_sum), None);
                let count_name = format!("{}_count", family.name);
                encode_sample(out, &count_name, &metric.labels, None, &sample_count.to_string(), None);
            }
        }
    }
}

fn encode_sample(
    out: &mut String,
    name: &str,
    labels: &Labels,
    extra: Option<(&str, String)>,
    value: &str,
    timestamp_ms: Option<i64>,
) {
    out.push_str(name);
    if !labels.is_empty() || extra.is_some() {
        out.push('{');
        let mut first = true;
        for label in labels.iter() {
            if !first {
                out.push(',');
            }
            let _ = write!(out, "{}=\"{}\"", label.name, escape_label_value(&label.value));
            first = false;
        }
        if let Some((name, value)) = extra {
            if !first {
                out.push(',');
            }
            let _ = write!(out, "{name}=\"{value}\"");
        }
        out.push('}');
    }
    out.push(' ');
    out.push_str(value);
    if let Some(ts) = timestamp_ms {
        let _ = write!(out, " {ts}");
    }
    out.push('\n');
}
