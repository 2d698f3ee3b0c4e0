//! Accumulated per-source state and the operations that mutate it.
//!
//! The store owns the map from source identity to accumulated families;
//! no caller touches the map directly. Ingestion and export both go
//! through one lock scoped to the whole store, since export merges across
//! all sources and needs a consistent view.

use std::collections::BTreeMap;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::Error;
use crate::merge::{merge_family, MergeMode};
use crate::metric::{MetricFamily, MetricType};

/// Time source for staleness decisions. Tests inject a fake one.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct SourceState {
    last_update: Instant,
    families: FxHashMap<String, MetricFamily>,
}

/// Accumulates pushed metric batches and assembles the merged export view.
pub struct AggregateStore<C = SystemClock> {
    sources: RwLock<FxHashMap<String, SourceState>>,
    /// When set, repeated pushes from one source overwrite rather than sum.
    by_source: bool,
    /// A source silent for longer than this has its gauges pruned.
    stale_after: Duration,
    clock: C,
}

impl AggregateStore<SystemClock> {
    pub fn new(by_source: bool, stale_after: Duration) -> Self {
        Self::with_clock(by_source, stale_after, SystemClock)
    }
}

impl<C: Clock> AggregateStore<C> {
    pub fn with_clock(by_source: bool, stale_after: Duration, clock: C) -> Self {
        Self {
            sources: RwLock::new(FxHashMap::default()),
            by_source,
            stale_after,
            clock,
        }
    }

    /// Merges a pushed batch into `source`'s accumulated state.
    ///
    /// Each family is canonicalized and validated, then inserted or merged.
    /// A failing family aborts the rest of the batch; families merged
    /// earlier in the same batch stay committed.
    pub fn ingest(&self, source: &str, families: Vec<MetricFamily>) -> Result<(), Error> {
        let mode = if self.by_source {
            MergeMode::Overwrite
        } else {
            MergeMode::Sum
        };
        let now = self.clock.now();

        let mut sources = self.sources.write();
        for mut family in families {
            family.canonicalize();
            validate_family(&family)?;

            let state = sources
                .entry(source.to_owned())
                .or_insert_with(|| SourceState {
                    last_update: now,
                    families: FxHashMap::default(),
                });
            state.last_update = now;

            match state.families.entry(family.name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(family);
                }
                Entry::Occupied(mut slot) => {
                    // Type mismatch must leave the accumulated family
                    // untouched, hence merge on a clone.
                    let merged = merge_family(slot.get().clone(), family, mode)?;
                    slot.insert(merged);
                }
            }
        }
        Ok(())
    }

    /// Assembles the export view: prunes stale gauges, then merges every
    /// live source's families per name into one deterministically ordered
    /// sequence.
    ///
    /// Pruning mutates state, so the whole snapshot holds the lock
    /// exclusively; scrape concurrency is low enough that this is cheaper
    /// than a shared/exclusive two-phase dance.
    pub fn snapshot(&self) -> Result<Vec<MetricFamily>, Error> {
        let now = self.clock.now();
        let mut sources = self.sources.write();

        for (source, state) in sources.iter_mut() {
            if now.duration_since(state.last_update) > self.stale_after {
                prune_gauges(source, state);
            }
        }

        // Sources are visited in key order so that pass-through metadata
        // (help text) is deterministic for identical state.
        let mut source_names: Vec<&String> = sources.keys().collect();
        source_names.sort();

        let mut merged: BTreeMap<String, MetricFamily> = BTreeMap::new();
        for source in source_names {
            for family in sources[source].families.values() {
                match merged.entry(family.name.clone()) {
                    std::collections::btree_map::Entry::Vacant(slot) => {
                        slot.insert(family.clone());
                    }
                    std::collections::btree_map::Entry::Occupied(mut slot) => {
                        let combined =
                            merge_family(slot.get().clone(), family.clone(), MergeMode::Sum)?;
                        slot.insert(combined);
                    }
                }
            }
        }

        Ok(merged.into_values().collect())
    }
}

/// Removes every gauge family of a stale source. Counters and histograms
/// accumulate monotonically and stay valid contributions from a silent
/// source; a summed gauge stops being meaningful once a contributor goes
/// quiet.
fn prune_gauges(source: &str, state: &mut SourceState) {
    let before = state.families.len();
    state
        .families
        .retain(|_, family| family.kind != MetricType::Gauge);
    let pruned = before - state.families.len();
    if pruned > 0 {
        tracing::info!(source, pruned, "pruned gauge families of stale source");
    }
}

/// Rejects a pushed family that contains two metrics with the same
/// identity. Runs before merge so an ambiguous batch cannot corrupt
/// accumulated state.
fn validate_family(family: &MetricFamily) -> Result<(), Error> {
    let mut seen = FxHashSet::default();
    seen.reserve(family.metrics.len());
    for metric in &family.metrics {
        let fingerprint = metric.labels.signature_with_name(&family.name);
        if !seen.insert(fingerprint) {
            return Err(Error::DuplicateSeries {
                family: family.name.clone(),
                labels: metric.labels.clone(),
            });
        }
    }
    Ok(())
}
