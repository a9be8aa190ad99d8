//! Named performance models: historical duration statistics keyed by
//! (model name, size class), consulted for grouping decisions and updated
//! after every completed task unit.
//!
//! A model that has never been recorded is not an error — prediction
//! returns `None` and the dispatcher falls back to its fixed default group
//! size (the cold-start calibration pass).
//!
//! Histories are append-only for the lifetime of the process. The
//! [`PerfSnapshot`] types form the load/save seam consumed by the external
//! persistence layer; the engine itself never touches disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Coarse bucket of a task's total argument element count.
///
/// Buckets are next-power-of-two: counts 0 and 1 map to class 0, 2 to
/// class 1, 3..=4 to class 2, and so on. Identical argument shapes always
/// map to the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SizeClass(u32);

impl SizeClass {
    pub fn for_element_count(count: usize) -> Self {
        SizeClass(count.next_power_of_two().trailing_zeros())
    }

    /// Largest element count that maps to this class.
    pub fn ceiling(&self) -> usize {
        1usize << self.0
    }
}

/// Append-only observation history for one (model, size class) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    durations: Vec<Duration>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ModelEntry {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            durations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn record(&mut self, duration: Duration) {
        self.durations.push(duration);
        self.updated_at = Utc::now();
    }

    /// Arithmetic mean of the observations, `None` when cold.
    fn mean(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        Some(total / self.durations.len() as u32)
    }

    pub fn observations(&self) -> usize {
        self.durations.len()
    }
}

type EntryKey = (String, SizeClass);

/// Process-wide table of named performance models.
///
/// The outer map is read-locked on the hot path; each entry has its own
/// lock so concurrent completion callbacks appending to different
/// (model, size class) pairs never contend with each other.
#[derive(Default)]
pub struct PerfRegistry {
    entries: RwLock<HashMap<EntryKey, Arc<Mutex<ModelEntry>>>>,
}

impl PerfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, model: &str, class: SizeClass) -> Arc<Mutex<ModelEntry>> {
        let key = (model.to_string(), class);
        if let Ok(entries) = self.entries.read() {
            if let Some(entry) = entries.get(&key) {
                return entry.clone();
            }
        }
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(ModelEntry::new())))
            .clone()
    }

    fn existing(&self, model: &str, class: SizeClass) -> Option<Arc<Mutex<ModelEntry>>> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(&(model.to_string(), class)).cloned()
    }

    /// Append one observed duration.
    pub fn record(&self, model: &str, class: SizeClass, duration: Duration) {
        let entry = self.entry(model, class);
        match entry.lock() {
            Ok(mut guard) => guard.record(duration),
            Err(e) => warn!(model, ?class, error = %e, "perfmodel entry lock poisoned, dropping observation"),
        }
    }

    /// Mean of prior observations for this exact class, or `None` when the
    /// model or class has no history (cold start — never an error).
    pub fn predict(&self, model: &str, class: SizeClass) -> Option<Duration> {
        let entry = self.existing(model, class)?;
        let guard = match entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.mean()
    }

    /// Number of observations for a (model, size class) pair.
    pub fn observation_count(&self, model: &str, class: SizeClass) -> usize {
        self.existing(model, class)
            .map(|entry| match entry.lock() {
                Ok(guard) => guard.observations(),
                Err(poisoned) => poisoned.into_inner().observations(),
            })
            .unwrap_or(0)
    }

    /// All model names with at least one entry.
    pub fn model_names(&self) -> Vec<String> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = entries.keys().map(|(name, _)| name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Serializable copy of the whole table, for the external persistence
    /// layer (process shutdown).
    pub fn snapshot(&self) -> PerfSnapshot {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut models: Vec<SnapshotEntry> = entries
            .iter()
            .map(|((model, class), entry)| {
                let entry = match entry.lock() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                SnapshotEntry {
                    model: model.clone(),
                    size_class: *class,
                    entry,
                }
            })
            .collect();
        models.sort_by(|a, b| (&a.model, a.size_class).cmp(&(&b.model, b.size_class)));
        PerfSnapshot { models }
    }

    /// Replace the table with a previously-saved snapshot (process start).
    pub fn restore(&self, snapshot: PerfSnapshot) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.clear();
        for item in snapshot.models {
            entries.insert(
                (item.model, item.size_class),
                Arc::new(Mutex::new(item.entry)),
            );
        }
    }
}

/// Serializable registry state: the name → entries mapping consumed and
/// produced by the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfSnapshot {
    pub models: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub model: String,
    pub size_class: SizeClass,
    pub entry: ModelEntry,
}

static GLOBAL: OnceLock<Arc<PerfRegistry>> = OnceLock::new();

/// The process-wide registry used by default; models recorded here are
/// addressable by name for the lifetime of the process.
pub fn global_registry() -> Arc<PerfRegistry> {
    GLOBAL.get_or_init(|| Arc::new(PerfRegistry::new())).clone()
}
