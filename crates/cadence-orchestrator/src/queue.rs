use crate::events::{Event, EventBus};
use crate::types::{span_millis, span_secs};
use crate::SharedRegistry;
use cadence_core::{CadenceError, CadenceResult, Priority};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of a [`QueueItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

/// Bookkeeping carried by every queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the item moves to processing.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Base delay for exponential backoff, from the unit definition.
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    pub correlation_id: Uuid,
    #[serde(default)]
    pub parent_item_id: Option<Uuid>,
}

/// A unit of pending work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub unit_id: String,
    pub chain_id: u32,
    pub priority: Priority,
    pub payload: Value,
    pub metadata: ItemMetadata,
    pub status: ItemStatus,
    /// Not eligible for dequeue before this instant.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl QueueItem {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now)
    }
}

/// Optional parameters for [`WorkQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Overrides the unit's declared priority.
    pub priority: Option<Priority>,
    pub correlation_id: Option<Uuid>,
    pub parent_item_id: Option<Uuid>,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Attempts already spent before the item was queued.
    pub prior_attempts: u32,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_parent(mut self, id: Uuid) -> Self {
        self.parent_item_id = Some(id);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_prior_attempts(mut self, attempts: u32) -> Self {
        self.prior_attempts = attempts;
        self
    }
}

/// Queue tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub dead_letter_enabled: bool,
    #[serde(default = "default_dead_letter_max_age_secs")]
    pub dead_letter_max_age_secs: u64,
    /// Cap on stored processing-duration samples.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Completed items kept per chain for inspection.
    #[serde(default = "default_completed_limit")]
    pub completed_limit: usize,
    /// Pending items of one unit that count as a bottleneck.
    #[serde(default = "default_bottleneck_threshold")]
    pub bottleneck_threshold: usize,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_retry_delay_ms() -> u64 {
    300_000
}
fn default_true() -> bool {
    true
}
fn default_dead_letter_max_age_secs() -> u64 {
    7 * 24 * 3600
}
fn default_history_limit() -> usize {
    10_000
}
fn default_completed_limit() -> usize {
    1_000
}
fn default_bottleneck_threshold() -> usize {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            dead_letter_enabled: true,
            dead_letter_max_age_secs: default_dead_letter_max_age_secs(),
            history_limit: default_history_limit(),
            completed_limit: default_completed_limit(),
            bottleneck_threshold: default_bottleneck_threshold(),
        }
    }
}

/// What happened to an item passed to [`WorkQueue::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued with a backoff delay.
    Retrying {
        attempt: u32,
        scheduled_for: DateTime<Utc>,
    },
    /// Out of attempts, kept in the chain's failed list.
    Failed,
    /// Out of attempts, moved to the dead-letter store.
    DeadLettered,
}

/// A unit whose pending work is piling up.
#[derive(Debug, Clone, Serialize)]
pub struct Bottleneck {
    pub chain_id: u32,
    pub unit_id: String,
    pub count: usize,
    pub avg_wait_ms: f64,
}

/// Per-chain item counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Aggregate queue statistics.
///
/// `by_priority` and `by_unit` count queued work (pending plus processing).
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_chain: BTreeMap<u32, ChainCounts>,
    pub by_unit: BTreeMap<String, usize>,
    pub throughput_last_minute: usize,
    pub throughput_last_hour: usize,
    pub avg_processing_ms: f64,
}

/// Per-chain lists of a queue snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub pending: Vec<QueueItem>,
    pub processing: Vec<QueueItem>,
    pub failed: Vec<QueueItem>,
}

/// Exported queue contents, sufficient to rebuild the queue after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub timestamp: DateTime<Utc>,
    pub chains: BTreeMap<u32, ChainSnapshot>,
    pub dead_letter: Vec<QueueItem>,
}

impl QueueSnapshot {
    /// Write the snapshot as pretty JSON.
    pub fn write_to(&self, path: &Path) -> CadenceResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> CadenceResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn item_count(&self) -> usize {
        self.dead_letter.len()
            + self
                .chains
                .values()
                .map(|c| c.pending.len() + c.processing.len() + c.failed.len())
                .sum::<usize>()
    }
}

#[derive(Debug, Default)]
struct ChainQueue {
    /// Pending items, non-increasing priority, FIFO among equals.
    items: Vec<QueueItem>,
    processing: Vec<QueueItem>,
    completed: VecDeque<QueueItem>,
    failed: Vec<QueueItem>,
}

#[derive(Debug, Clone, Copy)]
struct ProcessingSample {
    finished_at: DateTime<Utc>,
    duration_ms: u64,
}

/// Computes the retry delay for the given attempt count using exponential
/// backoff capped at `max_ms`. `attempts` is the number of failures so far.
pub fn compute_retry_delay(base_ms: u64, multiplier: f64, attempts: u32, max_ms: u64) -> u64 {
    let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay = base_ms as f64 * multiplier.powi(exponent);
    if delay.is_finite() {
        delay.min(max_ms as f64) as u64
    } else {
        max_ms
    }
}

/// Insert so the list stays in non-increasing priority order with FIFO
/// tie-break: after the last item of greater-or-equal priority.
fn insert_by_priority(list: &mut Vec<QueueItem>, item: QueueItem) {
    let pos = list
        .iter()
        .position(|existing| existing.priority < item.priority)
        .unwrap_or(list.len());
    list.insert(pos, item);
}

/// Per-chain prioritized, retryable work queues with a dead-letter store.
pub struct WorkQueue {
    registry: SharedRegistry,
    config: QueueConfig,
    chains: BTreeMap<u32, ChainQueue>,
    dead_letter: Vec<QueueItem>,
    history: VecDeque<ProcessingSample>,
    events: EventBus,
}

impl WorkQueue {
    pub fn new(registry: SharedRegistry, config: QueueConfig, events: EventBus) -> Self {
        Self {
            registry,
            config,
            chains: BTreeMap::new(),
            dead_letter: Vec::new(),
            history: VecDeque::new(),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admit new work for a unit into its chain's pending list.
    pub fn enqueue(
        &mut self,
        unit_id: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> CadenceResult<QueueItem> {
        let (chain_id, priority, max_attempts, retry_delay_ms) = {
            let registry = self.registry.read();
            let unit = registry.require_unit(unit_id)?;
            (
                unit.chain_id,
                options.priority.unwrap_or(unit.priority),
                unit.max_attempts(),
                unit.retry_delay_ms,
            )
        };

        let now = Utc::now();
        let item = QueueItem {
            id: Uuid::new_v4(),
            unit_id: unit_id.to_string(),
            chain_id,
            priority,
            payload,
            metadata: ItemMetadata {
                created_at: now,
                updated_at: now,
                started_at: None,
                attempts: options.prior_attempts,
                max_attempts,
                retry_delay_ms,
                last_error: None,
                correlation_id: options.correlation_id.unwrap_or_else(Uuid::new_v4),
                parent_item_id: options.parent_item_id,
            },
            status: ItemStatus::Pending,
            scheduled_for: options.scheduled_for,
            result: None,
        };

        debug!(item_id = %item.id, unit = %unit_id, chain_id, %priority, "Enqueued item");
        self.events.emit(Event::ItemEnqueued {
            item_id: item.id,
            unit_id: item.unit_id.clone(),
            chain_id,
            priority,
        });
        insert_by_priority(&mut self.chains.entry(chain_id).or_default().items, item.clone());
        Ok(item)
    }

    /// Hand out the next eligible item, moving it to processing.
    ///
    /// With a chain id, takes the first due item of that chain. Without one,
    /// scans priority classes highest-first across all chains.
    pub fn dequeue(&mut self, chain_id: Option<u32>) -> Option<QueueItem> {
        self.dequeue_at(chain_id, Utc::now())
    }

    pub fn dequeue_at(&mut self, chain_id: Option<u32>, now: DateTime<Utc>) -> Option<QueueItem> {
        let (chain, index) = match chain_id {
            Some(id) => {
                let queue = self.chains.get(&id)?;
                let index = queue.items.iter().position(|i| i.is_due(now))?;
                (id, index)
            }
            None => Priority::DESCENDING.iter().find_map(|priority| {
                self.chains.iter().find_map(|(id, queue)| {
                    queue
                        .items
                        .iter()
                        .position(|i| i.priority == *priority && i.is_due(now))
                        .map(|index| (*id, index))
                })
            })?,
        };

        let queue = self.chains.get_mut(&chain)?;
        let mut item = queue.items.remove(index);
        item.status = ItemStatus::Processing;
        item.metadata.started_at = Some(now);
        item.metadata.updated_at = now;
        queue.processing.push(item.clone());

        debug!(item_id = %item.id, unit = %item.unit_id, "Dequeued item");
        self.events.emit(Event::ItemDequeued {
            item_id: item.id,
            unit_id: item.unit_id.clone(),
        });
        Some(item)
    }

    fn take_processing(&mut self, item_id: Uuid) -> CadenceResult<QueueItem> {
        for queue in self.chains.values_mut() {
            if let Some(pos) = queue.processing.iter().position(|i| i.id == item_id) {
                return Ok(queue.processing.remove(pos));
            }
        }
        Err(CadenceError::ItemNotFound(item_id))
    }

    /// Mark a processing item as done.
    pub fn complete(&mut self, item_id: Uuid, result: Value) -> CadenceResult<QueueItem> {
        let mut item = self.take_processing(item_id)?;
        let now = Utc::now();
        let duration_ms = item
            .metadata
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        item.status = ItemStatus::Completed;
        item.result = Some(result);
        item.metadata.updated_at = now;
        self.record_sample(now, duration_ms);

        let queue = self.chains.entry(item.chain_id).or_default();
        queue.completed.push_back(item.clone());
        while queue.completed.len() > self.config.completed_limit {
            queue.completed.pop_front();
        }

        debug!(item_id = %item.id, unit = %item.unit_id, duration_ms, "Completed item");
        self.events.emit(Event::ItemCompleted {
            item_id: item.id,
            unit_id: item.unit_id.clone(),
            duration_ms,
        });
        Ok(item)
    }

    /// Record a failed attempt: re-queue with backoff, or give up.
    pub fn fail(&mut self, item_id: Uuid, error: &str) -> CadenceResult<FailOutcome> {
        let mut item = self.take_processing(item_id)?;
        let now = Utc::now();
        item.metadata.attempts += 1;
        item.metadata.last_error = Some(error.to_string());
        item.metadata.updated_at = now;
        item.metadata.started_at = None;

        if item.metadata.attempts < item.metadata.max_attempts {
            let delay_ms = compute_retry_delay(
                item.metadata.retry_delay_ms,
                self.config.backoff_multiplier,
                item.metadata.attempts,
                self.config.max_retry_delay_ms,
            );
            let scheduled_for = now + span_millis(delay_ms);
            item.status = ItemStatus::Pending;
            item.scheduled_for = Some(scheduled_for);
            let attempt = item.metadata.attempts;

            warn!(
                item_id = %item.id,
                unit = %item.unit_id,
                attempt,
                delay_ms,
                error = %error,
                "Item failed, scheduling retry"
            );
            self.events.emit(Event::ItemRetrying {
                item_id: item.id,
                unit_id: item.unit_id.clone(),
                attempt,
                scheduled_for,
            });
            insert_by_priority(&mut self.chains.entry(item.chain_id).or_default().items, item);
            return Ok(FailOutcome::Retrying {
                attempt,
                scheduled_for,
            });
        }

        warn!(
            item_id = %item.id,
            unit = %item.unit_id,
            attempts = item.metadata.attempts,
            error = %error,
            "Item exhausted its attempts"
        );
        self.events.emit(Event::ItemFailed {
            item_id: item.id,
            unit_id: item.unit_id.clone(),
            error: error.to_string(),
            attempts: item.metadata.attempts,
        });

        if self.config.dead_letter_enabled {
            item.status = ItemStatus::Dead;
            info!(item_id = %item.id, unit = %item.unit_id, "Item moved to dead-letter store");
            self.events.emit(Event::ItemDeadLettered {
                item_id: item.id,
                unit_id: item.unit_id.clone(),
            });
            self.dead_letter.push(item);
            Ok(FailOutcome::DeadLettered)
        } else {
            item.status = ItemStatus::Failed;
            self.chains.entry(item.chain_id).or_default().failed.push(item);
            Ok(FailOutcome::Failed)
        }
    }

    fn take_pending(&mut self, item_id: Uuid) -> CadenceResult<QueueItem> {
        for queue in self.chains.values_mut() {
            if let Some(pos) = queue.items.iter().position(|i| i.id == item_id) {
                return Ok(queue.items.remove(pos));
            }
        }
        Err(CadenceError::ItemNotFound(item_id))
    }

    /// Move a pending item to a different priority class.
    pub fn reprioritize(&mut self, item_id: Uuid, priority: Priority) -> CadenceResult<()> {
        let mut item = self.take_pending(item_id)?;
        let from = item.priority;
        item.priority = priority;
        item.metadata.updated_at = Utc::now();
        self.events.emit(Event::ItemReprioritized {
            item_id,
            from,
            to: priority,
        });
        insert_by_priority(&mut self.chains.entry(item.chain_id).or_default().items, item);
        Ok(())
    }

    /// Withdraw a pending item.
    pub fn cancel(&mut self, item_id: Uuid) -> CadenceResult<QueueItem> {
        let item = self.take_pending(item_id)?;
        info!(item_id = %item_id, unit = %item.unit_id, "Cancelled item");
        self.events.emit(Event::ItemCancelled {
            item_id,
            unit_id: item.unit_id.clone(),
        });
        Ok(item)
    }

    /// Find an item wherever it currently lives.
    pub fn get_item(&self, item_id: Uuid) -> Option<&QueueItem> {
        self.chains
            .values()
            .find_map(|q| {
                q.items
                    .iter()
                    .chain(q.processing.iter())
                    .chain(q.completed.iter())
                    .chain(q.failed.iter())
                    .find(|i| i.id == item_id)
            })
            .or_else(|| self.dead_letter.iter().find(|i| i.id == item_id))
    }

    /// Pending items for a unit.
    pub fn queue_depth(&self, unit_id: &str) -> usize {
        self.chains
            .values()
            .flat_map(|q| q.items.iter())
            .filter(|i| i.unit_id == unit_id)
            .count()
    }

    pub fn pending_items(&self, chain_id: u32) -> Vec<&QueueItem> {
        self.chains
            .get(&chain_id)
            .map(|q| q.items.iter().collect())
            .unwrap_or_default()
    }

    pub fn failed_items(&self, chain_id: u32) -> Vec<&QueueItem> {
        self.chains
            .get(&chain_id)
            .map(|q| q.failed.iter().collect())
            .unwrap_or_default()
    }

    /// Units whose pending items reach the bottleneck threshold, largest first.
    pub fn bottlenecks(&self) -> Vec<Bottleneck> {
        let now = Utc::now();
        let mut found = Vec::new();
        for (chain_id, queue) in &self.chains {
            let mut groups: HashMap<&str, Vec<&QueueItem>> = HashMap::new();
            for item in &queue.items {
                groups.entry(item.unit_id.as_str()).or_default().push(item);
            }
            for (unit_id, items) in groups {
                if items.len() < self.config.bottleneck_threshold {
                    continue;
                }
                let total_wait: i64 = items
                    .iter()
                    .map(|i| (now - i.metadata.created_at).num_milliseconds().max(0))
                    .sum();
                found.push(Bottleneck {
                    chain_id: *chain_id,
                    unit_id: unit_id.to_string(),
                    count: items.len(),
                    avg_wait_ms: total_wait as f64 / items.len() as f64,
                });
            }
        }
        found.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.unit_id.cmp(&b.unit_id)));
        found
    }

    fn record_sample(&mut self, now: DateTime<Utc>, duration_ms: u64) {
        self.history.push_back(ProcessingSample {
            finished_at: now,
            duration_ms,
        });
        let cutoff = now - Duration::hours(1);
        while self
            .history
            .front()
            .is_some_and(|s| s.finished_at < cutoff)
        {
            self.history.pop_front();
        }
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    pub fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let mut stats = QueueStats {
            dead: self.dead_letter.len(),
            ..QueueStats::default()
        };

        for (chain_id, queue) in &self.chains {
            stats.pending += queue.items.len();
            stats.processing += queue.processing.len();
            stats.completed += queue.completed.len();
            stats.failed += queue.failed.len();
            stats.by_chain.insert(
                *chain_id,
                ChainCounts {
                    pending: queue.items.len(),
                    processing: queue.processing.len(),
                    completed: queue.completed.len(),
                    failed: queue.failed.len(),
                },
            );
            for item in queue.items.iter().chain(queue.processing.iter()) {
                *stats.by_priority.entry(item.priority).or_default() += 1;
                *stats.by_unit.entry(item.unit_id.clone()).or_default() += 1;
            }
        }

        let minute_ago = now - Duration::minutes(1);
        let hour_ago = now - Duration::hours(1);
        let last_hour: Vec<&ProcessingSample> = self
            .history
            .iter()
            .filter(|s| s.finished_at >= hour_ago)
            .collect();
        stats.throughput_last_hour = last_hour.len();
        stats.throughput_last_minute = last_hour
            .iter()
            .filter(|s| s.finished_at >= minute_ago)
            .count();
        if !last_hour.is_empty() {
            let total: u64 = last_hour.iter().map(|s| s.duration_ms).sum();
            stats.avg_processing_ms = total as f64 / last_hour.len() as f64;
        }
        stats
    }

    pub fn dead_letter_items(&self) -> &[QueueItem] {
        &self.dead_letter
    }

    /// Give a dead-lettered item a fresh retry budget and re-queue it.
    pub fn retry_dead_letter(&mut self, item_id: Uuid) -> CadenceResult<QueueItem> {
        let pos = self
            .dead_letter
            .iter()
            .position(|i| i.id == item_id)
            .ok_or(CadenceError::ItemNotFound(item_id))?;
        let mut item = self.dead_letter.remove(pos);
        item.status = ItemStatus::Pending;
        item.metadata.attempts = 0;
        item.metadata.last_error = None;
        item.metadata.started_at = None;
        item.metadata.updated_at = Utc::now();
        item.scheduled_for = None;

        info!(item_id = %item_id, unit = %item.unit_id, "Re-queued dead-lettered item");
        self.events.emit(Event::ItemEnqueued {
            item_id,
            unit_id: item.unit_id.clone(),
            chain_id: item.chain_id,
            priority: item.priority,
        });
        insert_by_priority(
            &mut self.chains.entry(item.chain_id).or_default().items,
            item.clone(),
        );
        Ok(item)
    }

    /// Drop dead-letter entries older than the configured max age.
    pub fn purge_old_dead_letters(&mut self) -> usize {
        self.purge_dead_letters_at(Utc::now())
    }

    pub fn purge_dead_letters_at(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - span_secs(self.config.dead_letter_max_age_secs);
        let before = self.dead_letter.len();
        self.dead_letter.retain(|i| i.metadata.updated_at >= cutoff);
        let purged = before - self.dead_letter.len();
        if purged > 0 {
            info!(purged, "Purged old dead-letter entries");
        }
        purged
    }

    pub fn clear_dead_letter_queue(&mut self) -> usize {
        let cleared = self.dead_letter.len();
        self.dead_letter.clear();
        cleared
    }

    pub fn export_state(&self) -> QueueSnapshot {
        QueueSnapshot {
            timestamp: Utc::now(),
            chains: self
                .chains
                .iter()
                .map(|(id, q)| {
                    (
                        *id,
                        ChainSnapshot {
                            pending: q.items.clone(),
                            processing: q.processing.clone(),
                            failed: q.failed.clone(),
                        },
                    )
                })
                .collect(),
            dead_letter: self.dead_letter.clone(),
        }
    }

    /// Replace the queue contents with a snapshot.
    ///
    /// Items that were processing are demoted to pending: in-flight work is
    /// not trusted to have completed. Items for units no longer registered
    /// are dropped. Returns the number of items restored.
    pub fn import_state(&mut self, snapshot: QueueSnapshot) -> usize {
        let registry = self.registry.clone();
        let registry = registry.read();
        let known = |item: &QueueItem| {
            let ok = registry.unit(&item.unit_id).is_some();
            if !ok {
                warn!(item_id = %item.id, unit = %item.unit_id, "Dropping item for unknown unit");
            }
            ok
        };

        self.chains.clear();
        let mut restored = 0;
        for (chain_id, chain) in snapshot.chains {
            let queue = self.chains.entry(chain_id).or_default();
            for mut item in chain.pending.into_iter().chain(chain.processing) {
                if !known(&item) {
                    continue;
                }
                item.status = ItemStatus::Pending;
                item.metadata.started_at = None;
                insert_by_priority(&mut queue.items, item);
                restored += 1;
            }
            for item in chain.failed {
                if known(&item) {
                    queue.failed.push(item);
                    restored += 1;
                }
            }
        }
        self.dead_letter = snapshot.dead_letter.into_iter().filter(known).collect();
        restored += self.dead_letter.len();

        info!(restored, "Imported queue state");
        restored
    }
}
