//! Worker discovery: who can run which task, learned by periodic probing (§4.2).

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeBody, NotifyBody};
use crate::transport::Transport;

/// What is known about one worker: its reply topic, the tasks it last
/// advertised, and how many probe rounds have passed since it last replied.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub topic: String,
    pub tasks: HashSet<String>,
    last_seen: Instant,
    missed_probes: u32,
}

struct WorkerTable {
    workers: HashMap<String, WorkerDescriptor>,
}

impl WorkerTable {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    fn record(&mut self, topic: String, tasks: Vec<String>) {
        let entry = self
            .workers
            .entry(topic.clone())
            .or_insert_with(|| WorkerDescriptor {
                topic,
                tasks: HashSet::new(),
                last_seen: Instant::now(),
                missed_probes: 0,
            });
        entry.tasks = tasks.into_iter().collect();
        entry.last_seen = Instant::now();
        entry.missed_probes = 0;
    }

    /// Candidate worker topics for `task_name`, sorted for deterministic
    /// selection.
    fn candidates(&self, task_name: &str) -> Vec<&str> {
        let mut topics: Vec<&str> = self
            .workers
            .values()
            .filter(|w| w.tasks.contains(task_name))
            .map(|w| w.topic.as_str())
            .collect();
        topics.sort_unstable();
        topics
    }

    fn distinct_worker_count(&self) -> usize {
        self.workers.len()
    }

    fn clear(&mut self) {
        self.workers.clear();
    }

    /// Age out workers that have missed too many consecutive probe rounds,
    /// and bump the miss counter for the rest ahead of the next round.
    /// Returns each evicted worker's topic alongside how long it had gone
    /// unseen.
    fn age_and_evict(&mut self, max_missed_probes: u32) -> Vec<(String, Duration)> {
        let mut evicted = Vec::new();
        self.workers.retain(|topic, worker| {
            worker.missed_probes += 1;
            if worker.missed_probes > max_missed_probes {
                evicted.push((topic.clone(), worker.last_seen.elapsed()));
                false
            } else {
                true
            }
        });
        evicted
    }
}

/// Deterministically select one of `candidates` for `request_uuid`: a hash of
/// the uuid modulo the (already sorted) candidate list, so repeated lookups
/// for the same request prefer the same worker while load spreads across
/// requests (§4.2, §9).
fn stable_select<'a>(candidates: &[&'a str], request_uuid: &Uuid) -> Option<&'a str> {
    if candidates.is_empty() {
        return None;
    }
    let mut hasher = DefaultHasher::new();
    request_uuid.hash(&mut hasher);
    let index = (hasher.finish() as usize) % candidates.len();
    Some(candidates[index])
}

/// Discovers which workers can serve which tasks by periodically broadcasting
/// a NOTIFY probe on a fixed set of discovery topics and recording
/// NOTIFY_RESPONSE replies.
pub struct WorkerFinder {
    table: Mutex<WorkerTable>,
    discovery_topics: Vec<String>,
    reply_to: String,
    worker_staleness_probes: u32,
    discovered: Notify,
}

impl WorkerFinder {
    pub fn new(discovery_topics: Vec<String>, reply_to: String, worker_staleness_probes: u32) -> Self {
        Self {
            table: Mutex::new(WorkerTable::new()),
            discovery_topics,
            reply_to,
            worker_staleness_probes,
            discovered: Notify::new(),
        }
    }

    /// Select one worker topic eligible for `task_name`, preferring the same
    /// worker for the same `request_uuid` across retries.
    pub fn get_worker_for_task(&self, task_name: &str, request_uuid: &Uuid) -> Option<String> {
        let table = self.table.lock().unwrap();
        let candidates = table.candidates(task_name);
        stable_select(&candidates, request_uuid).map(str::to_string)
    }

    /// Block until at least `min_count` distinct workers are known or
    /// `timeout` elapses. Returns the shortfall (0 on success).
    pub async fn wait_for_workers(&self, min_count: usize, timeout: Duration) -> usize {
        loop {
            let discovered = self.table.lock().unwrap().distinct_worker_count();
            if discovered >= min_count {
                return 0;
            }
            let notified = self.discovered.notified();
            match tokio_timeout(timeout, notified).await {
                Ok(()) => continue,
                Err(_) => {
                    let discovered = self.table.lock().unwrap().distinct_worker_count();
                    return min_count.saturating_sub(discovered);
                }
            }
        }
    }

    /// Drop all known workers, used at shutdown.
    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
    }

    /// Record an incoming NOTIFY_RESPONSE.
    pub fn record_response(&self, topic: String, tasks: Vec<String>) {
        info!(topic = %topic, tasks = ?tasks, "worker advertisement received");
        self.table.lock().unwrap().record(topic, tasks);
        self.discovered.notify_waiters();
    }

    /// One discovery round: evict stale workers, then broadcast a fresh
    /// NOTIFY probe on every configured discovery topic.
    pub async fn tick(&self, transport: &dyn Transport) {
        let evicted = self
            .table
            .lock()
            .unwrap()
            .age_and_evict(self.worker_staleness_probes);
        for (topic, unseen_for) in &evicted {
            info!(topic = %topic, unseen_for = ?unseen_for, "worker evicted after missing too many probes");
        }

        for discovery_topic in &self.discovery_topics {
            let envelope = Envelope::new(
                EnvelopeBody::Notify(NotifyBody {
                    topic: self.reply_to.clone(),
                }),
                None,
                Some(self.reply_to.clone()),
            );
            if let Err(err) = transport.publish(envelope, discovery_topic).await {
                debug!(topic = %discovery_topic, error = %err, "discovery probe publish failed");
            }
        }
    }
}
