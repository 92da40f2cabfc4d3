//! Batch dispatch: concurrent delivery for order-independent messages.
//!
//! A message goes to the parallel lane when its topic is on the fixed
//! allow-list or was declared parallel-safe, or (when trusted) when it
//! carries its own `parallel_safe` flag. Everything else runs in the
//! sequential lane, in input order, stopping at the first failure.

use super::transport::{Transport, TransportError};
use super::Message;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

/// Topics known to carry no ordering dependency.
pub const SAFE_PARALLEL_TOPICS: &[&str] = &[
    "core.lifecycle.migrated",
    "core.lifecycle.fused",
    "stats.memory_usage",
    "log.debug",
    "plugin.heartbeat",
    "config.theme_changed",
    "plugin.initialized",
    "plugin.shutdown",
    "system.process.declared",
    "system.process.terminating",
];

/// Batch errors.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Sequential delivery of {topic} (item {index}) failed: {source}")]
    Sequential {
        index: usize,
        topic: String,
        #[source]
        source: TransportError,
    },
}

/// A parallel delivery that failed. Siblings still ran.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub topic: String,
    pub error: String,
}

/// Outcome of one [`BatchDispatcher::dispatch`] call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub processed_count: usize,
    pub parallel_count: usize,
    pub sequential_count: usize,
    pub processing_time_ms: f64,
    pub failures: Vec<BatchFailure>,
}

/// Running totals across batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total_messages: u64,
    pub parallel_messages: u64,
    pub sequential_messages: u64,
    pub batch_count: u64,
    pub avg_processing_ms: f64,
    /// Share of messages that took the parallel lane, 0.0 to 1.0.
    pub parallelization_rate: f64,
}

/// Partitions batches and drives both lanes against a transport.
pub struct BatchDispatcher {
    declared: RwLock<HashSet<String>>,
    trust_flag: bool,
    stats: Mutex<BatchStats>,
}

impl BatchDispatcher {
    pub fn new(trust_flag: bool) -> Self {
        Self {
            declared: RwLock::new(HashSet::new()),
            trust_flag,
            stats: Mutex::new(BatchStats::default()),
        }
    }

    /// Declare `topic` free of ordering dependencies.
    pub fn declare_parallel_safe(&self, topic: impl Into<String>) {
        self.declared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.into());
    }

    pub fn is_parallel_safe(&self, message: &Message) -> bool {
        let topic = message.topic();
        if SAFE_PARALLEL_TOPICS.contains(&topic) {
            return true;
        }
        if self
            .declared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
        {
            return true;
        }
        // Sender-asserted safety is only honoured when trusted.
        self.trust_flag && message.is_parallel_safe()
    }

    /// Deliver `messages` through `transport`.
    ///
    /// Parallel deliveries are all-settled; their failures are collected in
    /// the result. A sequential failure stops the sequential lane and is
    /// returned as the error once the parallel lane has settled.
    pub async fn dispatch(
        &self,
        messages: Vec<Message>,
        transport: &dyn Transport,
    ) -> Result<BatchResult, BatchError> {
        let started = Instant::now();
        let processed_count = messages.len();

        let (parallel, sequential): (Vec<_>, Vec<_>) = messages
            .into_iter()
            .enumerate()
            .partition(|(_, m)| self.is_parallel_safe(m));
        let parallel_count = parallel.len();
        let sequential_count = sequential.len();

        let parallel_lane = join_all(parallel.iter().map(|(index, message)| async move {
            transport
                .send(message)
                .await
                .map_err(|e| BatchFailure {
                    index: *index,
                    topic: message.topic().to_string(),
                    error: e.to_string(),
                })
        }));

        let sequential_lane = async {
            for (index, message) in &sequential {
                if let Err(source) = transport.send(message).await {
                    return Err(BatchError::Sequential {
                        index: *index,
                        topic: message.topic().to_string(),
                        source,
                    });
                }
            }
            Ok(())
        };

        let (parallel_results, sequential_result) = futures::join!(parallel_lane, sequential_lane);

        let failures: Vec<BatchFailure> = parallel_results
            .into_iter()
            .filter_map(Result::err)
            .collect();
        for failure in &failures {
            warn!(topic = %failure.topic, index = failure.index, error = %failure.error, "Parallel delivery failed");
        }

        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.record(parallel_count, sequential_count, processing_time_ms);
        debug!(
            processed = processed_count,
            parallel = parallel_count,
            sequential = sequential_count,
            ms = processing_time_ms,
            "Batch dispatched"
        );

        sequential_result?;
        Ok(BatchResult {
            processed_count,
            parallel_count,
            sequential_count,
            processing_time_ms,
            failures,
        })
    }

    fn record(&self, parallel: usize, sequential: usize, elapsed_ms: f64) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.batch_count += 1;
        stats.parallel_messages += parallel as u64;
        stats.sequential_messages += sequential as u64;
        stats.total_messages += (parallel + sequential) as u64;
        let n = stats.batch_count as f64;
        stats.avg_processing_ms += (elapsed_ms - stats.avg_processing_ms) / n;
        stats.parallelization_rate = if stats.total_messages == 0 {
            0.0
        } else {
            stats.parallel_messages as f64 / stats.total_messages as f64
        };
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = BatchStats::default();
    }
}

impl Default for BatchDispatcher {
    fn default() -> Self {
        Self::new(true)
    }
}
