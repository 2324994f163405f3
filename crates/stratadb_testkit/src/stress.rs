//! Stress tests for StrataDB metadata and index trees.
//!
//! These tests verify behavior under heavy load and with readers working on
//! snapshots while a writer commits.

use crate::fixtures::{scenarios, TestStore};
use crate::generators::RowChange;
use crate::integration::MetaHarness;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stratadb_core::{Config, Meta, TransactionId};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of transactions to commit.
    pub transactions: usize,
    /// Rows written by each transaction.
    pub rows_per_transaction: u32,
    /// Persist after this many commits; 0 never persists.
    pub persist_every: usize,
    /// Number of concurrent reader threads.
    pub threads: usize,
    /// Node split threshold, small values give tall trees.
    pub max_node_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            transactions: 200,
            rows_per_transaction: 20,
            persist_every: 10,
            threads: 4,
            max_node_size: 256,
        }
    }
}

impl StressConfig {
    fn harness(&self) -> MetaHarness {
        let store = TestStore::memory_with(Config::new().max_node_size(self.max_node_size));
        let mut h = MetaHarness::new(store);
        h.create_table(scenarios::customers_schema());
        h
    }

    fn batch(&self, tran: usize) -> Vec<RowChange> {
        let first = tran as u32 * self.rows_per_transaction;
        (first..first + self.rows_per_transaction)
            .map(|id| RowChange::Upsert {
                id,
                value: format!("city{}", id % 17),
            })
            .collect()
    }
}

fn contains(meta: &Meta, id: u32) -> bool {
    let Some(info) = meta.get_ro_info("customers") else {
        return false;
    };
    let key = scenarios::row_id(id).into_bytes();
    matches!(info.indexes[0].lookup(&key), Ok(Some(_)))
}

/// Run a sequential commit stress test, persisting periodically. Each
/// committed transaction counts as one operation.
pub fn stress_sequential_commits(config: &StressConfig) -> StressTestResult {
    let mut h = config.harness();
    let start = Instant::now();

    for tran in 0..config.transactions {
        h.commit("customers", &config.batch(tran));
        if config.persist_every > 0 && (tran + 1) % config.persist_every == 0 {
            h.persist(false);
        }
    }
    let elapsed = start.elapsed();

    let total = config.transactions as u32 * config.rows_per_transaction;
    let missing = (0..total).filter(|&id| !contains(h.meta(), id)).count();
    StressTestResult::new(config.transactions, missing, elapsed)
}

/// Run readers on published snapshots while one writer commits. A read
/// fails if a row committed before the snapshot was taken is not visible.
pub fn stress_concurrent_snapshot_reads(config: &StressConfig) -> StressTestResult {
    let mut h = config.harness();
    let published = Arc::new(RwLock::new(h.meta().clone()));
    let committed = Arc::new(AtomicU32::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();

    let readers: Vec<_> = (0..config.threads)
        .map(|t| {
            let published = Arc::clone(&published);
            let committed = Arc::clone(&committed);
            let done = Arc::clone(&done);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                while !done.load(Ordering::Acquire) {
                    let visible = committed.load(Ordering::Acquire);
                    let snapshot = published.read().clone();
                    if visible == 0 {
                        thread::yield_now();
                        continue;
                    }
                    let id = rng.gen_range(0..visible);
                    if contains(&snapshot, id) {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for tran in 0..config.transactions {
        h.commit("customers", &config.batch(tran));
        if config.persist_every > 0 && (tran + 1) % config.persist_every == 0 {
            h.persist(false);
        }
        *published.write() = h.meta().clone();
        committed.store((tran as u32 + 1) * config.rows_per_transaction, Ordering::Release);
    }
    done.store(true, Ordering::Release);

    for handle in readers {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run transactions of which every other one is abandoned before commit.
/// Abandoned rows must never become visible.
pub fn stress_transaction_aborts(config: &StressConfig) -> StressTestResult {
    let mut h = config.harness();
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for tran in 0..config.transactions {
        let batch = config.batch(tran);
        if tran % 2 == 0 {
            h.commit("customers", &batch);
            successful += 1;
            continue;
        }
        // staged on a private copy, then dropped
        let mut tm = h.meta().mutable().expect("Failed to start transaction");
        let ti = tm
            .get_rw_info("customers", TransactionId::new(u64::MAX - tran as u64))
            .expect("Failed to get writable info")
            .expect("Table missing");
        for change in &batch {
            if let RowChange::Upsert { id, .. } = change {
                let key = scenarios::row_id(*id).into_bytes();
                ti.indexes[0].insert(&key, 1).expect("Failed to stage insert");
            }
        }
        let leaked = batch.iter().any(|change| match change {
            RowChange::Upsert { id, .. } | RowChange::Delete { id } => contains(h.meta(), *id),
        });
        if leaked {
            failed += 1;
        } else {
            successful += 1;
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run transactions of `rows_per_transaction * 50` rows each.
pub fn stress_large_transactions(config: &StressConfig) -> StressTestResult {
    let large = StressConfig {
        rows_per_transaction: config.rows_per_transaction * 50,
        ..config.clone()
    };
    let mut h = large.harness();
    let start = Instant::now();
    let transactions = config.transactions.min(10);
    for tran in 0..transactions {
        h.commit("customers", &large.batch(tran));
    }
    h.persist(true);
    let elapsed = start.elapsed();

    let failed = usize::from(h.meta().check().is_err());
    StressTestResult::new(transactions + 1 - failed, failed, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> StressConfig {
        StressConfig {
            transactions: 60,
            rows_per_transaction: 10,
            persist_every: 7,
            threads: 3,
            max_node_size: 96,
        }
    }

    #[test]
    fn test_sequential_commits() {
        let result = stress_sequential_commits(&small());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 60);
    }

    #[test]
    fn test_concurrent_snapshot_reads() {
        let result = stress_concurrent_snapshot_reads(&small());
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_transaction_aborts() {
        let config = StressConfig {
            transactions: 20,
            ..small()
        };
        let result = stress_transaction_aborts(&config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 20);
    }

    #[test]
    fn test_large_transactions() {
        let config = StressConfig {
            transactions: 3,
            rows_per_transaction: 10,
            ..small()
        };
        let result = stress_large_transactions(&config);
        assert_eq!(result.failed_ops, 0);
    }
}
