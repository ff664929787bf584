//! Replication simulations.
//!
//! Seeds a master, plants conflicting fork edits, runs a live replication
//! while both sides keep writing, and reports how it went.

use crate::fixtures::{eventually, scenarios, test_config, Person};
use docsync_replication::{ReplicationResult, ReplicationStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tracing::info;

/// Configuration for a simulation.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Documents seeded on master.
    pub documents: usize,
    /// Pull page size.
    pub pull_batch_size: usize,
    /// Push batch size.
    pub push_batch_size: usize,
    /// Seeded documents also edited on the fork before the first sync.
    pub conflicts: usize,
    /// Random writes issued on both sides while replicating live.
    pub live_writes: usize,
    /// Seed for the live writes.
    pub seed: u64,
    /// How long to wait for convergence.
    pub timeout: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            documents: 1_000,
            pull_batch_size: 100,
            push_batch_size: 50,
            conflicts: 10,
            live_writes: 100,
            seed: 7,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Documents on master at the end.
    pub documents: usize,
    /// Whether fork and master ended with identical content.
    pub converged: bool,
    /// Total duration.
    pub duration: Duration,
    /// Replication counters.
    pub stats: ReplicationStats,
    /// Documents applied or pushed per second.
    pub docs_per_second: f64,
}

impl SimulationReport {
    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Documents: {}", self.documents);
        println!("Converged: {}", self.converged);
        println!("Duration: {:?}", self.duration);
        println!(
            "Pulled: {} in {} pages",
            self.stats.down.documents_applied, self.stats.down.pages_applied
        );
        println!(
            "Pushed: {} in {} pages",
            self.stats.up.documents_pushed, self.stats.up.pages_pushed
        );
        println!(
            "Conflicts: {} ({} winners written, {} storms)",
            self.stats.up.conflicts, self.stats.up.conflict_writes, self.stats.up.conflict_storms
        );
        println!(
            "Skipped: {} pending local, {} already equal",
            self.stats.down.skipped_pending_local,
            self.stats.down.skipped_equal + self.stats.up.skipped_equal
        );
        println!("Retries: {}", self.stats.retries);
        println!("Throughput: {:.2} docs/sec", self.docs_per_second);
    }
}

/// Runs a simulation on in-memory stores.
///
/// A run that does not converge within `config.timeout` still returns a
/// report, with `converged` unset.
///
/// # Errors
///
/// Returns the error that stopped the replication, if any.
pub async fn run_simulation(config: &SimulationConfig) -> ReplicationResult<SimulationReport> {
    let harness = scenarios::seeded_master(config.documents).await;

    // Older fork edits lose to master on even ids, newer ones win on odd ids.
    let conflicts = config.conflicts.min(config.documents);
    for i in 0..conflicts {
        let id = scenarios::person_id(i);
        let master_lwt = harness.master.get(&id).map_or(0, |d| d.meta.lwt);
        let lwt = if i % 2 == 0 {
            master_lwt.saturating_sub(1)
        } else {
            master_lwt + 1
        };
        harness
            .write_fork_at(&id, Person::new(format!("fork edit {i}"), 0), lwt)
            .await;
    }

    let replication_config = test_config("simulation")
        .with_pull_batch_size(config.pull_batch_size)
        .with_push_batch_size(config.push_batch_size);
    let start = Instant::now();
    let state = harness.start(replication_config);
    state.await_first_in_sync().await?;
    info!(elapsed = ?start.elapsed(), "initial sync done");

    let mut rng = StdRng::seed_from_u64(config.seed);
    for n in 0..config.live_writes {
        let index = rng.gen_range(0..config.documents.max(1));
        let id = scenarios::person_id(index);
        let person = Person::new(format!("live write {n}"), rng.gen_range(0..120));
        if rng.gen_bool(0.5) {
            harness.write_fork(&id, person).await;
        } else {
            harness.write_master(&id, person).await;
        }
        if n % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let converged = eventually(config.timeout, || harness.converged()).await;
    if converged {
        state.await_idle().await?;
    }
    let duration = start.elapsed();
    let stats = state.stats();
    let stopped_by = state.last_error().filter(|e| !e.is_document_scoped());
    state.cancel().await;
    if let Some(err) = stopped_by {
        return Err(err);
    }

    let moved = stats.down.documents_applied + stats.up.documents_pushed;
    let docs_per_second = if duration.as_secs_f64() > 0.0 {
        moved as f64 / duration.as_secs_f64()
    } else {
        0.0
    };
    Ok(SimulationReport {
        documents: harness.master.len(),
        converged,
        duration,
        stats,
        docs_per_second,
    })
}
