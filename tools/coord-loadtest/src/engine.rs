use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use coord_store::MemoryStore;
use coordination::{
    CoordConfig, CoordinationService, DistributedLock, Lock, ReentrantLock, Semaphore,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{LoadTestConfig, Primitive};
use crate::report::{
    ClientResult, ErrorCategory, LoadTestReport, RunConfigSnapshot, RuntimeStats, Totals,
};
use crate::validation;

const CLUSTER: &str = "loadtest";
const ENTITY: &str = "contended";
const BASE_PATH: &str = "/loadtest";
const RELAY_CEILING_MS: u64 = 5_000;

/// Number of clients currently inside a grant, the highest value seen and
/// the order in which clients were granted.
#[derive(Debug, Default)]
struct HolderGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    order: Mutex<Vec<usize>>,
}

impl HolderGauge {
    fn enter(&self, client_index: usize) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.order
            .lock()
            .expect("grant order poisoned")
            .push(client_index);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn grant_order(&self) -> Vec<usize> {
        self.order.lock().expect("grant order poisoned").clone()
    }
}

enum Handle {
    Lock(Arc<Lock>),
    Reentrant(Arc<ReentrantLock>),
    Semaphore(Arc<Semaphore>),
}

pub async fn run(config: LoadTestConfig) -> Result<LoadTestReport> {
    let started = Instant::now();
    let store = MemoryStore::new();
    let gauge = Arc::new(HolderGauge::default());

    let mut services = Vec::with_capacity(config.clients);
    let mut tasks = JoinSet::new();
    for client_index in 0..config.clients {
        let service = Arc::new(
            CoordinationService::new(Arc::new(store.connect()), coord_config(client_index))
                .with_context(|| format!("create coordination service {client_index}"))?,
        );
        let handle = open_handle(&service, &config)
            .with_context(|| format!("open {:?} handle {client_index}", config.primitive))?;
        services.push(service.clone());

        let config = config.clone();
        let gauge = gauge.clone();
        tasks.spawn(async move {
            let owner_id = service.owner_id().to_owned();
            run_single_client(client_index, owner_id, handle, &config, &gauge).await
        });
    }
    info!(clients = config.clients, primitive = ?config.primitive, "load test started");

    let mut clients = Vec::with_capacity(config.clients);
    while let Some(joined) = tasks.join_next().await {
        let result = joined.context("client task join failed")?;
        clients.push(result);
    }
    clients.sort_by_key(|client| client.client_index);
    for service in &services {
        service.shutdown();
    }

    let totals = compute_totals(&clients, &config, gauge.peak());
    let stats = compute_stats(&clients, started.elapsed(), &totals);
    let validation = validation::run_validations(&clients, &totals);
    let passed = validation.passed;
    info!(passed, grants = totals.grants, peak = totals.peak_holders, "load test finished");

    Ok(LoadTestReport {
        config: RunConfigSnapshot::from(&config),
        passed,
        totals,
        stats,
        validation,
        grant_order: gauge.grant_order(),
        clients,
    })
}

fn coord_config(client_index: usize) -> CoordConfig {
    let mut config = CoordConfig {
        base_path: BASE_PATH.to_owned(),
        owner_id: Some(format!("client-{client_index}")),
        relay_ceiling_ms: RELAY_CEILING_MS,
        ..CoordConfig::default()
    };
    config.admin.enabled = false;
    config
}

fn open_handle(service: &CoordinationService, config: &LoadTestConfig) -> Result<Handle> {
    Ok(match config.primitive {
        Primitive::Lock => Handle::Lock(service.lock(CLUSTER, ENTITY)?),
        Primitive::ReentrantLock => Handle::Reentrant(service.reentrant_lock(CLUSTER, ENTITY)?),
        Primitive::Semaphore => {
            Handle::Semaphore(service.fixed_semaphore(CLUSTER, ENTITY, config.permits)?)
        }
    })
}

async fn run_single_client(
    client_index: usize,
    owner_id: String,
    handle: Handle,
    config: &LoadTestConfig,
    gauge: &HolderGauge,
) -> ClientResult {
    let mut result = ClientResult::new(client_index, owner_id);
    for round in 0..config.rounds {
        let requested = Instant::now();
        match &handle {
            Handle::Lock(lock) => {
                lock_round(lock.as_ref(), round, config, gauge, &mut result, requested).await
            }
            Handle::Reentrant(lock) => {
                reentrant_round(lock, round, config, gauge, &mut result, requested).await
            }
            Handle::Semaphore(semaphore) => {
                semaphore_round(semaphore, round, config, gauge, &mut result, requested).await
            }
        }
    }
    if !result.errors.is_empty() {
        warn!(client_index, errors = result.errors.len(), "client finished with errors");
    }
    result
}

async fn hold(config: &LoadTestConfig, gauge: &HolderGauge, result: &mut ClientResult, requested: Instant) {
    result.acquire_latency_ms.push(requested.elapsed().as_millis());
    result.grants += 1;
    gauge.enter(result.client_index);
    tokio::time::sleep(config.hold()).await;
    gauge.leave();
}

async fn acquire_lock(
    lock: &dyn DistributedLock,
    round: usize,
    wait: Duration,
    result: &mut ClientResult,
) -> bool {
    match lock.try_lock_for(wait, None).await {
        Ok(true) => true,
        Ok(false) => {
            result.record_error(ErrorCategory::Timeout, round, "lock not granted in time");
            false
        }
        Err(err) => {
            result.record_error(ErrorCategory::Acquire, round, err.to_string());
            false
        }
    }
}

async fn lock_round(
    lock: &dyn DistributedLock,
    round: usize,
    config: &LoadTestConfig,
    gauge: &HolderGauge,
    result: &mut ClientResult,
    requested: Instant,
) {
    if !acquire_lock(lock, round, config.timeout(), result).await {
        return;
    }
    hold(config, gauge, result, requested).await;
    if let Err(err) = lock.unlock().await {
        result.record_error(ErrorCategory::Release, round, err.to_string());
    }
}

async fn reentrant_round(
    lock: &ReentrantLock,
    round: usize,
    config: &LoadTestConfig,
    gauge: &HolderGauge,
    result: &mut ClientResult,
    requested: Instant,
) {
    if !acquire_lock(lock, round, config.timeout(), result).await {
        return;
    }
    // re-entering must not queue behind other clients
    let reentered = acquire_lock(lock, round, Duration::ZERO, result).await;
    if reentered && lock.hold_count() != 2 {
        result.record_error(
            ErrorCategory::Acquire,
            round,
            format!("hold count {} after re-entry", lock.hold_count()),
        );
    }
    hold(config, gauge, result, requested).await;
    for _ in 0..lock.hold_count() {
        if let Err(err) = lock.unlock().await {
            result.record_error(ErrorCategory::Release, round, err.to_string());
            break;
        }
    }
    debug!(round, "reentrant round done");
}

async fn semaphore_round(
    semaphore: &Semaphore,
    round: usize,
    config: &LoadTestConfig,
    gauge: &HolderGauge,
    result: &mut ClientResult,
    requested: Instant,
) {
    let permit = match semaphore.try_acquire_for(config.timeout(), None).await {
        Ok(Some(permit)) => permit,
        Ok(None) => {
            result.record_error(ErrorCategory::Timeout, round, "permit not granted in time");
            return;
        }
        Err(err) => {
            result.record_error(ErrorCategory::Acquire, round, err.to_string());
            return;
        }
    };
    hold(config, gauge, result, requested).await;
    if let Err(err) = semaphore.release(&permit).await {
        result.record_error(ErrorCategory::Release, round, err.to_string());
    }
}

fn compute_totals(clients: &[ClientResult], config: &LoadTestConfig, peak_holders: usize) -> Totals {
    let grants = clients.iter().map(|client| client.grants).sum();
    let total_errors = clients.iter().map(|client| client.errors.len()).sum();
    let timeout_errors = clients
        .iter()
        .flat_map(|client| client.errors.iter())
        .filter(|error| error.category == ErrorCategory::Timeout)
        .count();

    Totals {
        planned_grants: config.clients * config.rounds,
        grants,
        holder_limit: config.holder_limit(),
        peak_holders,
        total_errors,
        timeout_errors,
    }
}

fn compute_stats(clients: &[ClientResult], duration: Duration, totals: &Totals) -> RuntimeStats {
    let duration_secs = duration.as_secs_f64().max(1e-9);
    let mut latencies = clients
        .iter()
        .flat_map(|client| client.acquire_latency_ms.iter().copied())
        .collect::<Vec<_>>();
    latencies.sort_unstable();

    RuntimeStats {
        duration_ms: duration.as_millis(),
        grants_per_sec: totals.grants as f64 / duration_secs,
        latency_p50_ms: percentile(&latencies, 0.50),
        latency_p95_ms: percentile(&latencies, 0.95),
        latency_p99_ms: percentile(&latencies, 0.99),
    }
}

fn percentile(values: &[u128], p: f64) -> Option<u128> {
    if values.is_empty() {
        return None;
    }
    let index = ((values.len() - 1) as f64 * p).round() as usize;
    values.get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_picks_nearest_rank() {
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 0.5), Some(3));
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 0.99), Some(5));
    }

    #[test]
    fn gauge_tracks_peak() {
        let gauge = HolderGauge::default();
        gauge.enter(0);
        gauge.enter(1);
        gauge.leave();
        gauge.enter(2);
        gauge.leave();
        gauge.leave();
        assert_eq!(gauge.peak(), 2);
        assert_eq!(gauge.active.load(Ordering::SeqCst), 0);
        assert_eq!(gauge.grant_order(), vec![0, 1, 2]);
    }
}
