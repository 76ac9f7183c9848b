//! # metrics
//!
//! Per-service coordination statistics. Collectors are owned by a
//! [`CoordMetrics`] value and handed to each component, so several services
//! in one process never share counters unless they share a registry.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::error::{CoordError, CoordResult};
use crate::reservation::ReservationType;

#[derive(Debug, Clone)]
pub struct CoordMetrics {
    /// Watch relays currently alive.
    pub relays_outstanding: IntGauge,
    /// Successful acquisitions by reservation type.
    pub acquisitions: IntCounterVec,
    /// Acquisition attempts that ended without a hold, by reservation type.
    pub acquire_failures: IntCounterVec,
    /// Seconds from ticket creation to grant, by reservation type.
    pub acquire_duration: HistogramVec,
    pub relinquished: IntCounter,
    /// Handles revoked through observers, by kind (`lock`, `semaphore`).
    pub revocations: IntCounterVec,
    pub observer_dispatches: IntCounter,
    pub observer_rechecks: IntCounter,
    /// Store events dropped because the dispatch queue was full.
    pub observer_events_dropped: IntCounter,
    pub admin_runs: IntCounter,
    /// Seconds spent per administrative pass.
    pub admin_duration: Histogram,
    pub reservations_reaped: IntCounter,
}

impl CoordMetrics {
    /// Builds collectors without registering them anywhere.
    pub fn unregistered() -> Self {
        // names and label sets are static and valid
        Self::build().expect("static metric definitions are valid")
    }

    /// Builds collectors and registers them with `registry`.
    pub fn register(registry: &Registry) -> CoordResult<Self> {
        let metrics = Self::build().map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.relays_outstanding.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.acquisitions.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.acquire_failures.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.acquire_duration.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.relinquished.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.revocations.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.observer_dispatches.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.observer_rechecks.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.observer_events_dropped.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.admin_runs.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.admin_duration.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(metrics.reservations_reaped.clone()))
            .map_err(metrics_err)?;
        Ok(metrics)
    }

    fn build() -> prometheus::Result<Self> {
        Ok(Self {
            relays_outstanding: IntGauge::new(
                "coord_relays_outstanding",
                "watch relays currently waiting on a reservation",
            )?,
            acquisitions: IntCounterVec::new(
                Opts::new("coord_acquisitions", "reservations granted"),
                &["type"],
            )?,
            acquire_failures: IntCounterVec::new(
                Opts::new(
                    "coord_acquire_failures",
                    "acquisition attempts that ended without a hold",
                ),
                &["type"],
            )?,
            acquire_duration: HistogramVec::new(
                HistogramOpts::new(
                    "coord_acquire_duration",
                    "time from ticket creation to grant (seconds)",
                ),
                &["type"],
            )?,
            relinquished: IntCounter::new("coord_relinquished", "reservations relinquished")?,
            revocations: IntCounterVec::new(
                Opts::new("coord_revocations", "held reservations revoked externally"),
                &["kind"],
            )?,
            observer_dispatches: IntCounter::new(
                "coord_observer_dispatches",
                "observer callbacks invoked",
            )?,
            observer_rechecks: IntCounter::new(
                "coord_observer_rechecks",
                "delayed observer re-checks executed",
            )?,
            observer_events_dropped: IntCounter::new(
                "coord_observer_events_dropped",
                "store events dropped because the dispatch queue was full",
            )?,
            admin_runs: IntCounter::new("coord_admin_runs", "administrative passes completed")?,
            admin_duration: Histogram::with_opts(HistogramOpts::new(
                "coord_admin_duration",
                "administrative pass duration (seconds)",
            ))?,
            reservations_reaped: IntCounter::new(
                "coord_reservations_reaped",
                "reservations deleted for exceeding the maximum hold time",
            )?,
        })
    }

    pub(crate) fn acquired(&self, reservation_type: ReservationType, seconds: f64) {
        let label = reservation_type.to_string();
        self.acquisitions.with_label_values(&[&label]).inc();
        self.acquire_duration
            .with_label_values(&[&label])
            .observe(seconds);
    }

    pub(crate) fn acquire_failed(&self, reservation_type: ReservationType) {
        self.acquire_failures
            .with_label_values(&[&reservation_type.to_string()])
            .inc();
    }

    pub(crate) fn revoked(&self, kind: &str) {
        self.revocations.with_label_values(&[kind]).inc();
    }
}

impl Default for CoordMetrics {
    fn default() -> Self {
        Self::unregistered()
    }
}

fn metrics_err(err: prometheus::Error) -> CoordError {
    CoordError::Config(format!("metrics registration failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = CoordMetrics::register(&registry).unwrap();
        metrics.acquired(ReservationType::LockExclusive, 0.25);
        metrics.acquire_failed(ReservationType::Semaphore);
        metrics.relays_outstanding.inc();

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_owned()).collect();
        assert!(names.contains(&"coord_acquisitions".to_owned()));
        assert!(names.contains(&"coord_relays_outstanding".to_owned()));
        assert_eq!(
            metrics
                .acquisitions
                .with_label_values(&["lock_exclusive"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .acquire_failures
                .with_label_values(&["semaphore"])
                .get(),
            1
        );
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        CoordMetrics::register(&registry).unwrap();
        assert!(CoordMetrics::register(&registry).unwrap_err().is_config());
    }
}
