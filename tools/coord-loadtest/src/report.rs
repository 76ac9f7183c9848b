use serde::{Deserialize, Serialize};

use crate::config::{LoadTestConfig, Primitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Acquire,
    Release,
    Setup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub round: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResult {
    pub client_index: usize,
    pub owner_id: String,
    pub grants: usize,
    pub acquire_latency_ms: Vec<u128>,
    pub errors: Vec<ErrorRecord>,
}

impl ClientResult {
    pub fn new(client_index: usize, owner_id: String) -> Self {
        Self {
            client_index,
            owner_id,
            grants: 0,
            acquire_latency_ms: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, category: ErrorCategory, round: usize, message: impl Into<String>) {
        self.errors.push(ErrorRecord {
            category,
            round,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfigSnapshot {
    pub primitive: Primitive,
    pub clients: usize,
    pub permits: usize,
    pub hold_ms: u64,
    pub rounds: usize,
    pub timeout_ms: u64,
}

impl From<&LoadTestConfig> for RunConfigSnapshot {
    fn from(config: &LoadTestConfig) -> Self {
        Self {
            primitive: config.primitive,
            clients: config.clients,
            permits: config.permits,
            hold_ms: config.hold_ms,
            rounds: config.rounds,
            timeout_ms: config.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Totals {
    pub planned_grants: usize,
    pub grants: usize,
    pub holder_limit: usize,
    pub peak_holders: usize,
    pub total_errors: usize,
    pub timeout_errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub duration_ms: u128,
    pub grants_per_sec: f64,
    pub latency_p50_ms: Option<u128>,
    pub latency_p95_ms: Option<u128>,
    pub latency_p99_ms: Option<u128>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestReport {
    pub config: RunConfigSnapshot,
    pub passed: bool,
    pub totals: Totals,
    pub stats: RuntimeStats,
    pub validation: ValidationSummary,
    /// client indices in the order their grants began
    pub grant_order: Vec<usize>,
    pub clients: Vec<ClientResult>,
}

impl LoadTestReport {
    pub fn human_summary(&self) -> String {
        let mut output = String::new();
        output.push_str("coordination load test report\n");
        output.push_str(&format!(
            "status: {}\n",
            if self.passed { "PASS" } else { "FAIL" }
        ));
        output.push_str(&format!(
            "mode: primitive={:?}, clients={}, rounds={}, hold={}ms\n",
            self.config.primitive, self.config.clients, self.config.rounds, self.config.hold_ms
        ));
        output.push_str(&format!(
            "grants: planned={}, completed={} | holders: peak={}, limit={}\n",
            self.totals.planned_grants,
            self.totals.grants,
            self.totals.peak_holders,
            self.totals.holder_limit
        ));
        output.push_str(&format!(
            "errors: total={}, timeout={}\n",
            self.totals.total_errors, self.totals.timeout_errors
        ));
        output.push_str(&format!(
            "timing: duration={}ms grants={:.2}/s p50={:?}ms p95={:?}ms p99={:?}ms\n",
            self.stats.duration_ms,
            self.stats.grants_per_sec,
            self.stats.latency_p50_ms,
            self.stats.latency_p95_ms,
            self.stats.latency_p99_ms
        ));

        for check in &self.validation.checks {
            output.push_str(&format!(
                "check [{}] {}: {}\n",
                if check.passed { "PASS" } else { "FAIL" },
                check.name,
                check.details
            ));
        }
        output
    }
}
