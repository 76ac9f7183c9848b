use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PERMITS: usize = 2;
pub const DEFAULT_HOLD_MS: u64 = 5;
pub const DEFAULT_ROUNDS: usize = 10;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_COORD_LOG: &str = "warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Primitive {
    Lock,
    ReentrantLock,
    Semaphore,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "coord-loadtest",
    about = "Contention test for distributed locks and semaphores on an in-process store"
)]
pub struct Cli {
    /// number of sessions, each with its own coordination service
    #[arg(long, env = "COORD_CLIENTS")]
    pub clients: usize,
    #[arg(long, value_enum)]
    pub primitive: Primitive,

    /// pool size when `--primitive semaphore`
    #[arg(long, default_value_t = DEFAULT_PERMITS)]
    pub permits: usize,
    /// how long each grant is held
    #[arg(long, default_value_t = DEFAULT_HOLD_MS)]
    pub hold_ms: u64,
    /// acquisitions per client
    #[arg(long, default_value_t = DEFAULT_ROUNDS)]
    pub rounds: usize,
    /// per acquisition wait budget
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    #[arg(long)]
    pub json: bool,
    /// log filter, all valid RUST_LOG directives are accepted
    #[arg(long, env = "COORD_LOG", default_value = DEFAULT_COORD_LOG)]
    pub log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestConfig {
    pub clients: usize,
    pub primitive: Primitive,
    pub permits: usize,
    pub hold_ms: u64,
    pub rounds: usize,
    pub timeout_ms: u64,
    pub json: bool,
    pub log: String,
}

impl LoadTestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    /// Maximum number of simultaneous holders the primitive allows.
    pub fn holder_limit(&self) -> usize {
        match self.primitive {
            Primitive::Semaphore => self.permits,
            Primitive::Lock | Primitive::ReentrantLock => 1,
        }
    }
}

impl TryFrom<Cli> for LoadTestConfig {
    type Error = anyhow::Error;

    fn try_from(args: Cli) -> Result<Self> {
        if args.clients == 0 {
            bail!("--clients must be greater than 0");
        }
        if args.rounds == 0 {
            bail!("--rounds must be greater than 0");
        }
        if args.timeout_ms == 0 {
            bail!("--timeout-ms must be greater than 0");
        }
        if args.primitive == Primitive::Semaphore && args.permits == 0 {
            bail!("--permits must be greater than 0");
        }

        Ok(Self {
            clients: args.clients,
            primitive: args.primitive,
            permits: args.permits,
            hold_ms: args.hold_ms,
            rounds: args.rounds,
            timeout_ms: args.timeout_ms,
            json: args.json,
            log: args.log,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, LoadTestConfig, Primitive};

    #[test]
    fn parse_lock_defaults() {
        let cli = Cli::try_parse_from(["coord-loadtest", "--clients", "8", "--primitive", "lock"])
            .expect("cli should parse");
        let cfg = LoadTestConfig::try_from(cli).expect("config should build");

        assert_eq!(cfg.clients, 8);
        assert_eq!(cfg.primitive, Primitive::Lock);
        assert_eq!(cfg.holder_limit(), 1);
        assert_eq!(cfg.rounds, super::DEFAULT_ROUNDS);
    }

    #[test]
    fn parse_semaphore_permits() {
        let cli = Cli::try_parse_from([
            "coord-loadtest",
            "--clients",
            "4",
            "--primitive",
            "semaphore",
            "--permits",
            "3",
        ])
        .expect("cli should parse");
        let cfg = LoadTestConfig::try_from(cli).expect("config should build");

        assert_eq!(cfg.holder_limit(), 3);
    }

    #[test]
    fn reject_empty_pool() {
        let cli = Cli::try_parse_from([
            "coord-loadtest",
            "--clients",
            "2",
            "--primitive",
            "semaphore",
            "--permits",
            "0",
        ])
        .expect("cli should parse");
        let err = LoadTestConfig::try_from(cli).expect_err("expected permit validation error");

        assert!(err.to_string().contains("--permits"));
    }

    #[test]
    fn parse_reentrant_primitive() {
        let cli = Cli::try_parse_from([
            "coord-loadtest",
            "--clients",
            "1",
            "--primitive",
            "reentrant-lock",
        ])
        .expect("cli should parse");
        assert_eq!(cli.primitive, Primitive::ReentrantLock);
    }
}
