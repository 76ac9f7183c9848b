pub mod config;
pub mod engine;
pub mod report;
pub mod trace;
pub mod validation;

pub use config::{Cli, LoadTestConfig, Primitive};
pub use report::LoadTestReport;

pub async fn run_load_test(config: LoadTestConfig) -> anyhow::Result<LoadTestReport> {
    engine::run(config).await
}
