use clap::Parser;

use coord_loadtest::{Cli, LoadTestConfig, run_load_test};

async fn run(args: &[&str]) -> coord_loadtest::LoadTestReport {
    let cli = Cli::try_parse_from(std::iter::once("coord-loadtest").chain(args.iter().copied()))
        .expect("cli parse");
    let config = LoadTestConfig::try_from(cli).expect("config parse");
    run_load_test(config).await.expect("load test report")
}

#[tokio::test]
async fn lock_smoke() {
    let report = run(&["--clients", "4", "--primitive", "lock", "--rounds", "3", "--hold-ms", "1"]).await;

    assert!(report.passed, "{}", report.human_summary());
    assert_eq!(report.totals.grants, 12);
    assert_eq!(report.totals.peak_holders, 1);
    assert_eq!(report.clients.len(), 4);
}

#[tokio::test]
async fn reentrant_lock_smoke() {
    let report = run(&[
        "--clients",
        "3",
        "--primitive",
        "reentrant-lock",
        "--rounds",
        "2",
        "--hold-ms",
        "1",
    ])
    .await;

    assert!(report.passed, "{}", report.human_summary());
    assert_eq!(report.totals.grants, 6);
}

#[tokio::test]
async fn semaphore_smoke() {
    let report = run(&[
        "--clients",
        "5",
        "--primitive",
        "semaphore",
        "--permits",
        "2",
        "--rounds",
        "2",
        "--hold-ms",
        "5",
    ])
    .await;

    assert!(report.passed, "{}", report.human_summary());
    assert!(report.totals.peak_holders <= 2);
    assert_eq!(report.totals.grants, 10);
}
