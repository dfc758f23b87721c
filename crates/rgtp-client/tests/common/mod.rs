//! Common test utilities for rgtp-client integration tests

#![allow(dead_code)] // These utilities may be used by various test files

use std::path::Path;
use std::time::{Duration, Instant};

use rgtp_client::EngineConfig;

/// Overall per-test timeout for CI stability
pub const T_TEST: Duration = Duration::from_secs(20);
/// Poll interval while waiting on the harness log
pub const T_POLL: Duration = Duration::from_millis(20);

/// `gtp_harness` を起動する設定
pub fn harness(args: &[&str]) -> EngineConfig {
    EngineConfig {
        args: args.iter().map(|s| s.to_string()).collect(),
        ..EngineConfig::new(env!("CARGO_BIN_EXE_gtp_harness"))
    }
}

/// `--log` に渡すパスを足した設定
pub fn harness_with_log(log: &Path, args: &[&str]) -> EngineConfig {
    let mut config = harness(args);
    config.args.push("--log".to_string());
    config.args.push(log.display().to_string());
    config
}

pub fn log_lines(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// ハーネスのログに `line` が現れるまで待つ
pub async fn wait_for_log_line(log: &Path, line: &str) {
    let start = Instant::now();
    while start.elapsed() < T_TEST {
        if log_lines(log).iter().any(|l| l == line) {
            return;
        }
        tokio::time::sleep(T_POLL).await;
    }
    panic!("harness never logged {line:?}; got {:?}", log_lines(log));
}
