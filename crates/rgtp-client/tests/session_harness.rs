//! Session tests against the scripted `gtp_harness` engine.

#![cfg(feature = "cli")]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{T_TEST, harness, harness_with_log, log_lines, wait_for_log_line};
use rgtp_client::analyzer::KataAnalysis;
use rgtp_client::{AnalyzerKind, Framing, GameRecord, GtpError, OutputFormat, Session, StderrHook, StoneColor};

fn record(sgf: &str) -> GameRecord {
    GameRecord::from_sgf(sgf).expect("valid sgf")
}

#[tokio::test]
async fn replay_without_handicap_starts_with_black() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("harness.log");
    let mut session = Session::new(harness_with_log(&log, &[]));
    session.start(&[]).unwrap();

    session.replay_from(&record("(;SZ[9]KM[6.5];B[ee];W[cc];B[])")).await.unwrap();
    assert_eq!(session.board_size(), 9);
    assert_eq!(session.turn(), StoneColor::White);

    let result = session.genmove().await.unwrap();
    assert_eq!(result.mv, "D4");
    assert_eq!(session.turn(), StoneColor::Black);

    let exit = session.quit().await.unwrap();
    assert_eq!(exit.code, Some(0));
    assert!(!session.is_running());
    assert_eq!(
        log_lines(&log),
        vec![
            "start",
            "boardsize 9",
            "komi 6.5",
            "play black E5",
            "play white C7",
            "play black PASS",
            "genmove white",
            "quit",
        ]
    );
}

#[tokio::test]
async fn handicap_starts_with_white_and_komi_defaults_to_zero() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("harness.log");
    let mut session = Session::new(harness_with_log(&log, &[]));
    session.start(&[]).unwrap();

    session.replay_from(&record("(;SZ[9]AB[cc][gg])")).await.unwrap();
    assert_eq!(session.turn(), StoneColor::White);
    session.genmove().await.unwrap();
    session.quit().await.unwrap();

    assert_eq!(
        log_lines(&log),
        vec!["start", "boardsize 9", "set_free_handicap C7 G3", "komi 0", "genmove white", "quit"]
    );
}

#[tokio::test]
async fn no_handicap_and_no_komi_sends_no_komi() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("harness.log");
    let mut session = Session::new(harness_with_log(&log, &[]));
    session.start(&[]).unwrap();
    session.replay_from(&record("(;SZ[13])")).await.unwrap();
    assert_eq!(session.turn(), StoneColor::Black);
    session.quit().await.unwrap();
    assert_eq!(log_lines(&log), vec!["start", "boardsize 13", "quit"]);
}

#[tokio::test]
async fn failed_play_does_not_flip_turn() {
    let mut session = Session::new(harness(&[]));
    session.start(&[]).unwrap();
    session.set_conditions(9, &[], None).await.unwrap();

    match session.play("Z99").await {
        Err(GtpError::EngineFailure { id, reason }) => {
            assert_eq!(id, None);
            assert_eq!(reason, "illegal move");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.turn(), StoneColor::Black);

    session.play("E5").await.unwrap();
    assert_eq!(session.turn(), StoneColor::White);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn genmove_canonicalizes_the_move() {
    let mut session = Session::new(harness(&["--genmove", "pass", "--genmove", "q16", "--genmove", "resign"]));
    session.start(&[]).unwrap();
    assert_eq!(session.genmove().await.unwrap().mv, "PASS");
    assert_eq!(session.genmove().await.unwrap().mv, "Q16");
    let resign = session.genmove().await.unwrap();
    assert!(resign.is_resign());
    assert_eq!(session.turn(), StoneColor::White);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn numbered_multi_line_responses() {
    let config = rgtp_client::EngineConfig {
        framing: Framing::MultiLine,
        numbered_commands: true,
        ..harness(&[])
    };
    let mut session = Session::new(config);
    session.start(&[]).unwrap();

    let name = session.command("name").await.unwrap();
    assert_eq!(name.response.id, Some(1));
    assert_eq!(name.body(), "gtp_harness");

    let board = session.boardsize(5).await.unwrap();
    assert_eq!(board.response.id, Some(2));

    let board = session.command("showboard").await.unwrap();
    assert_eq!(board.response.id, Some(3));
    let lines: Vec<&str> = board.body().lines().collect();
    assert_eq!(lines.len(), 7);
    assert_eq!(lines[0], "A B C D E");
    assert_eq!(lines[1], " 5 . . . . .");

    match session.command("undo").await {
        Err(GtpError::EngineFailure { id, reason }) => {
            assert_eq!(id, Some(4));
            assert_eq!(reason, "unknown command");
        }
        other => panic!("unexpected {other:?}"),
    }
    session.quit().await.unwrap();
}

#[tokio::test]
async fn pipelined_commands_resolve_in_send_order() {
    let mut session = Session::new(harness(&[]));
    session.start(&[]).unwrap();

    let replies: Vec<_> = ["name", "protocol_version", "play black Z99", "boardsize 9", "play white A1"]
        .into_iter()
        .map(|cmd| session.submit(cmd, None, None).unwrap())
        .collect();
    let mut results = Vec::new();
    for reply in replies {
        results.push(reply.await);
    }

    assert_eq!(results[0].as_ref().unwrap().body(), "gtp_harness");
    assert_eq!(results[1].as_ref().unwrap().body(), "2");
    assert!(matches!(results[2], Err(GtpError::EngineFailure { .. })));
    assert_eq!(results[3].as_ref().unwrap().response.command, "boardsize 9");
    assert_eq!(results[4].as_ref().unwrap().response.command, "play white A1");
    session.quit().await.unwrap();
}

#[tokio::test]
async fn diagnostics_are_merged_into_genmove_result() {
    let config = rgtp_client::EngineConfig {
        analyzer: AnalyzerKind::KataGo,
        ..harness(&[
            "--genmove",
            "Q16",
            "--stderr",
            "Q16 ->     812 (V: 47.31%) (N: 22.10%) PV: Q16 D4",
            "--stderr",
            "1600 visits, 1034 nodes",
        ])
    };
    let mut session = Session::new(config);
    session.start(&[]).unwrap();

    let result = session.genmove().await.unwrap();
    assert_eq!(result.mv, "Q16");
    assert_eq!(result.info.visits, Some(1600));
    assert_eq!(result.info.nodes, Some(1034));
    assert_eq!(result.info.variations.len(), 1);
    assert_eq!(result.info.variations[0].pv, vec!["pd", "dp"]);

    // 次の着手コマンドにはフックが再登録できる
    let reply = session.play("D4").await.unwrap();
    assert_eq!(reply.diagnostics.unwrap().visits, Some(1600));
    session.quit().await.unwrap();
}

const KATAGO_CANDIDATE: &str = "Q16 ->     812 (V: 47.31%) (N: 22.10%) PV: Q16 D4";
const KATAGO_SUMMARY: &str = "1600 visits, 1034 nodes";

fn katago_harness(extra: &[&str]) -> rgtp_client::EngineConfig {
    let mut args = vec!["--genmove", "Q16", "--stderr", KATAGO_CANDIDATE, "--stderr", KATAGO_SUMMARY];
    args.extend_from_slice(extra);
    rgtp_client::EngineConfig {
        analyzer: AnalyzerKind::KataGo,
        ..harness(&args)
    }
}

#[tokio::test]
async fn diagnostics_survive_a_reply_that_races_ahead_of_stderr() {
    let mut session = Session::new(katago_harness(&["--stderr-settle-ms", "0"]));
    session.start(&[]).unwrap();
    for _ in 0..40 {
        let result = tokio::time::timeout(T_TEST, session.genmove()).await.unwrap().unwrap();
        assert_eq!(result.info.visits, Some(1600));
        assert_eq!(result.info.variations.len(), 1);
    }
    session.quit().await.unwrap();
}

#[tokio::test]
async fn diagnostics_written_after_the_reply_are_still_merged() {
    let mut session = Session::new(katago_harness(&["--stderr-late"]));
    session.start(&[]).unwrap();
    let result = session.genmove().await.unwrap();
    assert_eq!(result.mv, "Q16");
    assert_eq!(result.info.visits, Some(1600));
    assert_eq!(result.info.variations[0].pv, vec!["pd", "dp"]);
    assert_eq!(session.turn(), StoneColor::White);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn caller_stderr_listener_runs_next_to_the_analyzer() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut session = Session::new(katago_harness(&[]));
    session.start(&[]).unwrap();

    let listener: StderrHook = Box::new(move |line: &str| sink.lock().unwrap().push(line.to_string()));
    let result = session.genmove_with(Some(listener), None).await.unwrap();
    assert_eq!(result.info.visits, Some(1600));
    assert_eq!(*seen.lock().unwrap(), vec![KATAGO_CANDIDATE, KATAGO_SUMMARY]);

    // フックは1手分だけ。次の手の行は届かない
    session.genmove().await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn genmove_from_forwards_stderr_without_an_analyzer() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut session = Session::new(harness(&["--genmove", "Q16", "--stderr", "thinking..."]));
    let result = session
        .genmove_from(
            &record("(;SZ[19])"),
            None,
            OutputFormat::Gtp,
            Some(Box::new(move |line: &str| sink.lock().unwrap().push(line.to_string()))),
        )
        .await
        .unwrap();
    assert_eq!(result.mv, "Q16");
    assert!(result.info.is_empty());
    assert_eq!(*seen.lock().unwrap(), vec!["thinking..."]);
}

#[tokio::test]
async fn unrecognized_genmove_reply_keeps_the_turn() {
    let mut session = Session::new(harness(&["--genmove", "??", "--genmove", "C3"]));
    session.start(&[]).unwrap();
    assert!(matches!(session.genmove().await, Err(GtpError::Protocol(_))));
    assert_eq!(session.turn(), StoneColor::Black);
    assert_eq!(session.genmove().await.unwrap().mv, "C3");
    assert_eq!(session.turn(), StoneColor::White);
    session.quit().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn write_failure_reaches_every_pending_command_as_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("harness.log");
    let mut session = Session::new(harness_with_log(&log, &["--close-stdin-on", "genmove"]));
    session.start(&[]).unwrap();

    let genmove = session.submit("genmove black", None, None).unwrap();
    wait_for_log_line(&log, "stdin closed").await;
    let name = session.submit("name", None, None).unwrap();
    let (a, b) = tokio::time::timeout(T_TEST, async { (genmove.await, name.await) })
        .await
        .expect("pending commands settle after the write failure");

    for result in [a, b] {
        assert!(matches!(result, Err(GtpError::Io(_))), "unexpected {result:?}");
    }
    assert!(!session.is_running());
}

#[tokio::test]
async fn genmove_from_converts_to_sgf_and_quits() {
    let mut session = Session::new(harness(&["--genmove", "Q16"]));
    let result = session
        .genmove_from(&record("(;SZ[19];B[pd])"), Some(5), OutputFormat::Sgf, None)
        .await
        .unwrap();
    assert_eq!(result.mv, "pd");
    assert!(!session.is_running());
}

#[tokio::test]
async fn genmove_from_keeps_gtp_notation_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("harness.log");
    let mut session = Session::new(harness_with_log(&log, &["--genmove", "pass"]));
    let result = session
        .genmove_from(&record("(;SZ[19]KM[7.5])"), None, OutputFormat::Gtp, None)
        .await
        .unwrap();
    assert_eq!(result.mv, "PASS");
    assert_eq!(
        log_lines(&log),
        vec!["start", "boardsize 19", "komi 7.5", "genmove black", "quit"]
    );
}

#[tokio::test]
async fn exit_rejects_every_pending_command_with_the_same_status() {
    let mut session = Session::new(harness(&["--exit-on", "genmove", "--exit-code", "3"]));
    session.start(&[]).unwrap();

    let genmove = session.submit("genmove black", None, None).unwrap();
    let queued = session.submit("name", None, None).unwrap();
    let (a, b) = tokio::time::timeout(T_TEST, async { (genmove.await, queued.await) })
        .await
        .expect("pending commands settle on exit");

    for result in [a, b] {
        match result {
            Err(GtpError::ProcessExit(info)) => assert_eq!(info.code, Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(!session.is_running());
    assert_eq!(session.handle().exit_info().and_then(|i| i.code), Some(3));
    assert!(matches!(
        session.command("name").await,
        Err(GtpError::NoProcess { .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn terminate_interrupts_a_hung_engine() {
    let mut session = Session::new(harness(&["--hang-on", "genmove"]));
    session.start(&[]).unwrap();
    let pending = session.submit("genmove black", None, None).unwrap();

    let exit = session.terminate().await.unwrap().expect("process was running");
    assert_eq!(exit.signal, Some(libc::SIGINT));
    match pending.await {
        Err(GtpError::ProcessExit(info)) => assert_eq!(info, exit),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.terminate().await.unwrap(), None);
}

#[cfg(unix)]
#[tokio::test]
async fn configured_timeout_terminates_the_engine() {
    let config = rgtp_client::EngineConfig {
        timeout_ms: Some(300),
        ..harness(&["--hang-on", "genmove"])
    };
    let mut session = Session::new(config);
    session.start(&[]).unwrap();
    match tokio::time::timeout(T_TEST, session.genmove()).await.unwrap() {
        Err(GtpError::ProcessExit(info)) => assert_eq!(info.signal, Some(libc::SIGTERM)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.turn(), StoneColor::Black);
}

#[tokio::test]
async fn kata_analyze_lines_reach_the_stdout_hook() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut session = Session::new(harness(&[]));
    session.start(&[]).unwrap();

    let reply = session
        .kata_analyze(
            50,
            Box::new(move |line: &str| {
                if let Some(analysis) = KataAnalysis::parse(line) {
                    sink.lock().unwrap().push(analysis);
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(reply.body(), "");
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.command("name").await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].infos[0].vertex(), Some("D4"));
    assert_eq!(seen[1].ownership, vec![0.1, -0.2]);
    drop(seen);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let mut session = Session::new(harness(&[]));
    session.start(&[]).unwrap();
    assert!(matches!(session.start(&[]), Err(GtpError::AlreadyRunning)));
    session.quit().await.unwrap();
}
