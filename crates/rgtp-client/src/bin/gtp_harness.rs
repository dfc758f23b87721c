use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rgtp_sgf::vertex_to_sgf;

/// Minimal scripted GTP engine for exercising the session driver.
///
/// - 応答は常に `=`/`?` ヘッダ + 空行（id 付きで受けたら id を返す）
/// - `play` は盤外の座標を `? illegal move` で拒否する
/// - `genmove` は `--genmove` の値を順に返す（最後の値を繰り返す）
/// - `--stderr` の行を着手応答の前（`--stderr-late` なら後）に stderr に出す
/// - `--close-stdin-on` のコマンドを受けたら stdin を閉じ、以降は応答しない
#[derive(Parser, Debug)]
#[command(author, version, about = "Scripted GTP engine for driving rgtp-client")]
struct Cli {
    /// genmove の応答本文
    #[arg(long = "genmove", default_value = "D4")]
    genmove: Vec<String>,

    /// play / genmove の応答に合わせて stderr へ出す行
    #[arg(long = "stderr")]
    stderr_lines: Vec<String>,

    /// stderr を書いてから stdout に応答するまでの待ち時間（ミリ秒）
    #[arg(long, default_value_t = 50)]
    stderr_settle_ms: u64,

    /// `--stderr` の行を応答を書いた後に出す
    #[arg(long)]
    stderr_late: bool,

    /// genmove の思考時間（ミリ秒）
    #[arg(long, default_value_t = 0)]
    think_ms: u64,

    /// このコマンドを受け取ったら応答せずに終了する
    #[arg(long)]
    exit_on: Option<String>,

    /// `--exit-on` で終了する時の終了コード
    #[arg(long, default_value_t = 3)]
    exit_code: i32,

    /// このコマンドには応答しない
    #[arg(long)]
    hang_on: Option<String>,

    /// このコマンドを受け取ったら stdin を閉じ、応答せずに動き続ける
    #[arg(long)]
    close_stdin_on: Option<String>,

    /// 起動時に `start`、以降は受信したコマンドを追記するファイル
    #[arg(long)]
    log: Option<PathBuf>,
}

struct Harness {
    cli: Cli,
    size: u32,
    genmove_index: usize,
    log: Option<File>,
}

impl Harness {
    fn record(&mut self, line: &str) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            writeln!(log, "{line}")?;
            log.flush()?;
        }
        Ok(())
    }

    fn emit_diagnostics(&self) -> Result<()> {
        if self.cli.stderr_late {
            return Ok(());
        }
        self.write_stderr()?;
        // 別パイプの stdout 応答より先に読まれるように待つ
        if !self.cli.stderr_lines.is_empty() && self.cli.stderr_settle_ms > 0 {
            thread::sleep(Duration::from_millis(self.cli.stderr_settle_ms));
        }
        Ok(())
    }

    fn emit_late_diagnostics(&self, name: &str) -> Result<()> {
        if self.cli.stderr_late && matches!(name, "play" | "genmove") {
            self.write_stderr()?;
        }
        Ok(())
    }

    fn write_stderr(&self) -> Result<()> {
        let mut stderr = io::stderr();
        for line in &self.cli.stderr_lines {
            writeln!(stderr, "{line}")?;
        }
        stderr.flush()?;
        Ok(())
    }

    fn next_genmove(&mut self) -> String {
        let last = self.cli.genmove.len().saturating_sub(1);
        let mv = self.cli.genmove.get(self.genmove_index.min(last)).cloned();
        self.genmove_index += 1;
        mv.unwrap_or_else(|| "pass".to_string())
    }

    /// 1コマンドを処理し、応答（成功/失敗と本文）を返す。`None` は応答しない。
    fn handle(&mut self, name: &str, args: &[&str], out: &mut impl Write) -> Result<Option<(bool, String)>> {
        let reply = match name {
            "protocol_version" => (true, "2".to_string()),
            "name" => (true, "gtp_harness".to_string()),
            "version" => (true, env!("CARGO_PKG_VERSION").to_string()),
            "boardsize" => match args.first().and_then(|s| s.parse::<u32>().ok()) {
                Some(size) if (2..=25).contains(&size) => {
                    self.size = size;
                    (true, String::new())
                }
                _ => (false, "unacceptable size".to_string()),
            },
            "clear_board" | "komi" | "time_settings" | "kgs-time_settings" => (true, String::new()),
            "set_free_handicap" => {
                if args.iter().all(|v| self.on_board(v)) && !args.is_empty() {
                    (true, String::new())
                } else {
                    (false, "bad vertex list".to_string())
                }
            }
            "play" => {
                self.emit_diagnostics()?;
                match args {
                    [color, vertex] if is_color(color) && self.on_board(vertex) => (true, String::new()),
                    _ => (false, "illegal move".to_string()),
                }
            }
            "genmove" => {
                if self.cli.think_ms > 0 {
                    thread::sleep(Duration::from_millis(self.cli.think_ms));
                }
                self.emit_diagnostics()?;
                (true, self.next_genmove())
            }
            "showboard" => {
                let letters: Vec<String> = rgtp_sgf::COLUMN_LETTERS
                    .chars()
                    .take(self.size as usize)
                    .map(String::from)
                    .collect();
                let header = format!("   {}", letters.join(" "));
                let mut body = vec![header.clone()];
                for row in (1..=self.size).rev() {
                    body.push(format!("{row:>2} {}", vec!["."; self.size as usize].join(" ")));
                }
                body.push(header);
                (true, format!("\n{}", body.join("\n")))
            }
            "kata-analyze" => {
                writeln!(out, "=")?;
                writeln!(out, "info move D4 visits 12 winrate 0.51 scoreLead 0.5 pv D4 Q16")?;
                writeln!(out, "info move Q16 visits 8 winrate 0.49 pv Q16 D4 ownership 0.1 -0.2")?;
                writeln!(out)?;
                out.flush()?;
                return Ok(None);
            }
            _ => (false, "unknown command".to_string()),
        };
        Ok(Some(reply))
    }

    fn on_board(&self, vertex: &str) -> bool {
        vertex_to_sgf(vertex, self.size).is_ok()
    }
}

fn is_color(s: &str) -> bool {
    matches!(s.to_ascii_lowercase().as_str(), "b" | "w" | "black" | "white")
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let log = match &cli.log {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => None,
    };
    let mut harness = Harness {
        cli,
        size: 19,
        genmove_index: 0,
        log,
    };
    harness.record("start")?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        harness.record(line)?;

        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        let id = match tokens.first().and_then(|t| t.parse::<u64>().ok()) {
            Some(id) => {
                tokens.remove(0);
                Some(id)
            }
            None => None,
        };
        let Some((&name, args)) = tokens.split_first() else {
            continue;
        };

        if harness.cli.exit_on.as_deref() == Some(name) {
            std::process::exit(harness.cli.exit_code);
        }
        if harness.cli.hang_on.as_deref() == Some(name) {
            continue;
        }
        if harness.cli.close_stdin_on.as_deref() == Some(name) {
            close_stdin();
            harness.record("stdin closed")?;
            // 親の書き込みは EPIPE になる。kill されるまで生き続ける
            loop {
                thread::sleep(Duration::from_secs(1));
            }
        }
        if name == "quit" {
            write_reply(&mut stdout, id, true, "")?;
            break;
        }
        if let Some((ok, body)) = harness.handle(name, args, &mut stdout)? {
            write_reply(&mut stdout, id, ok, &body)?;
            harness.emit_late_diagnostics(name)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn close_stdin() {
    // SAFETY: 以降 fd 0 は読まない
    unsafe {
        libc::close(libc::STDIN_FILENO);
    }
}

#[cfg(not(unix))]
fn close_stdin() {}

fn write_reply(out: &mut impl Write, id: Option<u64>, ok: bool, body: &str) -> Result<()> {
    let marker = if ok { '=' } else { '?' };
    let id = id.map(|id| id.to_string()).unwrap_or_default();
    let header = format!("{marker}{id} {body}");
    writeln!(out, "{}", header.trim_end())?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
