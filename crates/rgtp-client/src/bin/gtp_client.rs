use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rgtp_client::analyzer::KataAnalysis;
use rgtp_client::{EngineConfig, EngineKind, GameRecord, OutputFormat, Session, StderrHook};

/// SGF の局面を GTP エンジンに読ませて着手や解析を得るツール。
///
/// # よく使うコマンド例
///
/// - KataGo（`KATAGO_PATH` から起動）に次の一手を聞く:
///
///   `cargo run --release --bin gtp_client -- genmove --engine katago --sgf game.sgf --byoyomi 5`
///
/// - 設定ファイルのエンジンで本譜を再生し、各手の診断を JSON Lines で出す:
///
///   `cargo run --release --bin gtp_client -- replay --config leela.toml --sgf game.sgf`
#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a GTP engine from an SGF record")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 局面の次の一手を生成して JSON で出力する
    Genmove {
        #[command(flatten)]
        engine: EngineArgs,

        /// 秒読み（秒）
        #[arg(long)]
        byoyomi: Option<u32>,

        /// 出力する座標表記 (gtp|sgf)
        #[arg(long, default_value = "gtp")]
        format: OutputFormat,

        /// genmove 中のエンジンの stderr をそのまま stderr に流す
        #[arg(long)]
        echo_stderr: bool,
    },
    /// 本譜を再生し、各 `play` の応答と診断を1行ずつ JSON で出力する
    Replay {
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// 局面で `kata-analyze` を走らせ、解析行を JSON Lines で出力する
    Analyze {
        #[command(flatten)]
        engine: EngineArgs,

        /// 解析行の出力間隔（センチ秒）
        #[arg(long, default_value_t = 50)]
        interval: u32,

        /// 解析を続ける時間（ミリ秒）
        #[arg(long, default_value_t = 3000)]
        duration_ms: u64,
    },
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// 環境変数から設定するエンジン (katago|leela|ray)
    #[arg(long, conflicts_with = "config")]
    engine: Option<EngineKind>,

    /// エンジン設定 TOML
    #[arg(long)]
    config: Option<PathBuf>,

    /// SGF ファイル
    #[arg(long)]
    sgf: PathBuf,

    /// エンジンに追加で渡す引数
    #[arg(last = true)]
    extra_args: Vec<String>,
}

impl EngineArgs {
    fn engine_config(&self) -> Result<EngineConfig> {
        let config = match (&self.config, self.engine) {
            (Some(path), _) => EngineConfig::load(path)?,
            (None, Some(kind)) => EngineConfig::from_env(kind)?,
            (None, None) => bail!("either --engine or --config is required"),
        };
        Ok(config)
    }

    fn record(&self) -> Result<GameRecord> {
        let text = std::fs::read_to_string(&self.sgf)
            .with_context(|| format!("failed to read {}", self.sgf.display()))?;
        GameRecord::from_sgf(&text).with_context(|| format!("failed to parse {}", self.sgf.display()))
    }

    fn start_session(&self) -> Result<Session> {
        let mut config = self.engine_config()?;
        if self.engine == Some(EngineKind::KataGo) {
            config.ensure_leading_arg("gtp");
        }
        let mut session = Session::new(config);
        session
            .start(&self.extra_args)
            .context("failed to start engine")?;
        Ok(session)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Genmove {
            engine,
            byoyomi,
            format,
            echo_stderr,
        } => {
            let record = engine.record()?;
            let mut session = engine.start_session()?;
            let echo = echo_stderr.then(|| Box::new(|line: &str| eprintln!("{line}")) as StderrHook);
            let result = session.genmove_from(&record, byoyomi, format, echo).await?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Command::Replay { engine } => {
            let record = engine.record()?;
            let moves = record.move_vertices()?;
            let handicap = record.handicap_vertices()?;
            let mut session = engine.start_session()?;
            session.set_conditions(record.size, &handicap, record.komi).await?;
            for (ply, vertex) in moves.iter().enumerate() {
                let color = session.turn();
                let reply = session.play(vertex).await.with_context(|| format!("ply {}: {vertex}", ply + 1))?;
                let line = serde_json::json!({
                    "ply": ply + 1,
                    "color": color.as_str(),
                    "move": vertex,
                    "info": reply.diagnostics.unwrap_or_default(),
                });
                println!("{line}");
            }
            session.quit().await?;
        }
        Command::Analyze {
            engine,
            interval,
            duration_ms,
        } => {
            let record = engine.record()?;
            let mut session = engine.start_session()?;
            session.replay_from(&record).await?;
            session
                .kata_analyze(
                    interval,
                    Box::new(|line: &str| {
                        if let Some(analysis) = KataAnalysis::parse(line) {
                            match serde_json::to_string(&analysis) {
                                Ok(json) => println!("{json}"),
                                Err(err) => log::warn!("failed to encode analysis: {err}"),
                            }
                        }
                    }),
                )
                .await?;
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            session.quit().await?;
        }
    }
    Ok(())
}
