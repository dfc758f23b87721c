//! GTP の意味的な操作と手番の管理
//!
//! [`Session`] は1つのエンジンプロセスを所有する。操作はすべて `&mut self` を取るため、
//! 着手コマンドが同時に2つ走ることは型で防がれる（診断フックは常に1つだけ有効）。
//! 待たずに続けてコマンドを投げたい場合は [`Session::submit`] を使う。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use rgtp_sgf::{GameRecord, StoneColor, vertex_to_sgf};
use serde::Serialize;

use crate::analyzer::{AnalyzerHook, MovePhase, SearchInfo, StderrAnalyzer};
use crate::config::EngineConfig;
use crate::error::{ExitInfo, GtpError};
use crate::pipeline::{DiagnosticHook, PendingReply, Reply, StderrHook, StdoutHook};
use crate::transport::{LineTransport, ProcessHandle, await_exit};

/// 先頭の着手トークン。`Q16 (book)` のような後続は読み捨てる。
static MOVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^((?i:pass)|[a-zA-Z][0-9]{1,2})\b").expect("valid regex"));

/// `genmove_from` の結果の座標表記
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `Q16` 形式
    #[default]
    Gtp,
    /// `pd` 形式。パスは空文字列
    Sgf,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gtp" => Ok(OutputFormat::Gtp),
            "sgf" => Ok(OutputFormat::Sgf),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// `kgs-time_settings` の時間制度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KgsTimeSystem {
    None,
    Absolute { main: u32 },
    ByoYomi { main: u32, period: u32, periods: u32 },
    Canadian { main: u32, byoyomi: u32, stones: u32 },
}

impl fmt::Display for KgsTimeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            KgsTimeSystem::None => f.write_str("none"),
            KgsTimeSystem::Absolute { main } => write!(f, "absolute {main}"),
            KgsTimeSystem::ByoYomi {
                main,
                period,
                periods,
            } => write!(f, "byoyomi {main} {period} {periods}"),
            KgsTimeSystem::Canadian {
                main,
                byoyomi,
                stones,
            } => write!(f, "canadian {main} {byoyomi} {stones}"),
        }
    }
}

/// `genmove` の結果。診断統計は同じ階層に展開してシリアライズする。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoveResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "move")]
    pub mv: String,
    #[serde(flatten)]
    pub info: SearchInfo,
}

impl MoveResult {
    pub fn is_resign(&self) -> bool {
        self.mv == "resign"
    }
}

/// 1つのエンジンプロセスとの GTP セッション
pub struct Session {
    config: EngineConfig,
    transport: LineTransport,
    analyzer: Option<Arc<dyn StderrAnalyzer>>,
    turn: StoneColor,
    board_size: u32,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        let analyzer = config.analyzer.build();
        Self {
            config,
            transport: LineTransport::new(),
            analyzer,
            turn: StoneColor::Black,
            board_size: rgtp_sgf::DEFAULT_BOARD_SIZE,
        }
    }

    /// 設定の `analyzer` の代わりに任意の analyzer を使う。
    pub fn with_analyzer(mut self, analyzer: Arc<dyn StderrAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn turn(&self) -> StoneColor {
        self.turn
    }

    pub fn board_size(&self) -> u32 {
        self.board_size
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }

    /// 別タスクから強制終了するためのハンドル
    pub fn handle(&self) -> ProcessHandle {
        self.transport.handle()
    }

    /// 設定の引数に `extra_args` を足してプロセスを起動する。
    pub fn start(&mut self, extra_args: &[String]) -> Result<(), GtpError> {
        self.transport.start(&self.config, extra_args)
    }

    /// 応答を待たずにコマンドを投げる。返り値は送信順に解決される。
    pub fn submit(
        &self,
        text: &str,
        diagnostic: Option<Box<dyn DiagnosticHook>>,
        stdout: Option<StdoutHook>,
    ) -> Result<PendingReply, GtpError> {
        self.transport.submit(text, diagnostic, stdout)
    }

    pub async fn command(&mut self, text: &str) -> Result<Reply, GtpError> {
        self.submit(text, None, None)?.await
    }

    /// 盤を初期化するので手番は黒に戻る。
    pub async fn boardsize(&mut self, size: u32) -> Result<Reply, GtpError> {
        let reply = self.command(&format!("boardsize {size}")).await?;
        self.board_size = size;
        self.turn = StoneColor::Black;
        Ok(reply)
    }

    /// 置石を置く。成功すると白番になる。
    pub async fn set_free_handicap(&mut self, vertices: &[String]) -> Result<Reply, GtpError> {
        let reply = self.command(&format!("set_free_handicap {}", vertices.join(" "))).await?;
        self.turn = StoneColor::White;
        Ok(reply)
    }

    pub async fn komi(&mut self, komi: f64) -> Result<Reply, GtpError> {
        self.command(&format!("komi {komi}")).await
    }

    pub async fn time_settings(&mut self, main: u32, byoyomi: u32, stones: u32) -> Result<Reply, GtpError> {
        self.command(&format!("time_settings {main} {byoyomi} {stones}")).await
    }

    pub async fn kgs_time_settings(&mut self, system: KgsTimeSystem) -> Result<Reply, GtpError> {
        self.command(&format!("kgs-time_settings {system}")).await
    }

    /// 盤サイズ・置石・コミを設定する。
    ///
    /// 置石があれば白番から始まり、コミ未指定なら 0 を送る。
    /// 置石が無ければ黒番から始まり、コミは指定された時だけ送る。
    pub async fn set_conditions(
        &mut self,
        size: u32,
        handicap: &[String],
        komi: Option<f64>,
    ) -> Result<(), GtpError> {
        self.boardsize(size).await?;
        if handicap.is_empty() {
            self.turn = StoneColor::Black;
            if let Some(komi) = komi {
                self.komi(komi).await?;
            }
        } else {
            self.set_free_handicap(handicap).await?;
            self.komi(komi.unwrap_or(0.0)).await?;
        }
        Ok(())
    }

    /// 現在の手番で `vertex` に打つ。成功した時だけ手番が替わる。
    pub async fn play(&mut self, vertex: &str) -> Result<Reply, GtpError> {
        let hook = self.hook(MovePhase::Play, None);
        let text = format!("play {} {vertex}", self.turn);
        let reply = self.submit(&text, hook, None)?.await?;
        self.turn = self.turn.opponent();
        Ok(reply)
    }

    /// 現在の手番の着手を生成させる。成功した時だけ手番が替わる。
    pub async fn genmove(&mut self) -> Result<MoveResult, GtpError> {
        self.genmove_with(None, None).await
    }

    /// [`Session::genmove`] に加えて、stderr の各行を `on_stderr` に、
    /// stdout の各行を `on_stdout` にも流す（analyzer の集計はそのまま行う）。
    pub async fn genmove_with(
        &mut self,
        on_stderr: Option<StderrHook>,
        on_stdout: Option<StdoutHook>,
    ) -> Result<MoveResult, GtpError> {
        let hook = self.hook(MovePhase::Genmove, on_stderr);
        let text = format!("genmove {}", self.turn);
        let reply = self.submit(&text, hook, on_stdout)?.await?;
        let mv = canonical_move(&reply.response.body)?;
        self.turn = self.turn.opponent();
        Ok(MoveResult {
            id: reply.response.id,
            mv,
            info: reply.diagnostics.unwrap_or_default(),
        })
    }

    /// `kata-analyze` を開始する。解析行は次のコマンドを送るまで `on_line` に流れる。
    pub async fn kata_analyze(&mut self, centisec: u32, on_line: StdoutHook) -> Result<Reply, GtpError> {
        self.submit(&format!("kata-analyze {centisec}"), None, Some(on_line))?.await
    }

    /// 棋譜の対局条件を設定し、本譜を順に打つ。
    pub async fn replay_from(&mut self, record: &GameRecord) -> Result<(), GtpError> {
        let handicap = record.handicap_vertices().map_err(GtpError::record)?;
        let moves = record.move_vertices().map_err(GtpError::record)?;
        self.set_conditions(record.size, &handicap, record.komi).await?;
        for vertex in &moves {
            self.play(vertex).await?;
        }
        log::debug!("replayed {} move(s); {} to play", moves.len(), self.turn);
        Ok(())
    }

    /// 棋譜の局面で次の一手を生成させ、エンジンを終了させる。
    ///
    /// 起動していなければここで起動する。途中で失敗した場合はプロセスを強制終了してからエラーを返す。
    /// `on_stderr` は `genmove` の間だけ stderr の各行を受け取る。
    pub async fn genmove_from(
        &mut self,
        record: &GameRecord,
        byoyomi: Option<u32>,
        format: OutputFormat,
        on_stderr: Option<StderrHook>,
    ) -> Result<MoveResult, GtpError> {
        if !self.is_running() {
            self.start(&[])?;
        }
        let result = self.genmove_and_quit(record, byoyomi, format, on_stderr).await;
        if let Err(err) = &result {
            log::warn!("genmove_from failed: {err}");
            if let Err(err) = self.terminate().await {
                log::warn!("failed to terminate engine: {err}");
            }
        }
        result
    }

    async fn genmove_and_quit(
        &mut self,
        record: &GameRecord,
        byoyomi: Option<u32>,
        format: OutputFormat,
        on_stderr: Option<StderrHook>,
    ) -> Result<MoveResult, GtpError> {
        self.replay_from(record).await?;
        if let Some(byoyomi) = byoyomi.filter(|&b| b > 0) {
            self.time_settings(0, byoyomi, 1).await?;
        }
        let mut result = self.genmove_with(on_stderr, None).await?;
        if format == OutputFormat::Sgf && !result.is_resign() {
            result.mv = vertex_to_sgf(&result.mv, self.board_size).map_err(GtpError::record)?;
        }
        self.quit().await?;
        Ok(result)
    }

    /// `quit` を送り、応答ではなくプロセスの終了を待つ。
    pub async fn quit(&mut self) -> Result<ExitInfo, GtpError> {
        let exited = self.transport.exit_waiter();
        // 応答より先に終了することがあるので応答は待たない
        let _reply = self.submit("quit", None, None)?;
        await_exit(exited).await
    }

    /// 強制終了する。プロセスが無ければ `None`。
    pub async fn terminate(&mut self) -> Result<Option<ExitInfo>, GtpError> {
        self.transport.terminate().await
    }

    fn hook(&self, phase: MovePhase, listener: Option<StderrHook>) -> Option<Box<dyn DiagnosticHook>> {
        AnalyzerHook::new(self.analyzer.clone(), listener, phase, self.board_size)
            .map(|hook| Box::new(hook) as Box<dyn DiagnosticHook>)
    }
}

/// `genmove` の応答本文を着手に正規化する。着手として読めない本文は [`GtpError::Protocol`]。
fn canonical_move(body: &str) -> Result<String, GtpError> {
    if body.to_ascii_lowercase().contains("resign") {
        return Ok("resign".to_string());
    }
    match MOVE.captures(body.trim()) {
        Some(caps) => Ok(caps[1].to_ascii_uppercase()),
        None => Err(GtpError::Protocol(format!("unrecognized genmove reply: {body:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_canonicalization() {
        assert_eq!(canonical_move("pass").unwrap(), "PASS");
        assert_eq!(canonical_move("q16").unwrap(), "Q16");
        assert_eq!(canonical_move(" D4 ").unwrap(), "D4");
        assert_eq!(canonical_move("Q16 (book)").unwrap(), "Q16");
        assert_eq!(canonical_move("Resign").unwrap(), "resign");
    }

    #[test]
    fn unrecognized_genmove_reply_is_a_protocol_error() {
        for body in ["q164", "", "??", "passing"] {
            assert!(
                matches!(canonical_move(body), Err(GtpError::Protocol(_))),
                "{body:?}"
            );
        }
    }

    #[test]
    fn kgs_time_settings_arity() {
        assert_eq!(KgsTimeSystem::None.to_string(), "none");
        assert_eq!(KgsTimeSystem::Absolute { main: 600 }.to_string(), "absolute 600");
        assert_eq!(
            KgsTimeSystem::ByoYomi {
                main: 600,
                period: 30,
                periods: 5
            }
            .to_string(),
            "byoyomi 600 30 5"
        );
        assert_eq!(
            KgsTimeSystem::Canadian {
                main: 0,
                byoyomi: 300,
                stones: 25
            }
            .to_string(),
            "canadian 0 300 25"
        );
    }

    #[test]
    fn move_result_flattens_search_info() {
        let result = MoveResult {
            id: None,
            mv: "Q16".into(),
            info: SearchInfo {
                win_rate: Some(51.5),
                ..SearchInfo::default()
            },
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({"move": "Q16", "winRate": 51.5})
        );
    }

    #[test]
    fn output_format_from_str() {
        assert_eq!("sgf".parse::<OutputFormat>(), Ok(OutputFormat::Sgf));
        assert!("json".parse::<OutputFormat>().is_err());
    }

    #[tokio::test]
    async fn commands_without_process_fail_immediately() {
        let mut session = Session::new(EngineConfig::new("unused"));
        match session.boardsize(19).await {
            Err(GtpError::NoProcess { command }) => assert_eq!(command, "boardsize 19"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.board_size(), 19);
        assert!(matches!(session.quit().await, Err(GtpError::NoProcess { .. })));
        assert_eq!(session.terminate().await.unwrap(), None);
    }
}
