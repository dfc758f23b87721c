//! GTP エンジンのセッションドライバ
//!
//! - [`transport`]: プロセスの起動、stdout / stderr の行分割、終了処理
//! - [`response`]: 応答ヘッダと複数行応答の状態機械
//! - [`pipeline`]: 送信済みコマンドの FIFO 照合と診断フック
//! - [`session`]: `boardsize` / `play` / `genmove` などの意味的な操作と手番
//! - [`analyzer`]: エンジンごとの stderr 文法
//! - [`scheduler`]: 接続ごとの着手要求を直列化するキャンセル可能なジョブキュー

pub mod analyzer;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod response;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use analyzer::{AnalyzerKind, MovePhase, SearchInfo, StderrAnalyzer, Variation};
pub use config::{EngineConfig, EngineKind};
pub use error::{ConfigError, ExitInfo, GtpError};
pub use pipeline::{CommandPipeline, DiagnosticHook, PendingReply, Reply, StderrHook, StdoutHook};
pub use response::{Framing, ParseEvent, Response, ResponseParser, Status};
pub use scheduler::{CancelableJob, JobTicket, MoveRequest, MoveScheduler, StderrListener};
pub use session::{KgsTimeSystem, MoveResult, OutputFormat, Session};
pub use transport::{LineTransport, ProcessHandle};

pub use rgtp_sgf::{GameRecord, StoneColor};
