//! GTP セッションのエラー型

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// プロセス終了時の情報。シグナルで落ちた場合は `code` が `None` になる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// セッション・パイプライン・スケジューラ共通のエラー。
///
/// プロセス終了のように1つの原因で複数の待機者を reject するため `Clone` にしている。
#[derive(thiserror::Error, Debug, Clone)]
pub enum GtpError {
    /// プロセスが起動していない状態でコマンドが投げられた
    #[error("no gtp process ({command})")]
    NoProcess { command: String },

    #[error("engine process is already running")]
    AlreadyRunning,

    #[error("failed to start engine: {0}")]
    Spawn(Arc<io::Error>),

    /// 実行中の入出力エラー
    #[error("engine i/o error: {0}")]
    Io(Arc<io::Error>),

    /// 応答待ちの間にプロセスが終了した
    #[error("engine process exited with {0}")]
    ProcessExit(ExitInfo),

    /// 応答ヘッダを解釈できなかった
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `?` 応答
    #[error("engine failure{}: {reason}", .id.map(|id| format!(" (id {id})")).unwrap_or_default())]
    EngineFailure { id: Option<u64>, reason: String },

    #[error("job canceled")]
    Canceled,

    /// 診断フックが既に有効な状態で別のフックを登録しようとした
    #[error("another diagnostic hook is already active")]
    DiagnosticBusy,

    #[error("game record error: {0}")]
    Record(String),
}

impl GtpError {
    pub(crate) fn no_process(command: &str) -> Self {
        GtpError::NoProcess {
            command: command.to_string(),
        }
    }

    pub(crate) fn record(err: anyhow::Error) -> Self {
        GtpError::Record(format!("{err:#}"))
    }
}

/// エンジン設定の読み込み・検証エラー。起動前にだけ発生する。
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("engine binding is not supported on {0}")]
    UnsupportedPlatform(String),

    #[error("engine command is empty")]
    EmptyCommand,

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid engine config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_failure_message_includes_id() {
        let err = GtpError::EngineFailure {
            id: Some(2),
            reason: "illegal move".into(),
        };
        assert_eq!(err.to_string(), "engine failure (id 2): illegal move");
        let err = GtpError::EngineFailure {
            id: None,
            reason: "unknown command".into(),
        };
        assert_eq!(err.to_string(), "engine failure: unknown command");
    }

    #[test]
    fn exit_info_display() {
        let exit = ExitInfo {
            code: Some(0),
            signal: None,
        };
        assert_eq!(GtpError::ProcessExit(exit).to_string(), "engine process exited with exit code 0");
        let killed = ExitInfo {
            code: None,
            signal: Some(2),
        };
        assert_eq!(killed.to_string(), "signal 2");
    }
}
