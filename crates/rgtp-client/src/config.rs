//! エンジンバインディングの設定
//!
//! TOML ファイルから読むか、エンジン種別ごとの環境変数から組み立てる。
//!
//! ```toml
//! command = "/usr/local/bin/katago"
//! args = ["gtp", "-config", "gtp.cfg"]
//! work_dir = "/opt/katago"
//! timeout_ms = 60000
//! framing = "multi_line"
//! analyzer = "katago"
//! diagnostic_settle_ms = 200
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::analyzer::AnalyzerKind;
use crate::error::ConfigError;
use crate::response::Framing;

/// 1つのエンジンバインディングの起動設定
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// 実行ファイルのパス
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// 未指定なら呼び出し元のカレントディレクトリ
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// 経過したら SIGTERM を送る
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub framing: Framing,
    /// コマンドに連番 id を付けて送る
    #[serde(default)]
    pub numbered_commands: bool,
    #[serde(default)]
    pub analyzer: AnalyzerKind,
    /// 着手の応答の後、診断行の集計が終わるまで待つ最長時間
    #[serde(default = "default_diagnostic_settle_ms")]
    pub diagnostic_settle_ms: u64,
    /// 対応 OS（`std::env::consts::OS` の値）。空なら制限なし。
    #[serde(default)]
    pub platforms: Vec<String>,
}

impl EngineConfig {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            work_dir: None,
            timeout_ms: None,
            framing: Framing::default(),
            numbered_commands: false,
            analyzer: AnalyzerKind::None,
            diagnostic_settle_ms: default_diagnostic_settle_ms(),
            platforms: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 環境変数からエンジン種別ごとの既定設定を組み立てる。
    pub fn from_env(kind: EngineKind) -> Result<Self, ConfigError> {
        Self::from_env_with(kind, |key| std::env::var(key).ok())
    }

    /// `lookup` で環境変数を引く版。テストから差し替えられる。
    pub fn from_env_with(kind: EngineKind, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnv(key))
        };
        let config = match kind {
            EngineKind::Leela => Self {
                args: vec!["--gtp".to_string()],
                analyzer: AnalyzerKind::Leela,
                ..Self::new(var("LEELA_PATH")?)
            },
            EngineKind::Ray => Self {
                analyzer: AnalyzerKind::Ray,
                ..Self::new(var("RAY_PATH")?)
            },
            EngineKind::KataGo => Self {
                args: vec!["gtp".to_string()],
                work_dir: var("KATAGO_WORK_DIR").ok().map(PathBuf::from),
                analyzer: AnalyzerKind::KataGo,
                ..Self::new(var("KATAGO_PATH")?)
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// 起動前の検証。実行中のコマンドではこのエラーは出ない。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        let os = std::env::consts::OS;
        if !self.platforms.is_empty() && !self.platforms.iter().any(|p| p == os) {
            return Err(ConfigError::UnsupportedPlatform(os.to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|&ms| ms > 0).map(Duration::from_millis)
    }

    pub fn diagnostic_settle(&self) -> Duration {
        Duration::from_millis(self.diagnostic_settle_ms)
    }

    /// 引数に `arg` が無ければ先頭に足す（KataGo の `gtp` サブコマンド）。
    pub fn ensure_leading_arg(&mut self, arg: &str) {
        if !self.args.iter().any(|a| a == arg) {
            self.args.insert(0, arg.to_string());
        }
    }
}

fn default_diagnostic_settle_ms() -> u64 {
    200
}

/// 環境変数から設定できるエンジン
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Leela,
    Ray,
    KataGo,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leela" => Ok(EngineKind::Leela),
            "ray" => Ok(EngineKind::Ray),
            "katago" => Ok(EngineKind::KataGo),
            other => Err(format!("unknown engine kind: {other}")),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Leela => "leela",
            EngineKind::Ray => "ray",
            EngineKind::KataGo => "katago",
        })
    }
}
