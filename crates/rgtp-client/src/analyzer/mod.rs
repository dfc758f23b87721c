//! エンジン固有の stderr 診断出力の解析
//!
//! 着手コマンドの応答待ちの間、stderr の各行が [`StderrAnalyzer`] に渡され、
//! [`SearchInfo`] に探索統計が蓄積される。文法はエンジンごとに異なるため、
//! セッション本体は行単位のコールバックしか知らない。

mod katago;
mod leela;
mod ray;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pipeline::{DiagnosticHook, StderrHook};

pub use katago::{DumpSummary, KataAnalysis, KataGoAnalyzer, KataMoveInfo};
pub use leela::LeelaAnalyzer;
pub use ray::RayAnalyzer;

/// どの着手コマンドに対する診断か
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovePhase {
    Play,
    Genmove,
}

/// 候補手1つ分の統計
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    #[serde(rename = "move")]
    pub mv: String,
    pub rollouts: u64,
    pub win_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<f64>,
    /// SGF 座標の読み筋
    pub pv: Vec<String>,
}

/// 1手分の探索統計。エンジンが出さなかった項目は `None` のまま残る。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_rate: Option<f64>,
    /// SGF 座標の読み筋
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pv: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variations: Vec<Variation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_depth: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_leaf_nodes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_children: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u64>,
}

impl SearchInfo {
    pub fn is_empty(&self) -> bool {
        *self == SearchInfo::default()
    }
}

/// エンジン1種類分の stderr 文法
pub trait StderrAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// stderr の1行を解析して `info` に反映する。関係ない行は無視する。
    fn analyze(&self, phase: MovePhase, line: &str, board_size: u32, info: &mut SearchInfo);

    /// 1手分の要約行まで読み終えたか。応答の後に届く診断行をいつまで待つかの判断に使う。
    fn is_complete(&self, _phase: MovePhase, _info: &SearchInfo) -> bool {
        false
    }
}

/// 設定ファイルで選ぶ analyzer の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    #[default]
    None,
    KataGo,
    Leela,
    Ray,
}

impl AnalyzerKind {
    pub fn build(self) -> Option<Arc<dyn StderrAnalyzer>> {
        match self {
            AnalyzerKind::None => None,
            AnalyzerKind::KataGo => Some(Arc::new(KataGoAnalyzer)),
            AnalyzerKind::Leela => Some(Arc::new(LeelaAnalyzer)),
            AnalyzerKind::Ray => Some(Arc::new(RayAnalyzer)),
        }
    }
}

/// analyzer と呼び出し側の stderr フックを束ねて [`DiagnosticHook`] として使うためのアダプタ。
pub(crate) struct AnalyzerHook {
    analyzer: Option<Arc<dyn StderrAnalyzer>>,
    listener: Option<StderrHook>,
    phase: MovePhase,
    board_size: u32,
    info: SearchInfo,
}

impl AnalyzerHook {
    /// どちらも無ければフックは要らないので `None`。
    pub(crate) fn new(
        analyzer: Option<Arc<dyn StderrAnalyzer>>,
        listener: Option<StderrHook>,
        phase: MovePhase,
        board_size: u32,
    ) -> Option<Self> {
        if analyzer.is_none() && listener.is_none() {
            return None;
        }
        Some(Self {
            analyzer,
            listener,
            phase,
            board_size,
            info: SearchInfo::default(),
        })
    }
}

impl DiagnosticHook for AnalyzerHook {
    fn on_line(&mut self, line: &str) {
        if let Some(analyzer) = &self.analyzer {
            analyzer.analyze(self.phase, line, self.board_size, &mut self.info);
        }
        if let Some(listener) = self.listener.as_mut() {
            listener(line);
        }
    }

    fn is_complete(&self) -> bool {
        self.analyzer
            .as_ref()
            .is_some_and(|analyzer| analyzer.is_complete(self.phase, &self.info))
    }

    fn finish(self: Box<Self>) -> SearchInfo {
        self.info
    }
}

/// GTP 座標の列を SGF 座標に変換する。盤外や解釈できないものは捨てる。
pub(crate) fn pv_to_sgf<'a>(vertices: impl IntoIterator<Item = &'a str>, board_size: u32) -> Vec<String> {
    vertices
        .into_iter()
        .filter_map(|v| rgtp_sgf::vertex_to_sgf(&v.to_ascii_uppercase(), board_size).ok())
        .collect()
}
