use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::{MovePhase, SearchInfo, StderrAnalyzer, Variation, pv_to_sgf};

static VARIATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"([A-Z][0-9]{1,2}) ->\s*([0-9]+) \(V:\s*([.0-9]+)%\) \(N:\s*([.0-9]+)%\).*PV:((?: [a-zA-Z][0-9]{1,2})+)",
    )
    .expect("valid regex")
});
static DEPTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9.]+) average depth, ([0-9]+) max depth").expect("valid regex"));
static CHILDREN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([0-9]+) non leaf nodes, ([0-9.]+) average children").expect("valid regex")
});
static VISITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+) visits, ([0-9]+) nodes").expect("valid regex"));
static DUMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Playouts: ([0-9]+), Win:\s+([.0-9]+)%.*, PV:((?:\s[A-Z][0-9]{1,2})+)")
        .expect("valid regex")
});
static ANALYZE_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-zA-Z]+) ([A-Z][0-9]{1,2}|pass|PASS|-?\d+\.\d+(?:e-?\d+)?|[0-9]+)")
        .expect("valid regex")
});
static INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").expect("valid regex"));

/// KataGo の探索ログ（候補手一覧と木の統計）。`play` と `genmove` で同じ文法。
#[derive(Debug, Default)]
pub struct KataGoAnalyzer;

impl StderrAnalyzer for KataGoAnalyzer {
    fn name(&self) -> &'static str {
        "katago"
    }

    fn analyze(&self, _phase: MovePhase, line: &str, board_size: u32, info: &mut SearchInfo) {
        if let Some(caps) = VARIATION.captures(line) {
            info.variations.push(Variation {
                mv: caps[1].to_string(),
                rollouts: caps[2].parse().unwrap_or(0),
                win_rate: caps[3].parse().unwrap_or(0.0),
                policy: caps[4].parse().ok(),
                pv: pv_to_sgf(caps[5].split_whitespace(), board_size),
            });
        } else if let Some(caps) = DEPTH.captures(line) {
            info.average_depth = caps[1].parse().ok();
            info.max_depth = caps[2].parse().ok();
        } else if let Some(caps) = CHILDREN.captures(line) {
            info.non_leaf_nodes = caps[1].parse().ok();
            info.average_children = caps[2].parse().ok();
        } else if let Some(caps) = VISITS.captures(line) {
            info.visits = caps[1].parse().ok();
            info.nodes = caps[2].parse().ok();
        }
    }

    /// `N visits, M nodes` が探索ログの最後の要約行
    fn is_complete(&self, _phase: MovePhase, info: &SearchInfo) -> bool {
        info.visits.is_some()
    }
}

/// `Playouts: ..., Win: ...%, ..., PV: ...` 形式の要約行
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpSummary {
    pub nodes: u64,
    pub win_rate: f64,
    pub pv: Vec<String>,
}

impl DumpSummary {
    pub fn parse(line: &str) -> Option<Self> {
        let caps = DUMP.captures(line)?;
        Some(Self {
            nodes: caps[1].parse().ok()?,
            win_rate: caps[2].parse().ok()?,
            pv: caps[3].split_whitespace().map(str::to_string).collect(),
        })
    }
}

/// `kata-analyze` の候補手1つ分。キーはエンジンが出したものをそのまま使う。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KataMoveInfo {
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
    pub pv: Vec<String>,
}

impl KataMoveInfo {
    pub fn vertex(&self) -> Option<&str> {
        self.values.get("move").and_then(Value::as_str)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }
}

/// `kata-analyze` が stdout に流す `info ... pv ... [ownership ...]` 行
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KataAnalysis {
    pub infos: Vec<KataMoveInfo>,
    pub ownership: Vec<f64>,
}

impl KataAnalysis {
    /// `info` を含まない行は `None`。
    pub fn parse(line: &str) -> Option<Self> {
        if !line.contains("info") {
            return None;
        }
        let (pre_ownership, ownership) = match line.split_once("ownership ") {
            Some((pre, own)) => (pre, Some(own)),
            None => (line, None),
        };
        let mut analysis = KataAnalysis {
            infos: Vec::new(),
            ownership: ownership
                .map(|own| own.split_whitespace().filter_map(|e| e.parse().ok()).collect())
                .unwrap_or_default(),
        };
        for chunk in pre_ownership.split("info ") {
            if chunk.trim().is_empty() {
                continue;
            }
            let (pre_pv, pv) = match chunk.split_once("pv ") {
                Some((pre, pv)) => (pre, pv),
                None => (chunk, ""),
            };
            let mut info = KataMoveInfo {
                values: BTreeMap::new(),
                pv: pv.split_whitespace().map(str::to_string).collect(),
            };
            for caps in ANALYZE_FIELD.captures_iter(pre_pv) {
                let key = caps[1].to_string();
                let raw = &caps[2];
                let value = if key == "winrate" {
                    raw.parse::<f64>().ok().map(|w| Value::from(w * 100.0))
                } else if INTEGER.is_match(raw) {
                    raw.parse::<i64>().ok().map(Value::from)
                } else if let Ok(f) = raw.parse::<f64>() {
                    Some(Value::from(f))
                } else if raw.eq_ignore_ascii_case("pass") {
                    Some(Value::from("PASS"))
                } else {
                    Some(Value::from(raw))
                };
                if let Some(value) = value {
                    info.values.insert(key, value);
                }
            }
            if !info.values.is_empty() || !info.pv.is_empty() {
                analysis.infos.push(info);
            }
        }
        Some(analysis)
    }
}
