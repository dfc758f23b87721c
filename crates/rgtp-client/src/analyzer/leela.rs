use once_cell::sync::Lazy;
use regex::Regex;

use super::{MovePhase, SearchInfo, StderrAnalyzer, Variation, pv_to_sgf};

static VARIATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Z][0-9]{1,2}) ->\s*([0-9]+) \(W:\s*([.0-9]+)%\).*PV:((?: [a-zA-Z][0-9]{1,2})+)")
        .expect("valid regex")
});
static SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"visits, score\s*(-?[0-9.]+).*PV:((?: [a-zA-Z][0-9]{1,2})+)").expect("valid regex")
});

/// Leela の探索ログ。`genmove` では定跡手の通知も拾う。
#[derive(Debug, Default)]
pub struct LeelaAnalyzer;

impl StderrAnalyzer for LeelaAnalyzer {
    fn name(&self) -> &'static str {
        "leela"
    }

    fn analyze(&self, phase: MovePhase, line: &str, board_size: u32, info: &mut SearchInfo) {
        if phase == MovePhase::Genmove && line.contains("book moves") {
            info.comment = Some("book moves".to_string());
            return;
        }
        if let Some(caps) = VARIATION.captures(line) {
            info.variations.push(Variation {
                mv: caps[1].to_string(),
                rollouts: caps[2].parse().unwrap_or(0),
                win_rate: caps[3].parse().unwrap_or(0.0),
                policy: None,
                pv: pv_to_sgf(caps[4].split_whitespace(), board_size),
            });
        } else if let Some(caps) = SUMMARY.captures(line) {
            info.win_rate = caps[1].parse().ok();
            info.pv = Some(pv_to_sgf(caps[2].split_whitespace(), board_size));
        }
    }

    fn is_complete(&self, _phase: MovePhase, info: &SearchInfo) -> bool {
        info.pv.is_some()
    }
}
