use once_cell::sync::Lazy;
use regex::Regex;

use super::{MovePhase, SearchInfo, StderrAnalyzer, pv_to_sgf};

static VERTEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Z][0-9]{1,2}").expect("valid regex"));
static WINNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Winning Percentage :\s*([0-9.]+)%").expect("valid regex"));

/// Ray の思考ログ。`genmove` の最善応手列と勝率だけを拾う。
#[derive(Debug, Default)]
pub struct RayAnalyzer;

impl StderrAnalyzer for RayAnalyzer {
    fn name(&self) -> &'static str {
        "ray"
    }

    fn analyze(&self, phase: MovePhase, line: &str, board_size: u32, info: &mut SearchInfo) {
        if phase != MovePhase::Genmove {
            return;
        }
        if let Some(rest) = line.strip_prefix("Best Sequence :") {
            let pv = pv_to_sgf(VERTEX.find_iter(rest).map(|m| m.as_str()), board_size);
            info.pv.get_or_insert_with(Vec::new).extend(pv);
        } else if let Some(caps) = WINNING.captures(line) {
            info.win_rate = caps[1].parse().ok();
        }
    }

    /// `play` では何も拾わないので待たない。`genmove` は勝率の行で終わる。
    fn is_complete(&self, phase: MovePhase, info: &SearchInfo) -> bool {
        phase != MovePhase::Genmove || info.win_rate.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_sequence_and_winning_percentage() {
        let mut info = SearchInfo::default();
        RayAnalyzer.analyze(MovePhase::Genmove, "Best Sequence : C3(120) -> D7(80) -> G3(40)", 9, &mut info);
        assert!(!RayAnalyzer.is_complete(MovePhase::Genmove, &info));
        RayAnalyzer.analyze(MovePhase::Genmove, "Winning Percentage : 61.5%", 9, &mut info);
        assert!(RayAnalyzer.is_complete(MovePhase::Genmove, &info));
        assert_eq!(info.pv, Some(vec!["cg".to_string(), "dc".to_string(), "gg".to_string()]));
        assert_eq!(info.win_rate, Some(61.5));
    }

    #[test]
    fn play_phase_is_ignored() {
        let mut info = SearchInfo::default();
        RayAnalyzer.analyze(MovePhase::Play, "Winning Percentage : 61.5%", 9, &mut info);
        assert!(info.is_empty());
        assert!(RayAnalyzer.is_complete(MovePhase::Play, &info));
    }
}
