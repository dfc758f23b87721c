use std::fmt;

use anyhow::{Context, Result, anyhow};

use crate::coord::sgf_to_vertex;
use crate::tree::parse_collection;

/// `SZ` が無い棋譜の盤サイズ
pub const DEFAULT_BOARD_SIZE: u32 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoneColor {
    Black,
    White,
}

impl StoneColor {
    pub fn opponent(self) -> Self {
        match self {
            StoneColor::Black => StoneColor::White,
            StoneColor::White => StoneColor::Black,
        }
    }

    /// GTP 引数としての表記
    pub fn as_str(self) -> &'static str {
        match self {
            StoneColor::Black => "black",
            StoneColor::White => "white",
        }
    }
}

impl fmt::Display for StoneColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 本譜の1手。`point` は SGF 座標で、空文字列はパス。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMove {
    pub color: StoneColor,
    pub point: String,
}

/// エンジンに再生させるための棋譜情報。
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub size: u32,
    /// `KM` が無ければ `None`
    pub komi: Option<f64>,
    /// 置石（`AB`、SGF 座標）
    pub handicap: Vec<String>,
    pub moves: Vec<RecordMove>,
}

impl GameRecord {
    /// SGF テキストの最初のゲーム木から棋譜を組み立てる。
    ///
    /// ルートノードの着手は無視し、ルートの第一子から本譜をたどる。
    pub fn from_sgf(text: &str) -> Result<Self> {
        let trees = parse_collection(text)?;
        let tree = &trees[0];
        let root = tree.root().ok_or_else(|| anyhow!("empty game tree"))?;

        let size = match root.get("SZ") {
            // 長方形盤 `19:13` は先頭だけを見る
            Some(sz) => sz
                .split(':')
                .next()
                .unwrap_or(sz)
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid SZ value {sz:?}"))?,
            None => DEFAULT_BOARD_SIZE,
        };
        let komi = root
            .get("KM")
            .map(|km| km.trim().parse::<f64>().with_context(|| format!("invalid KM value {km:?}")))
            .transpose()?;
        let handicap = root.values("AB").map(<[String]>::to_vec).unwrap_or_default();

        let moves = tree
            .main_line()
            .into_iter()
            .skip(1)
            .filter_map(|node| {
                // 空値 `B[]` はパスとしてそのまま採用する
                if let Some(point) = node.get("B") {
                    Some(RecordMove {
                        color: StoneColor::Black,
                        point: point.to_string(),
                    })
                } else {
                    node.get("W").map(|point| RecordMove {
                        color: StoneColor::White,
                        point: point.to_string(),
                    })
                }
            })
            .collect();

        Ok(Self {
            size,
            komi,
            handicap,
            moves,
        })
    }

    /// 置石を GTP 座標で返す。
    pub fn handicap_vertices(&self) -> Result<Vec<String>> {
        self.handicap.iter().map(|p| sgf_to_vertex(p, self.size)).collect()
    }

    /// 本譜の着手を GTP 座標で返す。
    pub fn move_vertices(&self) -> Result<Vec<String>> {
        self.moves.iter().map(|m| sgf_to_vertex(&m.point, self.size)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_reads_root_conditions_and_main_line() {
        let rec = GameRecord::from_sgf("(;GM[1]SZ[9]KM[7];B[ee];W[];B[cc](;W[gg])(;W[gc]))").unwrap();
        assert_eq!(rec.size, 9);
        assert_eq!(rec.komi, Some(7.0));
        assert!(rec.handicap.is_empty());
        assert_eq!(rec.moves.len(), 4);
        assert_eq!(rec.moves[1].color, StoneColor::White);
        assert_eq!(rec.moves[1].point, "");
        assert_eq!(rec.move_vertices().unwrap(), vec!["E5", "PASS", "C7", "G3"]);
    }

    #[test]
    fn defaults_when_root_is_bare() {
        let rec = GameRecord::from_sgf("(;AB[dd][pp];W[dp])").unwrap();
        assert_eq!(rec.size, DEFAULT_BOARD_SIZE);
        assert_eq!(rec.komi, None);
        assert_eq!(rec.handicap_vertices().unwrap(), vec!["D16", "Q4"]);
        assert_eq!(rec.moves, vec![RecordMove { color: StoneColor::White, point: "dp".into() }]);
    }

    #[test]
    fn nodes_without_moves_are_skipped() {
        let rec = GameRecord::from_sgf("(;SZ[13];C[comment];B[aa])").unwrap();
        assert_eq!(rec.moves.len(), 1);
        assert_eq!(rec.move_vertices().unwrap(), vec!["A13"]);
    }

    #[test]
    fn invalid_size_is_an_error() {
        assert!(GameRecord::from_sgf("(;SZ[abc])").is_err());
        assert!(GameRecord::from_sgf("(;KM[x])").is_err());
    }

    #[test]
    fn color_display_and_opponent() {
        assert_eq!(StoneColor::Black.to_string(), "black");
        assert_eq!(StoneColor::Black.opponent(), StoneColor::White);
    }
}
