//! SGF 棋譜の読み込みと座標表記変換
//!
//! - [`parse_collection`]: SGF テキストをゲーム木の列に分解する
//! - [`GameRecord`]: ルートの盤サイズ・コミ・置石と本譜（第一子の連鎖）の着手列
//! - [`sgf_to_vertex`] / [`vertex_to_sgf`]: `pd` ⇔ `Q16` 形式の変換

mod coord;
mod record;
mod tree;

pub use coord::{COLUMN_LETTERS, PASS, is_pass, sgf_to_vertex, vertex_to_sgf};
pub use record::{DEFAULT_BOARD_SIZE, GameRecord, RecordMove, StoneColor};
pub use tree::{MAX_TREE_DEPTH, SgfNode, SgfTree, parse_collection};
