//! GTP 応答のパーサ（状態機械）
//!
//! stdout の1行ずつを受け取り、完結した [`Response`] を返す。
//! 複数行応答では、ヘッダ行から空行までを1つの応答として蓄積する。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([=?])([0-9]+)?(.*)$").expect("valid regex"));

/// 応答のフレーミング規則。エンジンごとにどちらかを選ぶ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// ヘッダ行だけで応答が完結する。後続の空行は読み捨てる。
    #[default]
    SingleLine,
    /// ヘッダ行から空行までを1つの応答とする。
    MultiLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// 応答を生んだコマンド文字列。パイプラインが照合時に埋める。
    pub command: String,
    pub status: Status,
    pub id: Option<u64>,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Response(Response),
    /// ヘッダの解釈に失敗した。最古の待機コマンドをこのメッセージで reject する。
    Error(String),
}

#[derive(Debug)]
enum ParserState {
    Idle,
    Accumulating(Response),
}

#[derive(Debug)]
pub struct ResponseParser {
    framing: Framing,
    state: ParserState,
}

impl ResponseParser {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            state: ParserState::Idle,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, ParserState::Accumulating(_))
    }

    /// 蓄積中の応答を捨てて idle に戻す。
    pub fn reset(&mut self) {
        self.state = ParserState::Idle;
    }

    pub fn feed(&mut self, line: &str) -> Option<ParseEvent> {
        match &mut self.state {
            ParserState::Accumulating(open) => {
                if line.trim().is_empty() {
                    let mut closed = match std::mem::replace(&mut self.state, ParserState::Idle) {
                        ParserState::Accumulating(resp) => resp,
                        ParserState::Idle => return None,
                    };
                    closed.body = closed.body.trim().to_string();
                    return Some(ParseEvent::Response(closed));
                }
                open.body.push('\n');
                open.body.push_str(line);
                None
            }
            ParserState::Idle => {
                // ヘッダ以外の行（診断出力の混入や応答後の空行）は無視する
                let caps = HEADER.captures(line)?;
                let status = if &caps[1] == "=" {
                    Status::Success
                } else {
                    Status::Failure
                };
                let id = match caps.get(2) {
                    Some(m) => match m.as_str().parse::<u64>() {
                        Ok(id) => Some(id),
                        Err(_) => {
                            return Some(ParseEvent::Error(format!(
                                "response id out of range: {line:?}"
                            )));
                        }
                    },
                    None => None,
                };
                let response = Response {
                    command: String::new(),
                    status,
                    id,
                    body: caps[3].trim().to_string(),
                };
                match self.framing {
                    Framing::SingleLine => Some(ParseEvent::Response(response)),
                    Framing::MultiLine => {
                        self.state = ParserState::Accumulating(response);
                        None
                    }
                }
            }
        }
    }
}
