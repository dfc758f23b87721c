use std::iter::Peekable;
use std::str::Chars;

use anyhow::{Result, bail};

/// ゲーム木の入れ子の上限。深すぎる入力はエラーにする。
pub const MAX_TREE_DEPTH: usize = 1000;

/// SGF のノード。プロパティは出現順に保持する。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SgfNode {
    pub properties: Vec<(String, Vec<String>)>,
}

impl SgfNode {
    /// プロパティの最初の値。`B[]` のような空値は `Some("")` になり、「プロパティなし」とは区別される。
    pub fn get(&self, ident: &str) -> Option<&str> {
        self.values(ident).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn values(&self, ident: &str) -> Option<&[String]> {
        self.properties
            .iter()
            .find(|(id, _)| id == ident)
            .map(|(_, values)| values.as_slice())
    }
}

/// `( ノード列 子ゲーム木* )`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SgfTree {
    pub nodes: Vec<SgfNode>,
    pub variations: Vec<SgfTree>,
}

impl SgfTree {
    pub fn root(&self) -> Option<&SgfNode> {
        self.nodes.first()
    }

    /// 本譜（各分岐で最初の子をたどった連鎖）のノード列。ルートを含む。
    pub fn main_line(&self) -> Vec<&SgfNode> {
        let mut line = Vec::new();
        let mut tree = Some(self);
        while let Some(t) = tree {
            line.extend(t.nodes.iter());
            tree = t.variations.first();
        }
        line
    }
}

/// SGF コレクション（ゲーム木の列）をパースする。
pub fn parse_collection(text: &str) -> Result<Vec<SgfTree>> {
    let mut parser = Parser {
        chars: text.chars().peekable(),
    };
    let mut trees = Vec::new();
    loop {
        parser.skip_whitespace();
        match parser.chars.peek() {
            None => break,
            Some('(') => trees.push(parser.game_tree()?),
            Some(c) => bail!("unexpected character {c:?} outside of a game tree"),
        }
    }
    if trees.is_empty() {
        bail!("no game tree in SGF text");
    }
    Ok(trees)
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        match self.chars.next() {
            Some(c) if c == expected => Ok(()),
            Some(c) => bail!("expected {expected:?}, found {c:?}"),
            None => bail!("expected {expected:?}, found end of input"),
        }
    }

    /// 入れ子の子ゲーム木は再帰せず、開いている親を明示的なスタックに積んで読む。
    fn game_tree(&mut self) -> Result<SgfTree> {
        self.expect('(')?;
        let mut parents: Vec<SgfTree> = Vec::new();
        let mut tree = SgfTree::default();
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                Some(';') => {
                    self.chars.next();
                    if !tree.variations.is_empty() {
                        bail!("node after variations");
                    }
                    tree.nodes.push(self.node()?);
                }
                Some('(') => {
                    if parents.len() + 2 > MAX_TREE_DEPTH {
                        bail!("game tree nested deeper than {MAX_TREE_DEPTH}");
                    }
                    self.chars.next();
                    parents.push(std::mem::take(&mut tree));
                }
                Some(')') => {
                    self.chars.next();
                    if tree.nodes.is_empty() {
                        bail!("game tree without nodes");
                    }
                    match parents.pop() {
                        Some(parent) => {
                            let child = std::mem::replace(&mut tree, parent);
                            tree.variations.push(child);
                        }
                        None => return Ok(tree),
                    }
                }
                Some(c) => bail!("unexpected character {c:?} in game tree"),
                None => bail!("unterminated game tree"),
            }
        }
    }

    fn node(&mut self) -> Result<SgfNode> {
        let mut node = SgfNode::default();
        loop {
            self.skip_whitespace();
            let Some(&c) = self.chars.peek() else {
                break;
            };
            if !c.is_ascii_alphabetic() {
                break;
            }
            let mut ident = String::new();
            while let Some(&c) = self.chars.peek() {
                if !c.is_ascii_alphabetic() {
                    break;
                }
                // FF[3] 以前の小文字混じり識別子（`GaMe` 等）は大文字だけ残す
                if c.is_ascii_uppercase() {
                    ident.push(c);
                }
                self.chars.next();
            }
            let mut values = Vec::new();
            loop {
                self.skip_whitespace();
                if self.chars.peek() != Some(&'[') {
                    break;
                }
                self.chars.next();
                values.push(self.value()?);
            }
            if values.is_empty() {
                bail!("property {ident} without value");
            }
            node.properties.push((ident, values));
        }
        Ok(node)
    }

    fn value(&mut self) -> Result<String> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some('\\') => match self.chars.next() {
                    // 行継続
                    Some('\n') => {}
                    Some(c) => value.push(c),
                    None => bail!("unterminated property value"),
                },
                Some(']') => return Ok(value),
                Some(c) => value.push(c),
                None => bail!("unterminated property value"),
            }
        }
    }
}
