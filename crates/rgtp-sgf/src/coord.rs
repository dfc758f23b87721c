use anyhow::{Result, bail};

/// GTP の列記号。`I` は使わない。
pub const COLUMN_LETTERS: &str = "ABCDEFGHJKLMNOPQRSTUVWXYZ";

/// GTP のパス表記
pub const PASS: &str = "PASS";

const MAX_BOARD_SIZE: u32 = 25;

/// 大文字小文字を問わずパス表記かどうか。
pub fn is_pass(vertex: &str) -> bool {
    vertex.eq_ignore_ascii_case("pass")
}

/// SGF 座標（`pd`）を GTP 座標（`Q16`）に変換する。
///
/// 空文字列はパスを表し `PASS` を返す。19路以下では旧形式のパス `tt` も受け付ける。
pub fn sgf_to_vertex(point: &str, size: u32) -> Result<String> {
    if point.is_empty() || (size <= 19 && point == "tt") {
        return Ok(PASS.to_string());
    }
    check_size(size)?;
    let bytes = point.as_bytes();
    if bytes.len() != 2 {
        bail!("invalid SGF point {point:?}");
    }
    let x = sgf_index(bytes[0], point)?;
    let y = sgf_index(bytes[1], point)?;
    if x >= size || y >= size {
        bail!("SGF point {point:?} is outside a {size}x{size} board");
    }
    let column = COLUMN_LETTERS.as_bytes()[x as usize] as char;
    Ok(format!("{column}{}", size - y))
}

/// GTP 座標（`Q16`, `q16`）を SGF 座標（`pd`）に変換する。パスは空文字列になる。
pub fn vertex_to_sgf(vertex: &str, size: u32) -> Result<String> {
    if is_pass(vertex) {
        return Ok(String::new());
    }
    check_size(size)?;
    let mut chars = vertex.chars();
    let Some(column) = chars.next() else {
        bail!("empty vertex");
    };
    let Some(x) = COLUMN_LETTERS.find(column.to_ascii_uppercase()) else {
        bail!("invalid column in vertex {vertex:?}");
    };
    let digits = chars.as_str();
    // `parse` は `+5` も受け付けるので桁だけで構成されていることを先に確かめる
    if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid row in vertex {vertex:?}");
    }
    let row: u32 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid row in vertex {vertex:?}"))?;
    if x as u32 >= size || row == 0 || row > size {
        bail!("vertex {vertex:?} is outside a {size}x{size} board");
    }
    let sx = (b'a' + x as u8) as char;
    let sy = (b'a' + (size - row) as u8) as char;
    Ok(format!("{sx}{sy}"))
}

fn sgf_index(c: u8, point: &str) -> Result<u32> {
    if !c.is_ascii_lowercase() {
        bail!("invalid SGF point {point:?}");
    }
    Ok(u32::from(c - b'a'))
}

fn check_size(size: u32) -> Result<()> {
    if size == 0 || size > MAX_BOARD_SIZE {
        bail!("unsupported board size {size}");
    }
    Ok(())
}
