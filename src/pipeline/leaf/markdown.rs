//! Markdown passthrough: decode and normalise whitespace only.

use super::text::decode;
use crate::error::LeafError;

pub fn convert(bytes: &[u8]) -> Result<String, LeafError> {
    let text = decode(bytes)?;
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let body = lines.join("\n");
    let body = body.trim_end_matches('\n');
    Ok(format!("{body}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_space_and_adds_final_newline() {
        assert_eq!(convert(b"# Title   \n\n- item\t\n").unwrap(), "# Title\n\n- item\n");
    }

    #[test]
    fn keeps_markup_untouched() {
        let src = "| a | b |\n|---|---|\n| 1 | 2 |\n";
        assert_eq!(convert(src.as_bytes()).unwrap(), src);
    }
}
