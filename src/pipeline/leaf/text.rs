//! Plain text: encoding detection plus a light paragraph structure pass.
//!
//! Detection priority:
//! 1. BOM (UTF-8, UTF-16 LE/BE)
//! 2. UTF-8 validation
//! 3. chardetng statistical guess for legacy code pages

use crate::error::LeafError;
use chardetng::EncodingDetector;
use encoding_rs::Encoding;

/// Decode `bytes` to a `String`, detecting the encoding.
pub fn decode(bytes: &[u8]) -> Result<String, LeafError> {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, had_errors) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        if had_errors {
            return Err(LeafError::Decode(format!(
                "invalid {} sequence after BOM",
                encoding.name()
            )));
        }
        return Ok(text.into_owned());
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(text.to_string());
    }

    if bytes.contains(&0) {
        return Err(LeafError::Decode("binary content".into()));
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        tracing::debug!(encoding = encoding.name(), "lossy decode");
    }
    Ok(text.into_owned())
}

pub fn convert(bytes: &[u8]) -> Result<String, LeafError> {
    let text = decode(bytes)?;
    Ok(structure(&text))
}

/// Join wrapped lines into paragraphs and promote short standalone lines
/// to `##` headings.
fn structure(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let paragraphs: Vec<Vec<&str>> = text
        .split("\n\n")
        .map(|p| p.lines().map(str::trim).filter(|l| !l.is_empty()).collect())
        .collect();

    let (total, count) = paragraphs
        .iter()
        .flatten()
        .fold((0usize, 0usize), |(t, c), l| (t + l.chars().count(), c + 1));
    let avg = if count == 0 { 0.0 } else { total as f64 / count as f64 };

    let parts: Vec<String> = paragraphs
        .iter()
        .filter(|lines| !lines.is_empty())
        .map(|lines| match lines.as_slice() {
            [single] if is_heading(single, avg) => format!("## {single}"),
            _ => lines.join(" "),
        })
        .collect();

    format!("{}\n", parts.join("\n\n"))
}

fn is_heading(line: &str, avg_len: f64) -> bool {
    let has_letters = line.chars().any(char::is_alphabetic);
    if has_letters && line.chars().count() > 1 && line == line.to_uppercase() {
        return true;
    }
    avg_len > 0.0 && (line.chars().count() as f64) < avg_len * 0.4 && !line.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_utf8_bom() {
        assert_eq!(decode(b"\xEF\xBB\xBFhello").unwrap(), "hello");
    }

    #[test]
    fn decodes_utf16le_bom() {
        let bytes = [0xFF, 0xFE, b'h', 0, b'i', 0];
        assert_eq!(decode(&bytes).unwrap(), "hi");
    }

    #[test]
    fn decodes_legacy_latin1() {
        // "café crème" in windows-1252
        let bytes = b"caf\xe9 cr\xe8me au lait, une boisson tr\xe8s appr\xe9ci\xe9e";
        let text = decode(bytes).unwrap();
        assert!(text.starts_with("café crème"), "got: {text}");
    }

    #[test]
    fn rejects_binary() {
        assert!(decode(b"\xff\x00\xfe\x00\x00garbage\x81").is_err());
    }

    #[test]
    fn wraps_lines_and_detects_headings() {
        let src = "INTRODUCTION\n\nThis paragraph was wrapped\nacross two lines by an editor.\n\nScope\n\nAnother long paragraph that carries the real content here.";
        let out = convert(src.as_bytes()).unwrap();
        assert_eq!(
            out,
            "## INTRODUCTION\n\nThis paragraph was wrapped across two lines by an editor.\n\n## Scope\n\nAnother long paragraph that carries the real content here.\n"
        );
    }

    #[test]
    fn sentences_are_not_headings() {
        let src = "Ok.\n\nA much longer sentence that sets the average line length.";
        let out = convert(src.as_bytes()).unwrap();
        assert!(out.starts_with("Ok.\n\n"), "got: {out}");
    }
}
