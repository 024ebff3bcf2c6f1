//! Post-processing: deterministic cleanup of page text and final assembly.
//!
//! ## Why is post-processing necessary?
//!
//! Both OCR output and embedded PDF text layers carry artefacts that are
//! noise for downstream consumers:
//!
//! - Running headers/footers such as `Page 3`, `p. 3`, `3/10`, `第3页`
//! - Windows-style `\r\n` line endings and trailing spaces
//! - Zero-width characters and soft hyphens from the PDF producer
//! - Long runs of blank lines where the recogniser saw whitespace
//!
//! Each rule is a pure `&str → String` pass, independently testable.
//!
//! ## Rule Order
//!
//! Line endings are normalised before any line-based rule runs; page markers
//! are removed before blank lines are collapsed so the gap they leave
//! disappears too.

use crate::config::PageSeparator;
use once_cell::sync::Lazy;
use regex::Regex;

/// Clean the text of a single page (OCR or text layer).
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Trim whitespace around each line
/// 4. Drop page-number marker lines
/// 5. Collapse 3+ consecutive newlines down to 2
pub fn clean_page_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_lines(&s);
    let s = remove_page_markers(&s);
    collapse_blank_lines(&s).trim().to_string()
}

/// Join cleaned pages as `## Page N` sections in page order.
///
/// Pages with no text after cleaning are omitted.
pub fn assemble_pages(pages: &[(usize, String)], separator: &PageSeparator) -> String {
    let mut out = String::new();
    let mut first = true;
    for (page, text) in pages {
        if text.trim().is_empty() {
            continue;
        }
        if !first {
            out.push_str(&separator.render(*page));
        }
        first = false;
        out.push_str(&format!("## Page {page}\n\n{}", text.trim()));
    }
    finish(&out)
}

/// Final normalisation for any assembled document.
pub fn finish(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Trim lines ───────────────────────────────────────────────────────

fn trim_lines(input: &str) -> String {
    input.lines().map(str::trim).collect::<Vec<_>>().join("\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Remove page-number markers ───────────────────────────────────────

static RE_PAGE_CJK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^第\s*\d+\s*页$").expect("valid regex"));
static RE_PAGE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:page|p\.)\s*\d+$").expect("valid regex"));
static RE_PAGE_FRACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,4})\s*/\s*(\d{1,4})$").expect("valid regex"));

/// Whether a trimmed line is only a page-number marker.
pub fn is_page_marker(line: &str) -> bool {
    let line = line.trim();
    if RE_PAGE_CJK.is_match(line) || RE_PAGE_WORD.is_match(line) {
        return true;
    }
    // "3/10" is a marker only when it reads as page-of-total; "12/5" is data.
    RE_PAGE_FRACTION
        .captures(line)
        .and_then(|c| {
            let n: u32 = c[1].parse().ok()?;
            let m: u32 = c[2].parse().ok()?;
            Some(n >= 1 && n <= m)
        })
        .unwrap_or(false)
}

fn remove_page_markers(input: &str) -> String {
    input
        .lines()
        .filter(|line| !is_page_marker(line))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 6: Ensure file ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_markers() {
        assert!(is_page_marker("Page 3"));
        assert!(is_page_marker("p. 12"));
        assert!(is_page_marker("  3 / 10 "));
        assert!(is_page_marker("第 4 页"));
        assert!(!is_page_marker("12/5"));
        assert!(!is_page_marker("0/3"));
        assert!(!is_page_marker("Page three of the report"));
    }

    #[test]
    fn test_clean_page_text() {
        let raw = "  Heading \r\n\r\n\r\n\r\nBody\u{200B} text\r\nPage 2\r\n";
        assert_eq!(clean_page_text(raw), "Heading\n\nBody text");
    }

    #[test]
    fn test_assemble_orders_and_separates() {
        let pages = vec![(1, "one".to_string()), (3, "three".to_string())];
        let out = assemble_pages(&pages, &PageSeparator::HorizontalRule);
        assert_eq!(out, "## Page 1\n\none\n\n---\n\n## Page 3\n\nthree\n");
    }

    #[test]
    fn test_assemble_skips_empty_pages() {
        let pages = vec![(1, "   ".to_string()), (2, "two".to_string())];
        let out = assemble_pages(&pages, &PageSeparator::HorizontalRule);
        assert_eq!(out, "## Page 2\n\ntwo\n");
    }

    #[test]
    fn test_finish() {
        assert_eq!(finish("a  \r\n\n\n\nb"), "a\n\nb\n");
        assert_eq!(finish("   \n"), "");
    }
}
