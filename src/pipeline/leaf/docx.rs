//! Word documents: `word/document.xml` to Markdown.
//!
//! Headings come from `Heading1`..`Heading6` / `Title` paragraph styles,
//! list items from numbering properties (ordered vs bullet resolved through
//! `word/numbering.xml`), bold and italic from run properties, and tables
//! become GFM pipe tables with the first row as header.

use super::xml::{attr, is_on, open_package, read_part, xml_error};
use crate::error::LeafError;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

const FORMAT: &str = "docx";
const DOCUMENT_PART: &str = "word/document.xml";
const NUMBERING_PART: &str = "word/numbering.xml";

pub fn convert(bytes: &[u8]) -> Result<String, LeafError> {
    let mut package = open_package(FORMAT, bytes)?;
    let document = read_part(FORMAT, &mut package, DOCUMENT_PART)?.ok_or_else(|| {
        LeafError::Malformed {
            format: FORMAT,
            detail: format!("missing {DOCUMENT_PART}"),
        }
    })?;
    let numbering = match read_part(FORMAT, &mut package, NUMBERING_PART)? {
        Some(xml) => Numbering::parse(&xml)?,
        None => Numbering::default(),
    };

    let blocks = parse_body(&document, &numbering)?;
    Ok(render_blocks(&blocks))
}

// ── Numbering definitions ────────────────────────────────────────────────

/// `numId` → abstract definition → per-level format.
#[derive(Debug, Default)]
struct Numbering {
    nums: HashMap<String, String>,
    formats: HashMap<(String, u32), String>,
}

impl Numbering {
    fn parse(xml: &str) -> Result<Self, LeafError> {
        let mut out = Numbering::default();
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();
        let mut abstract_id: Option<String> = None;
        let mut level: Option<u32> = None;
        let mut num_id: Option<String> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                    match e.local_name().as_ref() {
                        b"abstractNum" => abstract_id = attr(e, b"abstractNumId"),
                        b"lvl" => level = attr(e, b"ilvl").and_then(|v| v.parse().ok()),
                        b"numFmt" => {
                            if let (Some(a), Some(l), Some(fmt)) =
                                (&abstract_id, level, attr(e, b"val"))
                            {
                                out.formats.insert((a.clone(), l), fmt);
                            }
                        }
                        b"num" => num_id = attr(e, b"numId"),
                        b"abstractNumId" => {
                            if let (Some(n), Some(a)) = (&num_id, attr(e, b"val")) {
                                out.nums.insert(n.clone(), a);
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                    b"abstractNum" => abstract_id = None,
                    b"lvl" => level = None,
                    b"num" => num_id = None,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(xml_error(FORMAT, NUMBERING_PART, e)),
                _ => {}
            }
            buf.clear();
        }
        Ok(out)
    }

    fn is_ordered(&self, num_id: &str, level: u32) -> bool {
        self.nums
            .get(num_id)
            .and_then(|a| self.formats.get(&(a.clone(), level)))
            .map(|fmt| fmt != "bullet" && fmt != "none")
            .unwrap_or(false)
    }
}

// ── Body model ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Block {
    Paragraph(String),
    ListItem(String),
    Table(Vec<Vec<String>>),
}

#[derive(Debug, Default)]
struct Segment {
    text: String,
    bold: bool,
    italic: bool,
}

#[derive(Debug, Default)]
struct Paragraph {
    style: Option<String>,
    num_id: Option<String>,
    level: u32,
    segments: Vec<Segment>,
}

impl Paragraph {
    fn push(&mut self, text: &str, bold: bool, italic: bool) {
        match self.segments.last_mut() {
            Some(last) if last.bold == bold && last.italic == italic => last.text.push_str(text),
            _ => self.segments.push(Segment {
                text: text.to_string(),
                bold,
                italic,
            }),
        }
    }

    fn plain_text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    fn inline_markdown(&self) -> String {
        self.segments
            .iter()
            .map(|s| emphasise(&s.text, s.bold, s.italic))
            .collect::<String>()
            .trim()
            .to_string()
    }

    fn heading_level(&self) -> Option<usize> {
        let style = self.style.as_deref()?.to_ascii_lowercase().replace(' ', "");
        match style.as_str() {
            "title" => Some(1),
            "subtitle" => Some(2),
            s => s
                .strip_prefix("heading")
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| (1..=6).contains(n)),
        }
    }

    /// `Some(ordered)` when the paragraph is a list item.
    fn list_kind(&self, numbering: &Numbering) -> Option<bool> {
        if let Some(num_id) = self.num_id.as_deref().filter(|id| *id != "0") {
            return Some(numbering.is_ordered(num_id, self.level));
        }
        let style = self.style.as_deref()?.to_ascii_lowercase().replace(' ', "");
        if style.starts_with("listbullet") {
            Some(false)
        } else if style.starts_with("listnumber") {
            Some(true)
        } else {
            None
        }
    }
}

/// Wrap `text` in emphasis markers, keeping surrounding spaces outside.
fn emphasise(text: &str, bold: bool, italic: bool) -> String {
    let marker = match (bold, italic) {
        (true, true) => "***",
        (true, false) => "**",
        (false, true) => "*",
        (false, false) => return text.to_string(),
    };
    let core = text.trim();
    if core.is_empty() {
        return text.to_string();
    }
    let lead = &text[..text.len() - text.trim_start().len()];
    let trail = &text[text.trim_end().len()..];
    format!("{lead}{marker}{core}{marker}{trail}")
}

// ── Parser ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Run {
    bold: bool,
    italic: bool,
}

fn parse_body(xml: &str, numbering: &Numbering) -> Result<Vec<Block>, LeafError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut blocks = Vec::new();
    let mut paragraph: Option<Paragraph> = None;
    let mut run: Option<Run> = None;
    let mut in_text = false;

    let mut table_depth = 0usize;
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell: Vec<String> = Vec::new();

    let mut counters: HashMap<(String, u32), usize> = HashMap::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| xml_error(FORMAT, DOCUMENT_PART, e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"p" if !is_empty => paragraph = Some(Paragraph::default()),
                    b"pStyle" => {
                        if let Some(p) = paragraph.as_mut() {
                            p.style = attr(e, b"val");
                        }
                    }
                    b"numId" => {
                        if let Some(p) = paragraph.as_mut() {
                            p.num_id = attr(e, b"val");
                        }
                    }
                    b"ilvl" => {
                        if let Some(p) = paragraph.as_mut() {
                            p.level = attr(e, b"val").and_then(|v| v.parse().ok()).unwrap_or(0);
                        }
                    }
                    b"r" if !is_empty => run = Some(Run::default()),
                    b"b" => {
                        if let Some(r) = run.as_mut() {
                            r.bold = is_on(e);
                        }
                    }
                    b"i" => {
                        if let Some(r) = run.as_mut() {
                            r.italic = is_on(e);
                        }
                    }
                    b"t" if !is_empty => in_text = true,
                    b"tab" | b"br" => {
                        if let (Some(p), Some(r)) = (paragraph.as_mut(), run.as_ref()) {
                            p.push(" ", r.bold, r.italic);
                        }
                    }
                    b"tbl" if !is_empty => {
                        table_depth += 1;
                        if table_depth == 1 {
                            rows.clear();
                        }
                    }
                    b"tr" if !is_empty && table_depth == 1 => row.clear(),
                    b"tc" if !is_empty && table_depth == 1 => cell.clear(),
                    _ => {}
                }
            }
            Event::Text(ref t) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|e| xml_error(FORMAT, DOCUMENT_PART, e))?;
                if let Some(p) = paragraph.as_mut() {
                    let (bold, italic) = run.as_ref().map(|r| (r.bold, r.italic)).unwrap_or_default();
                    p.push(&text, bold, italic);
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"r" => run = None,
                b"p" => {
                    if let Some(p) = paragraph.take() {
                        if table_depth > 0 {
                            let text = p.plain_text();
                            if !text.trim().is_empty() {
                                cell.push(text.trim().to_string());
                            }
                        } else if let Some(block) = paragraph_block(&p, numbering, &mut counters) {
                            blocks.push(block);
                        }
                    }
                }
                b"tc" if table_depth == 1 => row.push(cell.join(" ")),
                b"tr" if table_depth == 1 => rows.push(std::mem::take(&mut row)),
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 && !rows.is_empty() {
                        blocks.push(Block::Table(std::mem::take(&mut rows)));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(blocks)
}

fn paragraph_block(
    p: &Paragraph,
    numbering: &Numbering,
    counters: &mut HashMap<(String, u32), usize>,
) -> Option<Block> {
    let text = p.inline_markdown();
    if text.is_empty() {
        return None;
    }
    if let Some(level) = p.heading_level() {
        let plain = p.plain_text();
        return Some(Block::Paragraph(format!(
            "{} {}",
            "#".repeat(level),
            plain.trim()
        )));
    }
    match p.list_kind(numbering) {
        Some(ordered) => {
            let indent = "  ".repeat(p.level as usize);
            let marker = if ordered {
                let key = p.num_id.clone().unwrap_or_default();
                // A shallower item restarts every deeper counter of the list.
                counters.retain(|(id, lvl), _| *id != key || *lvl <= p.level);
                let n = counters.entry((key, p.level)).or_insert(0);
                *n += 1;
                format!("{n}.")
            } else {
                "-".to_string()
            };
            Some(Block::ListItem(format!("{indent}{marker} {text}")))
        }
        None => Some(Block::Paragraph(text)),
    }
}

// ── Rendering ────────────────────────────────────────────────────────────

fn render_blocks(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Block> = None;
    for block in blocks {
        if let Some(prev) = prev {
            let tight = matches!(
                (prev, block),
                (Block::ListItem(_), Block::ListItem(_))
            );
            out.push_str(if tight { "\n" } else { "\n\n" });
        }
        match block {
            Block::Paragraph(text) | Block::ListItem(text) => out.push_str(text),
            Block::Table(rows) => out.push_str(&render_table(rows)),
        }
        prev = Some(block);
    }
    if out.is_empty() {
        out
    } else {
        out.push('\n');
        out
    }
}

fn render_table(rows: &[Vec<String>]) -> String {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let line = |cells: &[String]| {
        let mut parts: Vec<String> = cells.iter().map(|c| escape_cell(c)).collect();
        parts.resize(width, String::new());
        format!("| {} |", parts.join(" | "))
    };
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(line(&rows[0]));
    lines.push(format!("|{}", " --- |".repeat(width)));
    lines.extend(rows[1..].iter().map(|r| line(r)));
    lines.join("\n")
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
