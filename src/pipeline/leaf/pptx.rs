//! PowerPoint decks: one `##` section per slide, in slide-number order.
//!
//! The slide title is the text of the shape with a `title`/`ctrTitle`
//! placeholder; every other paragraph on the slide becomes body text.
//! Slides are separated by horizontal rules.

use super::xml::{attr, open_package, read_part, xml_error};
use crate::error::LeafError;
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;

const FORMAT: &str = "pptx";

static RE_SLIDE_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").expect("valid regex"));

#[derive(Debug, Default, PartialEq)]
struct Slide {
    title: Option<String>,
    body: Vec<String>,
}

pub fn convert(bytes: &[u8]) -> Result<String, LeafError> {
    let mut package = open_package(FORMAT, bytes)?;

    let mut parts: Vec<(u32, String)> = package
        .file_names()
        .filter_map(|name| {
            let n = RE_SLIDE_PART.captures(name)?.get(1)?.as_str().parse().ok()?;
            Some((n, name.to_string()))
        })
        .collect();
    parts.sort_by_key(|(n, _)| *n);

    let mut sections = Vec::with_capacity(parts.len());
    for (index, (_, part)) in parts.iter().enumerate() {
        let Some(xml) = read_part(FORMAT, &mut package, part)? else {
            continue;
        };
        let slide = parse_slide(&xml, part)?;
        sections.push(render_slide(index + 1, &slide));
    }

    if sections.is_empty() {
        return Ok(String::new());
    }
    Ok(format!("{}\n", sections.join("\n\n---\n\n")))
}

fn parse_slide(xml: &str, part: &str) -> Result<Slide, LeafError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut slide = Slide::default();
    let mut shape_depth = 0usize;
    let mut shape_is_title = false;
    let mut shape_paragraphs: Vec<String> = Vec::new();
    let mut paragraph: Option<String> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"sp" => {
                    shape_depth += 1;
                    if shape_depth == 1 {
                        shape_is_title = false;
                        shape_paragraphs.clear();
                    }
                }
                b"ph" => {
                    if matches!(attr(e, b"type").as_deref(), Some("title") | Some("ctrTitle")) {
                        shape_is_title = true;
                    }
                }
                b"p" => paragraph = Some(String::new()),
                b"t" => in_text = true,
                b"br" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.push(' ');
                    }
                }
                _ => {}
            },
            Ok(Event::Text(ref t)) if in_text => {
                let text = t.unescape().map_err(|e| xml_error(FORMAT, part, e))?;
                if let Some(p) = paragraph.as_mut() {
                    p.push_str(&text);
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if let Some(p) = paragraph.take() {
                        let p = p.trim().to_string();
                        if p.is_empty() {
                            // skip
                        } else if shape_depth > 0 {
                            shape_paragraphs.push(p);
                        } else {
                            slide.body.push(p);
                        }
                    }
                }
                b"sp" => {
                    shape_depth = shape_depth.saturating_sub(1);
                    if shape_depth == 0 {
                        let paragraphs = std::mem::take(&mut shape_paragraphs);
                        if shape_is_title && slide.title.is_none() && !paragraphs.is_empty() {
                            slide.title = Some(paragraphs.join(" "));
                        } else {
                            slide.body.extend(paragraphs);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(FORMAT, part, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(slide)
}

fn render_slide(number: usize, slide: &Slide) -> String {
    let heading = match &slide.title {
        Some(title) => format!("## {title}"),
        None => format!("## Slide {number}"),
    };
    if slide.body.is_empty() {
        heading
    } else {
        format!("{heading}\n\n{}", slide.body.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const NS: &str = r#"xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main""#;

    fn shape(placeholder: Option<&str>, paragraphs: &[&str]) -> String {
        let ph = placeholder
            .map(|t| format!(r#"<p:nvPr><p:ph type="{t}"/></p:nvPr>"#))
            .unwrap_or_else(|| "<p:nvPr/>".to_string());
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<a:p><a:r><a:t>{p}</a:t></a:r></a:p>"))
            .collect();
        format!("<p:sp><p:nvSpPr>{ph}</p:nvSpPr><p:txBody>{body}</p:txBody></p:sp>")
    }

    fn deck(slides: &[(u32, String)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        zip.start_file("ppt/presentation.xml", opts).unwrap();
        for (n, shapes) in slides {
            zip.start_file(format!("ppt/slides/slide{n}.xml"), opts).unwrap();
            write!(zip, r#"<p:sld {NS}><p:cSld><p:spTree>{shapes}</p:spTree></p:cSld></p:sld>"#).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn slides_in_numeric_order_with_titles() {
        let bytes = deck(&[
            (10, shape(Some("title"), &["Wrap-up"])),
            (2, [shape(Some("ctrTitle"), &["Agenda"]), shape(None, &["Intro", "Q&amp;A"])].concat()),
            (1, shape(None, &["Untitled content"])),
        ]);
        let out = convert(&bytes).unwrap();
        assert_eq!(
            out,
            "## Slide 1\n\nUntitled content\n\n---\n\n## Agenda\n\nIntro\n\nQ&A\n\n---\n\n## Wrap-up\n"
        );
    }

    #[test]
    fn empty_deck_is_empty_output() {
        assert_eq!(convert(&deck(&[])).unwrap(), "");
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            convert(b"not a zip"),
            Err(LeafError::Malformed { format: "pptx", .. })
        ));
    }
}
