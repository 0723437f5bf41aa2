//! Line styling for released records.

use once_cell::sync::Lazy;
use regex::Regex;
use trail_proto::{LineStyle, LogLevel, StyledLine};

use crate::level::LevelDetector;
use crate::types::RawLine;

static XML_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<((?:\w[\w-]*:)?\w[\w-]*)[^<>]*>").unwrap_or_else(|_| unreachable!())
});

/// Style the lines of a grouped record.
///
/// The first line carries the record level; the others are either part of
/// an XML span or plain text.
#[must_use]
pub fn style_group(lines: &[RawLine], level: Option<LogLevel>) -> Vec<StyledLine> {
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    let xml = xml_spans(&texts, 1);

    lines
        .iter()
        .zip(xml)
        .enumerate()
        .map(|(i, (line, in_xml))| {
            let style = if i == 0 {
                level.map_or(LineStyle::Plain, LineStyle::Level)
            } else if in_xml {
                LineStyle::Xml
            } else {
                LineStyle::Plain
            };
            StyledLine::new(line.text.clone(), style)
        })
        .collect()
}

/// Style the lines of a flat batch: each line by its own level, else XML or plain.
#[must_use]
pub fn style_flat(lines: &[RawLine], levels: &LevelDetector) -> Vec<StyledLine> {
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    let xml = xml_spans(&texts, 0);

    lines
        .iter()
        .zip(xml)
        .map(|(line, in_xml)| {
            let style = match levels.detect(&line.text) {
                Some(level) => LineStyle::Level(level),
                None if in_xml => LineStyle::Xml,
                None => LineStyle::Plain,
            };
            StyledLine::new(line.text.clone(), style)
        })
        .collect()
}

/// Mark lines belonging to a balanced XML element, scanning from `start`.
///
/// An element opens with `<name ...>` and ends at the first `</name>` on the
/// same or a following line. Every line from the opening one to the closing
/// one is marked. Unclosed elements mark nothing.
fn xml_spans(texts: &[&str], start: usize) -> Vec<bool> {
    let mut marks = vec![false; texts.len()];
    let mut i = start;

    while i < texts.len() {
        let Some(open) = XML_OPEN.captures(texts[i]) else {
            i += 1;
            continue;
        };
        let (Some(name), Some(whole)) = (open.get(1), open.get(0)) else {
            i += 1;
            continue;
        };

        let close = format!("</{}>", name.as_str());
        let self_closing = whole.as_str().ends_with("/>");
        let same_line = self_closing || texts[i][whole.end()..].contains(&close);

        let end = if same_line {
            Some(i)
        } else {
            texts[i + 1..]
                .iter()
                .position(|t| t.contains(&close))
                .map(|offset| i + 1 + offset)
        };

        match end {
            Some(end) => {
                marks[i..=end].fill(true);
                i = end + 1;
            }
            None => i += 1,
        }
    }

    marks
}
