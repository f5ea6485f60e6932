use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    CompoundNumeric,
    Numeric,
    Chapter,
    Roman,
    Parenthesized,
    Letter,
    Bullet,
    /// No label matched; `number` is the synthesized running number.
    Synthesized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub number: String,
    pub title: String,
    pub original_line: String,
    pub index: usize,
    pub label_kind: LabelKind,
}

struct LabelPattern {
    kind: LabelKind,
    regex: Regex,
}

// Capture group 1 is the raw label. Order is precedence: the first match wins.
static LABEL_PATTERNS: LazyLock<Vec<LabelPattern>> = LazyLock::new(|| {
    [
        (LabelKind::CompoundNumeric, r"^(\d+[-.]\d+\.?)"),
        (LabelKind::Numeric, r"^(\d+\.)"),
        (LabelKind::Chapter, r"^(第\d+[章節]\.?)"),
        (LabelKind::Roman, r"^([IVXLC]+\.?)(?:\s|$)"),
        (LabelKind::Parenthesized, r"^(\(\d+\)|\d+\))"),
        (LabelKind::Letter, r"^([a-zA-Z]\))"),
        (LabelKind::Bullet, r"^([*•-])"),
    ]
    .into_iter()
    .filter_map(|(kind, pattern)| match Regex::new(pattern) {
        Ok(regex) => Some(LabelPattern { kind, regex }),
        Err(err) => {
            tracing::error!(pattern, error = %err, "invalid label pattern; skipping");
            None
        }
    })
    .collect()
});

/// Splits outline text into one [`Section`] per non-empty line.
///
/// Never rejects input: a line that matches no label pattern gets its
/// 1-based position as a synthesized number and the whole line as its title.
pub fn parse(outline_text: &str) -> Vec<Section> {
    let sections = outline_text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| parse_line(index, line))
        .collect::<Vec<_>>();

    tracing::info!(sections = sections.len(), "parsed outline");
    sections
}

fn parse_line(index: usize, line: &str) -> Section {
    let (number, title, label_kind) = match match_label(line) {
        Some((kind, raw_label, rest)) => {
            let title = if rest.is_empty() { line } else { rest };
            (normalize_label(raw_label), title.to_owned(), kind)
        }
        None => (
            (index + 1).to_string(),
            line.to_owned(),
            LabelKind::Synthesized,
        ),
    };

    tracing::debug!(index, number = %number, kind = ?label_kind, "outline line");

    Section {
        id: format!("section_{}", index + 1),
        number,
        title,
        original_line: line.to_owned(),
        index,
        label_kind,
    }
}

fn match_label(line: &str) -> Option<(LabelKind, &str, &str)> {
    LABEL_PATTERNS.iter().find_map(|pattern| {
        let label = pattern.regex.captures(line)?.get(1)?;
        let rest = line[label.end()..].trim_start();
        Some((pattern.kind, label.as_str(), rest))
    })
}

fn normalize_label(raw: &str) -> String {
    let label = raw.strip_suffix(['.', ')']).unwrap_or(raw);
    let label = label.strip_prefix('(').unwrap_or(label);
    label.to_owned()
}
