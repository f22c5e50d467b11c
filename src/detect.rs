//! Fragment detector: segments raw document text into typed candidate
//! fragments.
//!
//! Heuristics run in fixed priority order: balanced-brace JSON scanning
//! (with lenient repair), markup-table tag spans, generic XML root spans,
//! then per-line delimiter consistency for tabular blocks. A span claimed
//! by one heuristic is never
//! re-claimed by a later one. Unclaimed spans become `unknown` fragments so
//! the returned sequence covers the whole document in order.
//!
//! An optional classification oracle can re-score ambiguous fragments, but
//! its verdict is advisory: heuristic parse success is authoritative and
//! the oracle never reclassifies a span.

use std::time::Duration;

use serde_json::Value;

use crate::models::{Fragment, ShapeKind};
use crate::oracle::ClassificationOracle;
use crate::parse::{lenient_parse_json, split_delimited, DELIMITERS};

/// Confidence assigned per detection path.
const CONF_JSON: f64 = 1.0;
const CONF_JSON_REPAIRED: f64 = 0.9;
const CONF_MARKUP: f64 = 0.85;
const CONF_XML: f64 = 0.8;
const CONF_TABULAR: f64 = 0.7;

/// Fragments below this confidence are considered ambiguous and eligible
/// for oracle re-scoring.
const AMBIGUOUS_BELOW: f64 = 0.8;

/// Segment a document into an ordered, non-overlapping sequence of
/// fragments covering the whole text.
pub fn detect_fragments(text: &str) -> Vec<Fragment> {
    let lines = LineIndex::new(text);
    let mut claimed = vec![false; lines.len()];
    let mut fragments = Vec::new();

    scan_json(&lines, &mut claimed, &mut fragments);
    scan_markup_tables(&lines, &mut claimed, &mut fragments);
    scan_xml(&lines, &mut claimed, &mut fragments);
    scan_tabular(&lines, &mut claimed, &mut fragments);
    fill_unknown(&lines, &claimed, &mut fragments);

    fragments.sort_by_key(|f| f.start);
    tracing::debug!(count = fragments.len(), "detected fragments");
    fragments
}

/// Re-score ambiguous fragments with an advisory oracle call, bounded by
/// `timeout`. Failure or timeout degrades gracefully to heuristics-only.
pub async fn rescore_ambiguous(
    fragments: &mut [Fragment],
    text: &str,
    oracle: &dyn ClassificationOracle,
    timeout: Duration,
) {
    if !fragments.iter().any(|f| f.confidence < AMBIGUOUS_BELOW) {
        return;
    }

    let verdicts = match tokio::time::timeout(timeout, oracle.classify(text)).await {
        Ok(Ok(verdicts)) => verdicts,
        Ok(Err(e)) => {
            tracing::warn!(oracle = oracle.name(), error = %e, "oracle call failed, keeping heuristics");
            return;
        }
        Err(_) => {
            tracing::warn!(oracle = oracle.name(), "oracle call timed out, keeping heuristics");
            return;
        }
    };

    let lines = LineIndex::new(text);
    for fragment in fragments.iter_mut() {
        if fragment.confidence >= AMBIGUOUS_BELOW {
            continue;
        }
        for verdict in &verdicts {
            let (vstart, vend) = lines.byte_range_of_lines(verdict.start_line, verdict.end_line);
            let overlaps = vstart < fragment.end && fragment.start < vend;
            if overlaps && verdict.kind == fragment.kind {
                // Agreement raises confidence; the kind never changes.
                fragment.confidence = fragment.confidence.max(verdict.confidence.clamp(0.0, 0.95));
            }
        }
    }
}

/// Line-oriented view of the document with byte offsets per line.
struct LineIndex<'a> {
    lines: Vec<&'a str>,
    starts: Vec<usize>,
    total_len: usize,
}

impl<'a> LineIndex<'a> {
    fn new(text: &'a str) -> Self {
        let mut lines = Vec::new();
        let mut starts = Vec::new();
        let mut pos = 0;
        for line in text.split('\n') {
            starts.push(pos);
            lines.push(line);
            pos += line.len() + 1;
        }
        Self {
            lines,
            starts,
            total_len: text.len(),
        }
    }

    fn len(&self) -> usize {
        self.lines.len()
    }

    /// Byte range covering lines `first..=last` (indices).
    fn span(&self, first: usize, last: usize) -> (usize, usize) {
        let start = self.starts[first];
        let end = (self.starts[last] + self.lines[last].len()).min(self.total_len);
        (start, end)
    }

    /// Byte range for 1-based line numbers as reported by the oracle.
    fn byte_range_of_lines(&self, start_line: usize, end_line: usize) -> (usize, usize) {
        let first = start_line.saturating_sub(1).min(self.len().saturating_sub(1));
        let last = end_line.saturating_sub(1).min(self.len().saturating_sub(1));
        self.span(first.min(last), last.max(first))
    }

    fn text_of(&self, first: usize, last: usize) -> String {
        self.lines[first..=last].join("\n")
    }
}

fn claim(claimed: &mut [bool], first: usize, last: usize) {
    for flag in &mut claimed[first..=last] {
        *flag = true;
    }
}

/// Balanced-brace/bracket scan for top-level JSON values. Recoverable
/// malformations are repaired; repair failure demotes the span to
/// `unknown` rather than aborting.
fn scan_json(lines: &LineIndex<'_>, claimed: &mut [bool], fragments: &mut Vec<Fragment>) {
    let mut i = 0;
    while i < lines.len() {
        if claimed[i] {
            i += 1;
            continue;
        }
        let trimmed = lines.lines[i].trim_start();
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            i += 1;
            continue;
        }

        match find_balanced_end(lines, i) {
            Some(j) => {
                let candidate = lines.text_of(i, j);
                let (start, end) = lines.span(i, j);
                match lenient_parse_json(&candidate) {
                    Some((Value::Object(_) | Value::Array(_), repaired)) => {
                        fragments.push(Fragment {
                            kind: ShapeKind::Json,
                            start,
                            end,
                            text: candidate,
                            confidence: if repaired { CONF_JSON_REPAIRED } else { CONF_JSON },
                        });
                        claim(claimed, i, j);
                    }
                    _ => {
                        fragments.push(Fragment {
                            kind: ShapeKind::Unknown,
                            start,
                            end,
                            text: candidate,
                            confidence: 0.0,
                        });
                        claim(claimed, i, j);
                    }
                }
                i = j + 1;
            }
            // Never balances before EOF; leave the lines for later passes.
            None => i += 1,
        }
    }
}

/// Find the line index where braces/brackets opened at `first` return to
/// balance, tracking string literals so embedded braces don't count.
fn find_balanced_end(lines: &LineIndex<'_>, first: usize) -> Option<usize> {
    let mut depth: i64 = 0;
    let mut opened = false;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for (j, line) in lines.lines[first..].iter().enumerate() {
        for ch in line.chars() {
            if let Some(quote) = in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == quote {
                    in_string = None;
                }
                continue;
            }
            match ch {
                '"' | '\'' => in_string = Some(ch),
                '{' | '[' => {
                    depth += 1;
                    opened = true;
                }
                '}' | ']' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return Some(first + j);
        }
    }
    None
}

/// Claim `<table>…</table>` spans over unclaimed lines.
fn scan_markup_tables(lines: &LineIndex<'_>, claimed: &mut [bool], fragments: &mut Vec<Fragment>) {
    let mut i = 0;
    while i < lines.len() {
        if claimed[i] || !lines.lines[i].to_ascii_lowercase().contains("<table") {
            i += 1;
            continue;
        }
        let mut close = None;
        for j in i..lines.len() {
            if claimed[j] {
                break;
            }
            if lines.lines[j].to_ascii_lowercase().contains("</table") {
                close = Some(j);
                break;
            }
        }
        match close {
            Some(j) => {
                let (start, end) = lines.span(i, j);
                fragments.push(Fragment {
                    kind: ShapeKind::MarkupTable,
                    start,
                    end,
                    text: lines.text_of(i, j),
                    confidence: CONF_MARKUP,
                });
                claim(claimed, i, j);
                i = j + 1;
            }
            None => i += 1,
        }
    }
}

/// Root tag name of an XML-looking line, or `None` for declarations,
/// comments, and `<table>` (which the markup pass owns).
fn xml_root_name(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('<')?;
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':'))
        .unwrap_or(rest.len());
    let name = &rest[..end];
    if name.is_empty() || name.eq_ignore_ascii_case("table") {
        return None;
    }
    Some(name)
}

/// Claim spans from an XML root open tag to its matching close tag over
/// unclaimed lines. Runs after the markup pass, so `<table>` spans are
/// already taken.
fn scan_xml(lines: &LineIndex<'_>, claimed: &mut [bool], fragments: &mut Vec<Fragment>) {
    let mut i = 0;
    while i < lines.len() {
        if claimed[i] {
            i += 1;
            continue;
        }
        let Some(name) = xml_root_name(lines.lines[i]) else {
            i += 1;
            continue;
        };
        let close = format!("</{}", name);
        let mut end = None;
        for j in i..lines.len() {
            if claimed[j] {
                break;
            }
            if lines.lines[j].contains(&close) {
                end = Some(j);
                break;
            }
        }
        match end {
            Some(j) => {
                let (start, end) = lines.span(i, j);
                fragments.push(Fragment {
                    kind: ShapeKind::Xml,
                    start,
                    end,
                    text: lines.text_of(i, j),
                    confidence: CONF_XML,
                });
                claim(claimed, i, j);
                i = j + 1;
            }
            None => i += 1,
        }
    }
}

fn looks_structural(line: &str) -> bool {
    matches!(
        line.trim_start().chars().next(),
        Some('{') | Some('[') | Some('}') | Some(']') | Some('<')
    )
}

/// Per-line delimiter-frequency analysis: a block of two or more
/// consecutive lines that split consistently on the same delimiter.
fn scan_tabular(lines: &LineIndex<'_>, claimed: &mut [bool], fragments: &mut Vec<Fragment>) {
    let mut i = 0;
    while i < lines.len() {
        let line = lines.lines[i];
        if claimed[i] || line.trim().is_empty() || looks_structural(line) {
            i += 1;
            continue;
        }

        let delimiter = DELIMITERS
            .iter()
            .copied()
            .find(|&d| split_delimited(line, d).len() >= 2);
        let Some(delimiter) = delimiter else {
            i += 1;
            continue;
        };

        let mut j = i;
        while j + 1 < lines.len() {
            let next = lines.lines[j + 1];
            if claimed[j + 1]
                || next.trim().is_empty()
                || looks_structural(next)
                || split_delimited(next, delimiter).len() < 2
            {
                break;
            }
            j += 1;
        }

        if j > i {
            let (start, end) = lines.span(i, j);
            fragments.push(Fragment {
                kind: ShapeKind::Tabular,
                start,
                end,
                text: lines.text_of(i, j),
                confidence: CONF_TABULAR,
            });
            claim(claimed, i, j);
            i = j + 1;
        } else {
            i += 1;
        }
    }
}

/// Group remaining unclaimed lines into `unknown` fragments so fragments
/// cover the whole document.
fn fill_unknown(lines: &LineIndex<'_>, claimed: &[bool], fragments: &mut Vec<Fragment>) {
    let mut i = 0;
    while i < lines.len() {
        if claimed[i] {
            i += 1;
            continue;
        }
        let mut j = i;
        while j + 1 < lines.len() && !claimed[j + 1] {
            j += 1;
        }
        let text = lines.text_of(i, j);
        if !text.trim().is_empty() {
            let (start, end) = lines.span(i, j);
            fragments.push(Fragment {
                kind: ShapeKind::Unknown,
                start,
                end,
                text,
                confidence: 0.0,
            });
        }
        i = j + 1;
    }
}
