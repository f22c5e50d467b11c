//! Shape parsers: one pure function per fragment kind, dispatched over the
//! closed [`ShapeKind`] enum.
//!
//! Parsers are format-pure: tabular, markup, and XML values come out as raw
//! strings, JSON values keep their native types, and scalar inference is
//! left entirely to the canonicalizer. Adding a shape kind means adding one
//! enum variant and one function here.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;

use crate::canonical::coerces_to_scalar;
use crate::models::{FieldMap, Fragment, PipelineError, ShapeKind};

/// Candidate delimiters for tabular blocks, in tie-break priority order.
pub(crate) const DELIMITERS: &[char] = &[',', ';', '\t', '|'];

/// Parse a fragment's raw text into flat records.
///
/// Unknown fragments yield no records. A fragment whose parser yields zero
/// records is discarded by the orchestrator rather than propagated as an
/// empty shape.
pub fn parse_fragment(fragment: &Fragment) -> Result<Vec<FieldMap>, PipelineError> {
    match fragment.kind {
        ShapeKind::Json => parse_json(&fragment.text),
        ShapeKind::Tabular => parse_tabular(&fragment.text),
        ShapeKind::MarkupTable => parse_markup_table(&fragment.text),
        ShapeKind::Xml => parse_xml(&fragment.text),
        ShapeKind::Unknown => Ok(Vec::new()),
    }
}

// ============ JSON ============

/// Parse JSON text with one repair attempt for common malformations
/// (trailing commas, single quotes, unquoted keys).
///
/// Returns the parsed value and whether repair was needed.
pub(crate) fn lenient_parse_json(text: &str) -> Option<(Value, bool)> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some((value, false));
    }
    let repaired = repair_json(text);
    serde_json::from_str::<Value>(&repaired)
        .ok()
        .map(|v| (v, true))
}

/// Best-effort JSON repair: single-quoted strings become double-quoted,
/// bare object keys are quoted, and trailing commas before `}`/`]` are
/// dropped. Anything it cannot fix is left for the parser to reject.
pub(crate) fn repair_json(text: &str) -> String {
    let requoted = requote_strings(text);
    let keyed = quote_bare_keys(&requoted);
    strip_trailing_commas(&keyed)
}

fn requote_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_double || in_single => {
                out.push(ch);
                escaped = true;
            }
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push('"');
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(ch),
        }
    }
    out
}

fn quote_bare_keys(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut expect_key = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                expect_key = false;
                out.push(ch);
            }
            '{' => {
                stack.push('{');
                expect_key = true;
                out.push(ch);
            }
            '[' => {
                stack.push('[');
                expect_key = false;
                out.push(ch);
            }
            '}' | ']' => {
                stack.pop();
                expect_key = false;
                out.push(ch);
            }
            ',' => {
                expect_key = stack.last() == Some(&'{');
                out.push(ch);
            }
            ':' => {
                expect_key = false;
                out.push(ch);
            }
            c if expect_key && (c.is_ascii_alphabetic() || c == '_') => {
                let mut key = String::new();
                key.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' || next == '-' {
                        key.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push('"');
                out.push_str(&key);
                out.push('"');
                expect_key = false;
            }
            _ => out.push(ch),
        }
    }
    out
}

fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                // Drop the comma if the next non-whitespace char closes a
                // container.
                let mut lookahead = chars.clone();
                let mut closes = false;
                while let Some(&next) = lookahead.peek() {
                    if next.is_whitespace() {
                        lookahead.next();
                    } else {
                        closes = next == '}' || next == ']';
                        break;
                    }
                }
                if !closes {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

fn json_records(value: Value) -> Vec<FieldMap> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Value::Object(map) => vec![map],
        _ => Vec::new(),
    }
}

/// Accepts a top-level array of objects, a single object, or consecutive
/// single-line objects (NDJSON). Nested structures are preserved, never
/// flattened.
fn parse_json(text: &str) -> Result<Vec<FieldMap>, PipelineError> {
    if let Some((value, _)) = lenient_parse_json(text) {
        return Ok(json_records(value));
    }

    // NDJSON fallback: one object per non-empty line.
    let mut records = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match lenient_parse_json(trimmed) {
            Some((Value::Object(map), _)) => records.push(map),
            _ => {
                return Err(PipelineError::Parse {
                    kind: ShapeKind::Json,
                    reason: "not valid JSON after repair".to_string(),
                })
            }
        }
    }

    if records.is_empty() {
        return Err(PipelineError::Parse {
            kind: ShapeKind::Json,
            reason: "no JSON objects found".to_string(),
        });
    }
    Ok(records)
}

// ============ Tabular ============

/// Split one line into cells, honoring double-quoted cells with `""`
/// escapes.
pub(crate) fn split_delimited(line: &str, delimiter: char) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(ch);
            }
        } else if ch == '"' && current.is_empty() {
            in_quotes = true;
        } else if ch == delimiter {
            cells.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    cells.push(current);
    cells
}

/// Majority vote over sampled lines: the delimiter splitting the most lines
/// into two or more cells wins, ties broken by [`DELIMITERS`] order.
pub(crate) fn detect_delimiter(lines: &[&str]) -> Option<char> {
    let mut best: Option<(char, usize)> = None;
    for &delim in DELIMITERS {
        let votes = lines
            .iter()
            .filter(|line| split_delimited(line, delim).len() >= 2)
            .count();
        if votes >= 2 && best.map_or(true, |(_, b)| votes > b) {
            best = Some((delim, votes));
        }
    }
    best.map(|(d, _)| d)
}

/// Delimiter-separated block parser. The first row is the header unless any
/// of its cells coerces to a non-string scalar, in which case positional
/// `field_N` names are synthesized and the first row is data.
fn parse_tabular(text: &str) -> Result<Vec<FieldMap>, PipelineError> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 2 {
        return Err(PipelineError::Parse {
            kind: ShapeKind::Tabular,
            reason: "fewer than two rows".to_string(),
        });
    }

    let delimiter = detect_delimiter(&lines).ok_or_else(|| PipelineError::Parse {
        kind: ShapeKind::Tabular,
        reason: "no consistent delimiter".to_string(),
    })?;

    let rows: Vec<Vec<String>> = lines
        .iter()
        .map(|line| {
            split_delimited(line, delimiter)
                .into_iter()
                .map(|c| c.trim().to_string())
                .collect()
        })
        .collect();

    let has_header = !rows[0].iter().any(|cell| coerces_to_scalar(cell));
    let (names, data_rows): (Vec<String>, &[Vec<String>]) = if has_header {
        (rows[0].clone(), &rows[1..])
    } else {
        let width = rows[0].len();
        ((0..width).map(|i| format!("field_{}", i)).collect(), &rows[..])
    };

    let mut records = Vec::new();
    for row in data_rows {
        let mut map = FieldMap::new();
        for (i, cell) in row.iter().enumerate() {
            let name = names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("field_{}", i));
            map.insert(name, Value::String(cell.clone()));
        }
        if !map.is_empty() {
            records.push(map);
        }
    }
    Ok(records)
}

// ============ Markup tables ============

/// Markup-table parser: one record per body row, column identity from
/// header cells (`<th>` or `<thead>`) when present, else positional.
/// Nested tables collapse into the text of the containing cell.
fn parse_markup_table(text: &str) -> Result<Vec<FieldMap>, PipelineError> {
    let mut reader = Reader::from_str(text);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;

    struct Row {
        cells: Vec<String>,
        all_header_cells: bool,
        in_thead: bool,
    }

    let mut rows: Vec<Row> = Vec::new();
    let mut current_row: Option<Row> = None;
    let mut current_cell: Option<String> = None;
    let mut cell_is_th = false;
    let mut in_thead = false;
    let mut table_depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"table" => table_depth += 1,
                b"thead" if table_depth == 1 => in_thead = true,
                b"tr" if table_depth == 1 => {
                    current_row = Some(Row {
                        cells: Vec::new(),
                        all_header_cells: true,
                        in_thead,
                    });
                }
                b"td" | b"th" if table_depth == 1 && current_row.is_some() => {
                    current_cell = Some(String::new());
                    cell_is_th = e.local_name().as_ref() == b"th";
                }
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"table" => {
                    table_depth = table_depth.saturating_sub(1);
                }
                b"thead" => in_thead = false,
                b"tr" if table_depth == 1 => {
                    if let Some(row) = current_row.take() {
                        if !row.cells.is_empty() {
                            rows.push(row);
                        }
                    }
                }
                b"td" | b"th" if table_depth == 1 => {
                    if let (Some(cell), Some(row)) = (current_cell.take(), current_row.as_mut()) {
                        row.cells.push(cell.trim().to_string());
                        if !cell_is_th {
                            row.all_header_cells = false;
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Some(cell) = current_cell.as_mut() {
                    let txt = match t.unescape() {
                        Ok(cow) => cow.into_owned(),
                        Err(_) => String::from_utf8_lossy(&t).into_owned(),
                    };
                    if !cell.is_empty() && !txt.trim().is_empty() {
                        cell.push(' ');
                    }
                    cell.push_str(txt.trim());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(PipelineError::Parse {
                    kind: ShapeKind::MarkupTable,
                    reason: e.to_string(),
                })
            }
        }
    }

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    // Header: first row made of <th> cells or inside <thead>.
    let header_idx = rows
        .iter()
        .position(|row| row.in_thead || row.all_header_cells);
    let names: Vec<String> = match header_idx {
        Some(i) => rows[i].cells.clone(),
        None => (0..rows[0].cells.len())
            .map(|i| format!("field_{}", i))
            .collect(),
    };

    let mut records = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if Some(i) == header_idx {
            continue;
        }
        let mut map = FieldMap::new();
        for (j, cell) in row.cells.iter().enumerate() {
            let name = names
                .get(j)
                .cloned()
                .unwrap_or_else(|| format!("field_{}", j));
            map.insert(name, Value::String(cell.clone()));
        }
        if !map.is_empty() {
            records.push(map);
        }
    }
    Ok(records)
}

// ============ Generic XML ============

/// Element tree as read off the event stream. Attributes are stored as
/// leaf children flagged `is_attr` so flattening treats them like nested
/// elements while record grouping can still tell them apart.
struct XmlNode {
    name: String,
    text: String,
    is_attr: bool,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn from_start(e: &quick_xml::events::BytesStart<'_>) -> Self {
        let mut node = XmlNode {
            name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
            text: String::new(),
            is_attr: false,
            children: Vec::new(),
        };
        for attr in e.attributes().flatten() {
            node.children.push(XmlNode {
                name: String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned(),
                text: attr
                    .unescape_value()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned()),
                is_attr: true,
                children: Vec::new(),
            });
        }
        node
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Generic XML parser: each child element of a root becomes one record,
/// nested elements flatten into `parent_child` field names, and root
/// attributes are carried onto every record as `root_attr_<name>`. A root
/// with no element children yields no records.
fn parse_xml(text: &str) -> Result<Vec<FieldMap>, PipelineError> {
    let mut reader = Reader::from_str(text);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;

    let mut roots: Vec<XmlNode> = Vec::new();
    let mut stack: Vec<XmlNode> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(XmlNode::from_start(&e)),
            Ok(Event::Empty(e)) => {
                let node = XmlNode::from_start(&e);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => roots.push(node),
                }
            }
            Ok(Event::End(_)) => {
                if let Some(node) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => roots.push(node),
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(node) = stack.last_mut() {
                    let txt = match t.unescape() {
                        Ok(cow) => cow.into_owned(),
                        Err(_) => String::from_utf8_lossy(&t).into_owned(),
                    };
                    if !node.text.is_empty() && !txt.trim().is_empty() {
                        node.text.push(' ');
                    }
                    node.text.push_str(txt.trim());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(PipelineError::Parse {
                    kind: ShapeKind::Xml,
                    reason: e.to_string(),
                })
            }
        }
    }

    // Truncated input: attach whatever was still open.
    while let Some(node) = stack.pop() {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }

    let mut records = Vec::new();
    for root in &roots {
        let elements: Vec<&XmlNode> = root
            .children
            .iter()
            .filter(|c| !c.is_attr && !c.is_leaf())
            .collect();

        // Two or more element children are the logical records of the
        // collection; anything flatter is one record of the root itself.
        if elements.len() < 2 {
            let mut map = FieldMap::new();
            flatten_xml(root, "", &mut map);
            if !map.is_empty() {
                records.push(map);
            }
            continue;
        }

        for element in elements {
            let mut map = FieldMap::new();
            flatten_xml(element, "", &mut map);
            for attr in root.children.iter().filter(|c| c.is_attr) {
                map.insert(
                    format!("root_attr_{}", attr.name),
                    Value::String(attr.text.clone()),
                );
            }
            if !map.is_empty() {
                records.push(map);
            }
        }
    }
    Ok(records)
}

/// Depth-first flatten: leaves become `path_joined` string fields.
fn flatten_xml(node: &XmlNode, prefix: &str, map: &mut FieldMap) {
    for child in &node.children {
        let key = if prefix.is_empty() {
            child.name.clone()
        } else {
            format!("{}_{}", prefix, child.name)
        };
        if child.is_leaf() {
            map.insert(key, Value::String(child.text.clone()));
        } else {
            flatten_xml(child, &key, map);
        }
    }
}
