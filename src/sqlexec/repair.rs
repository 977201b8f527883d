//! SQL Repair Engine: best-effort INSERT rewrites against live metadata.
//!
//! Only `INSERT INTO t (cols) VALUES (vals)` with a single row is handled.
//! Two rewrites:
//!
//! 1. An `id` column that is a sequence/identity-backed primary key is
//!    dropped together with its value, so the database assigns it.
//! 2. A string literal in an enum-constrained column that matches none of the
//!    allowed values (case-insensitive) becomes the first allowed value.
//!
//! Anything unexpected returns the statement unchanged. The engine never
//! reports an error to its caller.

use std::ops::Range;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::schema::{SchemaInfo, SchemaInspector};
use crate::logging;

static INSERT_HEAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*INSERT\s+INTO\s+([^\s(]+)\s*\(").unwrap());

static VALUES_HEAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*VALUES\s*\(").unwrap());

type Span = Range<usize>;

// ---------------------------------------------------------------------------
// InsertStatement
// ---------------------------------------------------------------------------

/// A parsed single-row INSERT. Spans index into the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement<'a> {
    sql: &'a str,
    table: String,
    columns: Vec<Span>,
    values: Vec<Span>,
}

impl<'a> InsertStatement<'a> {
    pub fn parse(sql: &'a str) -> Option<Self> {
        let head = INSERT_HEAD_RE.captures(sql)?;
        let table = head.get(1)?.as_str().to_string();
        let columns_open = head.get(0)?.end();

        let (columns, columns_close) = split_list(sql, columns_open, false)?;

        let values_head = VALUES_HEAD_RE.find(&sql[columns_close + 1..])?;
        let values_open = columns_close + 1 + values_head.end();
        let (values, values_close) = split_list(sql, values_open, true)?;

        // Multi-row VALUES lists are not supported.
        if sql[values_close + 1..].trim_start().starts_with(',') {
            return None;
        }
        if columns.len() != values.len() {
            return None;
        }

        Some(Self {
            sql,
            table,
            columns,
            values,
        })
    }

    /// Target table as written (may be schema-qualified and quoted).
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Column names with identifier quotes removed.
    pub fn column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|span| self.sql[span.clone()].trim_matches('"').to_string())
            .collect()
    }

    pub fn value_text(&self, idx: usize) -> Option<&'a str> {
        self.values.get(idx).map(|span| &self.sql[span.clone()])
    }

    /// Apply the rewrites. `None` when nothing needs to change.
    pub fn repair(&self, info: &SchemaInfo) -> Option<Repaired> {
        let names = self.column_names();

        let drop_idx = if names.len() > 1 {
            names.iter().position(|c| {
                c.eq_ignore_ascii_case("id") && info.is_primary_key(c) && info.is_auto_increment(c)
            })
        } else {
            None
        };

        let mut replacements: Vec<Option<String>> = vec![None; names.len()];
        let mut enum_fixes = Vec::new();

        for (idx, name) in names.iter().enumerate() {
            if Some(idx) == drop_idx {
                continue;
            }
            let Some(allowed) = info.allowed_values(name) else {
                continue;
            };
            let Some(value) = self.value_text(idx) else {
                continue;
            };
            let Some(literal) = StringLiteral::parse(value) else {
                continue;
            };

            let wanted = literal.text.to_lowercase();
            if allowed.iter().any(|a| a.to_lowercase() == wanted) {
                continue;
            }

            let first = &allowed[0];
            replacements[idx] = Some(format!("{}{}", quote_literal(first), &value[literal.end..]));
            enum_fixes.push(EnumFix {
                column: name.clone(),
                from: literal.text,
                to: first.clone(),
            });
        }

        if drop_idx.is_none() && enum_fixes.is_empty() {
            return None;
        }

        let mut edits: Vec<(Span, &str)> = Vec::new();
        if let Some(idx) = drop_idx {
            edits.push((without_item(&self.columns, idx), ""));
        }
        for (idx, (span, replacement)) in self.values.iter().zip(&replacements).enumerate() {
            if Some(idx) == drop_idx {
                edits.push((without_item(&self.values, idx), ""));
            } else if let Some(replacement) = replacement {
                edits.push((span.clone(), replacement.as_str()));
            }
        }

        Some(Repaired {
            sql: self.splice(&edits),
            dropped_column: drop_idx.map(|idx| names[idx].clone()),
            enum_fixes,
        })
    }

    /// Apply ordered, non-overlapping edits; every other byte is kept.
    fn splice(&self, edits: &[(Span, &str)]) -> String {
        let mut out = String::with_capacity(self.sql.len());
        let mut last = 0;
        for (span, replacement) in edits {
            out.push_str(&self.sql[last..span.start]);
            out.push_str(replacement);
            last = span.end;
        }
        out.push_str(&self.sql[last..]);
        out
    }
}

/// Range covering list item `idx` and one adjacent separator: the one before
/// it, or the one after it for the first item. The list has at least two items.
fn without_item(items: &[Span], idx: usize) -> Span {
    match idx {
        0 => items[0].start..items[1].start,
        _ => items[idx - 1].end..items[idx].end,
    }
}

/// Result of a successful rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repaired {
    pub sql: String,
    pub dropped_column: Option<String>,
    pub enum_fixes: Vec<EnumFix>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumFix {
    pub column: String,
    pub from: String,
    pub to: String,
}

/// Split a parenthesised, comma-separated list starting at `start` (just
/// after the `(`). Returns trimmed item spans and the offset of the closing
/// `)`. Quotes are respected; nested parentheses only when `nested`.
fn split_list(sql: &str, start: usize, nested: bool) -> Option<(Vec<Span>, usize)> {
    let bytes = sql.as_bytes();
    let mut items = Vec::new();
    let mut item_start = start;
    let mut depth = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if in_single {
            if b == b'\'' {
                if bytes.get(i + 1) == Some(&b'\'') {
                    i += 2;
                    continue;
                }
                in_single = false;
            }
            i += 1;
            continue;
        }
        if in_double {
            if b == b'"' {
                in_double = false;
            }
            i += 1;
            continue;
        }

        match b {
            b'\'' => in_single = true,
            b'"' => in_double = true,
            b'(' if nested => depth += 1,
            b'(' => return None,
            b')' if depth > 0 => depth -= 1,
            b')' => {
                items.push(trim_span(sql, item_start..i)?);
                return Some((items, i));
            }
            b',' if depth == 0 => {
                items.push(trim_span(sql, item_start..i)?);
                item_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn trim_span(sql: &str, span: Span) -> Option<Span> {
    let text = &sql[span.clone()];
    let lead = text.len() - text.trim_start().len();
    let len = text.trim().len();
    (len > 0).then(|| span.start + lead..span.start + lead + len)
}

/// A leading `'...'` literal, optionally followed by a `::type` cast.
struct StringLiteral {
    text: String,
    /// Offset just after the closing quote.
    end: usize,
}

impl StringLiteral {
    fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix('\'')?;
        let mut text = String::new();
        let mut chars = rest.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            if c != '\'' {
                text.push(c);
                continue;
            }
            if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
                text.push('\'');
                continue;
            }
            let end = 1 + pos + 1;
            let suffix = value[end..].trim_start();
            return (suffix.is_empty() || suffix.starts_with("::")).then_some(Self { text, end });
        }
        None
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ---------------------------------------------------------------------------
// SqlRepairEngine
// ---------------------------------------------------------------------------

pub struct SqlRepairEngine {
    inspector: Arc<SchemaInspector>,
}

impl SqlRepairEngine {
    pub fn new(inspector: Arc<SchemaInspector>) -> Self {
        Self { inspector }
    }

    pub fn inspector(&self) -> &Arc<SchemaInspector> {
        &self.inspector
    }

    /// Rewrite `sql` if it needs it; otherwise return it unchanged.
    ///
    /// `schema` qualifies an unqualified target table.
    pub async fn repair(&self, sql: &str, schema: Option<&str>) -> String {
        let Some(statement) = InsertStatement::parse(sql) else {
            return sql.to_string();
        };

        let table = match schema {
            Some(schema) if !statement.table().contains('.') => {
                format!("{schema}.{}", statement.table())
            }
            _ => statement.table().to_string(),
        };

        let info = match self.inspector.get_schema_info(&table).await {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(
                    table = %table,
                    error = %logging::mask(&e.to_string()),
                    "SqlRepairEngine: no metadata, statement left unchanged"
                );
                return sql.to_string();
            }
        };

        match statement.repair(&info) {
            Some(repaired) => {
                for fix in &repaired.enum_fixes {
                    tracing::debug!(
                        table = %table,
                        column = %fix.column,
                        from = %fix.from,
                        to = %fix.to,
                        "SqlRepairEngine: replaced invalid enum value"
                    );
                }
                if let Some(column) = &repaired.dropped_column {
                    tracing::debug!(
                        table = %table,
                        column = %column,
                        "SqlRepairEngine: removed sequence-backed primary key"
                    );
                }
                repaired.sql
            }
            None => sql.to_string(),
        }
    }
}
