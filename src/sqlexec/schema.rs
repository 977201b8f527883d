//! Schema Inspector: cached primary-key, sequence and enum metadata.
//!
//! Metadata is fetched lazily per table on first reference and is immutable
//! once cached. `clear_cache()` drops every entry (schema drift). The cache
//! sits behind one reader/writer lock: concurrent readers, exclusive writers
//! on population.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::Result;

/// Schema used for unqualified table names.
pub const DEFAULT_SCHEMA: &str = "public";

// ---------------------------------------------------------------------------
// SchemaInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaInfo {
    /// Schema-qualified name, e.g. `public.users`.
    pub table_name: String,
    /// Primary-key columns in key order.
    pub primary_key_columns: Vec<String>,
    /// Column → sequence/identity-backed.
    pub auto_increment: BTreeMap<String, bool>,
    /// Column → allowed literals, in declaration order.
    pub enum_values: BTreeMap<String, Vec<String>>,
}

impl SchemaInfo {
    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn is_auto_increment(&self, column: &str) -> bool {
        self.auto_increment
            .iter()
            .any(|(c, auto)| *auto && c.eq_ignore_ascii_case(column))
    }

    pub fn allowed_values(&self, column: &str) -> Option<&[String]> {
        self.enum_values
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(column))
            .map(|(_, values)| values.as_slice())
            .filter(|values| !values.is_empty())
    }
}

/// `schema.table` split into parts, quotes removed. Unqualified names use
/// [`DEFAULT_SCHEMA`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn parse(name: &str) -> Self {
        let unquote = |s: &str| s.trim().trim_matches('"').to_string();
        match name.trim().split_once('.') {
            Some((schema, table)) => Self {
                schema: unquote(schema),
                table: unquote(table),
            },
            None => Self {
                schema: DEFAULT_SCHEMA.to_string(),
                table: unquote(name),
            },
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

// ---------------------------------------------------------------------------
// Enum extraction
// ---------------------------------------------------------------------------

/// `col IN ('a', 'b')`
static IN_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bIN\s*\(\s*([^)]+)\)").unwrap());

/// `col = ANY (ARRAY['a'::text, 'b'::text])`
static ANY_ARRAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)=\s*ANY\s*\(\s*\(?\s*ARRAY\s*\[([^\]]+)\]").unwrap());

/// Allowed literals from a check-constraint definition, in order.
pub fn extract_enum_values(definition: &str) -> Vec<String> {
    let list = ANY_ARRAY_RE
        .captures(definition)
        .or_else(|| IN_LIST_RE.captures(definition))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());

    let Some(list) = list else {
        return Vec::new();
    };

    let mut values: Vec<String> = Vec::new();
    for item in list.split(',') {
        let literal = strip_cast(item.trim());
        let literal = literal.trim().trim_matches(|c| c == '\'' || c == '"').trim();
        if !literal.is_empty() && !values.iter().any(|v| v == literal) {
            values.push(literal.to_string());
        }
    }
    values
}

/// `'a'::character varying` → `'a'`, also `('a'::text)`.
fn strip_cast(item: &str) -> &str {
    let item = item.trim_start_matches('(').trim_end_matches(')');
    match item.find("::") {
        Some(pos) => &item[..pos],
        None => item,
    }
}

// ---------------------------------------------------------------------------
// SchemaSource
// ---------------------------------------------------------------------------

/// Where table metadata comes from.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch(&self, table: &TableRef) -> Result<SchemaInfo>;
}

/// Live Postgres catalog queries.
#[derive(Clone)]
pub struct PgSchemaSource {
    pool: PgPool,
}

impl PgSchemaSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaSource for PgSchemaSource {
    async fn fetch(&self, table: &TableRef) -> Result<SchemaInfo> {
        let primary_key_columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
             AND tc.table_name = kcu.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
              AND tc.table_schema = $1
              AND tc.table_name = $2
            ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await?;

        let auto_rows: Vec<(String, bool)> = sqlx::query_as(
            r#"
            SELECT column_name::text,
                   COALESCE(column_default LIKE 'nextval(%' OR is_identity = 'YES', false) AS is_auto
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await?;

        // Single-column CHECK constraints.
        let check_rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT a.attname::text, pg_get_constraintdef(c.oid)
            FROM pg_constraint c
            JOIN pg_class t ON t.oid = c.conrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = c.conkey[1]
            WHERE c.contype = 'c'
              AND cardinality(c.conkey) = 1
              AND n.nspname = $1
              AND t.relname = $2
            ORDER BY a.attnum, c.conname
            "#,
        )
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await?;

        // Columns typed with a native enum.
        let native_rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT a.attname::text, e.enumlabel::text
            FROM pg_attribute a
            JOIN pg_class t ON t.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_enum e ON e.enumtypid = a.atttypid
            WHERE n.nspname = $1
              AND t.relname = $2
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY a.attnum, e.enumsortorder
            "#,
        )
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await?;

        let mut info = SchemaInfo {
            table_name: table.qualified(),
            primary_key_columns,
            auto_increment: auto_rows.into_iter().collect(),
            enum_values: BTreeMap::new(),
        };

        for (column, definition) in check_rows {
            let values = extract_enum_values(&definition);
            if !values.is_empty() {
                info.enum_values.entry(column).or_insert(values);
            }
        }
        for (column, label) in native_rows {
            let values = info.enum_values.entry(column).or_default();
            if !values.contains(&label) {
                values.push(label);
            }
        }

        Ok(info)
    }
}

// ---------------------------------------------------------------------------
// SchemaInspector
// ---------------------------------------------------------------------------

pub struct SchemaInspector {
    source: Arc<dyn SchemaSource>,
    cache: RwLock<HashMap<TableRef, Arc<SchemaInfo>>>,
}

impl SchemaInspector {
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::new(Arc::new(PgSchemaSource::new(pool)))
    }

    /// Cached metadata for `table_name`, fetched on first use.
    pub async fn get_schema_info(&self, table_name: &str) -> Result<Arc<SchemaInfo>> {
        let key = TableRef::parse(table_name);

        if let Some(info) = self.cache.read().await.get(&key) {
            return Ok(Arc::clone(info));
        }

        // No lock is held across the catalog round trips.
        let fetched = Arc::new(self.source.fetch(&key).await?);

        let mut cache = self.cache.write().await;
        // A concurrent fetch of the same table may have landed first; keep its entry.
        let info = Arc::clone(cache.entry(key).or_insert_with(|| {
            tracing::debug!(
                table = %fetched.table_name,
                primary_key = ?fetched.primary_key_columns,
                enum_columns = fetched.enum_values.len(),
                "SchemaInspector: cached table metadata"
            );
            Arc::clone(&fetched)
        }));
        Ok(info)
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        let dropped = cache.len();
        cache.clear();
        tracing::debug!(dropped, "SchemaInspector: cache cleared");
    }

    pub async fn cached_tables(&self) -> usize {
        self.cache.read().await.len()
    }
}
