//! Local SQL execution: schema metadata, statement repair, execution and
//! result encoding.

pub mod executor;
pub mod repair;
pub mod schema;
pub mod value;

pub use executor::{PgStatementExecutor, StatementExecutor};
pub use repair::{EnumFix, InsertStatement, Repaired, SqlRepairEngine};
pub use schema::{
    extract_enum_values, PgSchemaSource, SchemaInfo, SchemaInspector, SchemaSource, TableRef,
};
pub use value::ResultEnvelope;
