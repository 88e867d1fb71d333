//! Parameterized SQL generation and bind-value conversion.

pub mod builder;
pub mod params;

pub use builder::{delete_by_pk, insert_chunk, select, upsert_chunk, QueryBuf};
pub use params::PgBindValue;
