//! redb table definitions.
//!
//! `&str` keys, JSON-encoded `&[u8]` values.

use redb::TableDefinition;

/// Compositions keyed by name.
pub const COMPOSITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("compositions");

/// Top distributions keyed by their content uid.
pub const DISTRIBUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("distributions");

/// Node-tier isolates keyed by `{node}/{isolate}`.
pub const ISOLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("isolates");
