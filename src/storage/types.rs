//! Shared storage types: engine identity and option structs for the
//! engine-specific capabilities.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::config::is_valid_identifier;

// =============================================================================
// Engine Type
// =============================================================================

/// Storage engine family.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum EngineType {
    /// SQL engine (PostgreSQL).
    Relational,
    /// Document engine (MongoDB).
    Document,
    /// Key-value cache engine (Redis).
    Cache,
    /// Time-series engine (TimescaleDB on PostgreSQL).
    TimeSeries,
}

impl EngineType {
    /// All engine families.
    pub const ALL: [EngineType; 4] = [
        EngineType::Relational,
        EngineType::Document,
        EngineType::Cache,
        EngineType::TimeSeries,
    ];
}

// =============================================================================
// Ordering
// =============================================================================

/// Sort direction for index keys and compression ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    /// MongoDB index direction (`1` / `-1`).
    pub fn as_index_direction(&self) -> i32 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }

    fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// One column of an `ORDER BY`-style list, e.g. `ts DESC NULLS LAST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByColumn {
    pub column: String,
    pub order: SortOrder,
    /// `Some(true)` = NULLS FIRST, `Some(false)` = NULLS LAST.
    pub nulls_first: Option<bool>,
}

impl OrderByColumn {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Ascending,
            nulls_first: None,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Descending,
            nulls_first: None,
        }
    }
}

impl FromStr for OrderByColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<String> = s.split_whitespace().map(str::to_ascii_uppercase).collect();
        let column = s
            .split_whitespace()
            .next()
            .ok_or_else(|| "empty order-by entry".to_string())?;
        if !is_valid_identifier(column) {
            return Err(format!("invalid column '{column}'"));
        }

        let mut entry = Self::asc(column);
        let mut rest = &parts[1..];
        if let Some(first) = rest.first() {
            match first.as_str() {
                "ASC" => rest = &rest[1..],
                "DESC" => {
                    entry.order = SortOrder::Descending;
                    rest = &rest[1..];
                }
                _ => {}
            }
        }
        match rest {
            [] => {}
            [nulls, pos] if nulls == "NULLS" && pos == "FIRST" => entry.nulls_first = Some(true),
            [nulls, pos] if nulls == "NULLS" && pos == "LAST" => entry.nulls_first = Some(false),
            _ => return Err(format!("invalid order-by entry '{s}'")),
        }
        Ok(entry)
    }
}

impl fmt::Display for OrderByColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.column, self.order.as_sql())?;
        match self.nulls_first {
            Some(true) => write!(f, " NULLS FIRST"),
            Some(false) => write!(f, " NULLS LAST"),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Document Options
// =============================================================================

/// Options for creating a collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    /// Fixed-size collection.
    pub capped: bool,
    /// Maximum size in bytes (required when capped).
    pub size_bytes: Option<u64>,
    /// Maximum number of documents (capped only).
    pub max_documents: Option<u64>,
    /// JSON-schema validator document.
    pub validator: Option<mongodb::bson::Document>,
}

/// One key of an index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub field: String,
    pub order: SortOrder,
}

/// Index definition: ordered field→sort-order keys plus flags.
#[derive(Debug, Clone, Default)]
pub struct IndexDefinition {
    /// Index name; the server derives one when absent.
    pub name: Option<String>,
    pub keys: Vec<IndexKey>,
    pub unique: bool,
    pub sparse: bool,
    /// Expire documents this long after the indexed date field.
    pub ttl: Option<Duration>,
}

impl IndexDefinition {
    /// Start a definition with a single key.
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self::default().key(field, order)
    }

    /// Append a key; key order is preserved.
    pub fn key(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.keys.push(IndexKey {
            field: field.into(),
            order,
        });
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

// =============================================================================
// Time-series Options
// =============================================================================

/// Options for `create_hypertable`.
#[derive(Debug, Clone, Default)]
pub struct HypertableOptions {
    /// Chunk interval; falls back to the configured default.
    pub chunk_time_interval: Option<Duration>,
    /// Space-partitioning column.
    pub partitioning_column: Option<String>,
    /// Number of space partitions (requires `partitioning_column`).
    pub number_partitions: Option<u32>,
    /// Skip the default time index.
    pub skip_default_indexes: bool,
    /// Succeed silently if the table is already a hypertable.
    pub if_not_exists: bool,
    /// Convert a table that already holds rows.
    pub migrate_data: bool,
}

/// Options for `enable_compression`.
#[derive(Debug, Clone, Default)]
pub struct CompressionOptions {
    /// Segment-by columns; falls back to the configured default when empty.
    pub segment_by: Vec<String>,
    /// Order-by columns; falls back to the configured default when empty.
    pub order_by: Vec<OrderByColumn>,
    /// Add a background policy compressing chunks older than this. `None`
    /// adds the configured default policy only when compression is enabled
    /// in the configuration.
    pub compress_after: Option<Duration>,
}

/// Refresh schedule for a continuous aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Window start, relative to now (`None` = unbounded).
    pub start_offset: Option<Duration>,
    /// Window end, relative to now (`None` = up to now).
    pub end_offset: Option<Duration>,
    pub schedule_interval: Duration,
}

/// Options for `create_continuous_aggregate`.
#[derive(Debug, Clone, Default)]
pub struct ContinuousAggregateOptions {
    pub refresh_policy: Option<RefreshPolicy>,
    /// Materialize existing data at creation time.
    pub with_data: bool,
    /// Aggregate over real-time (non-materialized) data as well.
    pub materialized_only: bool,
}

/// Summary row of `timescaledb_information.hypertables`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HypertableInfo {
    pub schema: String,
    pub name: String,
    pub num_chunks: i64,
    pub compression_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_type_strings() {
        assert_eq!(EngineType::TimeSeries.to_string(), "time-series");
        assert_eq!(EngineType::Relational.as_ref(), "relational");
        assert_eq!(
            EngineType::from_str("Time-Series").unwrap(),
            EngineType::TimeSeries
        );
        assert!(EngineType::from_str("graph").is_err());
    }

    #[test]
    fn test_order_by_parsing() {
        let entry = OrderByColumn::from_str("ts DESC").unwrap();
        assert_eq!(entry, OrderByColumn::desc("ts"));
        assert_eq!(entry.to_string(), "ts DESC");

        let entry = OrderByColumn::from_str("device_id asc nulls last").unwrap();
        assert_eq!(entry.order, SortOrder::Ascending);
        assert_eq!(entry.nulls_first, Some(false));
        assert_eq!(entry.to_string(), "device_id ASC NULLS LAST");

        assert_eq!(OrderByColumn::from_str("ts").unwrap(), OrderByColumn::asc("ts"));
    }

    #[test]
    fn test_order_by_rejects_injection() {
        assert!(OrderByColumn::from_str("").is_err());
        assert!(OrderByColumn::from_str("ts; DROP TABLE x").is_err());
        assert!(OrderByColumn::from_str("ts DESC, other").is_err());
        assert!(OrderByColumn::from_str("ts SIDEWAYS").is_err());
    }

    #[test]
    fn test_index_definition_keeps_key_order() {
        let def = IndexDefinition::new("tenant_id", SortOrder::Ascending)
            .key("created_at", SortOrder::Descending)
            .unique()
            .with_ttl(Duration::from_secs(3600));
        assert_eq!(def.keys[0].field, "tenant_id");
        assert_eq!(def.keys[1].order.as_index_direction(), -1);
        assert!(def.unique);
        assert!(!def.sparse);
    }
}
