//! Warehouse layout: schema names, the two year-partitioned tables, and the
//! DDL statements that create and reset their partitions.
//!
//! DDL cannot take bind parameters, so every statement here is rendered from
//! typed values only: compile-time identifiers, a validated [`Year`], and
//! [`PartitionBound`]s derived from it.

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::debug;

use crate::error::{PipelineError, Result};

pub const STAGING_SCHEMA: &str = "source";
pub const WAREHOUSE_SCHEMA: &str = "bart";

pub const DIM_DATE: &str = "bart.dim_date";
pub const DIM_STATION: &str = "bart.dim_station";

/// A reporting year, restricted to four-digit years so that partition names
/// and bounds are always well formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Year(i32);

impl Year {
    pub const MIN: i32 = 1900;
    pub const MAX: i32 = 9999;

    pub fn new(value: i32) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(PipelineError::InvalidYear(value))
        }
    }

    /// Every year in `start..=end`, ascending.
    pub fn range(start: i32, end: i32) -> Result<Vec<Self>> {
        let first = Self::new(start)?;
        let last = Self::new(end)?;
        if first > last {
            return Err(PipelineError::InvalidYearRange { start, end });
        }
        Ok((first.0..=last.0).map(Self).collect())
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn first_day(self) -> NaiveDate {
        ymd(self.0)
    }

    /// First day of the following year; the exclusive upper bound of this
    /// year's date range.
    pub fn next_first_day(self) -> NaiveDate {
        ymd(self.0 + 1)
    }

    /// `YYYY0101` surrogate key of the first day of the year.
    pub fn first_date_key(self) -> i32 {
        self.0 * 10_000 + 101
    }

    pub fn next_first_date_key(self) -> i32 {
        (self.0 + 1) * 10_000 + 101
    }

    pub fn contains(self, day: NaiveDate) -> bool {
        day >= self.first_day() && day < self.next_first_day()
    }
}

fn ymd(year: i32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, 1, 1).expect("January 1st exists for four-digit years")
}

impl fmt::Display for Year {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for Year {
    type Error = PipelineError;

    fn try_from(value: i32) -> Result<Self> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: &'static str,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: &'static str, name: impl Into<String>) -> Self {
        Self {
            schema,
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKey {
    /// Range over a `DATE` column.
    Date,
    /// Range over an integer `YYYYMMDD` surrogate date key.
    DateKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionBound {
    Date(NaiveDate),
    DateKey(i32),
    /// Open upper end. Used for the last supported year, whose following
    /// January 1st has five digits and no `DATE` literal.
    MaxValue,
}

impl fmt::Display for PartitionBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionBound::Date(date) => write!(f, "'{}'", date.format("%Y-%m-%d")),
            PartitionBound::DateKey(key) => write!(f, "{key}"),
            PartitionBound::MaxValue => f.write_str("MAXVALUE"),
        }
    }
}

#[derive(Debug)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
}

/// A parent table range-partitioned into one partition per calendar year.
#[derive(Debug)]
pub struct PartitionedTable {
    pub schema: &'static str,
    pub name: &'static str,
    pub columns: &'static [Column],
    pub partition_column: &'static str,
    pub key: PartitionKey,
}

pub static STAGING_RIDERSHIP: PartitionedTable = PartitionedTable {
    schema: STAGING_SCHEMA,
    name: "ridership",
    columns: &[
        Column { name: "day", sql_type: "DATE" },
        Column { name: "hour", sql_type: "INT" },
        Column { name: "origin", sql_type: "VARCHAR(16)" },
        Column { name: "destination", sql_type: "VARCHAR(16)" },
        Column { name: "trip_count", sql_type: "INT" },
    ],
    partition_column: "day",
    key: PartitionKey::Date,
};

pub static FACT_RIDERSHIP: PartitionedTable = PartitionedTable {
    schema: WAREHOUSE_SCHEMA,
    name: "fact_ridership",
    columns: &[
        Column { name: "date_id", sql_type: "INT" },
        Column { name: "hour", sql_type: "INT" },
        Column { name: "origin_station_id", sql_type: "INT" },
        Column { name: "destination_station_id", sql_type: "INT" },
        Column { name: "trip_count", sql_type: "INT" },
    ],
    partition_column: "date_id",
    key: PartitionKey::DateKey,
};

impl PartitionedTable {
    pub fn qualified(&'static self) -> QualifiedName {
        QualifiedName::new(self.schema, self.name)
    }

    pub fn partition_name(&'static self, year: Year) -> QualifiedName {
        QualifiedName::new(self.schema, format!("{}_{}", self.name, year))
    }

    /// Inverse of [`partition_name`](Self::partition_name) for a bare
    /// relation name such as `ridership_2023`.
    pub fn partition_year(&self, relname: &str) -> Option<Year> {
        let suffix = relname.strip_prefix(self.name)?.strip_prefix('_')?;
        if suffix.len() != 4 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Year::new(suffix.parse().ok()?).ok()
    }

    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn partition(&'static self, year: Year) -> PartitionSpec {
        let (lower, upper) = match self.key {
            PartitionKey::Date if year.value() == Year::MAX => {
                (PartitionBound::Date(year.first_day()), PartitionBound::MaxValue)
            }
            PartitionKey::Date => (
                PartitionBound::Date(year.first_day()),
                PartitionBound::Date(year.next_first_day()),
            ),
            PartitionKey::DateKey => (
                PartitionBound::DateKey(year.first_date_key()),
                PartitionBound::DateKey(year.next_first_date_key()),
            ),
        };
        PartitionSpec {
            parent: self.qualified(),
            partition: self.partition_name(year),
            lower,
            upper,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub parent: QualifiedName,
    pub partition: QualifiedName,
    pub lower: PartitionBound,
    pub upper: PartitionBound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub table: QualifiedName,
    pub columns: &'static [&'static str],
}

/// One structured DDL statement.
#[derive(Debug)]
pub enum Ddl {
    CreateSchema(&'static str),
    CreateParent(&'static PartitionedTable),
    CreatePartition(PartitionSpec),
    CreateIndex(IndexSpec),
    Truncate(QualifiedName),
    DropTable(QualifiedName),
}

impl fmt::Display for Ddl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ddl::CreateSchema(schema) => write!(f, "CREATE SCHEMA IF NOT EXISTS {schema}"),
            Ddl::CreateParent(table) => {
                let columns = table
                    .columns
                    .iter()
                    .map(|column| format!("{} {}", column.name, column.sql_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(
                    f,
                    "CREATE TABLE IF NOT EXISTS {}.{} ({}) PARTITION BY RANGE ({})",
                    table.schema, table.name, columns, table.partition_column
                )
            }
            Ddl::CreatePartition(spec) => write!(
                f,
                "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ({}) TO ({})",
                spec.partition, spec.parent, spec.lower, spec.upper
            ),
            Ddl::CreateIndex(index) => write!(
                f,
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                index.name,
                index.table,
                index.columns.join(", ")
            ),
            Ddl::Truncate(table) => write!(f, "TRUNCATE {table}"),
            Ddl::DropTable(table) => write!(f, "DROP TABLE IF EXISTS {table}"),
        }
    }
}

/// Statements that prepare an empty staging partition for `year`.
pub fn staging_setup(year: Year) -> Vec<Ddl> {
    vec![
        Ddl::CreateSchema(STAGING_SCHEMA),
        Ddl::CreateParent(&STAGING_RIDERSHIP),
        Ddl::CreatePartition(STAGING_RIDERSHIP.partition(year)),
        Ddl::Truncate(STAGING_RIDERSHIP.partition_name(year)),
    ]
}

/// Statements that prepare an empty, indexed fact partition for `year`.
pub fn fact_setup(year: Year) -> Vec<Ddl> {
    vec![
        Ddl::CreateSchema(WAREHOUSE_SCHEMA),
        Ddl::CreateParent(&FACT_RIDERSHIP),
        Ddl::CreatePartition(FACT_RIDERSHIP.partition(year)),
        Ddl::CreateIndex(IndexSpec {
            name: format!("idx_fact_ridership_{year}_date_origin_destination"),
            table: FACT_RIDERSHIP.partition_name(year),
            columns: &["date_id", "origin_station_id", "destination_station_id"],
        }),
        Ddl::Truncate(FACT_RIDERSHIP.partition_name(year)),
    ]
}

/// Executes statements in order on one connection (usually a transaction).
pub async fn apply(conn: &mut PgConnection, statements: &[Ddl]) -> sqlx::Result<()> {
    for statement in statements {
        let sql = statement.to_string();
        debug!(sql = %sql, "Executing DDL");
        sqlx::raw_sql(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}
