use std::collections::HashMap;

use crate::error::{PipelineError, Result};

/// Suffix of the shadow relation an aggregate is rebuilt under before it is
/// swapped into its published name.
pub const SHADOW_SUFFIX: &str = "_tmp";

#[derive(Debug)]
pub struct IndexDefinition {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

/// A materialized aggregate over `bart.fact_ridership`.
///
/// `select` is written against shadow relations: an aggregate built from
/// other aggregates reads their `_tmp` names, so the whole generation is
/// computed from one consistent set of inputs.
#[derive(Debug)]
pub struct AggregateDefinition {
    pub name: &'static str,
    pub select: &'static str,
    pub depends_on: &'static [&'static str],
    pub indexes: &'static [IndexDefinition],
}

impl AggregateDefinition {
    pub fn published(&self) -> String {
        format!("bart.{}", self.name)
    }

    pub fn shadow_name(&self) -> String {
        format!("{}{}", self.name, SHADOW_SUFFIX)
    }

    pub fn shadow(&self) -> String {
        format!("bart.{}", self.shadow_name())
    }
}

pub static CATALOG: &[AggregateDefinition] = &[
    AggregateDefinition {
        name: "fact_ridership_by_station_by_date",
        select: r#"
            SELECT
                date_id,
                abbreviation,
                COALESCE(origin.latitude, destination.latitude) AS latitude,
                COALESCE(origin.longitude, destination.longitude) AS longitude,
                COALESCE(origin.origin_count, 0) AS origin_count,
                COALESCE(destination.destination_count, 0) AS destination_count
            FROM (
                SELECT
                    fr.date_id,
                    ds.abbreviation,
                    ds.latitude,
                    ds.longitude,
                    COUNT(*) AS origin_count
                FROM bart.fact_ridership fr
                JOIN bart.dim_station ds
                    ON fr.origin_station_id = ds.id
                GROUP BY fr.date_id, ds.abbreviation, ds.latitude, ds.longitude
            ) origin
            FULL OUTER JOIN (
                SELECT
                    fr.date_id,
                    ds.abbreviation,
                    ds.latitude,
                    ds.longitude,
                    COUNT(*) AS destination_count
                FROM bart.fact_ridership fr
                JOIN bart.dim_station ds
                    ON fr.destination_station_id = ds.id
                GROUP BY fr.date_id, ds.abbreviation, ds.latitude, ds.longitude
            ) destination
            USING (date_id, abbreviation)
        "#,
        depends_on: &[],
        indexes: &[IndexDefinition {
            name: "idx_date_id_abbreviation_frbsbd",
            columns: &["date_id", "abbreviation"],
        }],
    },
    AggregateDefinition {
        name: "fact_ridership_count_by_date",
        select: r#"
            SELECT
                date_id,
                COUNT(*) AS cnt
            FROM bart.fact_ridership
            GROUP BY date_id
        "#,
        depends_on: &[],
        indexes: &[IndexDefinition {
            name: "idx_date_id_frcbd",
            columns: &["date_id"],
        }],
    },
    AggregateDefinition {
        name: "fact_ridership_count_by_hour_by_date",
        select: r#"
            SELECT
                date_id,
                hour,
                COUNT(*) AS ridership_total
            FROM bart.fact_ridership
            GROUP BY date_id, hour
        "#,
        depends_on: &[],
        indexes: &[IndexDefinition {
            name: "idx_date_id_frcbhbd",
            columns: &["date_id"],
        }],
    },
    AggregateDefinition {
        name: "fact_ridership_by_hour_by_origin_station_by_date",
        select: r#"
            SELECT
                fr.date_id,
                ds.abbreviation,
                fr.hour,
                COUNT(*) AS origin_ridership_total
            FROM bart.fact_ridership fr
            JOIN bart.dim_station ds
                ON fr.origin_station_id = ds.id
            GROUP BY fr.date_id, ds.abbreviation, fr.hour
        "#,
        depends_on: &[],
        indexes: &[],
    },
    AggregateDefinition {
        name: "fact_ridership_by_hour_by_dest_station_by_date",
        select: r#"
            SELECT
                fr.date_id,
                ds.abbreviation,
                fr.hour,
                COUNT(*) AS destination_ridership_total
            FROM bart.fact_ridership fr
            JOIN bart.dim_station ds
                ON fr.destination_station_id = ds.id
            GROUP BY fr.date_id, ds.abbreviation, fr.hour
        "#,
        depends_on: &[],
        indexes: &[],
    },
    AggregateDefinition {
        name: "fact_ridership_by_hour_by_station_by_date",
        select: r#"
            SELECT
                date_id,
                abbreviation,
                hour,
                COALESCE(origin.origin_ridership_total, 0) AS origin_ridership_total,
                COALESCE(destination.destination_ridership_total, 0) AS destination_ridership_total
            FROM bart.fact_ridership_by_hour_by_origin_station_by_date_tmp origin
            FULL OUTER JOIN bart.fact_ridership_by_hour_by_dest_station_by_date_tmp destination
            USING (date_id, abbreviation, hour)
        "#,
        depends_on: &[
            "fact_ridership_by_hour_by_origin_station_by_date",
            "fact_ridership_by_hour_by_dest_station_by_date",
        ],
        indexes: &[IndexDefinition {
            name: "idx_date_id_abbreviation_frbhbsbd",
            columns: &["date_id", "abbreviation"],
        }],
    },
];

/// Catalog entries ordered by dependency rank: an aggregate without
/// dependencies has rank 0, any other is one above its highest dependency.
/// Entries of equal rank keep their catalog order.
#[derive(Debug)]
pub struct RefreshPlan {
    ranked: Vec<(usize, &'static AggregateDefinition)>,
}

impl RefreshPlan {
    pub fn new(catalog: &'static [AggregateDefinition]) -> Result<Self> {
        for definition in catalog {
            for dependency in definition.depends_on {
                if !catalog.iter().any(|other| other.name == *dependency) {
                    return Err(PipelineError::InvalidCatalog(format!(
                        "{} depends on unknown aggregate {}",
                        definition.name, dependency
                    )));
                }
            }
        }

        let mut ranks: HashMap<&'static str, usize> = HashMap::new();
        while ranks.len() < catalog.len() {
            let mut progressed = false;
            for definition in catalog {
                if ranks.contains_key(definition.name) {
                    continue;
                }
                let dependency_ranks: Option<Vec<usize>> = definition
                    .depends_on
                    .iter()
                    .map(|dependency| ranks.get(dependency).copied())
                    .collect();
                if let Some(dependency_ranks) = dependency_ranks {
                    let rank = dependency_ranks.into_iter().map(|r| r + 1).max().unwrap_or(0);
                    ranks.insert(definition.name, rank);
                    progressed = true;
                }
            }
            if !progressed {
                let stuck: Vec<&str> = catalog
                    .iter()
                    .map(|definition| definition.name)
                    .filter(|name| !ranks.contains_key(name))
                    .collect();
                return Err(PipelineError::InvalidCatalog(format!(
                    "dependency cycle among {}",
                    stuck.join(", ")
                )));
            }
        }

        let mut ranked: Vec<(usize, &'static AggregateDefinition)> = catalog
            .iter()
            .map(|definition| (ranks.get(definition.name).copied().unwrap_or(0), definition))
            .collect();
        ranked.sort_by_key(|(rank, _)| *rank);
        Ok(Self { ranked })
    }

    /// Dependencies before dependents.
    pub fn refresh_order(&self) -> impl Iterator<Item = &'static AggregateDefinition> + '_ {
        self.ranked.iter().map(|(_, definition)| *definition)
    }

    /// Dependents before dependencies, so no dropped relation still has a
    /// dependent view.
    pub fn swap_order(&self) -> impl Iterator<Item = &'static AggregateDefinition> + '_ {
        self.ranked.iter().rev().map(|(_, definition)| *definition)
    }

    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.ranked
            .iter()
            .find(|(_, definition)| definition.name == name)
            .map(|(rank, _)| *rank)
    }
}
