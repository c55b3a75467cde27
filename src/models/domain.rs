use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use validator::{Validate, ValidationError};

/// Typed attributes that pool filters select on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFields {
    #[serde(rename = "doubleArgs", default)]
    pub double_args: HashMap<String, f64>,
    #[serde(rename = "stringArgs", default)]
    pub string_args: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Opaque payload written to a ticket once it has been matched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub connection: String,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// A participant (or party) waiting to be matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "searchFields", default)]
    pub search_fields: SearchFields,
    #[serde(default)]
    pub assignment: Option<Assignment>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "createTime", default = "Utc::now")]
    pub create_time: DateTime<Utc>,
}

impl Ticket {
    pub fn new(search_fields: SearchFields) -> Self {
        Self {
            id: String::new(),
            search_fields,
            assignment: None,
            extensions: BTreeMap::new(),
            create_time: Utc::now(),
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.assignment.is_some()
    }
}

/// A partially filled match looking for more tickets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backfill {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "searchFields", default)]
    pub search_fields: SearchFields,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub generation: i64,
    #[serde(rename = "createTime", default = "Utc::now")]
    pub create_time: DateTime<Utc>,
}

impl Backfill {
    pub fn new(search_fields: SearchFields) -> Self {
        Self {
            id: String::new(),
            search_fields,
            extensions: BTreeMap::new(),
            generation: 0,
            create_time: Utc::now(),
        }
    }
}

/// Persisted form of a backfill together with its pending tickets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRecord {
    pub backfill: Backfill,
    #[serde(rename = "ticketIds", default)]
    pub ticket_ids: Vec<String>,
    #[serde(rename = "lastAcknowledged", default)]
    pub last_acknowledged: Option<DateTime<Utc>>,
    /// Game server of the match that opened the backfill; every ticket
    /// joining it later gets the same assignment
    #[serde(default)]
    pub assignment: Option<Assignment>,
}

/// Which bounds of a double range are exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeExclusion {
    #[default]
    None,
    Min,
    Max,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleRangeFilter {
    #[serde(rename = "doubleArg")]
    pub double_arg: String,
    #[serde(default = "default_min")]
    pub min: f64,
    #[serde(default = "default_max")]
    pub max: f64,
    #[serde(default)]
    pub exclude: RangeExclusion,
}

fn default_min() -> f64 { f64::NEG_INFINITY }
fn default_max() -> f64 { f64::INFINITY }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringEqualsFilter {
    #[serde(rename = "stringArg")]
    pub string_arg: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPresentFilter {
    pub tag: String,
}

/// Named filter selecting the tickets and backfills eligible for a profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct Pool {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(rename = "doubleRangeFilters", default)]
    pub double_range_filters: Vec<DoubleRangeFilter>,
    #[serde(rename = "stringEqualsFilters", default)]
    pub string_equals_filters: Vec<StringEqualsFilter>,
    #[serde(rename = "tagPresentFilters", default)]
    pub tag_present_filters: Vec<TagPresentFilter>,
    #[serde(rename = "createdBefore", default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(rename = "createdAfter", default)]
    pub created_after: Option<DateTime<Utc>>,
}

impl Pool {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A named matchmaking request bundling one or more pools
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct MatchProfile {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1), nested, custom(function = "validate_unique_pools"))]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

fn validate_unique_pools(pools: &[Pool]) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for pool in pools {
        if !seen.insert(pool.name.as_str()) {
            let mut err = ValidationError::new("duplicate_pool");
            err.message = Some(format!("pool '{}' is defined more than once", pool.name).into());
            return Err(err);
        }
    }
    Ok(())
}

/// A proposed grouping produced by a match function
///
/// Proposals are never persisted; only accepted ones are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(rename = "matchId")]
    pub match_id: String,
    #[serde(rename = "matchProfile", default)]
    pub match_profile: String,
    #[serde(rename = "matchFunction", default)]
    pub match_function: String,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
    #[serde(default)]
    pub backfill: Option<Backfill>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Match {
    pub fn ticket_ids(&self) -> impl Iterator<Item = &str> {
        self.tickets.iter().map(|t| t.id.as_str())
    }

    /// Backfill id, if the match carries an already persisted backfill
    pub fn backfill_id(&self) -> Option<&str> {
        self.backfill
            .as_ref()
            .map(|b| b.id.as_str())
            .filter(|id| !id.is_empty())
    }
}
