use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HarvestError;

/// Search facets: facet name to accepted values.
pub type FacetMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum EntityKind {
    Dataset,
    File,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Dataset => write!(f, "Dataset"),
            EntityKind::File => write!(f, "File"),
        }
    }
}

/// Pipeline run status. Declaration order is the activation order: a
/// pipeline only ever moves towards `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    New,
    Waiting,
    Pause,
    Running,
    Done,
    Error,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStatus::Done | PipelineStatus::Error)
    }

    pub fn is_success(self) -> bool {
        self == PipelineStatus::Done
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineStatus::New => "NEW",
            PipelineStatus::Waiting => "WAITING",
            PipelineStatus::Pause => "PAUSE",
            PipelineStatus::Running => "RUNNING",
            PipelineStatus::Done => "DONE",
            PipelineStatus::Error => "ERROR",
        };
        write!(f, "{label}")
    }
}

impl FromStr for PipelineStatus {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(PipelineStatus::New),
            "WAITING" => Ok(PipelineStatus::Waiting),
            "PAUSE" => Ok(PipelineStatus::Pause),
            "RUNNING" => Ok(PipelineStatus::Running),
            "DONE" => Ok(PipelineStatus::Done),
            "ERROR" => Ok(PipelineStatus::Error),
            _ => Err(HarvestError::MalformedMapping(format!(
                "unknown pipeline status: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    New,
    Processed,
    Deferred,
    Ignored,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_functional_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A completion report from some processing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: EventStatus::New,
            payload: EventPayload::default(),
        }
    }

    pub fn for_dataset(name: impl Into<String>, dataset_functional_id: impl Into<String>) -> Self {
        let mut event = Self::new(name);
        event.payload.dataset_functional_id = Some(dataset_functional_id.into());
        event
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One search query, written as `key=v1,v2 key2=v3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    line: String,
    facets: FacetMap,
}

impl QuerySpec {
    pub fn facets(&self) -> &FacetMap {
        &self.facets
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn variables(&self) -> Option<&[String]> {
        self.facets.get("variable").map(Vec::as_slice)
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}

impl FromStr for QuerySpec {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let line = value.trim();
        if line.is_empty() {
            return Err(HarvestError::InvalidQuery("empty query".to_string()));
        }
        let mut facets = FacetMap::new();
        for token in line.split_whitespace() {
            let (key, values) = token
                .split_once('=')
                .ok_or_else(|| HarvestError::InvalidQuery(value.to_string()))?;
            if key.is_empty() {
                return Err(HarvestError::InvalidQuery(value.to_string()));
            }
            let values = values
                .split(',')
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();
            facets.entry(key.to_string()).or_default().extend(values);
        }
        Ok(Self {
            line: line.to_string(),
            facets,
        })
    }
}

/// Parses a query file, one query per line; blank and `#` lines are skipped.
pub fn parse_query_file(content: &str) -> Result<Vec<QuerySpec>, HarvestError> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::parse)
        .collect()
}
