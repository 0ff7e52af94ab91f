//! Static pipeline bindings: which pipeline an event starts, which pipeline
//! has to finish first, and which pipelines a finished one starts.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::PipelineStatus;
use crate::error::HarvestError;

pub const EVENT_OUTPUT12_VARIABLE_COMPLETE: &str = "EVENT_OUTPUT12_VARIABLE_COMPLETE";
pub const EVENT_OUTPUT12_LATEST_DATASET_COMPLETE: &str = "EVENT_OUTPUT12_LATEST_DATASET_COMPLETE";
pub const EVENT_VARIABLE_COMPLETE: &str = "EVENT_VARIABLE_COMPLETE";
pub const EVENT_CDF_VARIABLE_N: &str = "EVENT_CDF_VARIABLE_N";
pub const EVENT_CDF_DATASET: &str = "EVENT_CDF_DATASET";
pub const EVENT_CDF_VARIABLE_O: &str = "EVENT_CDF_VARIABLE_O";

/// Pipeline started by an event, and the status it starts in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTarget {
    pub pipeline: String,
    pub status: PipelineStatus,
}

impl PipelineTarget {
    pub fn new(pipeline: impl Into<String>, status: PipelineStatus) -> Self {
        Self {
            pipeline: pipeline.into(),
            status,
        }
    }
}

/// Validated, read-only pipeline bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTables {
    mapping: BTreeMap<String, PipelineTarget>,
    dependency: BTreeMap<String, String>,
    trigger: BTreeMap<String, Vec<String>>,
    trigger_status: PipelineStatus,
}

impl PipelineTables {
    pub fn new(
        mapping: BTreeMap<String, PipelineTarget>,
        dependency: BTreeMap<String, String>,
        trigger: BTreeMap<String, Vec<String>>,
        trigger_status: PipelineStatus,
    ) -> Result<Self, HarvestError> {
        let tables = Self {
            mapping,
            dependency,
            trigger,
            trigger_status,
        };
        tables.validate()?;
        Ok(tables)
    }

    /// The stock bindings for the IPSL/CDF post-processing chain.
    pub fn standard() -> Self {
        let mapping = BTreeMap::from([
            (
                EVENT_OUTPUT12_VARIABLE_COMPLETE.to_string(),
                PipelineTarget::new("IPSL_VARIABLE", PipelineStatus::Waiting),
            ),
            (
                EVENT_OUTPUT12_LATEST_DATASET_COMPLETE.to_string(),
                PipelineTarget::new("IPSL_DATASET", PipelineStatus::Pause),
            ),
            (
                EVENT_VARIABLE_COMPLETE.to_string(),
                PipelineTarget::new("IPSL", PipelineStatus::Waiting),
            ),
            // IPSL_DATASET may be done while IPSL_VARIABLE is still running.
            (
                EVENT_CDF_VARIABLE_N.to_string(),
                PipelineTarget::new("CDF_VARIABLE", PipelineStatus::Pause),
            ),
            (
                EVENT_CDF_DATASET.to_string(),
                PipelineTarget::new("CDF_DATASET", PipelineStatus::Pause),
            ),
            (
                EVENT_CDF_VARIABLE_O.to_string(),
                PipelineTarget::new("CDF", PipelineStatus::Pause),
            ),
        ]);
        let dependency = BTreeMap::from([
            ("CDF_VARIABLE".to_string(), "IPSL_DATASET".to_string()),
            ("CDF".to_string(), "IPSL".to_string()),
        ]);
        let trigger = BTreeMap::from([
            (
                "CDF_VARIABLE".to_string(),
                vec!["CDF_DATASET".to_string(), "NV2D".to_string()],
            ),
            (
                "IPSL_VARIABLE".to_string(),
                vec!["IPSL_DATASET".to_string(), "NV2D".to_string()],
            ),
        ]);
        Self {
            mapping,
            dependency,
            trigger,
            trigger_status: PipelineStatus::Waiting,
        }
    }

    pub fn target(&self, event: &str) -> Option<&PipelineTarget> {
        self.mapping.get(event)
    }

    /// Pipeline that must have finished before `pipeline` may start.
    pub fn dependency(&self, pipeline: &str) -> Option<&str> {
        self.dependency.get(pipeline).map(String::as_str)
    }

    /// Pipelines started once `pipeline` has finished, in declared order.
    pub fn triggers(&self, pipeline: &str) -> &[String] {
        self.trigger
            .get(pipeline)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn trigger_status(&self) -> PipelineStatus {
        self.trigger_status
    }

    pub fn mapping(&self) -> &BTreeMap<String, PipelineTarget> {
        &self.mapping
    }

    fn validate(&self) -> Result<(), HarvestError> {
        for (event, target) in &self.mapping {
            if event.trim().is_empty() || target.pipeline.trim().is_empty() {
                return Err(HarvestError::MalformedMapping(format!(
                    "empty name in mapping entry {event:?} -> {:?}",
                    target.pipeline
                )));
            }
            if target.status.is_terminal() {
                return Err(HarvestError::MalformedMapping(format!(
                    "event {event} maps to terminal status {}",
                    target.status
                )));
            }
        }
        if self.trigger_status.is_terminal() {
            return Err(HarvestError::MalformedMapping(format!(
                "trigger status cannot be terminal ({})",
                self.trigger_status
            )));
        }
        let names = self
            .dependency
            .iter()
            .flat_map(|(from, to)| [from, to])
            .chain(
                self.trigger
                    .iter()
                    .flat_map(|(from, to)| std::iter::once(from).chain(to)),
            );
        for name in names {
            if name.trim().is_empty() {
                return Err(HarvestError::MalformedMapping(
                    "empty pipeline name in dependency or trigger table".to_string(),
                ));
            }
        }
        if let Some(cycle) = find_dependency_cycle(&self.dependency) {
            return Err(HarvestError::DependencyCycle(cycle.join(" -> ")));
        }
        Ok(())
    }
}

/// Each pipeline has at most one predecessor, so following the chain from
/// every start either ends or loops.
fn find_dependency_cycle(dependency: &BTreeMap<String, String>) -> Option<Vec<String>> {
    let mut cleared: HashSet<&str> = HashSet::new();
    for start in dependency.keys() {
        let mut path: Vec<&str> = Vec::new();
        let mut current = start.as_str();
        loop {
            if cleared.contains(current) {
                break;
            }
            if let Some(position) = path.iter().position(|name| *name == current) {
                let mut cycle = path[position..]
                    .iter()
                    .map(|name: &&str| name.to_string())
                    .collect::<Vec<_>>();
                cycle.push(current.to_string());
                return Some(cycle);
            }
            path.push(current);
            match dependency.get(current) {
                Some(next) => current = next.as_str(),
                None => break,
            }
        }
        cleared.extend(path);
    }
    None
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn standard_tables_are_valid() {
        let tables = PipelineTables::standard();
        tables.validate().unwrap();
        assert_eq!(tables.dependency("CDF_VARIABLE"), Some("IPSL_DATASET"));
        assert_eq!(tables.triggers("IPSL_VARIABLE"), ["IPSL_DATASET", "NV2D"]);
        assert!(tables.triggers("NV2D").is_empty());
    }

    #[test]
    fn dependency_cycle_rejected() {
        let dependency = BTreeMap::from([
            ("A".to_string(), "B".to_string()),
            ("B".to_string(), "C".to_string()),
            ("C".to_string(), "A".to_string()),
        ]);
        let err = PipelineTables::new(
            BTreeMap::new(),
            dependency,
            BTreeMap::new(),
            PipelineStatus::Waiting,
        )
        .unwrap_err();
        assert_matches!(err, HarvestError::DependencyCycle(path) if path.starts_with("A -> B -> C -> A"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let dependency = BTreeMap::from([("A".to_string(), "A".to_string())]);
        let err = PipelineTables::new(
            BTreeMap::new(),
            dependency,
            BTreeMap::new(),
            PipelineStatus::Waiting,
        )
        .unwrap_err();
        assert_matches!(err, HarvestError::DependencyCycle(_));
    }

    #[test]
    fn terminal_initial_status_rejected() {
        let mapping = BTreeMap::from([(
            "EVENT_X".to_string(),
            PipelineTarget::new("X", PipelineStatus::Done),
        )]);
        let err = PipelineTables::new(
            mapping,
            BTreeMap::new(),
            BTreeMap::new(),
            PipelineStatus::Waiting,
        )
        .unwrap_err();
        assert_matches!(err, HarvestError::MalformedMapping(_));
    }
}
