//! Search results: records plus the totals every call must report.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::HarvestError;
use crate::record::{AttachedParameters, Record};

/// Count of hits for one facet value, as reported in the response footer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetItem {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetCounts {
    pub name: String,
    pub items: Vec<FacetItem>,
}

/// Parsed output of one or more search calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    records: Vec<Record>,
    /// Total matches on the index for the query.
    pub num_found: u64,
    /// Matches actually returned (depends on offset/limit).
    pub num_result: u64,
    /// Sum of all call durations when the query was paginated.
    pub call_duration: Duration,
    pub facet_counts: Vec<FacetCounts>,
    /// Keys attached to the records for the next stage.
    pub attached_parameter_names: BTreeSet<String>,
}

impl Response {
    pub fn new(
        records: Vec<Record>,
        num_found: Option<u64>,
        num_result: Option<u64>,
        call_duration: Duration,
    ) -> Result<Self, HarvestError> {
        let num_found = num_found.ok_or(HarvestError::MissingResponseField("num_found"))?;
        let num_result = num_result.ok_or(HarvestError::MissingResponseField("num_result"))?;
        Ok(Self {
            records,
            num_found,
            num_result,
            call_duration,
            facet_counts: Vec::new(),
            attached_parameter_names: BTreeSet::new(),
        })
    }

    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            num_found: 0,
            num_result: 0,
            call_duration: Duration::ZERO,
            facet_counts: Vec::new(),
            attached_parameter_names: BTreeSet::new(),
        }
    }

    /// Decodes a solr-style JSON search response.
    pub fn from_search_json(body: &Value, call_duration: Duration) -> Result<Self, HarvestError> {
        let inner = body
            .get("response")
            .ok_or(HarvestError::MissingResponseField("response"))?;
        let num_found = inner.get("numFound").and_then(Value::as_u64);
        let docs = inner
            .get("docs")
            .and_then(Value::as_array)
            .ok_or(HarvestError::MissingResponseField("docs"))?;
        let records = docs
            .iter()
            .map(|doc| serde_json::from_value::<Record>(doc.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| HarvestError::SearchParse(err.to_string()))?;
        let num_result = records.len() as u64;

        let mut response = Self::new(records, num_found, Some(num_result), call_duration)?;
        response.facet_counts = parse_facet_fields(body);
        Ok(response)
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Keeps parameters around across the search call so the next stage can
    /// see them.
    pub fn attach_parameters(&mut self, params: &AttachedParameters) -> Result<(), HarvestError> {
        attach_parameters(&mut self.records, params)?;
        self.attached_parameter_names
            .extend(params.keys().cloned());
        Ok(())
    }
}

/// Attaches a deep copy of `params` to every record. Fails without touching
/// anything if one record already carries parameters.
pub fn attach_parameters(records: &mut [Record], params: &AttachedParameters) -> Result<(), HarvestError> {
    if let Some(record) = records
        .iter()
        .find(|record| record.attached_parameters.is_some())
    {
        return Err(HarvestError::AlreadyAttached(record.id.clone()));
    }
    for record in records.iter_mut() {
        record.attach(params)?;
    }
    Ok(())
}

/// Pages of one logical query.
#[derive(Debug, Clone, Default)]
pub struct Responses {
    responses: Vec<Response>,
}

impl Responses {
    pub fn new(responses: Vec<Response>) -> Self {
        Self { responses }
    }

    pub fn add(&mut self, response: Response) {
        self.responses.push(response);
    }

    /// Concatenates records in page order and sums call durations. Totals
    /// are left for the caller to set.
    pub fn merge(self) -> Response {
        let mut merged = Response::empty();
        for response in self.responses {
            merged.call_duration += response.call_duration;
            if merged.facet_counts.is_empty() {
                merged.facet_counts = response.facet_counts;
            }
            merged.records.extend(response.records);
            merged
                .attached_parameter_names
                .extend(response.attached_parameter_names);
        }
        merged
    }
}

/// Non-error signals about a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryNotice {
    Empty,
    /// The result hit the page-size cap and may be truncated.
    AtCap { cap: u64 },
}

impl QueryNotice {
    pub fn classify(count: usize, cap: u64) -> Option<Self> {
        if count == 0 {
            Some(QueryNotice::Empty)
        } else if count as u64 == cap {
            Some(QueryNotice::AtCap { cap })
        } else {
            None
        }
    }
}

fn parse_facet_fields(body: &Value) -> Vec<FacetCounts> {
    let Some(fields) = body
        .get("facet_counts")
        .and_then(|counts| counts.get("facet_fields"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };

    fields
        .iter()
        .map(|(name, flat)| {
            // Solr encodes facet counts as [value, count, value, count, ...].
            let items = flat
                .as_array()
                .map(|values| {
                    values
                        .chunks(2)
                        .filter_map(|pair| match pair {
                            [value, count] => Some(FacetItem {
                                name: value.as_str()?.to_string(),
                                count: count.as_u64()?,
                            }),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            FacetCounts {
                name: name.clone(),
                items,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn decode_search_body() {
        let body = json!({
            "response": {
                "numFound": 42,
                "start": 0,
                "docs": [{"id": "d1", "type": "Dataset"}, {"id": "d2", "type": "Dataset"}]
            },
            "facet_counts": {"facet_fields": {"variable": ["tas", 10, "pr", 3]}}
        });
        let response = Response::from_search_json(&body, Duration::from_millis(5)).unwrap();
        assert_eq!(response.num_found, 42);
        assert_eq!(response.num_result, 2);
        assert_eq!(response.facet_counts[0].items[1].name, "pr");
        assert_eq!(response.facet_counts[0].items[1].count, 3);
    }

    #[test]
    fn missing_total_is_construction_error() {
        let body = json!({"response": {"docs": []}});
        let err = Response::from_search_json(&body, Duration::ZERO).unwrap_err();
        assert_matches!(err, HarvestError::MissingResponseField("num_found"));

        let err = Response::new(Vec::new(), Some(1), None, Duration::ZERO).unwrap_err();
        assert_matches!(err, HarvestError::MissingResponseField("num_result"));
    }

    #[test]
    fn classify_notices() {
        assert_eq!(QueryNotice::classify(0, 10_000), Some(QueryNotice::Empty));
        assert_eq!(
            QueryNotice::classify(10_000, 10_000),
            Some(QueryNotice::AtCap { cap: 10_000 })
        );
        assert_eq!(QueryNotice::classify(12, 10_000), None);
    }

    #[test]
    fn failed_attach_leaves_records_untouched() {
        let mut first = Record::new("a");
        first.attached_parameters = Some(AttachedParameters::new());
        let mut records = vec![Record::new("b"), first];
        let params = AttachedParameters::from([("k".to_string(), json!(1))]);

        let err = attach_parameters(&mut records, &params).unwrap_err();
        assert_matches!(err, HarvestError::AlreadyAttached(id) if id == "a");
        assert!(records[0].attached_parameters.is_none());
    }
}
