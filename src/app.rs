use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::{EntityKind, FacetMap, PipelineStatus, QuerySpec};
use crate::error::HarvestError;
use crate::pipeline::PipelineTables;
use crate::record::{AttachedParameters, Record};
use crate::report::RecordSink;
use crate::response::{QueryNotice, Response};
use crate::search::{SearchTransport, Searcher};
use crate::store::{MetadataStore, StoreKind, open_store};
use crate::transition::{EngineHandle, EngineReport, Signal};

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub kind: EntityKind,
    pub query: String,
    pub num_found: u64,
    pub num_result: u64,
    pub notice: Option<QueryNotice>,
}

/// A query that failed; the batch carries on without it.
#[derive(Debug, Clone, Serialize)]
pub struct QueryError {
    pub kind: EntityKind,
    pub query: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileListResult {
    pub generated_at: String,
    pub datasets: usize,
    pub files: usize,
    pub queries: Vec<QueryOutcome>,
    pub errors: Vec<QueryError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub reports: Vec<EngineReport>,
    pub statuses: BTreeMap<String, PipelineStatus>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<S: SearchTransport> {
    searcher: Searcher<S>,
    data_dir: Utf8PathBuf,
    store_kind: StoreKind,
}

impl<S: SearchTransport> App<S> {
    pub fn new(searcher: Searcher<S>, data_dir: Utf8PathBuf, store_kind: StoreKind) -> Self {
        Self {
            searcher,
            data_dir,
            store_kind,
        }
    }

    pub fn searcher(&self) -> &Searcher<S> {
        &self.searcher
    }

    /// Resolves every query to its datasets, then every dataset to its
    /// files, and hands each file record to `output`. A failing query is
    /// recorded and skipped.
    pub fn build_file_list(
        &self,
        queries: &[QuerySpec],
        attached: &AttachedParameters,
        output: &mut dyn RecordSink,
        sink: &dyn ProgressSink,
    ) -> Result<FileListResult, HarvestError> {
        let start = Instant::now();
        let mut outcomes = Vec::new();
        let mut errors = Vec::new();

        sink.event(ProgressEvent {
            message: format!("phase=Datasets; {} queries", queries.len()),
            elapsed: None,
        });
        let mut datasets = Vec::new();
        for query in queries {
            let Some(response) = self.run_query(
                EntityKind::Dataset,
                query.line(),
                query.facets(),
                &mut outcomes,
                &mut errors,
            ) else {
                continue;
            };
            let mut records = response.into_records();
            if let Some(variables) = query.variables() {
                for record in &mut records {
                    record.set_variables(variables);
                }
            }
            datasets.extend(records);
        }

        let groups = group_by_dataset(&datasets);
        info!(datasets = groups.len(), "retrieving file lists");
        sink.event(ProgressEvent {
            message: format!("phase=Files; {} datasets", groups.len()),
            elapsed: Some(start.elapsed()),
        });

        let mut store = open_store(self.store_kind, &self.data_dir)?;
        for (dataset_id, variables) in &groups {
            let mut facets = FacetMap::from([("dataset_id".to_string(), vec![dataset_id.clone()])]);
            if !variables.is_empty() {
                facets.insert("variable".to_string(), variables.iter().cloned().collect());
            }
            let label = format!(
                "{dataset_id} {}",
                variables.iter().cloned().collect::<Vec<_>>().join(",")
            );
            if let Some(response) =
                self.run_query(EntityKind::File, &label, &facets, &mut outcomes, &mut errors)
            {
                store.add_records(response.into_records())?;
            }
        }

        let exported = export(store.as_mut(), attached, output);
        store.close()?;
        let files = exported?;

        sink.event(ProgressEvent {
            message: format!("phase=Done; {files} files"),
            elapsed: Some(start.elapsed()),
        });

        Ok(FileListResult {
            generated_at: now_rfc3339(),
            datasets: groups.len(),
            files,
            queries: outcomes,
            errors,
        })
    }

    fn run_query(
        &self,
        kind: EntityKind,
        label: &str,
        facets: &FacetMap,
        outcomes: &mut Vec<QueryOutcome>,
        errors: &mut Vec<QueryError>,
    ) -> Option<Response> {
        match self.searcher.search(kind, facets) {
            Ok(response) => {
                let cap = self.searcher.options().max_results;
                let notice = QueryNotice::classify(response.count(), cap);
                match notice {
                    Some(QueryNotice::Empty) => {
                        warn!(kind = %kind, query = %label, "query returned nothing")
                    }
                    Some(QueryNotice::AtCap { cap }) => {
                        warn!(kind = %kind, query = %label, cap, "query result at upper limit")
                    }
                    None => {}
                }
                outcomes.push(QueryOutcome {
                    kind,
                    query: label.to_string(),
                    num_found: response.num_found,
                    num_result: response.num_result,
                    notice,
                });
                Some(response)
            }
            Err(err) => {
                error!(kind = %kind, query = %label, error = %err, "search query failed");
                errors.push(QueryError {
                    kind,
                    query: label.to_string(),
                    error: err.to_string(),
                });
                None
            }
        }
    }
}

fn export(
    store: &mut dyn MetadataStore,
    attached: &AttachedParameters,
    output: &mut dyn RecordSink,
) -> Result<usize, HarvestError> {
    store.attach_parameters(attached)?;
    store.for_each_record(&mut |record| output.record(record))?;
    store.count()
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Union of variables per dataset functional id.
pub fn group_by_dataset(datasets: &[Record]) -> BTreeMap<String, BTreeSet<String>> {
    let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for dataset in datasets {
        groups
            .entry(dataset.dataset_functional_id())
            .or_default()
            .extend(dataset.variable.iter().cloned());
    }
    groups
}

/// Feeds `signals` through a fresh engine thread, one report per signal.
pub fn replay_signals(
    tables: Arc<PipelineTables>,
    signals: Vec<Signal>,
    sink: &dyn ProgressSink,
) -> Result<ReplayResult, HarvestError> {
    let engine = EngineHandle::spawn(tables);
    let mut reports = Vec::with_capacity(signals.len());
    for signal in signals {
        let report = engine.submit(signal)?;
        if let EngineReport::Rejected { event, error } = &report {
            sink.event(ProgressEvent {
                message: format!("rejected {event}: {error}"),
                elapsed: None,
            });
        }
        reports.push(report);
    }
    let summary = engine.shutdown()?;
    Ok(ReplayResult {
        reports,
        statuses: summary.statuses,
    })
}
