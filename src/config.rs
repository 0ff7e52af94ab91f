use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::PipelineStatus;
use crate::error::HarvestError;
use crate::pipeline::{PipelineTables, PipelineTarget};
use crate::request::{DEFAULT_MAX_URL_LENGTH, DEFAULT_PAGE_SIZE};
use crate::search::SearchOptions;
use crate::store::StoreKind;

pub const DEFAULT_CONFIG_FILE: &str = "esgf-harvest.json";
pub const DEFAULT_INDEX_HOST: &str = "esgf-node.llnl.gov";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub index_host: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub lowmem: Option<bool>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub max_results: Option<u64>,
    #[serde(default)]
    pub max_url_length: Option<usize>,
    #[serde(default)]
    pub parallel_fetches: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub pipelines: Option<PipelineConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mapping: BTreeMap<String, MappingEntry>,
    #[serde(default)]
    pub dependency: BTreeMap<String, String>,
    #[serde(default)]
    pub trigger: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub trigger_status: Option<String>,
}

/// `"EVENT": ["PIPELINE", "STATUS"]` or `"EVENT": {"pipeline": .., "status": ..}`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MappingEntry {
    Pair(String, String),
    Detailed { pipeline: String, status: String },
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: Utf8PathBuf,
    pub store_kind: StoreKind,
    pub search: SearchOptions,
    pub timeout: Duration,
    pub pipelines: Arc<PipelineTables>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `esgf-harvest.json` from the working directory when
    /// present, or built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            if path.is_none() {
                return Self::resolve_config(Config::default());
            }
            return Err(HarvestError::MissingConfig(config_path));
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let data_dir = match config.data_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_data_dir()?,
        };

        let search = SearchOptions {
            index_host: config
                .index_host
                .unwrap_or_else(|| DEFAULT_INDEX_HOST.to_string()),
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
            max_results: config.max_results.unwrap_or(DEFAULT_PAGE_SIZE),
            max_url_length: config.max_url_length.unwrap_or(DEFAULT_MAX_URL_LENGTH),
            parallel_fetches: config.parallel_fetches.unwrap_or(1).max(1),
        };

        let pipelines = match config.pipelines {
            Some(pipelines) => resolve_pipelines(pipelines)?,
            None => PipelineTables::standard(),
        };

        Ok(ResolvedConfig {
            data_dir,
            store_kind: StoreKind::from_lowmem(config.lowmem.unwrap_or(false)),
            search,
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(60)),
            pipelines: Arc::new(pipelines),
        })
    }
}

fn resolve_pipelines(config: PipelineConfig) -> Result<PipelineTables, HarvestError> {
    let mapping = config
        .mapping
        .into_iter()
        .map(|(event, entry)| {
            let (pipeline, status) = match entry {
                MappingEntry::Pair(pipeline, status) => (pipeline, status),
                MappingEntry::Detailed { pipeline, status } => (pipeline, status),
            };
            Ok((event, PipelineTarget::new(pipeline, status.parse()?)))
        })
        .collect::<Result<BTreeMap<_, _>, HarvestError>>()?;

    let trigger_status = match config.trigger_status {
        Some(status) => status.parse()?,
        None => PipelineStatus::Waiting,
    };

    PipelineTables::new(mapping, config.dependency, config.trigger, trigger_status)
}

pub fn default_data_dir() -> Result<Utf8PathBuf, HarvestError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("esgf-harvest")).ok()
        })
        .ok_or_else(|| HarvestError::Filesystem("unable to resolve data directory".to_string()))
}
