use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FileListResult, ProgressEvent, ProgressSink, ReplayResult};
use crate::domain::FacetMap;
use crate::report::DedupSummary;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_file_list(result: &FileListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_dedup(summary: &DedupSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_selection(queries: &[FacetMap]) -> io::Result<()> {
        Self::print_json(&queries)
    }

    pub fn print_replay(result: &ReplayResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
