use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("index host must be set before building the url: {0}")]
    UnresolvedHost(String),

    #[error("dependency cycle between pipelines: {0}")]
    DependencyCycle(String),

    #[error("malformed pipeline mapping: {0}")]
    MalformedMapping(String),

    #[error("missing config file {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("url is too long ({length} > {max})")]
    UrlTooLong { length: usize, max: usize },

    #[error("url already carries a limit or offset keyword while pagination is enabled: {0}")]
    UnexpectedLimit(String),

    #[error("search response is missing mandatory field: {0}")]
    MissingResponseField(&'static str),

    #[error("record {0} already carries attached parameters")]
    AlreadyAttached(String),

    #[error("selection {0} does not belong to this tree")]
    UnknownSelection(usize),

    #[error("no pipeline mapped to event: {0}")]
    UnknownEvent(String),

    #[error("transition engine has stopped")]
    EngineStopped,

    #[error("search request failed: {0}")]
    SearchHttp(String),

    #[error("search service returned status {status}: {message}")]
    SearchStatus { status: u16, message: String },

    #[error("failed to parse search response: {0}")]
    SearchParse(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("metadata storage error: {0}")]
    Storage(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("csv error: {0}")]
    Csv(String),
}

/// Coarse failure classes used to decide what a failure aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Construction,
    UnknownEvent,
    Query,
    Storage,
}

impl ErrorClass {
    /// Recoverable failures are isolated to one event or one query.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorClass::UnknownEvent | ErrorClass::Query)
    }
}

impl HarvestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HarvestError::UnresolvedHost(_)
            | HarvestError::DependencyCycle(_)
            | HarvestError::MalformedMapping(_)
            | HarvestError::MissingConfig(_)
            | HarvestError::ConfigRead(_)
            | HarvestError::ConfigParse(_)
            | HarvestError::EngineStopped => ErrorClass::Configuration,
            HarvestError::UrlTooLong { .. }
            | HarvestError::UnexpectedLimit(_)
            | HarvestError::MissingResponseField(_)
            | HarvestError::AlreadyAttached(_)
            | HarvestError::UnknownSelection(_) => ErrorClass::Construction,
            HarvestError::UnknownEvent(_) => ErrorClass::UnknownEvent,
            HarvestError::SearchHttp(_)
            | HarvestError::SearchStatus { .. }
            | HarvestError::SearchParse(_)
            | HarvestError::InvalidQuery(_) => ErrorClass::Query,
            HarvestError::Storage(_) | HarvestError::Filesystem(_) | HarvestError::Csv(_) => {
                ErrorClass::Storage
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            HarvestError::DependencyCycle("A -> B -> A".to_string()).class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            HarvestError::UrlTooLong {
                length: 4000,
                max: 3500
            }
            .class(),
            ErrorClass::Construction
        );
        assert!(
            HarvestError::UnknownEvent("X".to_string())
                .class()
                .is_recoverable()
        );
        assert!(
            HarvestError::SearchHttp("timeout".to_string())
                .class()
                .is_recoverable()
        );
        assert!(
            !HarvestError::AlreadyAttached("f1".to_string())
                .class()
                .is_recoverable()
        );
    }
}
