//! Search transport, per-kind defaults and pagination.

use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::domain::{EntityKind, FacetMap};
use crate::error::HarvestError;
use crate::request::{DEFAULT_MAX_URL_LENGTH, DEFAULT_PAGE_SIZE, Request, SEARCH_URL_TEMPLATE, search_url};
use crate::response::{Response, Responses};

/// Fetches one page of search results for a fully built url.
pub trait SearchTransport: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Response, HarvestError>;
}

/// Linear backoff for transient HTTP failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`, or `None` once retries are
    /// used up.
    pub fn backoff(&self, attempt: usize) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.base_delay * (attempt as u32 + 1))
    }
}

#[derive(Clone)]
pub struct EsgfHttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl EsgfHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("esgf-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::SearchHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::SearchHttp(err.to_string()))?;
        Ok(Self {
            client,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // Retries on 429/5xx and on connect or timeout errors.
    fn get_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, HarvestError> {
        let mut attempt = 0usize;
        loop {
            let retryable = match self.client.get(url).send() {
                Ok(resp) if is_retryable_status(resp.status().as_u16()) => {
                    RetryCause::Status(resp)
                }
                Ok(resp) => return Ok(resp),
                Err(err) if is_retryable_error(&err) => RetryCause::Transport(err),
                Err(err) => return Err(HarvestError::SearchHttp(err.to_string())),
            };
            let Some(delay) = self.retry.backoff(attempt) else {
                return match retryable {
                    RetryCause::Status(resp) => Ok(resp),
                    RetryCause::Transport(err) => Err(HarvestError::SearchHttp(err.to_string())),
                };
            };
            debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying search call");
            thread::sleep(delay);
            attempt += 1;
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, HarvestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "search request failed".to_string());
        Err(HarvestError::SearchStatus { status, message })
    }
}

enum RetryCause {
    Status(reqwest::blocking::Response),
    Transport(reqwest::Error),
}

impl SearchTransport for EsgfHttpClient {
    fn fetch(&self, url: &str) -> Result<Response, HarvestError> {
        let start = Instant::now();
        let response = self.get_with_retries(url)?;
        let response = Self::handle_status(response)?;
        let body: Value = response
            .json()
            .map_err(|err| HarvestError::SearchParse(err.to_string()))?;
        Response::from_search_json(&body, start.elapsed())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Default parameters per entity kind; caller facets are merged over them.
pub struct QueryDefaults;

impl QueryDefaults {
    pub fn dataset() -> FacetMap {
        FacetMap::from([
            ("type".to_string(), vec!["Dataset".to_string()]),
            ("distrib".to_string(), vec!["true".to_string()]),
            (
                "fields".to_string(),
                vec!["instance_id,id,variable,data_node,type,size".to_string()],
            ),
        ])
    }

    pub fn file() -> FacetMap {
        FacetMap::from([
            ("type".to_string(), vec!["File".to_string()]),
            ("distrib".to_string(), vec!["true".to_string()]),
        ])
    }

    pub fn for_kind(kind: EntityKind) -> FacetMap {
        match kind {
            EntityKind::Dataset => Self::dataset(),
            EntityKind::File => Self::file(),
        }
    }

    /// Defaults overridden by `query`.
    pub fn merged(kind: EntityKind, query: &FacetMap) -> FacetMap {
        let mut facets = Self::for_kind(kind);
        facets.extend(query.iter().map(|(key, values)| (key.clone(), values.clone())));
        facets
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub index_host: String,
    /// Records per search call.
    pub page_size: u64,
    /// Records kept per query; a result of exactly this size may be truncated.
    pub max_results: u64,
    pub max_url_length: usize,
    pub parallel_fetches: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            index_host: "esgf-node.llnl.gov".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_results: DEFAULT_PAGE_SIZE,
            max_url_length: DEFAULT_MAX_URL_LENGTH,
            parallel_fetches: 1,
        }
    }
}

/// Runs whole queries: defaults, pagination and page merging.
pub struct Searcher<T: SearchTransport> {
    transport: T,
    options: SearchOptions,
}

impl<T: SearchTransport> Searcher<T> {
    pub fn new(transport: T, options: SearchOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    pub fn request_for(&self, kind: EntityKind, query: &FacetMap) -> Result<Request, HarvestError> {
        let facets = QueryDefaults::merged(kind, query);
        let request = Request::new(
            search_url(SEARCH_URL_TEMPLATE, &facets),
            true,
            self.options.page_size.max(1),
        )?
        .with_max_length(self.options.max_url_length)
        .bind_host(&self.options.index_host);
        Ok(request)
    }

    pub fn search(&self, kind: EntityKind, query: &FacetMap) -> Result<Response, HarvestError> {
        let request = self.request_for(kind, query)?;
        let first = self.fetch_at(&request, 0)?;
        let num_found = first.num_found;
        let wanted = num_found.min(self.options.max_results);

        let offsets = (request.limit..wanted)
            .step_by(request.limit as usize)
            .collect::<Vec<_>>();
        debug!(kind = %kind, num_found, pages = offsets.len() + 1, "search");

        let mut pages = Responses::default();
        pages.add(first);
        for page in self.fetch_pages(&request, &offsets)? {
            pages.add(page);
        }

        let mut merged = pages.merge();
        merged.truncate(wanted as usize);
        merged.num_found = num_found;
        merged.num_result = merged.count() as u64;
        Ok(merged)
    }

    fn fetch_at(&self, request: &Request, offset: u64) -> Result<Response, HarvestError> {
        let url = request.at_offset(offset).build_url()?;
        self.transport.fetch(&url)
    }

    fn fetch_pages(&self, request: &Request, offsets: &[u64]) -> Result<Vec<Response>, HarvestError> {
        if self.options.parallel_fetches <= 1 {
            return offsets
                .iter()
                .map(|offset| self.fetch_at(request, *offset))
                .collect();
        }

        let mut pages = Vec::with_capacity(offsets.len());
        for batch in offsets.chunks(self.options.parallel_fetches) {
            let results = thread::scope(|scope| {
                let handles = batch
                    .iter()
                    .map(|offset| scope.spawn(move || self.fetch_at(request, *offset)))
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(HarvestError::SearchHttp("page fetch panicked".to_string()))
                        })
                    })
                    .collect::<Vec<_>>()
            });
            for result in results {
                pages.push(result?);
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_then_stops() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(0), Some(Duration::from_millis(200)));
        assert_eq!(retry.backoff(2), Some(Duration::from_millis(600)));
        assert_eq!(retry.backoff(3), None);
    }

    #[test]
    fn only_transient_statuses_retry() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(404));
    }
}
