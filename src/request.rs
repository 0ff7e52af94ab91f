//! Search urls with an explicit offset/limit window.

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::FacetMap;
use crate::error::HarvestError;

/// Placeholder for the index host in url templates.
pub const INDEX_HOST_MARK: &str = "{index_host}";
pub const DEFAULT_PAGE_SIZE: u64 = 10_000;
/// Index front-ends reject GET lines much longer than this.
pub const DEFAULT_MAX_URL_LENGTH: usize = 3500;

pub const SEARCH_URL_TEMPLATE: &str =
    "https://{index_host}/esg-search/search?format=application%2Fsolr%2Bjson";

/// One search call: a base url plus the offset/limit window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    base_url: String,
    pagination: bool,
    pub offset: u64,
    pub limit: u64,
    max_length: usize,
}

impl Request {
    pub fn new(base_url: impl Into<String>, pagination: bool, limit: u64) -> Result<Self, HarvestError> {
        let base_url = base_url.into();
        let embedded = url_contains_limit_keyword(&base_url) || url_contains_offset_keyword(&base_url);
        if pagination && embedded {
            return Err(HarvestError::UnexpectedLimit(base_url));
        }
        Ok(Self {
            base_url,
            pagination,
            offset: 0,
            limit,
            max_length: DEFAULT_MAX_URL_LENGTH,
        })
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Replaces the host placeholder, if any.
    pub fn bind_host(mut self, host: &str) -> Self {
        self.base_url = self.base_url.replace(INDEX_HOST_MARK, host);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_paginated(&self) -> bool {
        self.pagination
    }

    /// Same request, moved to another window.
    pub fn at_offset(&self, offset: u64) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    // Without pagination the caller may have set its own window already.
    fn limit_filter(&self) -> String {
        if !self.pagination && url_contains_limit_keyword(&self.base_url) {
            return String::new();
        }
        format!("&limit={}", self.limit)
    }

    fn offset_filter(&self) -> String {
        if !self.pagination && url_contains_offset_keyword(&self.base_url) {
            return String::new();
        }
        format!("&offset={}", self.offset)
    }

    pub fn build_url(&self) -> Result<String, HarvestError> {
        let url = format!(
            "{}{}{}",
            self.base_url,
            self.limit_filter(),
            self.offset_filter()
        );

        if url.contains(INDEX_HOST_MARK) {
            return Err(HarvestError::UnresolvedHost(url));
        }
        if url.len() > self.max_length {
            return Err(HarvestError::UrlTooLong {
                length: url.len(),
                max: self.max_length,
            });
        }
        Ok(url)
    }
}

static LIMIT_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]limit=").expect("valid limit pattern"));
static OFFSET_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]offset=").expect("valid offset pattern"));

pub fn url_contains_limit_keyword(url: &str) -> bool {
    LIMIT_KEYWORD.is_match(url)
}

pub fn url_contains_offset_keyword(url: &str) -> bool {
    OFFSET_KEYWORD.is_match(url)
}

/// Serializes one facet as repeated `&name=value` pairs.
pub fn serialize_facet(name: &str, values: &[String]) -> String {
    values
        .iter()
        .map(|value| format!("&{name}={value}"))
        .collect::<String>()
}

/// Appends every facet of `facets` to `template`.
pub fn search_url(template: &str, facets: &FacetMap) -> String {
    let mut url = template.to_string();
    for (name, values) in facets {
        url.push_str(&serialize_facet(name, values));
    }
    url
}
