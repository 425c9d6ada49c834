use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// A profile that cannot be loaded. `path` points at the offending key,
/// e.g. `scrapers.list_scraper.video_item.fields.title.selector[1]`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no value supplied for `{{{name}}}` in `{template}`")]
    MissingParameter { name: String, template: String },
    #[error("unclosed placeholder in `{0}`")]
    Unclosed(String),
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed XML at byte {position}: {message}")]
    Xml { position: u64, message: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("fetching {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },
    #[error("automation session failed on {url}: {message}")]
    Automation { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("record has neither `download_url` nor `url`")]
    NoTarget,
    #[error("failed to hand off {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dispatcher rejected {url}: {reason}")]
    Rejected { url: String, reason: String },
}

/// Fatal errors a run can end with.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validate,
    Resolve,
    Fetch,
    Extract,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Validate => "validate",
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct RunError {
    pub stage: Stage,
    #[source]
    pub source: ScrapeError,
}

impl RunError {
    pub fn new(err: impl Into<ScrapeError>) -> Self {
        RunError::from(err.into())
    }
}

impl From<ScrapeError> for RunError {
    fn from(source: ScrapeError) -> Self {
        let stage = match &source {
            ScrapeError::Validation(_) => Stage::Validate,
            ScrapeError::Template(_) => Stage::Resolve,
            ScrapeError::Fetch(_) => Stage::Fetch,
            ScrapeError::Document(_) => Stage::Extract,
        };
        RunError { stage, source }
    }
}
