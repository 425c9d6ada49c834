//! Profile documents as written in YAML, before validation.

use indexmap::IndexMap;
use serde::Deserialize;

use super::SelectorStyle;

#[derive(Debug, Deserialize)]
pub struct RawProfile {
    pub name: String,
    pub shortcode: String,
    pub domain: String,
    pub base_url: String,
    #[serde(default)]
    pub selector_style: SelectorStyle,
    #[serde(default)]
    pub use_selenium: bool,
    #[serde(default)]
    pub m3u8_mode: bool,
    #[serde(default)]
    pub no_overwrite: bool,
    #[serde(default)]
    pub url_encoding_rules: IndexMap<String, String>,
    #[serde(default)]
    pub download: Option<RawDownload>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub modes: IndexMap<String, RawMode>,
    #[serde(default)]
    pub scrapers: IndexMap<String, RawScraper>,
}

/// A scraper block: its fields, plus `pagination` for listing scrapers.
#[derive(Debug, Deserialize)]
pub struct RawScraper {
    #[serde(default)]
    pub pagination: Option<RawPagination>,
    #[serde(flatten)]
    pub fields: IndexMap<String, RawField>,
}

#[derive(Debug, Deserialize)]
pub struct RawPagination {
    #[serde(default)]
    pub next_page: Option<RawNextPage>,
    #[serde(default)]
    pub max_pages: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RawNextPage {
    pub selector: RawSelector,
    #[serde(default)]
    pub attribute: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawDownload {
    pub method: String,
}

#[derive(Debug, Deserialize)]
pub struct RawMode {
    pub url_pattern: String,
    #[serde(default)]
    pub url_pattern_pages: Option<String>,
    #[serde(default)]
    pub max_pages: Option<i64>,
    pub scraper: String,
    #[serde(default)]
    pub url_encoding_rules: Option<IndexMap<String, String>>,
    #[serde(default)]
    pub selector_style: Option<SelectorStyle>,
    #[serde(default)]
    pub tip: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

/// `field: "css"` shorthand or a full field map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawField {
    Selector(String),
    Spec(RawFieldSpec),
}

#[derive(Debug, Default, Deserialize)]
pub struct RawFieldSpec {
    #[serde(default)]
    pub selector: Option<RawSelector>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub iframe: Option<RawSelector>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default, rename = "postProcess")]
    pub post_process: Vec<RawStep>,
    #[serde(default)]
    pub multiple: Option<bool>,
    #[serde(default)]
    pub fields: Option<IndexMap<String, RawField>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawSelector {
    One(String),
    Many(Vec<String>),
}

/// One `postProcess` entry; exactly one operation key is expected.
#[derive(Debug, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub replace: Option<Vec<RawReplace>>,
    #[serde(default)]
    pub trim: Option<bool>,
    #[serde(default)]
    pub lowercase: Option<bool>,
    #[serde(default)]
    pub uppercase: Option<bool>,
    #[serde(default)]
    pub first: Option<bool>,
    #[serde(default)]
    pub max_attribute: Option<bool>,
    /// Parameters of `max_attribute`.
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub unknown: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RawReplace {
    pub regex: String,
    #[serde(default)]
    pub with: String,
}
