use indexmap::IndexMap;
use scraper::ElementRef;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::Document;
use crate::error::DocumentError;
use crate::postprocess::Candidate;
use crate::profile::{FieldSpec, ListingScraper, ScraperSpec, SelectorStyle};
use crate::select::evaluate;

pub const JOIN_SEPARATOR: &str = ", ";

/// Field name → extracted string, in the scraper's declaration order.
/// Missing data is an empty string, never an absent key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedRecord(IndexMap<String, String>);

impl ExtractedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// The value of `field` if present and non-empty.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.get(field).filter(|v| !v.is_empty())
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    /// Non-empty values of `other` override ours; empty ones never erase.
    pub fn merge(&mut self, other: ExtractedRecord) {
        for (field, value) in other.0 {
            if !value.is_empty() || !self.0.contains_key(&field) {
                self.0.insert(field, value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExtractedRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ExtractedRecord(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Raw values before `pattern` and post-processing. Every match is kept when
/// `all` is set, otherwise only the first usable one.
fn raw_values<'a>(scope: ElementRef<'a>, name: &str, field: &FieldSpec, all: bool) -> Vec<Candidate<'a>> {
    if let Some(iframe) = &field.iframe {
        return evaluate(scope, iframe)
            .into_iter()
            .find_map(|el| {
                el.value().attr("src").map(|src| Candidate {
                    value: src.trim().to_string(),
                    element: el,
                })
            })
            .into_iter()
            .collect();
    }

    let elements = match &field.selector {
        Some(spec) => evaluate(scope, spec),
        None => vec![scope],
    };
    if elements.is_empty() {
        debug!(field = name, "no elements matched");
        return Vec::new();
    }

    let read = |el: ElementRef<'a>| match &field.attribute {
        Some(attr) => el.value().attr(attr).map(|v| Candidate {
            value: v.trim().to_string(),
            element: el,
        }),
        None => Some(Candidate {
            value: text_of(el),
            element: el,
        }),
    };
    if all {
        elements.into_iter().filter_map(read).collect()
    } else {
        elements.into_iter().find_map(read).into_iter().collect()
    }
}

fn refine(name: &str, field: &FieldSpec, raw: String) -> String {
    match &field.pattern {
        Some(re) => match re.captures(&raw).and_then(|c| c.get(1)) {
            Some(group) => group.as_str().to_string(),
            None => {
                debug!(field = name, pattern = re.as_str(), value = %raw, "pattern did not match");
                raw
            }
        },
        None => raw,
    }
}

/// Resolve one field against `scope`. Absent data yields an empty string.
pub fn extract_field(scope: ElementRef<'_>, name: &str, field: &FieldSpec) -> String {
    let all = field.multiple || field.post_process.reduces();
    let candidates = raw_values(scope, name, field, all)
        .into_iter()
        .map(|c| Candidate {
            value: refine(name, field, c.value),
            element: c.element,
        })
        .collect();
    let values = field.post_process.apply_all(candidates).into_iter().map(|c| c.value);

    if !field.multiple {
        return values.into_iter().next().unwrap_or_default();
    }

    // text values are de-duplicated; attribute values are kept as found
    let by_text = field.attribute.is_none() && field.iframe.is_none();
    let mut seen: Vec<String> = Vec::new();
    let mut kept: Vec<String> = Vec::new();
    for value in values.filter(|v| !v.is_empty()) {
        if by_text {
            let key = value.to_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
        }
        kept.push(value);
    }
    kept.join(JOIN_SEPARATOR)
}

pub fn extract_record(scope: ElementRef<'_>, fields: &IndexMap<String, FieldSpec>) -> ExtractedRecord {
    fields
        .iter()
        .map(|(name, field)| (name.as_str(), extract_field(scope, name, field)))
        .collect()
}

/// Records of one page, plus the raw next-page link when the scraper
/// paginates by selector.
#[derive(Debug, Default)]
pub struct ExtractedPage {
    pub records: Vec<ExtractedRecord>,
    pub next_page: Option<String>,
}

/// One record for a record scraper; one per item for a listing scraper.
/// A listing page with no container or no items yields nothing.
pub fn run_scraper(doc: &Document, scraper: &ScraperSpec) -> Vec<ExtractedRecord> {
    let root = doc.root();
    match scraper {
        ScraperSpec::Record(fields) => vec![extract_record(root, fields)],
        ScraperSpec::Listing(listing) => {
            let container = match &listing.container {
                Some(spec) => match evaluate(root, spec).into_iter().next() {
                    Some(el) => el,
                    None => {
                        debug!("no container on page");
                        return Vec::new();
                    }
                },
                None => root,
            };
            evaluate(container, &listing.item)
                .into_iter()
                .map(|item| extract_record(item, &listing.fields))
                .collect()
        }
    }
}

fn next_page_link(doc: &Document, listing: &ListingScraper) -> Option<String> {
    let next = listing.next_page.as_ref()?;
    let link = evaluate(doc.root(), &next.selector)
        .into_iter()
        .next()
        .and_then(|el| el.value().attr(&next.attribute))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(str::to_string);
    if link.is_none() {
        debug!(selector = ?next.selector, "no next page link");
    }
    link
}

/// Parse `markup` and run `scraper` over it without keeping the tree around.
pub fn extract_page(
    markup: &str,
    style: SelectorStyle,
    scraper: &ScraperSpec,
) -> Result<Vec<ExtractedRecord>, DocumentError> {
    Ok(extract_listing(markup, style, scraper)?.records)
}

/// Like [`extract_page`], also reading the next-page link.
pub fn extract_listing(
    markup: &str,
    style: SelectorStyle,
    scraper: &ScraperSpec,
) -> Result<ExtractedPage, DocumentError> {
    let doc = Document::parse(markup, style)?;
    let next_page = match scraper {
        ScraperSpec::Listing(listing) => next_page_link(&doc, listing),
        ScraperSpec::Record(_) => None,
    };
    Ok(ExtractedPage {
        records: run_scraper(&doc, scraper),
        next_page,
    })
}
