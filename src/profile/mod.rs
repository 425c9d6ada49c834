pub mod matching;
pub mod raw;
pub mod source;

use std::collections::HashSet;
use std::str::FromStr;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::dispatch::DownloadMethod;
use crate::error::ValidationError;
use crate::postprocess::{AttrKind, Pipeline, Replacement, Step};
use crate::select::{CompiledSelector, SelectorSpec};
use crate::template::{self, Params};
use raw::{RawField, RawFieldSpec, RawMode, RawPagination, RawProfile, RawScraper, RawSelector, RawStep};

pub use matching::{match_url, ModeMatch};
pub use source::ProfileSet;

/// Field names that collect every matched element unless `multiple: false`.
pub const MULTI_VALUED_FIELDS: &[&str] = &["tags", "actors", "producers", "studios"];

pub const VIDEO_MODE: &str = "video";
const RSS_MODE: &str = "rss";
const CONTAINER_KEY: &str = "video_container";
const ITEM_KEY: &str = "video_item";
const PAGINATION_KEY: &str = "pagination";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorStyle {
    #[default]
    Css,
    Xml,
}

/// Literal substring replacements, applied in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodingRules(Vec<(String, String)>);

impl EncodingRules {
    pub fn new(rules: Vec<(String, String)>) -> Self {
        EncodingRules(rules)
    }

    pub fn apply(&self, value: &str) -> String {
        self.0
            .iter()
            .fold(value.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<IndexMap<String, String>> for EncodingRules {
    fn from(map: IndexMap<String, String>) -> Self {
        EncodingRules(map.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct SiteProfile {
    pub name: String,
    pub shortcode: String,
    pub domain: String,
    pub base_url: String,
    pub selector_style: SelectorStyle,
    pub use_selenium: bool,
    pub m3u8_mode: bool,
    pub no_overwrite: bool,
    pub url_encoding_rules: EncodingRules,
    pub download_method: DownloadMethod,
    pub note: Option<String>,
    pub modes: IndexMap<String, ModeSpec>,
    pub scrapers: IndexMap<String, ScraperSpec>,
}

#[derive(Debug, Clone)]
pub struct ModeSpec {
    pub name: String,
    pub url_pattern: String,
    pub url_pattern_pages: Option<String>,
    pub max_pages: u32,
    pub scraper: String,
    pub url_encoding_rules: Option<EncodingRules>,
    pub selector_style: SelectorStyle,
    pub tip: Option<String>,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ScraperSpec {
    /// Fields applied directly to the fetched document.
    Record(IndexMap<String, FieldSpec>),
    Listing(ListingScraper),
}

#[derive(Debug, Clone)]
pub struct ListingScraper {
    /// `None` means the document root is the container.
    pub container: Option<SelectorSpec>,
    pub item: SelectorSpec,
    pub fields: IndexMap<String, FieldSpec>,
    /// Link to follow when the mode has no `url_pattern_pages`.
    pub next_page: Option<NextPage>,
    /// Page cap for modes that do not set their own `max_pages`.
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NextPage {
    pub selector: SelectorSpec,
    pub attribute: String,
}

#[derive(Debug, Clone, Default)]
pub struct FieldSpec {
    pub selector: Option<SelectorSpec>,
    pub attribute: Option<String>,
    pub iframe: Option<SelectorSpec>,
    pub pattern: Option<Regex>,
    pub post_process: Pipeline,
    pub multiple: bool,
}

impl SiteProfile {
    pub fn from_yaml(text: &str) -> Result<Self, ValidationError> {
        let raw: RawProfile =
            serde_yaml::from_str(text).map_err(|e| ValidationError::new("<document>", e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawProfile) -> Result<Self, ValidationError> {
        Url::parse(&raw.base_url)
            .map_err(|e| ValidationError::new("base_url", format!("not an absolute URL: {e}")))?;

        let download_method = match &raw.download {
            Some(d) => DownloadMethod::from_str(&d.method)
                .map_err(|e| ValidationError::new("download.method", e))?,
            None => DownloadMethod::default(),
        };

        // a scraper serving any XML-style mode gets XML selector folding
        let xml_scrapers: HashSet<String> = raw
            .modes
            .iter()
            .filter(|(name, mode)| mode_style(name, mode, raw.selector_style) == SelectorStyle::Xml)
            .map(|(_, mode)| mode.scraper.clone())
            .collect();

        let mut scrapers = IndexMap::new();
        for (name, scraper) in raw.scrapers {
            let style = if xml_scrapers.contains(&name) {
                SelectorStyle::Xml
            } else {
                raw.selector_style
            };
            let spec = build_scraper(&format!("scrapers.{name}"), scraper, style)?;
            scrapers.insert(name, spec);
        }

        let mut modes = IndexMap::new();
        for (name, mode) in raw.modes {
            let spec = build_mode(&name, mode, raw.selector_style, &scrapers)?;
            modes.insert(name, spec);
        }

        Ok(SiteProfile {
            name: raw.name,
            shortcode: raw.shortcode,
            domain: raw.domain,
            base_url: raw.base_url,
            selector_style: raw.selector_style,
            use_selenium: raw.use_selenium,
            m3u8_mode: raw.m3u8_mode,
            no_overwrite: raw.no_overwrite,
            url_encoding_rules: raw.url_encoding_rules.into(),
            download_method,
            note: raw.note,
            modes,
            scrapers,
        })
    }

    pub fn mode(&self, name: &str) -> Option<&ModeSpec> {
        self.modes.get(name)
    }

    pub fn scraper_for(&self, mode: &ModeSpec) -> &ScraperSpec {
        // presence checked at load
        &self.scrapers[mode.scraper.as_str()]
    }

    /// Modes a user can start a crawl from; `video` is reached through URLs.
    pub fn listing_modes(&self) -> impl Iterator<Item = &ModeSpec> {
        self.modes.values().filter(|m| m.name != VIDEO_MODE)
    }

    /// Fail before any fetch when the invocation lacks a placeholder value.
    pub fn check_invocation(&self, mode: &ModeSpec, params: &Params) -> Result<(), ValidationError> {
        let mut templates = vec![("url_pattern", &mode.url_pattern)];
        if let Some(pages) = &mode.url_pattern_pages {
            templates.push(("url_pattern_pages", pages));
        }
        for (key, tpl) in templates {
            let path = format!("modes.{}.{key}", mode.name);
            let names = template::required_params(tpl).map_err(|e| ValidationError::new(&path, e.to_string()))?;
            if let Some(missing) = names.iter().find(|n| !params.contains_key(**n)) {
                return Err(ValidationError::new(
                    path,
                    format!("no value supplied for `{{{missing}}}`"),
                ));
            }
        }
        Ok(())
    }
}

impl ModeSpec {
    pub fn paginates(&self) -> bool {
        self.url_pattern_pages.is_some()
    }
}

fn build_mode(
    name: &str,
    raw: RawMode,
    site_style: SelectorStyle,
    scrapers: &IndexMap<String, ScraperSpec>,
) -> Result<ModeSpec, ValidationError> {
    let path = format!("modes.{name}");

    let scraper = scrapers.get(&raw.scraper).ok_or_else(|| {
        ValidationError::new(format!("{path}.scraper"), format!("no scraper named `{}`", raw.scraper))
    })?;
    match (name == VIDEO_MODE, scraper) {
        (true, ScraperSpec::Listing(_)) => {
            return Err(ValidationError::new(
                format!("{path}.scraper"),
                "the video mode needs a record scraper",
            ))
        }
        (false, ScraperSpec::Record(_)) => {
            return Err(ValidationError::new(
                format!("{path}.scraper"),
                format!("listing scraper `{}` lacks both `{CONTAINER_KEY}` and `{ITEM_KEY}`", raw.scraper),
            ))
        }
        _ => {}
    }

    // A next-link chain without a cap runs until a page has no link.
    let fallback = match scraper {
        ScraperSpec::Listing(listing) if raw.url_pattern_pages.is_none() && listing.next_page.is_some() => {
            Some(listing.max_pages.unwrap_or(u32::MAX))
        }
        ScraperSpec::Listing(listing) => listing.max_pages,
        ScraperSpec::Record(_) => None,
    };
    let max_pages = match raw.max_pages {
        Some(n) => positive(&format!("{path}.max_pages"), n)?,
        None => fallback.unwrap_or(1),
    };

    template::parse(&raw.url_pattern)
        .map_err(|e| ValidationError::new(format!("{path}.url_pattern"), e.to_string()))?;
    if let Some(pages) = &raw.url_pattern_pages {
        template::parse(pages)
            .map_err(|e| ValidationError::new(format!("{path}.url_pattern_pages"), e.to_string()))?;
    }

    let selector_style = mode_style(name, &raw, site_style);

    Ok(ModeSpec {
        name: name.to_string(),
        url_pattern: raw.url_pattern,
        url_pattern_pages: raw.url_pattern_pages,
        max_pages,
        scraper: raw.scraper,
        url_encoding_rules: raw.url_encoding_rules.map(EncodingRules::from),
        selector_style,
        tip: raw.tip,
        examples: raw.examples,
    })
}

fn mode_style(name: &str, raw: &RawMode, site_style: SelectorStyle) -> SelectorStyle {
    raw.selector_style.unwrap_or(if name == RSS_MODE {
        SelectorStyle::Xml
    } else {
        site_style
    })
}

fn positive(path: &str, n: i64) -> Result<u32, ValidationError> {
    if n <= 0 {
        return Err(ValidationError::new(path, "must be positive"));
    }
    Ok(u32::try_from(n).unwrap_or(u32::MAX))
}

fn build_scraper(path: &str, raw: RawScraper, style: SelectorStyle) -> Result<ScraperSpec, ValidationError> {
    let RawScraper { pagination, mut fields } = raw;
    let container = fields.shift_remove(CONTAINER_KEY);
    let item = fields.shift_remove(ITEM_KEY);

    match (container, item) {
        (None, None) if pagination.is_some() => Err(ValidationError::new(
            format!("{path}.{PAGINATION_KEY}"),
            format!("only listing scrapers paginate; `{ITEM_KEY}` is missing"),
        )),
        (None, None) => Ok(ScraperSpec::Record(build_fields(path, fields, style)?)),
        (Some(_), None) => Err(ValidationError::new(
            format!("{path}.{ITEM_KEY}"),
            format!("required when `{CONTAINER_KEY}` is declared"),
        )),
        (container, Some(item)) => {
            let container = match container {
                Some(raw) => {
                    let spec = into_spec(raw);
                    let sel_path = format!("{path}.{CONTAINER_KEY}.selector");
                    let selector = spec
                        .selector
                        .map(|s| build_selector(&sel_path, s, style))
                        .transpose()?;
                    Some(selector.ok_or_else(|| ValidationError::new(sel_path, "missing"))?)
                }
                None => None,
            };

            let mut item = into_spec(item);
            let item_path = format!("{path}.{ITEM_KEY}");
            let item_selector = item
                .selector
                .take()
                .map(|s| build_selector(&format!("{item_path}.selector"), s, style))
                .transpose()?
                .ok_or_else(|| ValidationError::new(format!("{item_path}.selector"), "missing"))?;
            let nested = item.fields.take().unwrap_or_default();

            let (next_page, max_pages) = match pagination {
                Some(p) => build_pagination(&format!("{path}.{PAGINATION_KEY}"), p, style)?,
                None => (None, None),
            };

            Ok(ScraperSpec::Listing(ListingScraper {
                container,
                item: item_selector,
                fields: build_fields(&format!("{item_path}.fields"), nested, style)?,
                next_page,
                max_pages,
            }))
        }
    }
}

fn build_pagination(
    path: &str,
    raw: RawPagination,
    style: SelectorStyle,
) -> Result<(Option<NextPage>, Option<u32>), ValidationError> {
    let next_page = raw
        .next_page
        .map(|next| {
            Ok::<_, ValidationError>(NextPage {
                selector: build_selector(&format!("{path}.next_page.selector"), next.selector, style)?,
                attribute: next.attribute.unwrap_or_else(|| "href".to_string()),
            })
        })
        .transpose()?;
    let max_pages = raw
        .max_pages
        .map(|n| positive(&format!("{path}.max_pages"), n))
        .transpose()?;
    Ok((next_page, max_pages))
}

fn into_spec(raw: RawField) -> RawFieldSpec {
    match raw {
        RawField::Selector(selector) => RawFieldSpec {
            selector: Some(RawSelector::One(selector)),
            ..RawFieldSpec::default()
        },
        RawField::Spec(spec) => spec,
    }
}

fn build_fields(
    path: &str,
    fields: IndexMap<String, RawField>,
    style: SelectorStyle,
) -> Result<IndexMap<String, FieldSpec>, ValidationError> {
    fields
        .into_iter()
        .map(|(name, raw)| {
            let spec = build_field(&format!("{path}.{name}"), &name, into_spec(raw), style)?;
            Ok((name, spec))
        })
        .collect()
}

fn build_field(path: &str, name: &str, raw: RawFieldSpec, style: SelectorStyle) -> Result<FieldSpec, ValidationError> {
    let selector = raw
        .selector
        .map(|s| build_selector(&format!("{path}.selector"), s, style))
        .transpose()?;
    let iframe = raw
        .iframe
        .map(|s| build_selector(&format!("{path}.iframe"), s, style))
        .transpose()?;

    let pattern = match raw.pattern {
        Some(p) => {
            let re = Regex::new(&p).map_err(|e| ValidationError::new(format!("{path}.pattern"), e.to_string()))?;
            if re.captures_len() < 2 {
                return Err(ValidationError::new(format!("{path}.pattern"), "needs a capture group"));
            }
            Some(re)
        }
        None => None,
    };

    let steps = raw
        .post_process
        .into_iter()
        .enumerate()
        .map(|(i, step)| build_step(&format!("{path}.postProcess[{i}]"), step))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FieldSpec {
        selector,
        attribute: raw.attribute,
        iframe,
        pattern,
        post_process: Pipeline::new(steps),
        multiple: raw.multiple.unwrap_or_else(|| MULTI_VALUED_FIELDS.contains(&name)),
    })
}

fn build_selector(path: &str, raw: RawSelector, style: SelectorStyle) -> Result<SelectorSpec, ValidationError> {
    match raw {
        RawSelector::One(source) => CompiledSelector::parse(&source, style)
            .map(SelectorSpec::Single)
            .map_err(|e| ValidationError::new(path, e)),
        RawSelector::Many(list) if list.is_empty() => Err(ValidationError::new(path, "empty selector list")),
        RawSelector::Many(list) => list
            .iter()
            .enumerate()
            .map(|(i, source)| {
                CompiledSelector::parse(source, style).map_err(|e| ValidationError::new(format!("{path}[{i}]"), e))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(SelectorSpec::Fallback),
    }
}

fn build_step(path: &str, raw: RawStep) -> Result<Step, ValidationError> {
    if let Some(key) = raw.unknown.keys().next() {
        return Err(ValidationError::new(path, format!("unsupported operation `{key}`")));
    }

    let mut ops = Vec::new();
    if let Some(pairs) = raw.replace {
        let compiled = pairs
            .iter()
            .enumerate()
            .map(|(i, pair)| {
                Replacement::new(&pair.regex, &pair.with)
                    .map_err(|e| ValidationError::new(format!("{path}.replace[{i}].regex"), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        ops.push(Step::Replace(compiled));
    }
    if raw.trim == Some(true) {
        ops.push(Step::Trim);
    }
    if raw.lowercase == Some(true) {
        ops.push(Step::Lowercase);
    }
    if raw.uppercase == Some(true) {
        ops.push(Step::Uppercase);
    }
    if raw.first == Some(true) {
        ops.push(Step::First);
    }
    if raw.max_attribute == Some(true) {
        let attribute = raw
            .attribute
            .ok_or_else(|| ValidationError::new(format!("{path}.attribute"), "required by `max_attribute`"))?;
        let kind = match raw.kind.as_deref() {
            Some(k) => k
                .parse::<AttrKind>()
                .map_err(|e| ValidationError::new(format!("{path}.type"), e))?,
            None => AttrKind::default(),
        };
        ops.push(Step::MaxAttribute { attribute, kind });
    } else if raw.attribute.is_some() || raw.kind.is_some() {
        return Err(ValidationError::new(path, "`attribute` and `type` belong to `max_attribute`"));
    }

    match ops.len() {
        1 => Ok(ops.remove(0)),
        0 => Err(ValidationError::new(path, "no operation")),
        _ => Err(ValidationError::new(path, "one operation per step")),
    }
}
