//! Map a site URL back to the mode (and parameters) that would produce it.

use regex::{Regex, RegexBuilder};
use tracing::debug;
use url::Url;

use super::{ModeSpec, SiteProfile, VIDEO_MODE};
use crate::template::{self, Params, Segment};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeMatch {
    pub mode: String,
    pub params: Params,
    /// Set when the URL came from a paginated template.
    pub page: Option<u32>,
}

enum Capture {
    Param(String),
    Page(i64),
}

struct UrlPattern {
    regex: Regex,
    captures: Vec<Capture>,
    static_count: usize,
    static_length: usize,
}

impl UrlPattern {
    fn compile(template: &str) -> Option<Self> {
        let segments = template::parse(template.trim_end_matches('/')).ok()?;
        let mut source = String::from("^");
        let mut captures = Vec::new();
        let mut static_count = 0;
        let mut static_length = 0;

        for segment in segments {
            match segment {
                Segment::Literal(text) => {
                    source.push_str(&regex::escape(text));
                    static_count += 1;
                    static_length += text.len();
                }
                Segment::Param(name) => {
                    source.push_str("([^/?&#]+)");
                    captures.push(Capture::Param(name.to_string()));
                }
                Segment::Page(offset) => {
                    source.push_str(r"(\d+)");
                    captures.push(Capture::Page(offset));
                }
            }
        }
        // query-style templates tolerate trailing extra arguments
        if template.contains('?') || template.contains('&') {
            source.push_str("(?:$|&.*)");
        } else {
            source.push('$');
        }

        let regex = RegexBuilder::new(&source).case_insensitive(true).build().ok()?;
        Some(UrlPattern {
            regex,
            captures,
            static_count,
            static_length,
        })
    }

    fn score(&self) -> (usize, usize) {
        (self.static_count, self.static_length)
    }

    fn capture(&self, path: &str) -> Option<(Params, Option<u32>)> {
        let caps = self.regex.captures(path)?;
        let mut params = Params::new();
        let mut page = None;
        for (i, capture) in self.captures.iter().enumerate() {
            let value = caps.get(i + 1)?.as_str();
            match capture {
                Capture::Param(name) => {
                    params.insert(name.clone(), value.to_string());
                }
                Capture::Page(offset) => {
                    let n = value.parse::<i64>().ok()? - offset;
                    page = u32::try_from(n).ok().filter(|n| *n > 0);
                }
            }
        }
        Some((params, page))
    }
}

/// Path plus query of `url`, without a trailing slash on the path.
fn request_path(url: &Url) -> String {
    let mut path = url.path().trim_end_matches('/').to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Listing modes win over `video`; among them, the template with the most
/// literal segments (then the longest literal text) is chosen.
pub fn match_url(profile: &SiteProfile, url: &str) -> Option<ModeMatch> {
    let url = Url::parse(url).ok()?;
    let base = Url::parse(&profile.base_url).ok()?;
    if host_key(&url)? != host_key(&base)? {
        return None;
    }
    let path = request_path(&url);

    let mut best: Option<((usize, usize), ModeMatch)> = None;
    for mode in profile.listing_modes() {
        for template in templates(mode) {
            let Some(pattern) = UrlPattern::compile(template) else {
                continue;
            };
            let Some((params, page)) = pattern.capture(&path) else {
                continue;
            };
            let score = pattern.score();
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((
                    score,
                    ModeMatch {
                        mode: mode.name.clone(),
                        params,
                        page,
                    },
                ));
            }
        }
    }
    if let Some((score, found)) = best {
        debug!(mode = %found.mode, ?score, "url matched listing mode");
        return Some(found);
    }

    let video = profile.mode(VIDEO_MODE)?;
    let (params, _) = UrlPattern::compile(&video.url_pattern)?.capture(&path)?;
    debug!("url matched video mode");
    Some(ModeMatch {
        mode: VIDEO_MODE.to_string(),
        params,
        page: None,
    })
}

fn templates(mode: &ModeSpec) -> impl Iterator<Item = &str> {
    std::iter::once(mode.url_pattern.as_str()).chain(mode.url_pattern_pages.as_deref())
}
