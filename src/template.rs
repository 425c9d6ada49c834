use std::collections::BTreeMap;

use url::Url;

use crate::error::TemplateError;
use crate::profile::{EncodingRules, ModeSpec, SiteProfile};

/// Invocation parameters keyed by placeholder name.
pub type Params = BTreeMap<String, String>;

pub const PAGE: &str = "page";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    /// `{page}`, or `{page + n}` / `{page - n}` with the signed offset.
    Page(i64),
}

/// Split a template into literal text and `{...}` placeholders.
pub fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        if open > 0 {
            segments.push(Segment::Literal(&rest[..open]));
        }
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| TemplateError::Unclosed(template.to_string()))?;
        segments.push(placeholder(after[..close].trim()));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

fn placeholder(name: &str) -> Segment<'_> {
    if name == PAGE {
        return Segment::Page(0);
    }
    let Some(expr) = name.strip_prefix(PAGE) else {
        return Segment::Param(name);
    };
    let expr = expr.trim_start();
    let (sign, digits) = match expr.chars().next() {
        Some('+') => (1, expr[1..].trim()),
        Some('-') => (-1, expr[1..].trim()),
        _ => return Segment::Param(name),
    };
    match digits.parse::<i64>() {
        Ok(n) => Segment::Page(sign * n),
        Err(_) => Segment::Param(name),
    }
}

/// Placeholder names (other than `page`) a template needs.
pub fn required_params(template: &str) -> Result<Vec<&str>, TemplateError> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Param(name) => Some(name),
            _ => None,
        })
        .collect())
}

/// Substitute placeholders. Parameter values pass through `rules` in
/// declaration order; page numbers are inserted verbatim.
pub fn render(
    template: &str,
    params: &Params,
    rules: &EncodingRules,
    page: Option<u32>,
) -> Result<String, TemplateError> {
    let missing = |name: &str| TemplateError::MissingParameter {
        name: name.to_string(),
        template: template.to_string(),
    };

    let mut out = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Param(name) => {
                let value = params.get(name).ok_or_else(|| missing(name))?;
                out.push_str(&rules.apply(value));
            }
            Segment::Page(offset) => {
                let page = page.ok_or_else(|| missing(PAGE))?;
                out.push_str(&(i64::from(page) + offset).to_string());
            }
        }
    }
    Ok(out)
}

/// Prefix a site-relative path with `base_url`; absolute URLs pass through.
pub fn join_base(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Resolve a link found in markup (relative, protocol-relative or absolute).
pub fn absolutize(base_url: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() || href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match Url::parse(base_url).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => join_base(base_url, href),
    }
}

/// Build the absolute URL for `page` of `mode`.
pub fn resolve(
    profile: &SiteProfile,
    mode: &ModeSpec,
    params: &Params,
    page: u32,
) -> Result<String, TemplateError> {
    let template = match (&mode.url_pattern_pages, page > 1) {
        (Some(pages), true) => pages.as_str(),
        _ => mode.url_pattern.as_str(),
    };
    let rules = mode
        .url_encoding_rules
        .as_ref()
        .unwrap_or(&profile.url_encoding_rules);
    let path = render(template, params, rules, Some(page))?;
    Ok(join_base(&profile.base_url, &path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn rules(pairs: &[(&str, &str)]) -> EncodingRules {
        EncodingRules::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn parse_segments() {
        let segs = parse("/u/{user}?t=v&page={ page }").unwrap();
        assert_eq!(
            segs,
            vec![
                Segment::Literal("/u/"),
                Segment::Param("user"),
                Segment::Literal("?t=v&page="),
                Segment::Page(0),
            ]
        );
    }

    #[test]
    fn page_arithmetic() {
        assert_eq!(parse("{page - 1}").unwrap(), vec![Segment::Page(-1)]);
        assert_eq!(parse("{page+2}").unwrap(), vec![Segment::Page(2)]);
        assert_eq!(parse("{pages}").unwrap(), vec![Segment::Param("pages")]);

        let url = render("/list/{page - 1}", &Params::new(), &EncodingRules::default(), Some(3));
        assert_eq!(url.unwrap(), "/list/2");
    }

    #[test]
    fn unclosed_brace() {
        assert!(matches!(parse("/u/{user"), Err(TemplateError::Unclosed(_))));
    }

    #[test]
    fn user_page_templates() {
        let p = params(&[("user", "Jade_Kink")]);
        let none = EncodingRules::default();
        assert_eq!(render("/u/{user}?t=v", &p, &none, Some(1)).unwrap(), "/u/Jade_Kink?t=v");
        assert_eq!(
            render("/u/{user}?t=v&page={page}", &p, &none, Some(3)).unwrap(),
            "/u/Jade_Kink?t=v&page=3"
        );
    }

    #[test]
    fn encoding_rule_order_matters() {
        let p = params(&[("search", "Rough doggystyle")]);
        let ordered = rules(&[(" ", "+"), ("%20", "+")]);
        assert_eq!(render("{search}", &p, &ordered, None).unwrap(), "Rough+doggystyle");

        let q = params(&[("search", "a b")]);
        let chained = rules(&[(" ", "%20"), ("%20", "+")]);
        assert_eq!(render("{search}", &q, &chained, None).unwrap(), "a+b");
        let reversed = rules(&[("%20", "+"), (" ", "%20")]);
        assert_eq!(render("{search}", &q, &reversed, None).unwrap(), "a%20b");
    }

    #[test]
    fn page_number_is_not_encoded() {
        let r = rules(&[("1", "one")]);
        let out = render("/s/{q}/{page}", &params(&[("q", "x1")]), &r, Some(1)).unwrap();
        assert_eq!(out, "/s/xone/1");
    }

    #[test]
    fn missing_parameter() {
        let err = render("/tag/{tag}", &Params::new(), &EncodingRules::default(), None).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingParameter {
                name: "tag".into(),
                template: "/tag/{tag}".into()
            }
        );
    }

    #[test]
    fn deterministic_and_distinct() {
        let none = EncodingRules::default();
        let t = "/u/{user}?t=v&page={page}";
        let a = render(t, &params(&[("user", "a")]), &none, Some(2)).unwrap();
        let again = render(t, &params(&[("user", "a")]), &none, Some(2)).unwrap();
        let b = render(t, &params(&[("user", "b")]), &none, Some(2)).unwrap();
        let a3 = render(t, &params(&[("user", "a")]), &none, Some(3)).unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_ne!(a, a3);
    }

    #[test]
    fn required_params_skip_page() {
        assert_eq!(required_params("/g/{group}/{page}").unwrap(), vec!["group"]);
    }

    #[test]
    fn base_joining() {
        assert_eq!(join_base("https://site.test/", "/v/1"), "https://site.test/v/1");
        assert_eq!(join_base("https://site.test", "v/1"), "https://site.test/v/1");
        assert_eq!(join_base("https://site.test", "https://cdn.test/x"), "https://cdn.test/x");
    }

    #[test]
    fn absolutize_links() {
        let base = "https://site.test";
        assert_eq!(absolutize(base, "/v/abc"), "https://site.test/v/abc");
        assert_eq!(absolutize(base, "//cdn.test/a.mp4"), "https://cdn.test/a.mp4");
        assert_eq!(absolutize(base, "https://x.test/y"), "https://x.test/y");
        assert_eq!(absolutize(base, ""), "");
    }
}
