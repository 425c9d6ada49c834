use std::fmt;

use scraper::{ElementRef, Selector};
use tracing::debug;

use crate::profile::SelectorStyle;

/// A selector string compiled once at profile load.
#[derive(Clone)]
pub struct CompiledSelector {
    source: String,
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Css(Selector),
    /// `prefix|local`, matched against elements named `prefix:local`.
    Namespaced(String),
}

impl CompiledSelector {
    /// XML-style selectors have their element and attribute names folded to
    /// lowercase, matching how feed documents are parsed.
    pub fn parse(source: &str, style: SelectorStyle) -> Result<Self, String> {
        let source = source.trim();
        let kind = match (namespaced(source), style) {
            (Some(qualified), _) => Kind::Namespaced(qualified),
            (None, SelectorStyle::Css) => Kind::Css(Selector::parse(source).map_err(|e| e.to_string())?),
            (None, SelectorStyle::Xml) => {
                Kind::Css(Selector::parse(&fold_names(source)).map_err(|e| e.to_string())?)
            }
        };
        Ok(CompiledSelector {
            source: source.to_string(),
            kind,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Matching descendants of `scope`, in document order.
    pub fn select<'a>(&self, scope: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        match &self.kind {
            Kind::Css(selector) => scope.select(selector).collect(),
            Kind::Namespaced(qualified) => scope
                .descendants()
                .skip(1)
                .filter_map(ElementRef::wrap)
                .filter(|el| el.value().name().eq_ignore_ascii_case(qualified))
                .collect(),
        }
    }
}

impl fmt::Debug for CompiledSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.source)
    }
}

fn namespaced(source: &str) -> Option<String> {
    let (prefix, local) = source.split_once('|')?;
    let is_name = |s: &str| {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    };
    (is_name(prefix) && is_name(local)).then(|| format!("{prefix}:{local}"))
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Lowercase type selectors and attribute names. Classes, ids, pseudo-class
/// names and attribute values keep their case.
fn fold_names(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut quote: Option<char> = None;
    let mut in_brackets = false;
    let mut attr_name = false;
    let mut lower = false;
    let mut prev = ' ';

    for c in source.chars() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            out.push(c);
            prev = c;
            continue;
        }

        if is_name_char(c) {
            if !is_name_char(prev) {
                lower = if in_brackets {
                    attr_name
                } else {
                    !matches!(prev, '.' | '#' | ':')
                };
            }
            if lower {
                out.extend(c.to_lowercase());
            } else {
                out.push(c);
            }
        } else {
            if in_brackets && is_name_char(prev) {
                attr_name = false;
            }
            match c {
                '"' | '\'' => quote = Some(c),
                '[' => {
                    in_brackets = true;
                    attr_name = true;
                }
                ']' => in_brackets = false,
                _ => {}
            }
            out.push(c);
        }
        prev = c;
    }
    out
}

/// A field's selector: one string, or fallback candidates tried in order.
#[derive(Debug, Clone)]
pub enum SelectorSpec {
    Single(CompiledSelector),
    Fallback(Vec<CompiledSelector>),
}

impl SelectorSpec {
    pub fn candidates(&self) -> &[CompiledSelector] {
        match self {
            SelectorSpec::Single(one) => std::slice::from_ref(one),
            SelectorSpec::Fallback(list) => list,
        }
    }
}

/// The first candidate with a non-empty match set wins; later candidates are
/// never consulted. All-empty yields an empty vec.
pub fn evaluate<'a>(scope: ElementRef<'a>, spec: &SelectorSpec) -> Vec<ElementRef<'a>> {
    for candidate in spec.candidates() {
        let found = candidate.select(scope);
        if !found.is_empty() {
            debug!(selector = candidate.as_str(), matches = found.len(), "selector matched");
            return found;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::profile::SelectorStyle;

    fn spec(sources: &[&str]) -> SelectorSpec {
        let compiled: Vec<_> = sources
            .iter()
            .map(|s| CompiledSelector::parse(s, SelectorStyle::Css).unwrap())
            .collect();
        if compiled.len() == 1 {
            SelectorSpec::Single(compiled.into_iter().next().unwrap())
        } else {
            SelectorSpec::Fallback(compiled)
        }
    }

    fn texts(els: &[ElementRef<'_>]) -> Vec<String> {
        els.iter().map(|e| e.text().collect::<String>()).collect()
    }

    const PAGE: &str = r#"
        <div id="list">
          <div class="thumb"><a href="/v/1">One</a></div>
          <div class="thumb promo"><a href="/ad">Ad</a></div>
          <div class="thumb"><a href="/v/2">Two</a></div>
        </div>
        <ul class="alt"><li>x</li><li>y</li><li>z</li></ul>"#;

    #[test]
    fn fallback_takes_first_non_empty() {
        let doc = Document::parse(PAGE, SelectorStyle::Css).unwrap();
        let found = evaluate(doc.root(), &spec(&["div.missing", "div.thumb:not(.promo)", "ul.alt li"]));
        assert_eq!(texts(&found), vec!["One", "Two"]);
    }

    #[test]
    fn fallback_never_mixes() {
        let doc = Document::parse(PAGE, SelectorStyle::Css).unwrap();
        // the later candidate would match more, but is never consulted
        let found = evaluate(doc.root(), &spec(&["div.thumb:not(.promo) a", "ul.alt li"]));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn all_empty_is_empty() {
        let doc = Document::parse(PAGE, SelectorStyle::Css).unwrap();
        assert!(evaluate(doc.root(), &spec(&["table", "span.none"])).is_empty());
    }

    #[test]
    fn scoped_to_element() {
        let doc = Document::parse(PAGE, SelectorStyle::Css).unwrap();
        let items = evaluate(doc.root(), &spec(&["div.thumb"]));
        let inner = evaluate(items[2], &spec(&["a"]));
        assert_eq!(texts(&inner), vec!["Two"]);
        // scope itself is not a match
        assert!(evaluate(items[0], &spec(&["div.thumb"])).is_empty());
    }

    #[test]
    fn nth_child() {
        let doc = Document::parse(PAGE, SelectorStyle::Css).unwrap();
        let found = evaluate(doc.root(), &spec(&["ul.alt li:nth-child(2)"]));
        assert_eq!(texts(&found), vec!["y"]);
    }

    #[test]
    fn namespaced_tag() {
        let feed = r#"<rss><channel><item><title>t</title><content:encoded>body</content:encoded></item></channel></rss>"#;
        let doc = Document::parse(feed, SelectorStyle::Xml).unwrap();
        let found = evaluate(doc.root(), &spec(&["content|encoded"]));
        assert_eq!(texts(&found), vec!["body"]);
    }

    #[test]
    fn xml_selectors_match_camel_case_tags() {
        let feed = r#"<rss><item><pubDate>Mon, 01 Jan 2024</pubDate><media:thumbnail url="t.jpg"/></item></rss>"#;
        let doc = Document::parse(feed, SelectorStyle::Xml).unwrap();
        let date = SelectorSpec::Single(CompiledSelector::parse("item > pubDate", SelectorStyle::Xml).unwrap());
        assert_eq!(texts(&evaluate(doc.root(), &date)), vec!["Mon, 01 Jan 2024"]);
        let thumb = SelectorSpec::Single(CompiledSelector::parse("media|thumbnail", SelectorStyle::Xml).unwrap());
        assert_eq!(evaluate(doc.root(), &thumb).len(), 1);
    }

    #[test]
    fn folding_keeps_classes_and_values() {
        assert_eq!(fold_names("Item.Hot > pubDate"), "item.Hot > pubdate");
        assert_eq!(fold_names(r#"Enclosure[Type="Video/MP4"]"#), r#"enclosure[type="Video/MP4"]"#);
        assert_eq!(fold_names("#Main Item:not(.Ad)"), "#Main item:not(.Ad)");
        assert_eq!(fold_names("Entry:nth-child(2)"), "entry:nth-child(2)");
    }

    #[test]
    fn rejects_bad_css() {
        assert!(CompiledSelector::parse("div[", SelectorStyle::Css).is_err());
        assert!(CompiledSelector::parse("a|b", SelectorStyle::Css).is_ok());
        assert!(CompiledSelector::parse("div[", SelectorStyle::Xml).is_err());
    }
}
