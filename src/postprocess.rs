use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use scraper::ElementRef;
use tracing::{debug, warn};

/// One operation of a field's `postProcess` list.
#[derive(Debug, Clone)]
pub enum Step {
    Replace(Vec<Replacement>),
    Trim,
    Lowercase,
    Uppercase,
    /// Keep only the first of several matched values.
    First,
    /// Keep the value whose element carries the largest `attribute`.
    MaxAttribute { attribute: String, kind: AttrKind },
}

impl Step {
    fn reduces(&self) -> bool {
        matches!(self, Step::First | Step::MaxAttribute { .. })
    }

    fn map(&self, value: String) -> String {
        if value.is_empty() {
            return value;
        }
        match self {
            Step::Replace(pairs) => pairs.iter().fold(value, |acc, pair| pair.apply(&acc)),
            Step::Trim => value.trim().to_string(),
            Step::Lowercase => value.to_lowercase(),
            Step::Uppercase => value.to_uppercase(),
            Step::First | Step::MaxAttribute { .. } => value,
        }
    }
}

/// How `max_attribute` compares attribute values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttrKind {
    Int,
    Float,
    #[default]
    Str,
}

impl FromStr for AttrKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(AttrKind::Int),
            "float" => Ok(AttrKind::Float),
            "str" => Ok(AttrKind::Str),
            other => Err(format!("unknown type `{other}` (expected int, float or str)")),
        }
    }
}

/// A value still tied to the element it was read from.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub value: String,
    pub element: ElementRef<'a>,
}

#[derive(Debug, Clone)]
pub struct Replacement {
    pattern: Regex,
    with: String,
}

impl Replacement {
    /// Compile a `{regex, with}` pair. Patterns run with `.` matching newlines,
    /// and `\1`-style back-references in `with` are accepted.
    pub fn new(regex: &str, with: &str) -> Result<Self, regex::Error> {
        let pattern = RegexBuilder::new(regex).dot_matches_new_line(true).build()?;
        Ok(Replacement {
            pattern,
            with: translate_backrefs(with),
        })
    }

    fn apply(&self, value: &str) -> String {
        self.pattern.replace_all(value, self.with.as_str()).into_owned()
    }
}

/// Ordered string transforms; each step consumes the previous step's output.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Pipeline { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether a step narrows several matched values down to one.
    pub fn reduces(&self) -> bool {
        self.steps.iter().any(Step::reduces)
    }

    /// Run the string steps over a single value.
    pub fn apply(&self, value: &str) -> String {
        self.steps.iter().fold(value.to_string(), |acc, step| step.map(acc))
    }

    /// Run every step over all matched values, in list order.
    pub fn apply_all<'a>(&self, mut values: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
        for step in &self.steps {
            values = match step {
                Step::First => {
                    values.truncate(1);
                    values
                }
                Step::MaxAttribute { attribute, kind } => match kind {
                    AttrKind::Int => pick_max(values, attribute, |s| s.parse::<i64>().ok()),
                    AttrKind::Float => pick_max(values, attribute, |s| s.parse::<f64>().ok()),
                    AttrKind::Str => pick_max(values, attribute, |s| Some(s.to_string())),
                },
                _ => values
                    .into_iter()
                    .map(|c| Candidate {
                        value: step.map(c.value),
                        element: c.element,
                    })
                    .collect(),
            };
        }
        values
    }
}

/// The first value whose element has the greatest `attribute`. Falls back to
/// the first value when no element has it or a value does not convert.
fn pick_max<'a, K: PartialOrd>(
    values: Vec<Candidate<'a>>,
    attribute: &str,
    parse: impl Fn(&str) -> Option<K>,
) -> Vec<Candidate<'a>> {
    let mut best: Option<(usize, K)> = None;
    for (i, candidate) in values.iter().enumerate() {
        let Some(raw) = candidate.element.value().attr(attribute) else {
            continue;
        };
        let Some(key) = parse(raw.trim()) else {
            warn!(attribute, value = raw, "max_attribute cannot convert value, using first match");
            best = None;
            break;
        };
        if best.as_ref().map_or(true, |(_, top)| key > *top) {
            best = Some((i, key));
        }
    }
    if best.is_none() {
        debug!(attribute, "no usable attribute, using first match");
    }
    let index = best.map_or(0, |(i, _)| i);
    values.into_iter().nth(index).into_iter().collect()
}

/// Rewrite `\1` / `\g<1>` references into `${1}` and escape literal `$`.
fn translate_backrefs(with: &str) -> String {
    let mut out = String::with_capacity(with.len());
    let mut chars = with.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{group}}}"));
                }
                Some('g') => {
                    let rest: String = chars.clone().collect();
                    match rest.strip_prefix("g<").and_then(|r| r.split_once('>')) {
                        Some((name, _)) if !name.is_empty() => {
                            out.push_str(&format!("${{{name}}}"));
                            for _ in 0..name.len() + 3 {
                                chars.next();
                            }
                        }
                        _ => out.push('\\'),
                    }
                }
                Some('\\') => {
                    out.push('\\');
                    chars.next();
                }
                _ => out.push('\\'),
            },
            _ => out.push(c),
        }
    }
    out
}
