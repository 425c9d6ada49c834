use regex::{Regex, RegexBuilder};

use crate::extract::ExtractedRecord;

const SIZE_LIMIT: usize = 10 * (1 << 20);

/// Terms that disqualify a record. A term also matches its hyphenated form,
/// so `big cats` catches the `big-cats` slug in a URL.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    pattern: Option<Regex>,
}

impl IgnoreList {
    /// Fails when the terms compile past the regex size limit.
    pub fn new<S: AsRef<str>>(terms: &[S]) -> Result<Self, regex::Error> {
        Self::with_limit(terms, SIZE_LIMIT)
    }

    fn with_limit<S: AsRef<str>>(terms: &[S], size_limit: usize) -> Result<Self, regex::Error> {
        let alternatives: Vec<String> = terms
            .iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .flat_map(|t| {
                let hyphenated = t.replace(' ', "-");
                [regex::escape(&t), regex::escape(&hyphenated)]
            })
            .collect();
        if alternatives.is_empty() {
            return Ok(IgnoreList::default());
        }

        let source = format!(r"\b(?:{})\b", alternatives.join("|"));
        let pattern = RegexBuilder::new(&source)
            .case_insensitive(true)
            .size_limit(size_limit)
            .build()?;
        Ok(IgnoreList { pattern: Some(pattern) })
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_none()
    }

    /// The first `(field, term)` hit in `record`, if any.
    pub fn matched<'r>(&self, record: &'r ExtractedRecord) -> Option<(&'r str, &'r str)> {
        let pattern = self.pattern.as_ref()?;
        record
            .iter()
            .find_map(|(field, value)| pattern.find(value).map(|m| (field, m.as_str())))
    }
}
