use crate::extract::{ExtractedRecord, JOIN_SEPARATOR};

/// Exact spellings that win over title casing, matched case-insensitively.
/// `tag_overrides` apply to tags on top of `overrides`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseRules {
    pub overrides: Vec<String>,
    pub tag_overrides: Vec<String>,
}

impl CaseRules {
    pub fn new(overrides: Vec<String>, tag_overrides: Vec<String>) -> Self {
        CaseRules {
            overrides,
            tag_overrides,
        }
    }
}

/// `str.title()`-style casing: the first letter of every alphabetic run is
/// upper-cased, the rest lower-cased.
fn title_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut in_run = false;
    for c in word.chars() {
        if c.is_alphabetic() {
            if in_run {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

fn has_mixed_case(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).any(|w| {
        (w[0].is_lowercase() && w[1].is_uppercase()) || (w[0].is_uppercase() && w[1].is_lowercase())
    })
}

/// Title-case `text` word by word, using an override's exact spelling where
/// one matches. With `preserve_mixed`, text that already mixes cases is kept
/// unless it is itself an override.
pub fn title_case(text: &str, overrides: &[String], preserve_mixed: bool) -> String {
    let lookup = |word: &str| {
        let key = word.to_lowercase();
        overrides.iter().find(|o| o.to_lowercase() == key)
    };
    if text.is_empty() {
        return String::new();
    }
    if preserve_mixed && has_mixed_case(text) && lookup(text).is_none() {
        return text.to_string();
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return text.to_string();
    }
    words
        .iter()
        .map(|word| match lookup(word) {
            Some(exact) => exact.clone(),
            None if !preserve_mixed || words.len() > 1 => title_word(word),
            None => word.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn split(record: &ExtractedRecord, field: &str) -> Option<Vec<String>> {
    let value = record.get(field)?;
    Some(
        value
            .split(JOIN_SEPARATOR)
            .map(|v| v.trim().trim_start_matches('#').to_string())
            .filter(|v| !v.is_empty())
            .collect(),
    )
}

/// Tidy a record's people and tag fields before it is handed off: a name
/// listed as an actor is dropped from studios and tags, a studio from tags,
/// and casing rules are applied. Fields the record lacks stay absent.
pub fn finalize(record: &ExtractedRecord, rules: &CaseRules) -> ExtractedRecord {
    let mut out = record.clone();
    let actors = split(record, "actors");
    let studios = split(record, "studios");
    let tags = split(record, "tags");

    let lower = |list: &Option<Vec<String>>| -> Vec<String> {
        list.iter().flatten().map(|v| v.to_lowercase()).collect()
    };
    let actor_keys = lower(&actors);
    let studios = studios.map(|list| {
        list.into_iter()
            .filter(|s| !actor_keys.contains(&s.to_lowercase()))
            .collect::<Vec<_>>()
    });
    let studio_keys = lower(&studios);
    let tags = tags.map(|list| {
        list.into_iter()
            .filter(|t| {
                let key = t.to_lowercase();
                !actor_keys.contains(&key) && !studio_keys.contains(&key)
            })
            .collect::<Vec<_>>()
    });

    let tag_overrides: Vec<String> = rules
        .overrides
        .iter()
        .chain(&rules.tag_overrides)
        .cloned()
        .collect();
    let cased = |list: Vec<String>, overrides: &[String], preserve: bool| {
        list.iter()
            .map(|v| title_case(v, overrides, preserve))
            .collect::<Vec<_>>()
            .join(JOIN_SEPARATOR)
    };

    if let Some(list) = actors {
        out.insert("actors", cased(list, &rules.overrides, true));
    }
    if let Some(list) = studios {
        out.insert("studios", cased(list, &rules.overrides, true));
    }
    if let Some(list) = tags {
        out.insert("tags", cased(list, &tag_overrides, false));
    }
    if let Some(title) = record.value("title") {
        out.insert("title", title_case(title.trim(), &rules.overrides, false));
    }
    if let Some(studio) = record.value("studio") {
        out.insert("studio", title_case(studio.trim_start_matches('#'), &rules.overrides, true));
    }
    out
}
