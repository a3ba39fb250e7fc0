//! Per-category field classification and the level transform
//!
//! | class      | none | minimal | partial     | full |
//! |------------|------|---------|-------------|------|
//! | direct     | raw  | drop    | drop        | drop |
//! | sensitive  | raw  | raw     | drop        | drop |
//! | quasi      | raw  | raw     | generalized | drop |
//! | attribute  | raw  | raw     | raw         | raw  |
//!
//! Fields missing from a category's schema are treated as direct
//! identifiers.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use serde_json::Value;

use super::anonymize::{
    generalize_age, generalize_numeric, generalize_zip, mask, round_coordinate, truncate_date,
    DatePrecision, MaskStyle,
};
use crate::crypto::random_ref;
use crate::domain::{AnonymizationLevel, DataCategory, ReleasedPayload, UserId};
use crate::infra::{LedgerError, Result};

/// Shortest raw value searched for verbatim in released output
const MIN_LEAK_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Generalization {
    AgeBucket(u64),
    ZipPrefix(usize),
    DateTruncate(DatePrecision),
    NumericBucket(u64),
    CoordinateRound(u32),
    /// Keep the first character
    Mask,
}

impl Generalization {
    /// Generalize a raw value. `None` means the value cannot be generalized
    /// and must not be released.
    pub fn apply(&self, value: &Value) -> Option<Value> {
        match *self {
            Generalization::AgeBucket(size) => {
                as_whole_number(value).map(|age| Value::String(generalize_age(age, size)))
            }
            Generalization::ZipPrefix(keep) => value
                .as_str()
                .map(|zip| Value::String(generalize_zip(zip, keep))),
            Generalization::DateTruncate(precision) => {
                let text = value.as_str()?;
                let date = NaiveDate::parse_from_str(text.get(..10)?, "%Y-%m-%d").ok()?;
                Some(Value::String(truncate_date(
                    date.year(),
                    date.month(),
                    date.day(),
                    precision,
                )))
            }
            Generalization::NumericBucket(size) => {
                as_whole_number(value).map(|n| Value::String(generalize_numeric(n, size)))
            }
            Generalization::CoordinateRound(decimals) => value
                .as_f64()
                .filter(|v| v.is_finite())
                .and_then(|v| serde_json::Number::from_f64(round_coordinate(v, decimals)))
                .map(Value::Number),
            Generalization::Mask => value
                .as_str()
                .map(|s| Value::String(mask(s, MaskStyle::PreservePrefix(1, '*')))),
        }
    }
}

fn as_whole_number(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.floor() as u64)
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldClass {
    /// Identifies the user on its own
    Direct,
    /// Identifying in combination; generalized at `partial`
    Quasi(Generalization),
    Sensitive,
    /// Non-identifying; always releasable
    Attribute,
}

/// Treatment of one field at one level
#[derive(Debug, Clone, Copy, PartialEq)]
enum Treatment {
    Raw,
    Generalize(Generalization),
    Drop,
}

impl FieldClass {
    fn treatment(&self, level: AnonymizationLevel) -> Treatment {
        use AnonymizationLevel as L;
        match (self, level) {
            (_, L::None) => Treatment::Raw,
            (FieldClass::Attribute, _) => Treatment::Raw,
            (FieldClass::Direct, _) => Treatment::Drop,
            (FieldClass::Sensitive, L::Minimal) => Treatment::Raw,
            (FieldClass::Sensitive, _) => Treatment::Drop,
            (FieldClass::Quasi(_), L::Minimal) => Treatment::Raw,
            (FieldClass::Quasi(g), L::Partial) => Treatment::Generalize(*g),
            (FieldClass::Quasi(_), L::Full) => Treatment::Drop,
        }
    }
}

/// Field classes per data category
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    categories: HashMap<String, BTreeMap<String, FieldClass>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        use FieldClass::*;
        use Generalization::*;

        let mut registry = Self::empty();
        registry.register(
            "location",
            [
                ("street", Direct),
                ("address", Direct),
                ("device_id", Direct),
                ("lat", Quasi(CoordinateRound(1))),
                ("lon", Quasi(CoordinateRound(1))),
                ("zip", Quasi(ZipPrefix(3))),
                ("city", Quasi(Mask)),
                ("captured_at", Quasi(DateTruncate(DatePrecision::Month))),
                ("country", Attribute),
                ("accuracy_m", Attribute),
            ],
        );
        registry.register(
            "health",
            [
                ("name", Direct),
                ("ssn", Direct),
                ("mrn", Direct),
                ("diagnosis", Sensitive),
                ("medications", Sensitive),
                ("age", Quasi(AgeBucket(5))),
                ("birth_date", Quasi(DateTruncate(DatePrecision::Year))),
                ("weight_kg", Quasi(NumericBucket(10))),
                ("blood_type", Attribute),
                ("steps", Attribute),
            ],
        );
        registry.register(
            "demographics",
            [
                ("name", Direct),
                ("email", Direct),
                ("phone", Direct),
                ("ethnicity", Sensitive),
                ("religion", Sensitive),
                ("age", Quasi(AgeBucket(5))),
                ("zip", Quasi(ZipPrefix(3))),
                ("income", Quasi(NumericBucket(10_000))),
                ("occupation", Attribute),
                ("education", Attribute),
            ],
        );
        registry
    }
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self {
            categories: HashMap::new(),
        }
    }

    /// Register (or extend) a category's field classes.
    pub fn register<'a>(
        &mut self,
        category: &str,
        fields: impl IntoIterator<Item = (&'a str, FieldClass)>,
    ) -> &mut Self {
        let entry = self.categories.entry(category.to_string()).or_default();
        for (field, class) in fields {
            entry.insert(field.to_string(), class);
        }
        self
    }

    pub fn class_of(&self, category: &DataCategory, field: &str) -> FieldClass {
        self.categories
            .get(category.as_str())
            .and_then(|fields| fields.get(field))
            .copied()
            .unwrap_or(FieldClass::Direct)
    }

    /// Transform raw scoped fields to `level`.
    ///
    /// The subject is the user id only at level `none`; otherwise a fresh
    /// per-package pseudonym.
    pub fn transform(
        &self,
        user_id: &UserId,
        category: &DataCategory,
        level: AnonymizationLevel,
        raw: &BTreeMap<String, Value>,
    ) -> ReleasedPayload {
        let fields = raw
            .iter()
            .filter_map(|(name, value)| {
                let released = match self.class_of(category, name).treatment(level) {
                    Treatment::Raw => Some(value.clone()),
                    Treatment::Generalize(g) => g.apply(value),
                    Treatment::Drop => None,
                };
                released.map(|v| (name.clone(), v))
            })
            .collect();

        let subject = if level == AnonymizationLevel::None {
            user_id.to_string()
        } else {
            random_ref("subj")
        };

        ReleasedPayload {
            subject,
            category: category.to_string(),
            level,
            fields,
        }
    }

    /// Check a transformed payload against its raw input before release.
    ///
    /// Fails closed: any released key not allowed at the level, any
    /// generalized value that does not match an independent recomputation,
    /// or any withheld raw value appearing verbatim in the output is a
    /// `ReleaseVerification` error.
    pub fn verify_release(
        &self,
        user_id: &UserId,
        category: &DataCategory,
        raw: &BTreeMap<String, Value>,
        released: &ReleasedPayload,
    ) -> Result<()> {
        let level = released.level;
        let fail = |msg: String| Err(LedgerError::ReleaseVerification(msg));

        if released.category != category.as_str() {
            return fail("category mismatch".into());
        }

        // (field the value was withheld from, text)
        let mut withheld: Vec<(Option<&str>, String)> = Vec::new();
        for (name, raw_value) in raw {
            let treatment = self.class_of(category, name).treatment(level);
            let owned = |needle| (Some(name.as_str()), needle);
            match (treatment, released.fields.get(name)) {
                (Treatment::Raw, Some(out)) if out == raw_value => {}
                (Treatment::Raw, None) => {}
                (Treatment::Generalize(g), out) => {
                    if out.cloned() != g.apply(raw_value) {
                        return fail(format!("field '{name}' is not generalized"));
                    }
                    if out != Some(raw_value) {
                        withheld.extend(leak_needles(raw_value).into_iter().map(owned));
                    }
                }
                (Treatment::Drop, None) => {
                    withheld.extend(leak_needles(raw_value).into_iter().map(owned))
                }
                (_, Some(_)) => return fail(format!("field '{name}' is not releasable at {level}")),
            }
        }

        if let Some(extra) = released.fields.keys().find(|k| !raw.contains_key(*k)) {
            return fail(format!("field '{extra}' has no source value"));
        }

        if level != AnonymizationLevel::None {
            withheld.push((None, user_id.to_string()));
        }

        // Generalized outputs are derived from their own raw value and are
        // compared whole; everything else is searched token by token.
        let haystack: Vec<Released<'_>> = std::iter::once(Released {
            field: None,
            text: released.subject.clone(),
            generalized: false,
        })
        .chain(released.fields.iter().map(|(name, value)| Released {
            field: Some(name.as_str()),
            text: render(value),
            generalized: matches!(
                self.class_of(category, name).treatment(level),
                Treatment::Generalize(_)
            ),
        }))
        .collect();

        for (owner, needle) in &withheld {
            let whole_only = needle.chars().count() < MIN_LEAK_LEN;
            let leaked = haystack
                .iter()
                .filter(|h| owner.is_none() || h.field != *owner)
                .any(|h| {
                    if whole_only || h.generalized {
                        h.text == *needle
                    } else {
                        contains_token(&h.text, needle)
                    }
                });
            if leaked {
                return fail("withheld value present in released payload".into());
            }
        }
        Ok(())
    }
}

/// One released value as seen by the leak check
struct Released<'a> {
    field: Option<&'a str>,
    text: String,
    generalized: bool,
}

/// `needle` occurs in `text` with no letter or digit directly either side.
fn contains_token(text: &str, needle: &str) -> bool {
    text.match_indices(needle).any(|(at, hit)| {
        let before = text[..at].chars().next_back();
        let after = text[at + hit.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Text forms of a withheld value worth searching for
fn leak_needles(value: &Value) -> Vec<String> {
    match value {
        Value::Null | Value::Bool(_) => Vec::new(),
        Value::Array(items) => items.iter().flat_map(leak_needles).collect(),
        Value::Object(map) => map.values().flat_map(leak_needles).collect(),
        other => {
            let text = render(other);
            if text.chars().count() >= MIN_LEAK_LEN {
                vec![text]
            } else {
                Vec::new()
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
