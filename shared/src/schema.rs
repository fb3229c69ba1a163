//! Form schema inference for loosely typed feature attributes.
//!
//! Nothing here mutates state: the descriptor list is a pure function of the
//! store contents, the feature under edit and the configured field rules.

use chrono::{DateTime, NaiveDate, Utc};
use geojson::Feature;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::dataset::DatasetStore;

fn default_category_key() -> String {
    "type".into()
}

fn default_theme_key() -> String {
    "theme".into()
}

/// Declared field lists. A key may appear in several lists; the widget is
/// picked by precedence (see [`describe_fields`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldRules {
    #[serde(default)]
    pub boolean_fields: BTreeSet<String>,
    #[serde(default)]
    pub date_fields: BTreeSet<String>,
    #[serde(default)]
    pub dropdown_fields: BTreeSet<String>,
    #[serde(default)]
    pub excluded_fields: BTreeSet<String>,
    #[serde(default = "default_category_key")]
    pub category_key: String,
    #[serde(default = "default_theme_key")]
    pub theme_key: String,
}

impl Default for FieldRules {
    fn default() -> Self {
        Self {
            boolean_fields: BTreeSet::new(),
            date_fields: BTreeSet::new(),
            dropdown_fields: BTreeSet::new(),
            excluded_fields: BTreeSet::new(),
            category_key: default_category_key(),
            theme_key: default_theme_key(),
        }
    }
}

impl FieldRules {
    pub fn is_excluded(&self, key: &str) -> bool {
        self.excluded_fields.contains(key)
    }

    pub fn is_read_only(&self, key: &str) -> bool {
        key == self.category_key || key == self.theme_key
    }

    /// Keys the form may never write back.
    pub fn is_locked(&self, key: &str) -> bool {
        self.is_excluded(key) || self.is_read_only(key)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.category_key.trim().is_empty() || self.theme_key.trim().is_empty() {
            return Err("category and theme keys cannot be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Widget {
    Dropdown { options: Vec<String> },
    Checkbox,
    Date,
    Number,
    Text,
    ReadOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Checked(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub key: String,
    pub widget: Widget,
    pub value: FieldValue,
}

/// Builds the editable field list for `feature`, in its attribute order.
///
/// Precedence per key: excluded keys are dropped, the category and theme keys
/// are read-only, then boolean, date and dropdown lists apply in that order.
/// Anything left is a number when the stored value is a JSON number, text
/// otherwise.
pub fn describe_fields(
    store: &DatasetStore,
    feature: &Feature,
    rules: &FieldRules,
) -> Vec<FieldDescriptor> {
    let Some(properties) = feature.properties.as_ref() else {
        return Vec::new();
    };

    properties
        .iter()
        .filter(|(key, _)| !rules.is_excluded(key))
        .map(|(key, value)| {
            let (widget, value) = if rules.is_read_only(key) {
                (Widget::ReadOnly, FieldValue::Text(display_value(value)))
            } else if rules.boolean_fields.contains(key) {
                (Widget::Checkbox, FieldValue::Checked(is_truthy(value)))
            } else if rules.date_fields.contains(key) {
                (Widget::Date, FieldValue::Text(normalize_date(value)))
            } else if rules.dropdown_fields.contains(key) {
                (
                    Widget::Dropdown {
                        options: store.distinct_values(key),
                    },
                    FieldValue::Text(display_value(value)),
                )
            } else if value.is_number() {
                (Widget::Number, FieldValue::Text(display_value(value)))
            } else {
                (Widget::Text, FieldValue::Text(display_value(value)))
            };

            FieldDescriptor {
                key: key.clone(),
                widget,
                value,
            }
        })
        .collect()
}

/// 1, true, "1" and "true" count as checked.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => s == "1" || s == "true",
        _ => false,
    }
}

/// Text shown for a stored value. Null renders empty.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];

/// Normalizes a stored date to `YYYY-MM-DD`. Unparsable values become empty.
pub fn normalize_date(value: &Value) -> String {
    match value {
        Value::String(s) => normalize_date_str(s).unwrap_or_default(),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

pub fn normalize_date_str(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive().format("%Y-%m-%d").to_string());
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }

    // Local timestamps such as `2024-03-05T10:00:00` or `2024-03-05 10:00`.
    s.get(..10)
        .filter(|_| s.len() > 10 && matches!(s.as_bytes()[10], b'T' | b' '))
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}
