//! Reverse phone index over resolved identifier records.
//!
//! Phone lookups are never sent to the target. Instead, every identifier
//! payload that gets cached has its phone numbers pulled out, and each number
//! gets an index entry listing the identifier cache keys that mention it.

use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::query::{normalize_value, QueryKind};

/// Shortest digit string treated as a phone number.
const MIN_PHONE_DIGITS: usize = 6;

/// Locates phone numbers inside record payloads.
#[derive(Debug, Clone, Default)]
pub struct PhoneIndex {
  /// JSON pointers to phone values (string, number, or an array of either)
  paths: Vec<String>,
  /// Object key whose values are phones anywhere in the payload
  field: Option<String>,
  /// Length of the national number kept when a longer one is indexed
  suffix_digits: Option<usize>,
}

impl PhoneIndex {
  pub fn new(paths: Vec<String>, field: Option<String>) -> Self {
    Self {
      paths,
      field: field.filter(|f| !f.is_empty()),
      suffix_digits: None,
    }
  }

  /// Also index numbers longer than `digits` under their last `digits`
  /// digits, so "+51 987 654 321" is found as "987654321". Values shorter
  /// than a phone number disable this.
  pub fn with_suffix_digits(mut self, digits: usize) -> Self {
    self.suffix_digits = (digits >= MIN_PHONE_DIGITS).then_some(digits);
    self
  }

  pub fn is_enabled(&self) -> bool {
    !self.paths.is_empty() || self.field.is_some()
  }

  /// Keys a normalized number is indexed under, most specific first.
  pub fn forms(&self, digits: &str) -> Vec<String> {
    let mut forms = vec![digits.to_string()];
    if let Some(n) = self.suffix_digits {
      if digits.len() > n && digits.is_ascii() {
        forms.push(digits[digits.len() - n..].to_string());
      }
    }
    forms
  }

  /// Normalized, de-duplicated phone numbers found in `payload`, together
  /// with their national suffixes.
  pub fn extract(&self, payload: &Value) -> Vec<String> {
    let mut phones = BTreeSet::new();

    for path in &self.paths {
      if let Some(value) = payload.pointer(path) {
        collect_numbers(value, &mut phones);
      }
    }
    if let Some(field) = &self.field {
      collect_field(payload, field, &mut phones);
    }

    let forms: BTreeSet<String> = phones.iter().flat_map(|phone| self.forms(phone)).collect();
    forms.into_iter().collect()
  }
}

fn collect_numbers(value: &Value, out: &mut BTreeSet<String>) {
  match value {
    Value::String(s) => push_phone(s, out),
    Value::Number(n) => push_phone(&n.to_string(), out),
    Value::Array(items) => items.iter().for_each(|item| collect_numbers(item, out)),
    _ => {}
  }
}

fn collect_field(value: &Value, field: &str, out: &mut BTreeSet<String>) {
  match value {
    Value::Object(map) => {
      for (key, child) in map {
        if key == field {
          collect_numbers(child, out);
        } else {
          collect_field(child, field, out);
        }
      }
    }
    Value::Array(items) => items.iter().for_each(|item| collect_field(item, field, out)),
    _ => {}
  }
}

fn push_phone(raw: &str, out: &mut BTreeSet<String>) {
  let digits = normalize_value(QueryKind::Phone, raw);
  if digits.len() >= MIN_PHONE_DIGITS {
    out.insert(digits);
  }
}

/// Identifier cache keys listed by an index entry.
pub fn referenced_keys(entry: &Value) -> Vec<String> {
  entry
    .get("identifiers")
    .and_then(Value::as_array)
    .map(|keys| {
      keys
        .iter()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect()
    })
    .unwrap_or_default()
}

/// Index entry payload with `identifier_key` added to whatever `existing` lists.
pub fn merged_entry(existing: Option<&Value>, identifier_key: &str) -> Value {
  let mut keys = existing.map(referenced_keys).unwrap_or_default();
  if !keys.iter().any(|k| k == identifier_key) {
    keys.push(identifier_key.to_string());
  }
  json!({ "identifiers": keys })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record() -> Value {
    json!({
      "dni": "80660244",
      "telefonos": ["(01) 555-1234", 987654321, "n/a"],
      "contacto": { "celular": "987 654 321" },
      "familiares": [{ "nombre": "x", "celular": "912-000-111" }]
    })
  }

  #[test]
  fn extracts_from_pointers_and_fields() {
    let index = PhoneIndex::new(vec!["/telefonos".into()], Some("celular".into()));
    assert_eq!(
      index.extract(&record()),
      vec!["015551234", "912000111", "987654321"]
    );
  }

  #[test]
  fn missing_pointer_and_short_numbers_are_ignored() {
    let index = PhoneIndex::new(vec!["/nope".into(), "/dni".into()], None);
    assert_eq!(index.extract(&json!({"dni": "123"})), Vec::<String>::new());
    assert!(!PhoneIndex::default().is_enabled());
  }

  #[test]
  fn prefixed_numbers_are_also_indexed_by_national_suffix() {
    let index = PhoneIndex::new(vec!["/telefonos".into()], None).with_suffix_digits(9);
    let record = json!({"telefonos": ["+51 987 654 321", "987654321", "(01) 555-1234"]});
    assert_eq!(
      index.extract(&record),
      vec!["015551234", "51987654321", "987654321"]
    );

    assert_eq!(index.forms("51987654321"), vec!["51987654321", "987654321"]);
    assert_eq!(index.forms("987654321"), vec!["987654321"]);
    assert_eq!(
      PhoneIndex::default().with_suffix_digits(0).forms("51987654321"),
      vec!["51987654321"]
    );
  }

  #[test]
  fn merged_entry_deduplicates_keys() {
    let first = merged_entry(None, "identifier:a");
    let second = merged_entry(Some(&first), "identifier:b");
    let again = merged_entry(Some(&second), "identifier:a");
    assert_eq!(referenced_keys(&again), vec!["identifier:a", "identifier:b"]);
  }
}
