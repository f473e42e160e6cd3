//! Mapping between the short-key catalog format and `Artifact` records.
//!
//! The published catalog keeps keys short (`{"i": .., "t": .., "m": .., "l": ..}`)
//! to save bytes. Records are validated against the field table when loaded;
//! a missing or mistyped field is an error, never an empty value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Short key used for each artifact field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FieldMap {
  pub id: String,
  pub title: String,
  pub thumbnail: String,
  pub link: String,
}

impl Default for FieldMap {
  fn default() -> Self {
    Self {
      id: "i".to_string(),
      title: "t".to_string(),
      thumbnail: "m".to_string(),
      link: "l".to_string(),
    }
  }
}

impl FieldMap {
  fn table(&self) -> [(&'static str, &str); 4] {
    [
      ("id", &self.id),
      ("title", &self.title),
      ("thumbnail", &self.thumbnail),
      ("link", &self.link),
    ]
  }
}

/// A catalog record with long field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
  pub id: String,
  pub title: String,
  pub thumbnail: String,
  pub link: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
  #[error("record {index} is not an object")]
  NotAnObject { index: usize },

  #[error("record {index} is missing '{key}' ({field})")]
  MissingField {
    index: usize,
    field: &'static str,
    key: String,
  },

  #[error("record {index} field '{key}' ({field}) is not a string or number")]
  WrongType {
    index: usize,
    field: &'static str,
    key: String,
  },
}

/// Decode short-key records into artifacts.
///
/// Numeric ids are accepted and rendered as strings, since catalogs mix both.
pub fn decode_records(records: &[Value], fields: &FieldMap) -> Result<Vec<Artifact>, SchemaError> {
  records
    .iter()
    .enumerate()
    .map(|(index, record)| decode_record(index, record, fields))
    .collect()
}

fn decode_record(index: usize, record: &Value, fields: &FieldMap) -> Result<Artifact, SchemaError> {
  let object = record
    .as_object()
    .ok_or(SchemaError::NotAnObject { index })?;

  Ok(Artifact {
    id: read_field(index, object, "id", &fields.id)?,
    title: read_field(index, object, "title", &fields.title)?,
    thumbnail: read_field(index, object, "thumbnail", &fields.thumbnail)?,
    link: read_field(index, object, "link", &fields.link)?,
  })
}

fn read_field(
  index: usize,
  object: &Map<String, Value>,
  field: &'static str,
  key: &str,
) -> Result<String, SchemaError> {
  match object.get(key) {
    Some(Value::String(s)) => Ok(s.clone()),
    Some(Value::Number(n)) => Ok(n.to_string()),
    Some(_) => Err(SchemaError::WrongType {
      index,
      field,
      key: key.to_string(),
    }),
    None => Err(SchemaError::MissingField {
      index,
      field,
      key: key.to_string(),
    }),
  }
}

/// Build-time inverse: long-key records to the short-key catalog format.
///
/// Keys without a mapping are dropped.
pub fn minify(records: &[Map<String, Value>], fields: &FieldMap) -> Vec<Value> {
  records
    .iter()
    .map(|record| {
      let mut short = Map::new();
      for (long, key) in fields.table() {
        if let Some(value) = record.get(long) {
          short.insert(key.to_string(), value.clone());
        }
      }
      Value::Object(short)
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_decode_default_fields() {
    let records = vec![
      json!({"i": "a1", "t": "First", "m": "/thumbs/a1.jpg", "l": "https://videy.co/v?id=a1"}),
      json!({"i": 42, "t": "Second", "m": "/thumbs/42.jpg", "l": "https://videy.co/v?id=42", "x": true}),
    ];
    let artifacts = decode_records(&records, &FieldMap::default()).unwrap();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[0].title, "First");
    assert_eq!(artifacts[1].id, "42");
  }

  #[test]
  fn test_missing_field_is_error() {
    let records = vec![
      json!({"i": "a1", "t": "First", "m": "", "l": ""}),
      json!({"i": "a2", "t": "Second", "m": ""}),
    ];
    let err = decode_records(&records, &FieldMap::default()).unwrap_err();
    assert_eq!(
      err,
      SchemaError::MissingField {
        index: 1,
        field: "link",
        key: "l".to_string()
      }
    );
  }

  #[test]
  fn test_wrong_type_and_non_object() {
    let err = decode_records(&[json!({"i": "a", "t": ["x"], "m": "", "l": ""})], &FieldMap::default())
      .unwrap_err();
    assert!(matches!(err, SchemaError::WrongType { field: "title", .. }));

    let err = decode_records(&[json!("a1")], &FieldMap::default()).unwrap_err();
    assert_eq!(err, SchemaError::NotAnObject { index: 0 });
  }

  #[test]
  fn test_custom_field_map() {
    let fields = FieldMap {
      id: "id".to_string(),
      title: "t".to_string(),
      thumbnail: "thumb".to_string(),
      link: "src".to_string(),
    };
    let records = vec![json!({"id": "v1", "t": "Clip", "thumb": "/t.png", "src": "/v1.mp4"})];
    let artifacts = decode_records(&records, &fields).unwrap();
    assert_eq!(artifacts[0].link, "/v1.mp4");
  }

  #[test]
  fn test_minify_then_decode() {
    let long = json!({
      "id": "a1",
      "title": "First",
      "thumbnail": "/thumbs/a1.jpg",
      "link": "https://videy.co/v?id=a1",
      "description": "dropped"
    });
    let records = vec![long.as_object().unwrap().clone()];
    let short = minify(&records, &FieldMap::default());
    assert_eq!(
      short[0],
      json!({"i": "a1", "t": "First", "m": "/thumbs/a1.jpg", "l": "https://videy.co/v?id=a1"})
    );
    let decoded = decode_records(&short, &FieldMap::default()).unwrap();
    assert_eq!(decoded[0].id, "a1");
  }
}
