//! Flattening of nested match specs and partial updates into dotted paths.
//!
//! `{ "stateData": { "code": 200 } }` becomes `{ "stateData.code": { "$eq": 200 } }`
//! for filters and `{ "stateData.code": 200 }` for updates, so a nested
//! update only touches the named leaf and leaves its siblings alone.

use std::str::FromStr;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, Document};

use crate::error::{QueueError, Result};

/// Build an equality filter from a nested match spec
pub fn flatten_for_filter(spec: &Document) -> Result<Document> {
    let mut flat = Document::new();
    flatten_into(spec, None, &mut flat, |value| Bson::Document(doc! { "$eq": value }))?;
    Ok(flat)
}

/// Build `$set` assignments from a nested partial record
pub fn flatten_for_update(spec: &Document) -> Result<Document> {
    let mut flat = Document::new();
    flatten_into(spec, None, &mut flat, |value| value)?;
    Ok(flat)
}

fn flatten_into(
    spec: &Document,
    parent: Option<&str>,
    flat: &mut Document,
    leaf: fn(Bson) -> Bson,
) -> Result<()> {
    for (key, value) in spec {
        let path = match parent {
            Some(parent) => format!("{parent}.{key}"),
            // items are stored with `_id`, `id` only exists on the Rust side
            None if key == "id" => "_id".to_string(),
            None => key.clone(),
        };

        if is_id_key(key) {
            flat.insert(path, leaf(Bson::ObjectId(coerce_id(value)?)));
        } else if let Bson::Document(nested) = value {
            flatten_into(nested, Some(&path), flat, leaf)?;
        } else {
            flat.insert(path, leaf(value.clone()));
        }
    }
    Ok(())
}

fn is_id_key(key: &str) -> bool {
    key == "id" || key == "_id"
}

/// Coerce a leaf under an id key into the store's identifier type
pub fn coerce_id(value: &Bson) -> Result<ObjectId> {
    match value {
        Bson::ObjectId(id) => Ok(*id),
        Bson::String(raw) => ObjectId::from_str(raw).map_err(|_| QueueError::InvalidIdentifier(raw.clone())),
        other => Err(QueueError::InvalidIdentifier(other.to_string())),
    }
}
