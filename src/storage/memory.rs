//! In-process document store.
//!
//! Evaluates the part of the MongoDB query, update and aggregation language
//! the queue issues. Each collection keeps its documents behind one lock that
//! is held for the full duration of an operation, so upserts and
//! find-and-modify calls are atomic exactly like their server counterparts.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, Document};
use tokio::sync::Mutex;
use tracing::debug;

use super::{DocumentCollection, DocumentStore, IndexSpec, ReturnDocument, StoreError, StoreResult, UpdateOutcome};

/// Store holding named in-memory collections
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed handle to a collection, created on first use
    pub async fn handle(&self, name: &str) -> Arc<MemoryCollection> {
        let mut collections = self.collections.lock().await;
        collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCollection::new()))
            .clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn connect(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn collection(&self, name: &str) -> StoreResult<Arc<dyn DocumentCollection>> {
        Ok(self.handle(name).await)
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

/// A collection kept in insertion order
#[derive(Default)]
pub struct MemoryCollection {
    state: Mutex<CollectionState>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored document
    pub async fn documents(&self) -> Vec<Document> {
        self.state.lock().await.documents.clone()
    }

    /// Indexes created so far
    pub async fn indexes(&self) -> Vec<IndexSpec> {
        self.state.lock().await.indexes.clone()
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    async fn find_one(&self, filter: Document, skip: Option<u64>) -> StoreResult<Option<Document>> {
        let state = self.state.lock().await;
        let mut remaining = skip.unwrap_or(0);

        for doc in &state.documents {
            if matches(doc, &filter)? {
                if remaining == 0 {
                    return Ok(Some(doc.clone()));
                }
                remaining -= 1;
            }
        }
        Ok(None)
    }

    async fn find(&self, filter: Document) -> StoreResult<Vec<Document>> {
        let state = self.state.lock().await;
        let mut found = Vec::new();
        for doc in &state.documents {
            if matches(doc, &filter)? {
                found.push(doc.clone());
            }
        }
        Ok(found)
    }

    async fn count_documents(&self, filter: Document) -> StoreResult<u64> {
        let state = self.state.lock().await;
        let mut count = 0;
        for doc in &state.documents {
            if matches(doc, &filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_one(&self, document: Document) -> StoreResult<Bson> {
        let mut state = self.state.lock().await;
        let (id, stored) = with_id(document);
        state.documents.push(stored);
        Ok(id)
    }

    async fn update_one(&self, filter: Document, update: Document, upsert: bool) -> StoreResult<UpdateOutcome> {
        let mut state = self.state.lock().await;

        for doc in state.documents.iter_mut() {
            if matches(doc, &filter)? {
                let changed = apply_update(doc, &update, false)?;
                return Ok(UpdateOutcome {
                    matched_count: 1,
                    modified_count: u64::from(changed),
                    upserted_id: None,
                });
            }
        }

        if !upsert {
            return Ok(UpdateOutcome::default());
        }

        let mut seed = Document::new();
        seed_from_filter(&mut seed, &filter);
        apply_update(&mut seed, &update, true)?;
        let (id, stored) = with_id(seed);
        state.documents.push(stored);
        debug!("Upserted document {}", id);

        Ok(UpdateOutcome {
            matched_count: 0,
            modified_count: 0,
            upserted_id: Some(id),
        })
    }

    async fn update_many(&self, filter: Document, update: Document) -> StoreResult<UpdateOutcome> {
        let mut state = self.state.lock().await;
        let mut outcome = UpdateOutcome::default();

        for doc in state.documents.iter_mut() {
            if matches(doc, &filter)? {
                outcome.matched_count += 1;
                if apply_update(doc, &update, false)? {
                    outcome.modified_count += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        return_document: ReturnDocument,
    ) -> StoreResult<Option<Document>> {
        let mut state = self.state.lock().await;

        for doc in state.documents.iter_mut() {
            if matches(doc, &filter)? {
                let before = doc.clone();
                apply_update(doc, &update, false)?;
                return Ok(Some(match return_document {
                    ReturnDocument::Before => before,
                    ReturnDocument::After => doc.clone(),
                }));
            }
        }
        Ok(None)
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> StoreResult<Vec<Document>> {
        let state = self.state.lock().await;
        let mut docs = state.documents.clone();
        drop(state);

        for stage in &pipeline {
            let (name, spec) = stage
                .iter()
                .next()
                .ok_or_else(|| unsupported("empty pipeline stage"))?;
            let spec = spec
                .as_document()
                .ok_or_else(|| unsupported(format!("{name} expects a document")))?;

            docs = match name.as_str() {
                "$match" => {
                    let mut kept = Vec::with_capacity(docs.len());
                    for doc in docs {
                        if matches(&doc, spec)? {
                            kept.push(doc);
                        }
                    }
                    kept
                }
                "$group" => group(&docs, spec)?,
                other => return Err(unsupported(other)),
            };
        }
        Ok(docs)
    }

    async fn create_index(&self, index: IndexSpec) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.indexes.contains(&index) {
            state.indexes.push(index);
        }
        Ok(())
    }

    async fn drop_collection(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.documents.clear();
        state.indexes.clear();
        Ok(())
    }
}

fn unsupported(what: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("unsupported by the memory store: {what}"))
}

/// Put an `_id` first in the document, generating one when absent
fn with_id(mut document: Document) -> (Bson, Document) {
    let id = document
        .remove("_id")
        .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
    let mut stored = Document::new();
    stored.insert("_id", id.clone());
    for (key, value) in document {
        stored.insert(key, value);
    }
    (id, stored)
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn values_equal(left: &Bson, right: &Bson) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l == r;
    }
    match (left, right) {
        (Bson::Document(l), Bson::Document(r)) => {
            l.len() == r.len()
                && l.iter()
                    .zip(r.iter())
                    .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        (Bson::Array(l), Bson::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r.iter()).all(|(lv, rv)| values_equal(lv, rv))
        }
        _ => left == right,
    }
}

fn compare(left: &Bson, right: &Bson) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l.partial_cmp(&r);
    }
    match (left, right) {
        (Bson::String(l), Bson::String(r)) => Some(l.cmp(r)),
        (Bson::DateTime(l), Bson::DateTime(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn matches_type(value: &Bson, alias: &Bson) -> bool {
    match alias {
        Bson::Array(aliases) => aliases.iter().any(|alias| matches_type(value, alias)),
        Bson::String(name) => match name.as_str() {
            "number" => as_number(value).is_some(),
            "double" => matches!(value, Bson::Double(_)),
            "int" => matches!(value, Bson::Int32(_)),
            "long" => matches!(value, Bson::Int64(_)),
            "string" => matches!(value, Bson::String(_)),
            "bool" => matches!(value, Bson::Boolean(_)),
            "object" => matches!(value, Bson::Document(_)),
            "array" => matches!(value, Bson::Array(_)),
            "objectId" => matches!(value, Bson::ObjectId(_)),
            "null" => matches!(value, Bson::Null),
            _ => false,
        },
        _ => false,
    }
}

/// A condition like `{ "$lt": 5 }`, as opposed to an embedded document literal
fn operator_doc(condition: &Bson) -> Option<&Document> {
    match condition {
        Bson::Document(doc) if !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) => Some(doc),
        _ => None,
    }
}

fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        // a null literal matches a missing field
        None => matches!(expected, Bson::Null),
        Some(value) => values_equal(value, expected),
    }
}

fn ordered(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    value.and_then(|v| compare(v, operand)).map_or(false, accept)
}

fn matches(doc: &Document, filter: &Document) -> StoreResult<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let clauses = condition
                    .as_array()
                    .ok_or_else(|| unsupported("$and expects an array"))?;
                let mut all = true;
                for clause in clauses {
                    let clause = clause
                        .as_document()
                        .ok_or_else(|| unsupported("$and clause must be a document"))?;
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            op if op.starts_with('$') => return Err(unsupported(op)),
            path => field_matches(get_path(doc, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> StoreResult<bool> {
    let Some(operators) = operator_doc(condition) else {
        return Ok(equals(value, condition));
    };

    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            "$lt" => ordered(value, operand, |o| o == Ordering::Less),
            "$lte" => ordered(value, operand, |o| o != Ordering::Greater),
            "$gt" => ordered(value, operand, |o| o == Ordering::Greater),
            "$gte" => ordered(value, operand, |o| o != Ordering::Less),
            "$type" => value.map_or(false, |v| matches_type(v, operand)),
            other => return Err(unsupported(other)),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality predicates of an upsert filter become fields of the inserted document
fn seed_from_filter(seed: &mut Document, filter: &Document) {
    for (key, condition) in filter {
        if key == "$and" {
            if let Some(clauses) = condition.as_array() {
                for clause in clauses.iter().filter_map(Bson::as_document) {
                    seed_from_filter(seed, clause);
                }
            }
        } else if key.starts_with('$') {
            continue;
        } else if let Some(operators) = operator_doc(condition) {
            if let Some(value) = operators.get("$eq") {
                set_path(seed, key, value.clone());
            }
        } else {
            set_path(seed, key, condition.clone());
        }
    }
}

/// Apply `$set` / `$setOnInsert`; returns whether anything changed
fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> StoreResult<bool> {
    let mut changed = false;

    for (op, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| unsupported(format!("{op} expects a document")))?;

        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    if get_path(doc, path) != Some(value) {
                        changed = true;
                    }
                    set_path(doc, path, value.clone());
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields {
                        set_path(doc, path, value.clone());
                    }
                    changed = true;
                }
            }
            other => return Err(unsupported(other)),
        }
    }
    Ok(changed)
}

fn evaluate(doc: &Document, expr: &Bson) -> Bson {
    match expr {
        Bson::String(s) if s.starts_with('$') => get_path(doc, &s[1..]).cloned().unwrap_or(Bson::Null),
        other => other.clone(),
    }
}

fn group(docs: &[Document], spec: &Document) -> StoreResult<Vec<Document>> {
    let key_expr = spec.get("_id").cloned().unwrap_or(Bson::Null);

    let mut groups: Vec<(Bson, Vec<&Document>)> = Vec::new();
    for doc in docs {
        let key = evaluate(doc, &key_expr);
        match groups.iter_mut().find(|(existing, _)| values_equal(existing, &key)) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }

    let mut output = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut out = Document::new();
        out.insert("_id", key);

        for (field, accumulator) in spec.iter().filter(|(field, _)| *field != "_id") {
            let (op, expr) = accumulator
                .as_document()
                .and_then(|acc| acc.iter().next())
                .ok_or_else(|| unsupported(format!("accumulator for {field}")))?;
            let values = members.iter().map(|doc| evaluate(doc, expr));

            let result = match op.as_str() {
                "$max" => extreme(values, Ordering::Greater),
                "$min" => extreme(values, Ordering::Less),
                "$avg" => average(values),
                "$sum" => sum(values),
                other => return Err(unsupported(other)),
            };
            out.insert(field, result);
        }
        output.push(out);
    }
    Ok(output)
}

fn extreme(values: impl Iterator<Item = Bson>, wanted: Ordering) -> Bson {
    let mut best: Option<Bson> = None;
    for value in values.filter(|v| !matches!(v, Bson::Null)) {
        best = match best {
            Some(current) if compare(&value, &current) != Some(wanted) => Some(current),
            _ => Some(value),
        };
    }
    best.unwrap_or(Bson::Null)
}

fn average(values: impl Iterator<Item = Bson>) -> Bson {
    let numbers: Vec<f64> = values.filter_map(|v| as_number(&v)).collect();
    if numbers.is_empty() {
        return Bson::Null;
    }
    Bson::Double(numbers.iter().sum::<f64>() / numbers.len() as f64)
}

fn sum(values: impl Iterator<Item = Bson>) -> Bson {
    let mut total = 0.0;
    let mut integral = true;
    for value in values {
        if let Some(n) = as_number(&value) {
            integral &= !matches!(value, Bson::Double(_));
            total += n;
        }
    }
    if integral {
        Bson::Int64(total as i64)
    } else {
        Bson::Double(total)
    }
}
