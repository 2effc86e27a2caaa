//! View results and their conversion into typed values.

use std::collections::HashMap;
use std::ops::Deref;

use serde_json::{Map, Value as JsonValue};

use crate::couch_document::Document;
use crate::couch_error::{CouchError, Result};
use crate::model::Model;

/// One untyped view row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: Option<String>,
    pub key: JsonValue,
    pub value: JsonValue,
    /// Present when the query included documents.
    pub doc: Option<Document>,
}

impl Row {
    pub fn from_value(row: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut row) = row else {
            return Err(CouchError::RequestFailed(format!("Malformed view row: {row}")));
        };
        let doc = match row.remove("doc") {
            Some(JsonValue::Null) | None => None,
            Some(doc) => Some(Document::from_value(doc)?),
        };
        Ok(Self {
            id: row.remove("id").and_then(|id| id.as_str().map(str::to_string)),
            key: row.remove("key").unwrap_or(JsonValue::Null),
            value: row.remove("value").unwrap_or(JsonValue::Null),
            doc,
        })
    }

    /// The embedded document, or a document holding `key` and `value` when
    /// the query did not include bodies.
    pub fn into_document(self) -> Document {
        if let Some(doc) = self.doc {
            return doc;
        }
        let mut seed = Map::new();
        if let Some(id) = self.id {
            seed.insert("_id".to_string(), JsonValue::String(id));
        }
        seed.insert("key".to_string(), self.key);
        seed.insert("value".to_string(), self.value);
        Document::from_map(seed)
    }
}

/// Materialized query result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet<T> {
    pub total_rows: Option<u64>,
    pub offset: Option<u64>,
    rows: Vec<T>,
}

impl<T> ResultSet<T> {
    pub fn new(rows: Vec<T>) -> Self {
        Self {
            total_rows: None,
            offset: None,
            rows,
        }
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<T> {
        self.rows
    }

    /// Converts every row, stopping at the first failure.
    pub fn try_map<U>(self, f: impl FnMut(T) -> Result<U>) -> Result<ResultSet<U>> {
        let rows = self
            .rows
            .into_iter()
            .map(f)
            .collect::<Result<Vec<U>>>()?;
        Ok(ResultSet {
            total_rows: self.total_rows,
            offset: self.offset,
            rows,
        })
    }
}

impl ResultSet<Row> {
    /// Parses a `{total_rows, offset, rows}` view response.
    pub fn from_response(response: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut response) = response else {
            return Err(CouchError::RequestFailed(format!(
                "Malformed view response: {response}"
            )));
        };
        let rows = match response.remove("rows") {
            Some(JsonValue::Array(rows)) => rows
                .into_iter()
                .map(Row::from_value)
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Self {
            total_rows: response.get("total_rows").and_then(JsonValue::as_u64),
            offset: response.get("offset").and_then(JsonValue::as_u64),
            rows,
        })
    }
}

impl<T> Deref for ResultSet<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.rows
    }
}

impl<T> IntoIterator for ResultSet<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a ResultSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

type Constructor<T> = Box<dyn Fn(Document) -> Result<T> + Send + Sync>;

/// Resolves a row's type marker to a constructor.
///
/// Rows without a marker go to the fallback constructor. A marker with no
/// registered constructor is a [`CouchError::MissingClass`]; such rows are
/// never dropped silently.
pub struct TypeRegistry<T> {
    constructors: HashMap<String, Constructor<T>>,
    fallback: Constructor<T>,
}

impl<T> TypeRegistry<T> {
    pub fn new(fallback: impl Fn(Document) -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            constructors: HashMap::new(),
            fallback: Box::new(fallback),
        }
    }

    pub fn register(
        &mut self,
        marker: impl Into<String>,
        constructor: impl Fn(Document) -> Result<T> + Send + Sync + 'static,
    ) -> &mut Self {
        self.constructors.insert(marker.into(), Box::new(constructor));
        self
    }

    /// Registers `M` under its type name, wrapping decoded values with `wrap`.
    pub fn register_model<M: Model + 'static>(
        &mut self,
        wrap: impl Fn(M) -> T + Send + Sync + 'static,
    ) -> &mut Self {
        self.register(M::TYPE_NAME, move |doc: Document| {
            doc.into_model::<M>().map(&wrap)
        })
    }

    pub fn knows(&self, marker: &str) -> bool {
        self.constructors.contains_key(marker)
    }

    pub fn resolve(&self, doc: Document) -> Result<T> {
        match doc.class_marker().map(str::to_string) {
            Some(marker) => match self.constructors.get(&marker) {
                Some(constructor) => constructor(doc),
                None => Err(CouchError::MissingClass { marker }),
            },
            None => (self.fallback)(doc),
        }
    }
}

impl TypeRegistry<Document> {
    /// Plain documents for unmarked rows; markers must be registered with
    /// [`register_document`](TypeRegistry::register_document).
    pub fn documents() -> Self {
        Self::new(Ok)
    }

    pub fn register_document(&mut self, marker: impl Into<String>) -> &mut Self {
        self.register(marker, Ok)
    }
}

impl<M: Model + 'static> TypeRegistry<M> {
    /// Registry producing `M` for rows marked with its type name. Unmarked
    /// rows are decoded as `M` too.
    pub fn for_model() -> Self {
        let mut registry = Self::new(|doc: Document| doc.into_model::<M>());
        registry.register(M::TYPE_NAME, |doc: Document| doc.into_model::<M>());
        registry
    }
}
