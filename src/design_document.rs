//! Design documents: named map/reduce views, query construction and
//! server-side reductions.
//!
//! View scripts are opaque strings to this crate. When no map is supplied a
//! generic one is generated that indexes a single attribute, optionally
//! narrowed by a type marker or a raw boolean expression.

use std::collections::BTreeMap;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::couch_database::Database;
use crate::couch_document::{Document, CLASS_FIELD};
use crate::couch_error::{CouchError, Result};
use crate::couch_helpers::{escape_id, paramify_url};
use crate::query::QueryOptions;
use crate::result_set::{ResultSet, Row, TypeRegistry};

/// Wire prefix of design document ids.
pub const DESIGN_PREFIX: &str = "_design/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

/// Extra condition ANDed into a generated map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassConstraint {
    /// `doc['class_'] == '<marker>'`
    Marker(String),
    /// Raw JavaScript boolean expression.
    Expression(String),
}

/// What a generated map emits as key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitKey {
    Attribute(String),
    DocumentId,
}

/// What a generated map emits as value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmitValue {
    One,
    Key,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewOptions {
    pub map: Option<String>,
    pub reduce: Option<String>,
    pub class_constraint: Option<ClassConstraint>,
    /// Defaults to the attribute named like the view.
    pub key: Option<EmitKey>,
}

impl ViewOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, map: impl Into<String>) -> Self {
        self.map = Some(map.into());
        self
    }

    pub fn reduce(mut self, reduce: impl Into<String>) -> Self {
        self.reduce = Some(reduce.into());
        self
    }

    pub fn constrain_to_marker(mut self, marker: impl Into<String>) -> Self {
        self.class_constraint = Some(ClassConstraint::Marker(marker.into()));
        self
    }

    pub fn constrain_with(mut self, expression: impl Into<String>) -> Self {
        self.class_constraint = Some(ClassConstraint::Expression(expression.into()));
        self
    }

    pub fn keyed_by(mut self, attribute: impl Into<String>) -> Self {
        self.key = Some(EmitKey::Attribute(attribute.into()));
        self
    }

    pub fn keyed_by_id(mut self) -> Self {
        self.key = Some(EmitKey::DocumentId);
        self
    }
}

/// Server-side aggregations backed by `{index}_{kind}` views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Count,
    Sum,
    Min,
    Max,
}

impl Reduction {
    pub fn suffix(self) -> &'static str {
        match self {
            Reduction::Count => "count",
            Reduction::Sum => "sum",
            Reduction::Min => "min",
            Reduction::Max => "max",
        }
    }

    pub fn reduce_script(self) -> &'static str {
        match self {
            Reduction::Count | Reduction::Sum => {
                "function(keys, values, rereduce) {\n  return sum(values);\n}"
            }
            Reduction::Min => "function(keys, values, rereduce) {\n  return Math.min.apply(Math, values);\n}",
            Reduction::Max => "function(keys, values, rereduce) {\n  return Math.max.apply(Math, values);\n}",
        }
    }

    /// Count emits a constant 1 and sums it; the others reduce the emitted
    /// attribute itself.
    fn emit_value(self) -> EmitValue {
        match self {
            Reduction::Count => EmitValue::One,
            _ => EmitValue::Key,
        }
    }
}

fn js_quote(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

fn build_map(key: &EmitKey, value: EmitValue, constraint: Option<&ClassConstraint>) -> String {
    let attribute = match key {
        EmitKey::Attribute(attribute) => js_quote(attribute),
        EmitKey::DocumentId => "_id".to_string(),
    };
    let constraint = match constraint {
        Some(ClassConstraint::Marker(marker)) => {
            format!(" && doc['{}'] == '{}'", CLASS_FIELD, js_quote(marker))
        }
        Some(ClassConstraint::Expression(expression)) => format!(" && {expression}"),
        None => String::new(),
    };
    let value = match value {
        EmitValue::One => "1".to_string(),
        EmitValue::Key => format!("doc['{attribute}']"),
    };
    format!(
        "function(doc) {{\n  if (doc['{attribute}']{constraint}) {{\n    emit(doc['{attribute}'], {value});\n  }}\n}}"
    )
}

/// A document holding view definitions, addressed under `_design/`.
///
/// The local id is the bare name; the prefix only exists on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignDocument {
    document: Document,
    views: BTreeMap<String, ViewDefinition>,
}

impl DesignDocument {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CouchError::argument("DesignDocument must have a name"));
        }
        Ok(Self {
            document: Document::with_id(name),
            views: BTreeMap::new(),
        })
    }

    /// Parses a server response. `_id` loses its `_design/` prefix and the
    /// `views` object is lifted out of the payload.
    pub fn from_value(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut body) = value else {
            return Err(CouchError::Serialization(
                "A design document must be a JSON object".to_string(),
            ));
        };
        let views = match body.remove("views") {
            Some(views) => serde_json::from_value(views)?,
            None => BTreeMap::new(),
        };
        if let Some(JsonValue::String(id)) = body.get("_id") {
            let name = id.strip_prefix(DESIGN_PREFIX).unwrap_or(id).to_string();
            body.insert("_id".to_string(), JsonValue::String(name));
        }
        let document = Document::from_map(body);
        match document.id() {
            Some(name) if !name.is_empty() => Ok(Self { document, views }),
            _ => Err(CouchError::argument("DesignDocument must have a name")),
        }
    }

    pub fn name(&self) -> &str {
        self.document.id().unwrap_or_default()
    }

    pub fn rev(&self) -> Option<&str> {
        self.document.rev()
    }

    pub fn is_new(&self) -> bool {
        self.document.is_new()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn uri(&self, db: &Database) -> String {
        format!("{}/{}{}", db.uri(), DESIGN_PREFIX, escape_id(self.name()))
    }

    pub fn uri_for(db: &Database, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(CouchError::argument("DesignDocument must have a name"));
        }
        Ok(format!("{}/{}{}", db.uri(), DESIGN_PREFIX, escape_id(name)))
    }

    pub fn views(&self) -> &BTreeMap<String, ViewDefinition> {
        &self.views
    }

    pub fn view(&self, name: &str) -> Option<&ViewDefinition> {
        self.views.get(name)
    }

    pub fn to_json(&self) -> JsonValue {
        let mut body = match self.document.to_json() {
            JsonValue::Object(body) => body,
            _ => Map::new(),
        };
        body.insert(
            "_id".to_string(),
            JsonValue::String(format!("{}{}", DESIGN_PREFIX, self.name())),
        );
        let views = self
            .views
            .iter()
            .map(|(name, view)| {
                let view = serde_json::to_value(view).unwrap_or(JsonValue::Null);
                (name.clone(), view)
            })
            .collect::<Map<_, _>>();
        body.insert("views".to_string(), JsonValue::Object(views));
        JsonValue::Object(body)
    }

    /// Adds or replaces the view `name`. Without a map, one is generated
    /// emitting `(doc[key], 1)` for documents that have the key.
    pub fn add_view(&mut self, name: impl Into<String>, options: ViewOptions) -> &ViewDefinition {
        let name = name.into();
        let map = options.map.unwrap_or_else(|| {
            let key = options
                .key
                .clone()
                .unwrap_or_else(|| EmitKey::Attribute(name.clone()));
            build_map(&key, EmitValue::One, options.class_constraint.as_ref())
        });
        let definition = ViewDefinition {
            map,
            reduce: options.reduce,
        };
        self.views.insert(name.clone(), definition);
        &self.views[&name]
    }

    /// [`add_view`](DesignDocument::add_view) followed by a strict save. When
    /// the save fails the views are left as they were before the call.
    pub fn add_view_and_save(
        &mut self,
        db: &Database,
        name: impl Into<String>,
        options: ViewOptions,
    ) -> Result<()> {
        let name = name.into();
        let previous = self.views.get(&name).cloned();
        self.add_view(name.clone(), options);
        let saved = self.save(db);
        if saved.is_err() {
            match previous {
                Some(view) => self.views.insert(name, view),
                None => self.views.remove(&name),
            };
        }
        saved
    }

    pub fn save(&mut self, db: &Database) -> Result<()> {
        let uri = self.uri(db);
        let response = db.transport().put(&uri, Some(&self.to_json()))?;
        self.document.update_version(&response, Some(DESIGN_PREFIX))
    }

    pub fn save_quietly(&mut self, db: &Database) -> bool {
        match self.save(db) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Could not save design document {}: {}", self.name(), err);
                false
            }
        }
    }

    pub fn load(db: &Database, name: &str) -> Result<Self> {
        Self::from_value(db.get(&Self::uri_for(db, name)?)?)
    }

    pub fn load_quietly(db: &Database, name: &str) -> Option<Self> {
        Self::load(db, name).ok()
    }

    /// Loads `name`, creating an empty design document when it is missing.
    pub fn load_or_create(db: &Database, name: &str) -> Result<Self> {
        match Self::load(db, name) {
            Ok(design) => Ok(design),
            Err(err) if err.is_not_found() => {
                let mut design = Self::new(name)?;
                design.save(db)?;
                info!("Created design document {}", design.uri(db));
                Ok(design)
            }
            Err(err) => Err(err),
        }
    }

    pub fn reload(&mut self, db: &Database) -> Result<()> {
        *self = Self::from_value(db.get(&self.uri(db))?)?;
        Ok(())
    }

    pub fn delete(&mut self, db: &Database) -> Result<bool> {
        let Some(rev) = self.rev().map(str::to_string) else {
            return Err(CouchError::argument(
                "DesignDocument has no revision and can't be deleted",
            ));
        };
        let response = db
            .transport()
            .delete(&format!("{}?rev={}", self.uri(db), rev))?;
        Ok(response.get("ok").and_then(JsonValue::as_bool) == Some(true))
    }

    /// `{design uri}/_view/{view}?{params}`.
    pub fn query_uri(&self, db: &Database, view: &str, options: &QueryOptions) -> String {
        let base = format!("{}/_view/{}", self.uri(db), escape_id(view));
        paramify_url(&base, &options.params())
    }

    /// Untyped rows; never consults type markers.
    pub fn raw_query(
        &self,
        db: &Database,
        view: &str,
        options: &QueryOptions,
    ) -> Result<ResultSet<Row>> {
        let response = db.get(&self.query_uri(db, view, options))?;
        ResultSet::from_response(response)
    }

    /// Rows turned into `T` through `registry`. A row whose type marker is
    /// unknown to the registry fails the whole query with
    /// [`CouchError::MissingClass`].
    pub fn query<T>(
        &self,
        db: &Database,
        view: &str,
        options: &QueryOptions,
        registry: &TypeRegistry<T>,
    ) -> Result<ResultSet<T>> {
        self.raw_query(db, view, options)?
            .try_map(|row| registry.resolve(row.into_document()))
    }

    /// Number of documents carrying `index`.
    pub fn count(&mut self, db: &Database, index: &str, options: &QueryOptions) -> Result<Option<u64>> {
        self.count_with(db, index, ViewOptions::new(), options)
    }

    /// Count using `template` (key and constraint) for the generated view.
    pub fn count_with(
        &mut self,
        db: &Database,
        index: &str,
        template: ViewOptions,
        options: &QueryOptions,
    ) -> Result<Option<u64>> {
        let value = self.reduced_query(db, index, Reduction::Count, template, options)?;
        Ok(value.and_then(|value| {
            value
                .as_u64()
                .or_else(|| value.as_f64().map(|count| count as u64))
        }))
    }

    pub fn sum(&mut self, db: &Database, index: &str, options: &QueryOptions) -> Result<Option<f64>> {
        self.numeric_reduction(db, index, Reduction::Sum, options)
    }

    pub fn min(&mut self, db: &Database, index: &str, options: &QueryOptions) -> Result<Option<f64>> {
        self.numeric_reduction(db, index, Reduction::Min, options)
    }

    pub fn max(&mut self, db: &Database, index: &str, options: &QueryOptions) -> Result<Option<f64>> {
        self.numeric_reduction(db, index, Reduction::Max, options)
    }

    /// `sum / count`, computed here from two separate queries. Writes landing
    /// between the two reads make the result inconsistent with both.
    pub fn average(&mut self, db: &Database, index: &str, options: &QueryOptions) -> Result<Option<f64>> {
        let Some(count) = self.count(db, index, options)? else {
            return Ok(None);
        };
        if count == 0 {
            return Ok(None);
        }
        let sum = self.sum(db, index, options)?;
        Ok(sum.map(|sum| sum / count as f64))
    }

    fn numeric_reduction(
        &mut self,
        db: &Database,
        index: &str,
        reduction: Reduction,
        options: &QueryOptions,
    ) -> Result<Option<f64>> {
        let value = self.reduced_query(db, index, reduction, ViewOptions::new(), options)?;
        Ok(value.and_then(|value| value.as_f64()))
    }

    /// Ensures `{index}_{kind}` exists (saving the design document when it
    /// had to be added), then returns the single reduced value, if any.
    fn reduced_query(
        &mut self,
        db: &Database,
        index: &str,
        reduction: Reduction,
        template: ViewOptions,
        options: &QueryOptions,
    ) -> Result<Option<JsonValue>> {
        let view = format!("{}_{}", index, reduction.suffix());
        if !self.views.contains_key(&view) {
            let key = template
                .key
                .unwrap_or_else(|| EmitKey::Attribute(index.to_string()));
            let map = build_map(&key, reduction.emit_value(), template.class_constraint.as_ref());
            self.add_view_and_save(
                db,
                view.clone(),
                ViewOptions::new().map(map).reduce(reduction.reduce_script()),
            )?;
        }
        let options = options.clone().reduce(true);
        let rows = self.raw_query(db, &view, &options)?;
        Ok(rows.into_rows().into_iter().next().map(|row| row.value))
    }
}

