//! Document model and the operations that keep it in sync with the server.
//!
//! A [`Document`] is a JSON object with three pieces of identity kept
//! outside the payload: the user facing `id`, its escaped form
//! used on the wire, and the server assigned revision. Keeping them apart
//! means the payload never leaks stale revision state into what gets saved.

use log::{debug, warn};
use serde_json::{Map, Value as JsonValue};

use crate::attachments::Attachments;
use crate::couch_database::Database;
use crate::couch_error::{CouchError, Result};
use crate::couch_helpers::escape_id;

/// Field carrying the type marker of typed documents.
pub const CLASS_FIELD: &str = "class_";

/// Revision statuses that still have a body on the server.
const LIVE_REVISION_STATUSES: [&str; 2] = ["disk", "available"];

/// A JSON document with explicit identity and revision.
///
/// # Structure
///
/// - **id**: identifier chosen by the user, or a server uuid assigned on the
///   first save when none was chosen
/// - **escaped id**: percent-encoded `id`, always in sync with it
/// - **rev**: revision token; `None` until the document is saved once
/// - **fields**: arbitrary JSON payload
/// - **attachments**: named binary payloads sent with the next save
///
/// # Examples
///
/// ```rust
/// use couch_odm::Document;
/// use serde_json::json;
///
/// let mut doc = Document::from_value(json!({
///     "_id": "posts/2024/hello",
///     "_rev": "1-abc",
///     "title": "Hello",
/// }))?;
///
/// assert_eq!(doc.id(), Some("posts/2024/hello"));
/// assert_eq!(doc.escaped_id(), Some("posts%2F2024%2Fhello"));
/// assert_eq!(doc.rev(), Some("1-abc"));
/// assert!(!doc.is_new());
///
/// doc.insert("title", "Hello again");
/// assert_eq!(doc.get("title"), Some(&json!("Hello again")));
/// assert!(doc.get("_rev").is_none());
/// # Ok::<(), couch_odm::CouchError>(())
/// ```
///
/// # Lifecycle
///
/// Unsaved → saved (rev N) → saved (rev N+1) → deleted. A conflicting save
/// returns [`CouchError::Conflict`] and leaves the document untouched; the
/// caller decides whether to [`reload`](Document::reload) and retry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    id: Option<String>,
    escaped_id: Option<String>,
    rev: Option<String>,
    deleted: bool,
    fields: Map<String, JsonValue>,
    attachments: Attachments,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let mut doc = Self::default();
        doc.set_id(id);
        doc
    }

    /// Builds a document from a seed mapping. `_id` (or `id`) becomes the
    /// identity, `_rev` the revision, `_attachments` the attachment stubs;
    /// a bare `rev` key is discarded.
    pub fn from_map(mut seed: Map<String, JsonValue>) -> Self {
        let mut doc = Self::default();

        let id = match seed.remove("_id") {
            Some(id) => {
                seed.remove("id");
                Some(id)
            }
            None => seed.remove("id"),
        };
        if let Some(JsonValue::String(id)) = id {
            doc.set_id(id);
        }

        seed.remove("rev");
        if let Some(JsonValue::String(rev)) = seed.remove("_rev") {
            doc.rev = Some(rev);
        }
        if let Some(JsonValue::Object(stubs)) = seed.remove("_attachments") {
            doc.attachments = Attachments::from_stubs(stubs);
        }
        if let Some(JsonValue::Bool(deleted)) = seed.remove("_deleted") {
            doc.deleted = deleted;
        }

        doc.fields = seed;
        doc
    }

    pub fn from_value(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self::from_map(map)),
            other => Err(CouchError::Serialization(format!(
                "A document must be a JSON object, got: {other}"
            ))),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Sets the id and recomputes its escaped form.
    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.escaped_id = Some(escape_id(&id));
        self.id = Some(id);
    }

    pub fn escaped_id(&self) -> Option<&str> {
        self.escaped_id.as_deref()
    }

    pub fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    /// True until the first successful save.
    pub fn is_new(&self) -> bool {
        self.rev.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.fields.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Map<String, JsonValue> {
        &mut self.fields
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Attachments {
        &mut self.attachments
    }

    /// Type marker of typed documents, see [`CLASS_FIELD`].
    pub fn class_marker(&self) -> Option<&str> {
        self.fields.get(CLASS_FIELD).and_then(JsonValue::as_str)
    }

    pub(crate) fn set_rev(&mut self, rev: impl Into<String>) {
        self.rev = Some(rev.into());
    }

    /// Serialized form sent on save: payload plus `_id`, `_rev` and packed
    /// attachments.
    pub fn to_json(&self) -> JsonValue {
        let mut body = self.fields.clone();
        if let Some(id) = &self.id {
            body.insert("_id".to_string(), JsonValue::String(id.clone()));
        }
        if let Some(rev) = &self.rev {
            body.insert("_rev".to_string(), JsonValue::String(rev.clone()));
        }
        if !self.attachments.is_empty() {
            body.insert(
                "_attachments".to_string(),
                JsonValue::Object(self.attachments.pack()),
            );
        }
        JsonValue::Object(body)
    }

    /// Returns the escaped id, asking the server for a uuid first when the
    /// document has none.
    pub fn ensure_id(&mut self, db: &Database) -> Result<String> {
        if self.id.is_none() {
            let uuid = db.server().next_uuid()?;
            self.set_id(uuid);
        }
        Ok(self.escaped_id.clone().unwrap_or_default())
    }

    /// `{database uri}/{escaped id}`; assigns an id when missing.
    pub fn uri(&mut self, db: &Database) -> Result<String> {
        let escaped = self.ensure_id(db)?;
        Ok(format!("{}/{}", db.uri(), escaped))
    }

    pub fn uri_for(db: &Database, id: &str) -> String {
        format!("{}/{}", db.uri(), escape_id(id))
    }

    /// PUTs the document. On success the id and revision are replaced by the
    /// ones the server reports.
    pub fn save(&mut self, db: &Database) -> Result<()> {
        let uri = self.uri(db)?;
        let response = db.transport().put(&uri, Some(&self.to_json()))?;
        self.update_version(&response, None)
    }

    pub fn save_quietly(&mut self, db: &Database) -> bool {
        match self.save(db) {
            Ok(()) => true,
            Err(err) => {
                warn!("Could not save document {:?}: {}", self.id, err);
                false
            }
        }
    }

    /// Applies `{ok, id, rev}` from a write. `strip_prefix` is removed from
    /// the returned id when present.
    pub(crate) fn update_version(
        &mut self,
        response: &JsonValue,
        strip_prefix: Option<&str>,
    ) -> Result<()> {
        if response.get("ok").and_then(JsonValue::as_bool) != Some(true) {
            return Err(CouchError::RequestFailed(format!(
                "Unexpected save response: {response}"
            )));
        }
        if let Some(id) = response.get("id").and_then(JsonValue::as_str) {
            let id = strip_prefix
                .and_then(|prefix| id.strip_prefix(prefix))
                .unwrap_or(id);
            self.set_id(id);
        }
        if let Some(rev) = response.get("rev").and_then(JsonValue::as_str) {
            self.rev = Some(rev.to_string());
        }
        self.deleted = false;
        Ok(())
    }

    /// Builds a document from `seed` and saves it.
    pub fn create(db: &Database, seed: Map<String, JsonValue>) -> Result<Self> {
        let mut doc = Self::from_map(seed);
        doc.save(db)?;
        Ok(doc)
    }

    pub fn create_quietly(db: &Database, seed: Map<String, JsonValue>) -> Option<Self> {
        let mut doc = Self::from_map(seed);
        doc.save_quietly(db).then_some(doc)
    }

    /// Fetches a document by its unescaped id. If that fails and escaping
    /// changed the id, the id is tried verbatim in case the caller passed an
    /// already escaped one.
    pub fn load(db: &Database, id: &str) -> Result<Self> {
        let escaped = escape_id(id);
        let first = db.get(&format!("{}/{}", db.uri(), escaped));
        let body = match first {
            Ok(body) => body,
            Err(err) if escaped != id => {
                debug!("Escaped lookup of {} failed ({}), retrying verbatim", id, err);
                db.get(&format!("{}/{}", db.uri(), id))?
            }
            Err(err) => return Err(err),
        };
        Self::from_value(body)
    }

    pub fn load_quietly(db: &Database, id: &str) -> Option<Self> {
        match Self::load(db, id) {
            Ok(doc) => Some(doc),
            Err(err) => {
                warn!("Could not load document {}: {}", id, err);
                None
            }
        }
    }

    /// Replaces the whole local state with the server copy, discarding
    /// unsaved edits.
    pub fn reload(&mut self, db: &Database) -> Result<()> {
        let uri = self.uri(db)?;
        *self = Self::from_value(db.get(&uri)?)?;
        Ok(())
    }

    pub fn exists(&self, db: &Database) -> bool {
        match &self.escaped_id {
            Some(escaped) => db.get(&format!("{}/{}", db.uri(), escaped)).is_ok(),
            None => false,
        }
    }

    /// Revisions the server still holds a body for, newest first. Any fetch
    /// failure means "no history".
    pub fn revisions(&self, db: &Database) -> Vec<String> {
        let Some(escaped) = &self.escaped_id else {
            return Vec::new();
        };
        let uri = format!("{}/{}?revs_info=true", db.uri(), escaped);
        let Ok(info) = db.get(&uri) else {
            return Vec::new();
        };
        info.get("_revs_info")
            .and_then(JsonValue::as_array)
            .map(|revs| {
                revs.iter()
                    .filter(|rev| {
                        rev.get("status")
                            .and_then(JsonValue::as_str)
                            .is_some_and(|status| LIVE_REVISION_STATUSES.contains(&status))
                    })
                    .filter_map(|rev| rev.get("rev").and_then(JsonValue::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deletes the current revision. A document without a revision cannot be
    /// deleted this way; use [`purge`](Document::purge).
    pub fn delete(&mut self, db: &Database) -> Result<bool> {
        let Some(rev) = self.rev.clone() else {
            return Err(CouchError::argument(
                "Document has no revision and can't be deleted. Maybe you want to purge all revisions",
            ));
        };
        let uri = format!("{}?rev={}", self.uri(db)?, rev);
        let response = db.transport().delete(&uri)?;
        let ok = response.get("ok").and_then(JsonValue::as_bool) == Some(true);
        if ok {
            self.deleted = true;
            if let Some(tombstone) = response.get("rev").and_then(JsonValue::as_str) {
                self.rev = Some(tombstone.to_string());
            }
        }
        Ok(ok)
    }

    /// Like [`delete`](Document::delete) but transport failures become
    /// `Ok(false)`. Caller misuse is still an error.
    pub fn delete_quietly(&mut self, db: &Database) -> Result<bool> {
        if self.rev.is_none() {
            return self.delete(db);
        }
        match self.delete(db) {
            Ok(ok) => Ok(ok),
            Err(err) => {
                warn!("Could not delete document {:?}: {}", self.id, err);
                Ok(false)
            }
        }
    }

    /// Best-effort removal of every revision still on disk. Failures of
    /// individual revisions are skipped. Returns how many deletes succeeded.
    pub fn purge(&mut self, db: &Database) -> usize {
        let Some(escaped) = self.escaped_id.clone() else {
            return 0;
        };
        let base = format!("{}/{}", db.uri(), escaped);
        let mut purged = 0;
        for rev in self.revisions(db) {
            match db.transport().delete(&format!("{base}?rev={rev}")) {
                Ok(_) => purged += 1,
                Err(err) => warn!("Could not delete revision {} of {}: {}", rev, base, err),
            }
        }
        if purged > 0 {
            self.deleted = true;
        }
        purged
    }

    /// Loads the document with `id` and deletes its current revision.
    pub fn delete_by_id(db: &Database, id: &str) -> Result<bool> {
        let mut doc = Self::load(db, id)?;
        doc.delete(db)
    }

    pub fn delete_by_id_quietly(db: &Database, id: &str) -> bool {
        match Self::load_quietly(db, id) {
            Some(mut doc) => doc.delete_quietly(db).unwrap_or(false),
            None => false,
        }
    }

    /// Server side copy to `new_id`; returns the copy as stored.
    pub fn copy_to(&mut self, db: &Database, new_id: &str) -> Result<Self> {
        let uri = self.uri(db)?;
        db.transport().copy(&uri, &escape_id(new_id))?;
        Self::load(db, new_id)
    }
}

impl From<Map<String, JsonValue>> for Document {
    fn from(seed: Map<String, JsonValue>) -> Self {
        Self::from_map(seed)
    }
}
