//! Named binary payloads carried by a document.
//!
//! Attachments added locally are packed into the document's `_attachments`
//! object on the next save. Attachments already on the server show up as
//! stubs and are fetched on demand.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value as JsonValue};

use crate::couch_database::Database;
use crate::couch_document::Document;
use crate::couch_error::{CouchError, Result};
use crate::couch_helpers::escape_id;

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    fn packed(&self) -> JsonValue {
        json!({
            "content_type": self.content_type,
            "data": STANDARD.encode(&self.data),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachments {
    loaded: BTreeMap<String, Attachment>,
    /// Server descriptions of attachments not fetched yet.
    stubs: Map<String, JsonValue>,
}

impl Attachments {
    pub(crate) fn from_stubs(stubs: Map<String, JsonValue>) -> Self {
        Self {
            loaded: BTreeMap::new(),
            stubs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.stubs.is_empty()
    }

    /// Loaded and stubbed names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.keys().cloned().collect();
        for name in self.stubs.keys() {
            if !self.loaded.contains_key(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.loaded.contains_key(name) || self.stubs.contains_key(name)
    }

    /// Locally available attachment; stubs are not fetched here.
    pub fn get(&self, name: &str) -> Option<&Attachment> {
        self.loaded.get(name)
    }

    pub fn stub(&self, name: &str) -> Option<&JsonValue> {
        self.stubs.get(name)
    }

    /// Adds an attachment locally; it is uploaded with the next save.
    pub fn add(&mut self, name: impl Into<String>, attachment: Attachment) {
        self.loaded.insert(name.into(), attachment);
    }

    /// Removes an attachment locally only.
    pub fn remove(&mut self, name: &str) -> Option<Attachment> {
        let stub = self.stubs.remove(name);
        match self.loaded.remove(name) {
            Some(attachment) => Some(attachment),
            None => stub.map(|stub| Attachment {
                content_type: stub_content_type(&stub),
                data: Vec::new(),
            }),
        }
    }

    /// The `_attachments` object: loaded attachments inline as base64,
    /// untouched server attachments as stubs so a save keeps them.
    pub fn pack(&self) -> Map<String, JsonValue> {
        let mut packed = Map::new();
        for (name, stub) in &self.stubs {
            if !self.loaded.contains_key(name) {
                let mut stub = stub.clone();
                if let Some(stub) = stub.as_object_mut() {
                    stub.insert("stub".to_string(), JsonValue::Bool(true));
                }
                packed.insert(name.clone(), stub);
            }
        }
        for (name, attachment) in &self.loaded {
            packed.insert(name.clone(), attachment.packed());
        }
        packed
    }
}

fn stub_content_type(stub: &JsonValue) -> String {
    stub.get("content_type")
        .and_then(JsonValue::as_str)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

impl Document {
    /// `{document uri}/{escaped name}`, with `?rev=` when requested and known.
    /// The document must already have an id.
    pub fn attachment_uri(&self, db: &Database, name: &str, include_rev: bool) -> Result<String> {
        let escaped = match self.escaped_id() {
            Some(escaped) if !escaped.is_empty() => escaped,
            _ => {
                return Err(CouchError::argument(
                    "Document must have an id in order to address an attachment",
                ))
            }
        };
        let mut uri = format!("{}/{}/{}", db.uri(), escaped, escape_id(name));
        if include_rev {
            if let Some(rev) = self.rev() {
                uri.push_str(&format!("?rev={rev}"));
            }
        }
        Ok(uri)
    }

    /// Uploads one attachment directly and adopts the new document revision,
    /// so the document does not have to be saved afterwards.
    pub fn put_attachment(
        &mut self,
        db: &Database,
        name: &str,
        attachment: Attachment,
    ) -> Result<()> {
        let uri = self.attachment_uri(db, name, true)?;
        let response = db
            .transport()
            .put_raw(&uri, &attachment.data, &attachment.content_type)?;
        if let Some(rev) = response.get("rev").and_then(JsonValue::as_str) {
            self.set_rev(rev);
        }
        self.attachments_mut().add(name, attachment);
        Ok(())
    }

    /// Downloads an attachment and caches it on the document.
    pub fn fetch_attachment(&mut self, db: &Database, name: &str) -> Result<&Attachment> {
        let uri = self.attachment_uri(db, name, false)?;
        let data = db.transport().get_raw(&uri)?;
        let content_type = self
            .attachments()
            .stub(name)
            .map(stub_content_type)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        self.attachments_mut()
            .add(name, Attachment { content_type, data });
        self.attachments()
            .get(name)
            .ok_or_else(|| CouchError::ResourceNotFound(format!("attachment {name}")))
    }

    /// Cached attachment, fetched from the server when not loaded yet.
    pub fn attachment(&mut self, db: &Database, name: &str) -> Result<&Attachment> {
        if self.attachments().get(name).is_none() {
            self.fetch_attachment(db, name)?;
        }
        self.attachments()
            .get(name)
            .ok_or_else(|| CouchError::ResourceNotFound(format!("attachment {name}")))
    }

    /// Removes an attachment locally and, for saved documents, on the server.
    pub fn delete_attachment(&mut self, db: &Database, name: &str) -> Result<Option<Attachment>> {
        if !self.attachments().contains(name) {
            return Ok(None);
        }
        if !self.is_new() {
            let uri = self.attachment_uri(db, name, true)?;
            let response = db.transport().delete(&uri)?;
            if let Some(rev) = response.get("rev").and_then(JsonValue::as_str) {
                self.set_rev(rev);
            }
        }
        Ok(self.attachments_mut().remove(name))
    }
}
