//! Typed documents.
//!
//! A [`Model`] is any serde type stored as a document tagged with its
//! [`TYPE_NAME`](Model::TYPE_NAME) in the [`CLASS_FIELD`] field. The tag lets
//! view queries turn rows back into the right Rust type.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::couch_document::{Document, CLASS_FIELD};
use crate::couch_error::{CouchError, Result};

pub trait Model: Serialize + DeserializeOwned {
    /// Marker written to [`CLASS_FIELD`].
    const TYPE_NAME: &'static str;

    /// Name of the design document holding this model's views.
    fn design_name() -> String {
        Self::TYPE_NAME.to_string()
    }
}

impl Document {
    /// Serializes `model` into a new document tagged with its type name.
    /// `_id`/`id` fields of the model become the document id.
    pub fn from_model<M: Model>(model: &M) -> Result<Self> {
        let value = serde_json::to_value(model)?;
        let mut doc = Self::from_value(value).map_err(|_| {
            CouchError::Serialization(format!(
                "{} does not serialize to a JSON object",
                M::TYPE_NAME
            ))
        })?;
        doc.insert(CLASS_FIELD, M::TYPE_NAME);
        Ok(doc)
    }

    /// Decodes the payload into `M`. `_id` and `_rev` are visible to the
    /// model; attachments are not.
    pub fn into_model<M: Model>(self) -> Result<M> {
        let mut body = self.fields().clone();
        if let Some(id) = self.id() {
            body.insert("_id".to_string(), JsonValue::String(id.to_string()));
        }
        if let Some(rev) = self.rev() {
            body.insert("_rev".to_string(), JsonValue::String(rev.to_string()));
        }
        Ok(serde_json::from_value(JsonValue::Object(body))?)
    }
}
