//! Remote database handle.
//!
//! Building a [`Database`] never touches the network; existence is checked or
//! established lazily through [`Database::save`] and [`Database::exists`].

use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};

use crate::couch_error::Result;
use crate::couch_helpers::{escape_database_name, escape_id, paramify_url};
use crate::couch_server::Server;
use crate::transport::Transport;

pub const DEFAULT_DATABASE_NAME: &str = "documents";

/// What this handle last learned about the remote database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    Unknown,
    /// Confirmed absent on the server.
    New,
    Saved,
    Deleted,
}

pub struct Database {
    name: String,
    server: Arc<Server>,
    state: Mutex<DatabaseState>,
}

impl Database {
    pub fn new(server: Arc<Server>, name: &str) -> Self {
        let mut name = escape_database_name(name);
        if name.is_empty() {
            name = DEFAULT_DATABASE_NAME.to_string();
        }
        Self {
            name,
            server,
            state: Mutex::new(DatabaseState::Unknown),
        }
    }

    /// Builds the handle and PUTs it. An already existing database counts as
    /// success.
    pub fn create(server: Arc<Server>, name: &str) -> Result<Self> {
        let db = Self::new(server, name);
        db.save()?;
        Ok(db)
    }

    pub fn create_quietly(server: Arc<Server>, name: &str) -> Option<Self> {
        let db = Self::new(server, name);
        db.save_quietly().then_some(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn uri(&self) -> String {
        format!("{}/{}", self.server.uri(), self.name)
    }

    pub fn state(&self) -> DatabaseState {
        *self.state.lock()
    }

    pub(crate) fn get(&self, uri: &str) -> Result<JsonValue> {
        self.server.transport().get(uri)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        self.server.transport()
    }

    pub fn save(&self) -> Result<()> {
        match self.transport().put(&self.uri(), None) {
            Ok(_) => info!("Created database {}", self.uri()),
            Err(err) if err.is_precondition_failed() => {}
            Err(err) => return Err(err),
        }
        *self.state.lock() = DatabaseState::Saved;
        Ok(())
    }

    pub fn save_quietly(&self) -> bool {
        match self.save() {
            Ok(()) => true,
            Err(err) => {
                warn!("Could not save database {}: {}", self.uri(), err);
                false
            }
        }
    }

    /// Saves unless this handle already saw the database exist.
    pub fn ensure_saved(&self) -> Result<()> {
        if self.state() == DatabaseState::Saved {
            return Ok(());
        }
        self.save()
    }

    pub fn info(&self) -> Result<JsonValue> {
        self.get(&self.uri())
    }

    pub fn info_quietly(&self) -> Option<JsonValue> {
        self.info().ok()
    }

    /// `Ok(false)` when the server reports 404; other failures propagate.
    pub fn exists(&self) -> Result<bool> {
        match self.info() {
            Ok(_) => {
                *self.state.lock() = DatabaseState::Saved;
                Ok(true)
            }
            Err(err) if err.is_not_found() => {
                let mut state = self.state.lock();
                if *state != DatabaseState::Deleted {
                    *state = DatabaseState::New;
                }
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub fn exists_quietly(&self) -> bool {
        self.exists().unwrap_or(false)
    }

    /// Irreversibly drops the database. A missing database is an error.
    pub fn delete(&self) -> Result<JsonValue> {
        let response = self.transport().delete(&self.uri())?;
        *self.state.lock() = DatabaseState::Deleted;
        info!("Deleted database {}", self.uri());
        Ok(response)
    }

    pub fn delete_quietly(&self) -> bool {
        match self.delete() {
            Ok(_) => true,
            Err(err) => {
                warn!("Could not delete database {}: {}", self.uri(), err);
                false
            }
        }
    }

    /// Changes feed, optionally starting after sequence `since`.
    pub fn changes(&self, since: Option<u64>) -> Result<JsonValue> {
        let since = since.map(|seq| format!("?since={seq}")).unwrap_or_default();
        self.get(&format!("{}/_changes{}", self.uri(), since))
    }

    pub fn compact(&self) -> Result<JsonValue> {
        self.transport()
            .post(&format!("{}/_compact", self.uri()), None)
    }

    /// Replicates into `target`, creating it first. Both ends are sent as
    /// full database uris.
    pub fn replicate(&self, target: &Database, continuous: bool) -> Result<JsonValue> {
        target.save()?;
        let mut body = json!({
            "source": self.uri(),
            "target": target.uri(),
        });
        if continuous {
            body["continuous"] = JsonValue::Bool(true);
        }
        self.transport()
            .post(&format!("{}/_replicate/", self.server.uri()), Some(&body))
    }

    /// The `_all_docs` view. When `keys` is given the request becomes a POST
    /// carrying them in the body.
    pub fn documents(
        &self,
        params: &[(String, JsonValue)],
        keys: Option<&[String]>,
    ) -> Result<JsonValue> {
        let url = paramify_url(&format!("{}/_all_docs", self.uri()), params);
        match keys {
            Some(keys) => self
                .transport()
                .post(&url, Some(&json!({ "keys": keys }))),
            None => self.get(&url),
        }
    }

    /// Deletes every document, design documents included. Returns how many
    /// were removed.
    pub fn delete_all(&self) -> Result<usize> {
        let listing = self.documents(&[], None)?;
        let rows = listing
            .get("rows")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let mut deleted = 0;
        for row in rows {
            let (Some(id), Some(rev)) = (
                row.get("id").and_then(JsonValue::as_str),
                row.pointer("/value/rev").and_then(JsonValue::as_str),
            ) else {
                continue;
            };
            let uri = format!("{}/{}?rev={}", self.uri(), escape_document_path(id), rev);
            match self.transport().delete(&uri) {
                Ok(_) => deleted += 1,
                Err(err) => warn!("Could not delete {}: {}", id, err),
            }
        }
        Ok(deleted)
    }
}

/// Design document ids keep their `_design/` prefix unescaped.
fn escape_document_path(id: &str) -> String {
    match id.strip_prefix("_design/") {
        Some(name) => format!("_design/{}", escape_id(name)),
        None => escape_id(id),
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.uri() == other.uri()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("uri", &self.uri())
            .field("state", &self.state())
            .finish()
    }
}
