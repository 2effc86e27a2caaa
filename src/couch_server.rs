//! Connection description for a database server plus the uuid pool used to
//! name new documents.

use std::fmt;
use std::sync::{Arc, OnceLock};

use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::couch_database::Database;
use crate::couch_error::{CouchError, Result};
use crate::couch_helpers::escape_id;
use crate::transport::Transport;

pub const DEFAULT_PROTOCOL: &str = "http";
pub const DEFAULT_DOMAIN: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5984;
pub const DEFAULT_UUID_LIMIT: usize = 1000;

/// Everything needed to address a server. All fields are optional so the
/// struct can be deserialized from partial configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub protocol: Option<String>,
    pub domain: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub uuid_limit: Option<usize>,
}

pub struct Server {
    protocol: String,
    domain: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    uuid_limit: usize,
    uri: OnceLock<String>,
    /// LIFO pool of server generated ids. Empty check, refill and pop all
    /// happen under this lock so a token is never handed out twice.
    uuids: Mutex<Vec<String>>,
    transport: Arc<dyn Transport>,
}

impl Server {
    pub fn new(settings: ServerSettings, transport: Arc<dyn Transport>) -> Self {
        Self {
            protocol: settings
                .protocol
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            domain: settings.domain.as_deref().map(escape_id),
            port: settings.port,
            username: settings.username.as_deref().map(escape_id),
            password: settings.password.as_deref().map(escape_id),
            uuid_limit: settings.uuid_limit.unwrap_or(DEFAULT_UUID_LIMIT),
            uri: OnceLock::new(),
            uuids: Mutex::new(Vec::new()),
            transport,
        }
    }

    /// Server at `http://127.0.0.1:5984`.
    pub fn local(transport: Arc<dyn Transport>) -> Self {
        Self::new(ServerSettings::default(), transport)
    }

    /// `protocol://[user:password@]domain[:port]`, computed once. Without an
    /// explicit domain the default domain and port are used.
    pub fn uri(&self) -> &str {
        self.uri.get_or_init(|| {
            let credentials = match &self.username {
                Some(user) => format!("{}:{}@", user, self.password.as_deref().unwrap_or("")),
                None => String::new(),
            };
            let (domain, port) = match &self.domain {
                Some(domain) => (domain.clone(), self.port),
                None => (
                    DEFAULT_DOMAIN.to_string(),
                    Some(self.port.unwrap_or(DEFAULT_PORT)),
                ),
            };
            let port = port.map(|p| format!(":{p}")).unwrap_or_default();
            format!("{}://{}{}{}", self.protocol, credentials, domain, port)
        })
    }

    pub fn uuid_limit(&self) -> usize {
        self.uuid_limit
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Pops a pre-fetched uuid, refilling the pool with `uuid_limit` fresh
    /// tokens when it is empty.
    pub fn next_uuid(&self) -> Result<String> {
        self.next_uuid_with_limit(self.uuid_limit)
    }

    pub fn next_uuid_with_limit(&self, limit: usize) -> Result<String> {
        let mut pool = self.uuids.lock();
        if pool.is_empty() {
            *pool = self.fetch_uuids(limit)?;
            info!("Refilled uuid pool with {} tokens from {}", pool.len(), self.uri());
        }
        pool.pop()
            .ok_or_else(|| CouchError::RequestFailed("Server returned no uuids".to_string()))
    }

    /// Number of tokens currently cached.
    pub fn cached_uuids(&self) -> usize {
        self.uuids.lock().len()
    }

    pub fn fetch_uuids(&self, limit: usize) -> Result<Vec<String>> {
        let response = self
            .transport
            .get(&format!("{}/_uuids?count={}", self.uri(), limit.max(1)))?;
        let uuids = response
            .get("uuids")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| CouchError::RequestFailed("Missing uuids in response".to_string()))?;
        Ok(uuids
            .iter()
            .filter_map(|uuid| uuid.as_str().map(str::to_string))
            .collect())
    }

    /// Welcome message.
    pub fn info(&self) -> Result<JsonValue> {
        self.transport.get(&format!("{}/", self.uri()))
    }

    pub fn config(&self) -> Result<JsonValue> {
        self.transport.get(&format!("{}/_config", self.uri()))
    }

    /// Server statistics, optionally narrowed to one group and key.
    pub fn stats(&self, group_and_key: Option<(&str, &str)>) -> Result<JsonValue> {
        let uri = match group_and_key {
            Some((group, key)) => format!(
                "{}/_stats/{}/{}",
                self.uri(),
                escape_id(group),
                escape_id(key)
            ),
            None => format!("{}/_stats", self.uri()),
        };
        self.transport.get(&uri)
    }

    pub fn restart(&self) -> Result<JsonValue> {
        self.transport.post(&format!("{}/_restart", self.uri()), None)
    }

    pub fn database_names(&self) -> Result<Vec<String>> {
        let names = self.transport.get(&format!("{}/_all_dbs", self.uri()))?;
        let names: Vec<String> = serde_json::from_value(names)?;
        Ok(names)
    }

    pub fn databases(self: &Arc<Self>) -> Result<Vec<Database>> {
        Ok(self
            .database_names()?
            .iter()
            .map(|name| Database::new(Arc::clone(self), name))
            .collect())
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.uri() == other.uri()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server {{ uri: {:?} }}", self.uri())
    }
}
