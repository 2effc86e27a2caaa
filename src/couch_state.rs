//! Process wide context: transport, named servers, per-model databases and
//! design documents.
//!
//! Nothing here is global. Callers build one [`CouchState`] and pass it
//! around (or share it behind an `Arc`); every registry is guarded by its own
//! lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, RwLock};

use crate::couch_config::{default_repository, CouchConfig};
use crate::couch_database::{Database, DEFAULT_DATABASE_NAME};
use crate::couch_document::Document;
use crate::couch_error::Result;
use crate::couch_server::Server;
use crate::design_document::{DesignDocument, ViewOptions};
use crate::model::Model;
use crate::query::QueryOptions;
use crate::result_set::{ResultSet, TypeRegistry};
use crate::transport::{HttpTransport, Transport};

/// Registry name that resolves to the current repository.
pub const DEFAULT_SERVER: &str = "default";

/// Class-wide view registered on every model design document.
pub const ALL_VIEW: &str = "all";

pub struct CouchState {
    transport: Arc<dyn Transport>,
    config: Option<CouchConfig>,
    repository: String,
    /// Keyed by lowercased name.
    servers: RwLock<HashMap<String, Arc<Server>>>,
    default_database: Mutex<Option<Arc<Database>>>,
    databases: RwLock<HashMap<&'static str, Arc<Database>>>,
    designs: Mutex<HashMap<&'static str, DesignDocument>>,
}

impl CouchState {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: None,
            repository: default_repository(),
            servers: RwLock::new(HashMap::new()),
            default_database: Mutex::new(None),
            databases: RwLock::new(HashMap::new()),
            designs: Mutex::new(HashMap::new()),
        }
    }

    /// HTTP transport plus whatever configuration file the environment
    /// points at.
    pub fn init() -> Self {
        let mut state = Self::new(Arc::new(HttpTransport::default()));
        state.config = CouchConfig::load_default();
        state
    }

    pub fn with_config(mut self, config: CouchConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> Option<&CouchConfig> {
        self.config.as_ref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Registered server, else one built from the configuration environment
    /// of that name (creating its configured database), else the local
    /// default server. Names are case-insensitive.
    pub fn server(&self, name: &str) -> Result<Arc<Server>> {
        let key = name.to_lowercase();
        if let Some(server) = self.servers.read().get(&key) {
            return Ok(Arc::clone(server));
        }

        let environment = if key == DEFAULT_SERVER {
            self.repository.as_str()
        } else {
            name
        };
        let configured = self
            .config
            .as_ref()
            .and_then(|config| config.environment(environment));
        let server = match configured {
            Some(env) => {
                let server = Arc::new(Server::new(env.server.clone(), Arc::clone(&self.transport)));
                if let Some(database) = &env.database {
                    Database::create(Arc::clone(&server), database)?;
                }
                info!("Configured server {} from environment {}", server.uri(), environment);
                server
            }
            None => Arc::new(Server::local(Arc::clone(&self.transport))),
        };

        let mut servers = self.servers.write();
        Ok(Arc::clone(servers.entry(key).or_insert(server)))
    }

    pub fn default_server(&self) -> Result<Arc<Server>> {
        self.server(DEFAULT_SERVER)
    }

    pub fn add_server(&self, name: &str, server: Arc<Server>) {
        self.servers.write().insert(name.to_lowercase(), server);
    }

    pub fn clear_servers(&self) {
        self.servers.write().clear();
    }

    /// The repository's configured database, else `documents`, on the
    /// default server. Created on first use.
    pub fn default_database(&self) -> Result<Arc<Database>> {
        let mut slot = self.default_database.lock();
        if let Some(db) = slot.as_ref() {
            return Ok(Arc::clone(db));
        }
        let name = self
            .config
            .as_ref()
            .and_then(|config| config.database_name(&self.repository))
            .unwrap_or(DEFAULT_DATABASE_NAME)
            .to_string();
        let db = Arc::new(Database::new(self.default_server()?, &name));
        db.ensure_saved()?;
        *slot = Some(Arc::clone(&db));
        Ok(db)
    }

    pub fn database_for<M: Model>(&self) -> Result<Arc<Database>> {
        if let Some(db) = self.databases.read().get(M::TYPE_NAME) {
            return Ok(Arc::clone(db));
        }
        self.default_database()
    }

    /// Saves `db` and makes it the home of `M`. A previously cached design
    /// document for `M` is dropped since it belongs to the old database.
    pub fn set_database_for<M: Model>(&self, db: Database) -> Result<Arc<Database>> {
        db.save()?;
        let db = Arc::new(db);
        self.databases.write().insert(M::TYPE_NAME, Arc::clone(&db));
        self.designs.lock().remove(M::TYPE_NAME);
        Ok(db)
    }

    /// Snapshot of the model's design document, fetched or created, with the
    /// class-wide `all` view in place. Saving the snapshot does not update
    /// the cached copy; the cache reloads itself on the next conflict.
    pub fn design_document_for<M: Model>(&self) -> Result<DesignDocument> {
        self.with_design_document::<M, _>(|design, _| Ok(design.clone()))
    }

    /// Runs `f` on the cached design document. A conflict means the server
    /// copy moved on without us: the cache is reloaded and `f` retried once.
    fn with_design_document<M: Model, R>(
        &self,
        mut f: impl FnMut(&mut DesignDocument, &Database) -> Result<R>,
    ) -> Result<R> {
        let db = self.database_for::<M>()?;
        let mut designs = self.designs.lock();
        let design = match designs.entry(M::TYPE_NAME) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut design = DesignDocument::load_or_create(&db, &M::design_name())?;
                if design.view(ALL_VIEW).is_none() {
                    design.add_view_and_save(&db, ALL_VIEW, class_view::<M>())?;
                }
                entry.insert(design)
            }
        };
        match f(design, &db) {
            Err(err) if err.is_conflict() => {
                info!("Design document {} is stale, reloading", design.name());
                design.reload(&db)?;
                f(design, &db)
            }
            outcome => outcome,
        }
    }

    /// Number of stored `M` documents; `None` when there are none.
    pub fn count<M: Model>(&self) -> Result<Option<u64>> {
        self.with_design_document::<M, _>(|design, db| {
            design.count_with(db, ALL_VIEW, class_view::<M>(), &QueryOptions::new())
        })
    }

    pub fn all<M: Model + 'static>(&self, options: &QueryOptions) -> Result<ResultSet<M>> {
        self.with_design_document::<M, _>(|design, db| {
            design.query(db, ALL_VIEW, options, &TypeRegistry::for_model())
        })
    }

    /// Stores `model` in its database, tagged with its type name.
    pub fn save_model<M: Model>(&self, model: &M) -> Result<Document> {
        let db = self.database_for::<M>()?;
        let mut doc = Document::from_model(model)?;
        doc.save(&db)?;
        Ok(doc)
    }

    pub fn load_model<M: Model>(&self, id: &str) -> Result<M> {
        let db = self.database_for::<M>()?;
        Document::load(&db, id)?.into_model()
    }
}

fn class_view<M: Model>() -> ViewOptions {
    ViewOptions::new()
        .keyed_by_id()
        .constrain_to_marker(M::TYPE_NAME)
}
