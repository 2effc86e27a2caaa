//! # Couch ODM
//!
//! A client-side object-document mapper for CouchDB style REST databases.
//! Documents, databases and servers are plain Rust values; every remote
//! operation goes through a pluggable [`Transport`].
//!
//! ## Features
//!
//! - **Document lifecycle**: create, load, save, reload, delete and purge with
//!   explicit revision tracking and conflict detection
//! - **Design documents**: generated or hand written map/reduce views with a
//!   small query builder (ranges, ordering, paging, exact keys)
//! - **Reductions**: server-side count, sum, min, max and average
//! - **Typed rows**: view rows turned into Rust types through a `class_`
//!   type marker, failing loudly on unknown markers
//! - **Uuid pool**: server generated ids fetched in batches
//! - **Attachments**: inline on save or uploaded standalone
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use couch_odm::{Database, Document, HttpTransport, Server};
//! use serde_json::json;
//!
//! let server = Arc::new(Server::local(Arc::new(HttpTransport::default())));
//! let db = Database::create(server, "notes")?;
//!
//! let mut doc = Document::from_value(json!({ "title": "Hello" }))?;
//! doc.save(&db)?;
//! assert!(!doc.is_new());
//! # Ok::<(), couch_odm::CouchError>(())
//! ```
//!
//! ## Error handling
//!
//! Strict operations return [`Result`] with a [`CouchError`]. Most of them have
//! a `*_quietly` twin that logs the failure and returns `false`/`None`
//! instead.

pub mod attachments;
pub mod couch_config;
pub mod couch_database;
pub mod couch_document;
pub mod couch_error;
pub mod couch_helpers;
pub mod couch_server;
pub mod couch_state;
pub mod design_document;
pub mod model;
pub mod query;
pub mod result_set;
pub mod transport;

#[cfg(test)]
mod mock_couch;

pub use crate::attachments::{Attachment, Attachments};
pub use crate::couch_config::{CouchConfig, EnvironmentConfig};
pub use crate::couch_database::{Database, DatabaseState};
pub use crate::couch_document::{Document, CLASS_FIELD};
pub use crate::couch_error::{CouchError, Result};
pub use crate::couch_server::{Server, ServerSettings};
pub use crate::couch_state::CouchState;
pub use crate::design_document::{DesignDocument, Reduction, ViewDefinition, ViewOptions};
pub use crate::model::Model;
pub use crate::query::{Order, QueryOptions, Select};
pub use crate::result_set::{ResultSet, Row, TypeRegistry};
pub use crate::transport::{HttpTransport, Transport};
