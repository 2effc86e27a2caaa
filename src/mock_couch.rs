//! In-memory database server behind the [`Transport`] trait.
//!
//! Understands the subset of the REST protocol the crate speaks: databases,
//! documents with revision history, attachments, design documents and the
//! views this crate generates. Map functions are not executed; the generated
//! shape (`if (doc['A'] [&& doc['F'] == V]) { emit(doc['A'], 1 | doc['A']); }`)
//! is parsed and evaluated directly.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Map, Value as JsonValue};

use crate::couch_error::{CouchError, Result};
use crate::couch_helpers::unescape_id;
use crate::transport::Transport;

const DESIGN_PREFIX: &str = "_design/";

#[derive(Debug, Clone)]
struct StoredAttachment {
    content_type: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Revision {
    rev: String,
    deleted: bool,
    body: Map<String, JsonValue>,
    attachments: BTreeMap<String, StoredAttachment>,
}

#[derive(Debug, Clone, Default)]
struct StoredDocument {
    history: Vec<Revision>,
}

impl StoredDocument {
    fn latest(&self) -> Option<&Revision> {
        self.history.last()
    }

    fn live(&self) -> Option<&Revision> {
        self.latest().filter(|revision| !revision.deleted)
    }

    fn next_rev(&self, counter: u64) -> String {
        format!("{}-{:016x}", self.history.len() + 1, counter)
    }
}

#[derive(Debug, Default)]
struct MockDatabase {
    docs: BTreeMap<String, StoredDocument>,
    update_seq: u64,
    /// Last change per document: (seq, rev, deleted).
    changes: BTreeMap<String, (u64, String, bool)>,
}

impl MockDatabase {
    fn record_change(&mut self, id: &str) {
        let Some(latest) = self.docs.get(id).and_then(StoredDocument::latest) else {
            return;
        };
        let entry = (self.update_seq + 1, latest.rev.clone(), latest.deleted);
        self.update_seq += 1;
        self.changes.insert(id.to_string(), entry);
    }

    fn live(&self, id: &str) -> Option<&Revision> {
        self.docs.get(id).and_then(StoredDocument::live)
    }

    fn push_revision(&mut self, id: &str, revision: Revision) -> JsonValue {
        let rev = revision.rev.clone();
        self.docs
            .entry(id.to_string())
            .or_default()
            .history
            .push(revision);
        self.record_change(id);
        json!({ "ok": true, "id": id, "rev": rev })
    }

    fn get_document(&self, id: &str, query: &HashMap<String, String>) -> Result<Reply> {
        let stored = self.docs.get(id).ok_or_else(|| not_found("missing"))?;
        let revision = match query.get("rev") {
            Some(rev) => stored
                .history
                .iter()
                .find(|revision| &revision.rev == rev && !revision.deleted),
            None => stored.live(),
        }
        .ok_or_else(|| not_found("deleted"))?;

        let mut body = revision_body(id, revision);
        if query.get("revs_info").map(String::as_str) == Some("true") {
            let revs_info = stored
                .history
                .iter()
                .rev()
                .map(|revision| {
                    let status = if revision.deleted { "deleted" } else { "available" };
                    json!({ "rev": revision.rev, "status": status })
                })
                .collect::<Vec<_>>();
            body.insert("_revs_info".to_string(), JsonValue::Array(revs_info));
        }
        Ok(Reply::Json(JsonValue::Object(body)))
    }

    fn put_document(&mut self, id: &str, body: &JsonValue, counter: u64) -> Result<Reply> {
        let JsonValue::Object(body) = body else {
            return Err(bad_request("document must be an object"));
        };
        let supplied = body.get("_rev").and_then(JsonValue::as_str);
        let latest = self.docs.get(id).and_then(StoredDocument::latest);
        match (latest, supplied) {
            (Some(latest), Some(rev)) if latest.rev != rev => return Err(conflict()),
            (Some(latest), None) if !latest.deleted => return Err(conflict()),
            (None, Some(_)) => return Err(conflict()),
            _ => {}
        }

        let previous = latest
            .map(|latest| latest.attachments.clone())
            .unwrap_or_default();
        let mut attachments = BTreeMap::new();
        if let Some(JsonValue::Object(packed)) = body.get("_attachments") {
            for (name, entry) in packed {
                if entry.get("stub").and_then(JsonValue::as_bool) == Some(true) {
                    let kept = previous.get(name).cloned().ok_or_else(|| {
                        CouchError::from_status(412, format!("missing stub for {name}"))
                    })?;
                    attachments.insert(name.clone(), kept);
                    continue;
                }
                let data = entry
                    .get("data")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| bad_request("attachment without data"))?;
                let data = STANDARD
                    .decode(data)
                    .map_err(|_| bad_request("invalid base64 attachment"))?;
                let content_type = entry
                    .get("content_type")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("application/octet-stream")
                    .to_string();
                attachments.insert(name.clone(), StoredAttachment { content_type, data });
            }
        }

        let mut fields = body.clone();
        for reserved in ["_id", "_rev", "_attachments", "_deleted", "_revs_info"] {
            fields.remove(reserved);
        }
        let rev = self
            .docs
            .get(id)
            .map(|stored| stored.next_rev(counter))
            .unwrap_or_else(|| format!("1-{counter:016x}"));
        let response = self.push_revision(
            id,
            Revision {
                rev,
                deleted: false,
                body: fields,
                attachments,
            },
        );
        Ok(Reply::Json(response))
    }

    fn delete_document(&mut self, id: &str, rev: Option<&String>, counter: u64) -> Result<Reply> {
        let stored = self.docs.get(id).ok_or_else(|| not_found("missing"))?;
        let latest = stored.live().ok_or_else(|| not_found("deleted"))?;
        if rev != Some(&latest.rev) {
            return Err(conflict());
        }
        let tombstone = Revision {
            rev: stored.next_rev(counter),
            deleted: true,
            body: Map::new(),
            attachments: BTreeMap::new(),
        };
        Ok(Reply::Json(self.push_revision(id, tombstone)))
    }

    fn copy_document(&mut self, source: &str, destination: &str, counter: u64) -> Result<Reply> {
        let original = self.live(source).cloned().ok_or_else(|| not_found("missing"))?;
        if self.live(destination).is_some() {
            return Err(conflict());
        }
        let rev = self
            .docs
            .get(destination)
            .map(|stored| stored.next_rev(counter))
            .unwrap_or_else(|| format!("1-{counter:016x}"));
        let copy = Revision { rev, ..original };
        Ok(Reply::Json(self.push_revision(destination, copy)))
    }

    fn attachment(
        &mut self,
        method: &str,
        id: &str,
        name: &str,
        query: &HashMap<String, String>,
        body: Body<'_>,
        counter: u64,
    ) -> Result<Reply> {
        if method == "GET" {
            let revision = self.live(id).ok_or_else(|| not_found("missing"))?;
            let attachment = revision
                .attachments
                .get(name)
                .ok_or_else(|| not_found("missing attachment"))?;
            return Ok(Reply::Raw(attachment.data.clone()));
        }

        let rev = query.get("rev");
        let current = self.live(id).cloned();
        let mut next = match (current, rev) {
            (Some(current), Some(rev)) if &current.rev == rev => current,
            (None, None) => Revision {
                rev: String::new(),
                deleted: false,
                body: Map::new(),
                attachments: BTreeMap::new(),
            },
            (None, Some(_)) if method == "DELETE" => return Err(not_found("missing")),
            _ => return Err(conflict()),
        };

        match (method, body) {
            ("PUT", Body::Raw(data, content_type)) => {
                next.attachments.insert(
                    name.to_string(),
                    StoredAttachment {
                        content_type: content_type.to_string(),
                        data: data.to_vec(),
                    },
                );
            }
            ("DELETE", _) => {
                if next.attachments.remove(name).is_none() {
                    return Err(not_found("missing attachment"));
                }
            }
            _ => return Err(bad_request("unsupported attachment request")),
        }
        next.rev = self
            .docs
            .get(id)
            .map(|stored| stored.next_rev(counter))
            .unwrap_or_else(|| format!("1-{counter:016x}"));
        Ok(Reply::Json(self.push_revision(id, next)))
    }

    fn all_docs(&self, query: &HashMap<String, String>, body: Body<'_>) -> Result<Reply> {
        let include_docs = query.get("include_docs").map(String::as_str) == Some("true");
        let row = |id: &str, revision: &Revision| {
            let mut row = json!({ "id": id, "key": id, "value": { "rev": revision.rev } });
            if include_docs {
                row["doc"] = JsonValue::Object(revision_body(id, revision));
            }
            row
        };
        let rows = match body {
            Body::Json(request) => {
                let keys = request
                    .get("keys")
                    .and_then(JsonValue::as_array)
                    .ok_or_else(|| bad_request("keys must be an array"))?;
                keys.iter()
                    .filter_map(JsonValue::as_str)
                    .map(|key| match self.live(key) {
                        Some(revision) => row(key, revision),
                        None => json!({ "key": key, "error": "not_found" }),
                    })
                    .collect::<Vec<_>>()
            }
            _ => self
                .docs
                .iter()
                .filter_map(|(id, stored)| stored.live().map(|revision| row(id, revision)))
                .collect(),
        };
        let total = self.docs.values().filter(|stored| stored.live().is_some()).count();
        Ok(Reply::Json(json!({ "total_rows": total, "offset": 0, "rows": rows })))
    }

    fn changes(&self, query: &HashMap<String, String>) -> Result<Reply> {
        let since = query
            .get("since")
            .map(|since| since.parse::<u64>())
            .transpose()
            .map_err(|_| bad_request("since must be a number"))?
            .unwrap_or(0);
        let mut results = self
            .changes
            .iter()
            .filter(|(_, (seq, _, _))| *seq > since)
            .map(|(id, (seq, rev, deleted))| {
                let mut change = json!({ "seq": seq, "id": id, "changes": [{ "rev": rev }] });
                if *deleted {
                    change["deleted"] = JsonValue::Bool(true);
                }
                change
            })
            .collect::<Vec<_>>();
        results.sort_by_key(|change| change["seq"].as_u64());
        Ok(Reply::Json(json!({ "results": results, "last_seq": self.update_seq })))
    }

    fn view(
        &self,
        design: &str,
        view: &str,
        query: &HashMap<String, String>,
    ) -> Result<Reply> {
        let design = self
            .live(&format!("{DESIGN_PREFIX}{design}"))
            .ok_or_else(|| not_found("missing design document"))?;
        let definition = design
            .body
            .get("views")
            .and_then(|views| views.get(view))
            .ok_or_else(|| not_found("missing_named_view"))?;
        let map = definition
            .get("map")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| bad_request("view without map"))?;
        let program =
            MapProgram::parse(map).ok_or_else(|| bad_request("unsupported map function"))?;
        let reduce_script = definition.get("reduce").and_then(JsonValue::as_str);

        let mut rows = self
            .docs
            .iter()
            .filter(|(id, _)| !id.starts_with(DESIGN_PREFIX))
            .filter_map(|(id, stored)| stored.live().map(|revision| (id, revision)))
            .filter_map(|(id, revision)| {
                program
                    .emit(id, revision)
                    .map(|(key, value)| (key, id.clone(), value, revision))
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| collate(&a.0, &b.0).then_with(|| a.1.cmp(&b.1)));
        let total_rows = rows.len();

        let descending = flag(query, "descending");
        if descending {
            rows.reverse();
        }
        let exact = json_param(query, "key")?;
        let start = json_param(query, "startkey")?;
        let end = json_param(query, "endkey")?;
        rows.retain(|(key, ..)| {
            let after_start = start.as_ref().map_or(true, |start| {
                let order = collate(key, start);
                if descending { order != Ordering::Greater } else { order != Ordering::Less }
            });
            let before_end = end.as_ref().map_or(true, |end| {
                let order = collate(key, end);
                if descending { order != Ordering::Less } else { order != Ordering::Greater }
            });
            let matches = exact
                .as_ref()
                .map_or(true, |exact| collate(key, exact) == Ordering::Equal);
            after_start && before_end && matches
        });

        let include_docs = flag(query, "include_docs");
        let reduce = match query.get("reduce") {
            Some(reduce) => reduce == "true",
            None => reduce_script.is_some(),
        };
        if reduce {
            let script = reduce_script.ok_or_else(|| bad_request("view has no reduce"))?;
            if include_docs {
                return Err(bad_request("include_docs is invalid for reduce"));
            }
            if rows.is_empty() {
                return Ok(Reply::Json(json!({ "rows": [] })));
            }
            let values = rows
                .iter()
                .map(|(_, _, value, _)| value.as_f64())
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| CouchError::from_status(500, "non numeric reduce input"))?;
            let reduced = if script.contains("Math.min") {
                values.iter().copied().fold(f64::INFINITY, f64::min)
            } else if script.contains("Math.max") {
                values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            } else if script.contains("sum(values)") {
                values.iter().sum()
            } else {
                return Err(bad_request("unsupported reduce function"));
            };
            return Ok(Reply::Json(
                json!({ "rows": [{ "key": null, "value": number(reduced) }] }),
            ));
        }

        let skip = usize_param(query, "skip")?.unwrap_or(0);
        let limit = usize_param(query, "limit")?.unwrap_or(usize::MAX);
        let rows = rows
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|(key, id, value, revision)| {
                let mut row = json!({ "id": id, "key": key, "value": value });
                if include_docs {
                    row["doc"] = JsonValue::Object(revision_body(&id, revision));
                }
                row
            })
            .collect::<Vec<_>>();
        Ok(Reply::Json(
            json!({ "total_rows": total_rows, "offset": skip, "rows": rows }),
        ))
    }
}

/// Evaluable form of a generated map function.
struct MapProgram {
    guard: String,
    filter: Option<(String, JsonValue)>,
    key: String,
    emits_one: bool,
}

impl MapProgram {
    fn parse(map: &str) -> Option<Self> {
        let condition = between(map, "if (", ") {")?;
        let (guard, filter) = match condition.split_once(" && ") {
            Some((guard, filter)) => (guard, Some(parse_equality(filter)?)),
            None => (condition, None),
        };
        let emit = between(map, "emit(", ");")?;
        let (key, value) = emit.split_once(", ")?;
        let emits_one = value.trim() == "1";
        if !emits_one {
            field_name(value)?;
        }
        Some(Self {
            guard: field_name(guard)?,
            filter,
            key: field_name(key)?,
            emits_one,
        })
    }

    fn emit(&self, id: &str, revision: &Revision) -> Option<(JsonValue, JsonValue)> {
        let mut doc = revision.body.clone();
        doc.insert("_id".to_string(), JsonValue::String(id.to_string()));
        if !truthy(doc.get(&self.guard)) {
            return None;
        }
        if let Some((field, expected)) = &self.filter {
            if doc.get(field) != Some(expected) {
                return None;
            }
        }
        let key = doc.get(&self.key).cloned().unwrap_or(JsonValue::Null);
        let value = if self.emits_one { json!(1) } else { key.clone() };
        Some((key, value))
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let len = text[from..].find(end)?;
    Some(&text[from..from + len])
}

fn js_unquote(raw: &str) -> String {
    raw.replace("\\'", "'").replace("\\\\", "\\")
}

fn field_name(expr: &str) -> Option<String> {
    let inner = expr.trim().strip_prefix("doc['")?.strip_suffix("']")?;
    Some(js_unquote(inner))
}

fn parse_equality(expr: &str) -> Option<(String, JsonValue)> {
    let (field, value) = expr.split_once(" == ")?;
    let value = value.trim();
    let value = match value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        Some(quoted) => JsonValue::String(js_unquote(quoted)),
        None => serde_json::from_str(value).ok()?,
    };
    Some((field_name(field)?, value))
}

fn truthy(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn type_rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Null => 0,
        JsonValue::Bool(false) => 1,
        JsonValue::Bool(true) => 2,
        JsonValue::Number(_) => 3,
        JsonValue::String(_) => 4,
        JsonValue::Array(_) => 5,
        JsonValue::Object(_) => 6,
    }
}

/// View key collation: null, false, true, numbers, strings, arrays, objects.
fn collate(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Array(x), JsonValue::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(x, y)| collate(x, y))
            .find(|order| *order != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn number(value: f64) -> JsonValue {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn revision_body(id: &str, revision: &Revision) -> Map<String, JsonValue> {
    let mut body = revision.body.clone();
    body.insert("_id".to_string(), JsonValue::String(id.to_string()));
    body.insert("_rev".to_string(), JsonValue::String(revision.rev.clone()));
    if !revision.attachments.is_empty() {
        let stubs = revision
            .attachments
            .iter()
            .map(|(name, attachment)| {
                let stub = json!({
                    "content_type": attachment.content_type,
                    "length": attachment.data.len(),
                    "stub": true,
                });
                (name.clone(), stub)
            })
            .collect::<Map<_, _>>();
        body.insert("_attachments".to_string(), JsonValue::Object(stubs));
    }
    body
}

fn flag(query: &HashMap<String, String>, name: &str) -> bool {
    query.get(name).map(String::as_str) == Some("true")
}

fn json_param(query: &HashMap<String, String>, name: &str) -> Result<Option<JsonValue>> {
    query
        .get(name)
        .map(|raw| serde_json::from_str(raw).map_err(|_| bad_request("invalid JSON key")))
        .transpose()
}

fn usize_param(query: &HashMap<String, String>, name: &str) -> Result<Option<usize>> {
    query
        .get(name)
        .map(|raw| raw.parse().map_err(|_| bad_request("invalid integer")))
        .transpose()
}

fn not_found(reason: &str) -> CouchError {
    CouchError::from_status(404, json!({ "error": "not_found", "reason": reason }).to_string())
}

fn conflict() -> CouchError {
    CouchError::from_status(
        409,
        json!({ "error": "conflict", "reason": "Document update conflict." }).to_string(),
    )
}

fn bad_request(reason: &str) -> CouchError {
    CouchError::from_status(400, json!({ "error": "bad_request", "reason": reason }).to_string())
}

fn ok() -> Reply {
    Reply::Json(json!({ "ok": true }))
}

#[derive(Clone, Copy)]
enum Body<'a> {
    Empty,
    Json(&'a JsonValue),
    Raw(&'a [u8], &'a str),
    Destination(&'a str),
}

enum Reply {
    Json(JsonValue),
    Raw(Vec<u8>),
}

struct Request {
    segments: Vec<String>,
    query: HashMap<String, String>,
}

impl Request {
    /// Splits `scheme://authority/path?query`; path segments and query
    /// values are unescaped.
    fn parse(uri: &str) -> Self {
        let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
        let path = rest.find('/').map_or("", |slash| &rest[slash + 1..]);
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(unescape_id)
            .collect();
        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (name.to_string(), unescape_id(value))
            })
            .collect();
        Self { segments, query }
    }
}

/// One-shot answer for the first request matching a method and uri fragment.
struct Canned {
    method: String,
    fragment: String,
    outcome: std::result::Result<JsonValue, u16>,
}

#[derive(Default)]
struct MockState {
    databases: BTreeMap<String, MockDatabase>,
    counter: u64,
    failures: VecDeque<u16>,
    canned: Vec<Canned>,
    requests: Vec<(String, String)>,
}

impl MockState {
    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn database(&self, name: &str) -> Result<&MockDatabase> {
        self.databases
            .get(name)
            .ok_or_else(|| not_found("no_db_file"))
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut MockDatabase> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| not_found("no_db_file"))
    }

    fn dispatch(&mut self, method: &str, request: &Request, body: Body<'_>) -> Result<Reply> {
        let counter = self.next_counter();
        let query = &request.query;
        let segments = request
            .segments
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>();

        match (method, segments.as_slice()) {
            ("GET", []) => Ok(Reply::Json(json!({ "couchdb": "Welcome", "version": "mock" }))),
            ("GET", ["_uuids"]) => {
                let count = usize_param(query, "count")?.unwrap_or(1);
                let uuids = (0..count)
                    .map(|_| format!("{:032x}", self.next_counter()))
                    .collect::<Vec<_>>();
                Ok(Reply::Json(json!({ "uuids": uuids })))
            }
            ("GET", ["_all_dbs"]) => {
                let names = self.databases.keys().cloned().collect::<Vec<_>>();
                Ok(Reply::Json(json!(names)))
            }
            ("GET", ["_config", ..]) => Ok(Reply::Json(json!({ "couchdb": { "max_dbs_open": "100" } }))),
            ("GET", ["_stats", ..]) => Ok(Reply::Json(json!({ "couchdb": {} }))),
            ("POST", ["_restart"]) => Ok(ok()),
            ("POST", ["_replicate"]) => self.replicate(body),

            ("PUT", [name]) => {
                if self.databases.contains_key(*name) {
                    return Err(CouchError::from_status(
                        412,
                        json!({ "error": "file_exists" }).to_string(),
                    ));
                }
                self.databases.insert(name.to_string(), MockDatabase::default());
                Ok(ok())
            }
            ("GET", [name]) => {
                let db = self.database(name)?;
                let doc_count = db.docs.values().filter(|doc| doc.live().is_some()).count();
                Ok(Reply::Json(json!({
                    "db_name": name,
                    "doc_count": doc_count,
                    "update_seq": db.update_seq,
                })))
            }
            ("DELETE", [name]) => match self.databases.remove(*name) {
                Some(_) => Ok(ok()),
                None => Err(not_found("no_db_file")),
            },

            ("GET", [name, "_changes"]) => self.database(name)?.changes(query),
            ("POST", [name, "_compact"]) => {
                self.database(name)?;
                Ok(ok())
            }
            ("GET" | "POST", [name, "_all_docs"]) => self.database(name)?.all_docs(query, body),
            ("GET", [name, "_design", design, "_view", view]) => {
                self.database(name)?.view(design, view, query)
            }
            (_, [name, "_design", design]) => {
                let id = format!("{DESIGN_PREFIX}{design}");
                self.document(method, name, &id, query, body, counter)
            }
            (_, [name, id]) => self.document(method, name, id, query, body, counter),
            (_, [name, id, attachment]) => {
                self.database_mut(name)?
                    .attachment(method, id, attachment, query, body, counter)
            }
            _ => Err(bad_request("unsupported request")),
        }
    }

    fn document(
        &mut self,
        method: &str,
        name: &str,
        id: &str,
        query: &HashMap<String, String>,
        body: Body<'_>,
        counter: u64,
    ) -> Result<Reply> {
        let db = self.database_mut(name)?;
        match (method, body) {
            ("GET", _) => db.get_document(id, query),
            ("PUT", Body::Json(body)) => db.put_document(id, body, counter),
            ("DELETE", _) => db.delete_document(id, query.get("rev"), counter),
            ("COPY", Body::Destination(destination)) => {
                db.copy_document(id, &unescape_id(destination), counter)
            }
            _ => Err(bad_request("unsupported document request")),
        }
    }

    fn replicate(&mut self, body: Body<'_>) -> Result<Reply> {
        let Body::Json(body) = body else {
            return Err(bad_request("replication needs a body"));
        };
        let name_of = |field: &str| {
            body.get(field)
                .and_then(JsonValue::as_str)
                .and_then(|uri| Request::parse(uri).segments.last().cloned())
                .ok_or_else(|| bad_request("replication endpoints must be uris"))
        };
        let (source, target) = (name_of("source")?, name_of("target")?);
        let docs = self.database(&source)?.docs.clone();
        let target_db = self.database_mut(&target)?;
        for (id, stored) in docs {
            target_db.docs.insert(id.clone(), stored);
            target_db.record_change(&id);
        }
        Ok(Reply::Json(json!({ "ok": true, "source_last_seq": 0 })))
    }
}

/// Shared in-memory server. Every request is logged; failures can be
/// injected for the next request(s).
#[derive(Default)]
pub struct MockCouch {
    state: Mutex<MockState>,
}

impl MockCouch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next request fail with `status`.
    pub fn fail_next(&self, status: u16) {
        self.state.lock().failures.push_back(status);
    }

    /// Answers the next `method` request whose uri contains `fragment` with
    /// `reply` instead of consulting the stored data.
    pub fn reply_once(&self, method: &str, fragment: &str, reply: JsonValue) {
        self.can(method, fragment, Ok(reply));
    }

    /// Fails the next `method` request whose uri contains `fragment`.
    pub fn fail_once(&self, method: &str, fragment: &str, status: u16) {
        self.can(method, fragment, Err(status));
    }

    fn can(&self, method: &str, fragment: &str, outcome: std::result::Result<JsonValue, u16>) {
        self.state.lock().canned.push(Canned {
            method: method.to_string(),
            fragment: fragment.to_string(),
            outcome,
        });
    }

    /// Requests with `method` whose uri contains `fragment`.
    pub fn request_count(&self, method: &str, fragment: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, uri)| m == method && uri.contains(fragment))
            .count()
    }

    /// Latest stored body of a live document, as the server sees it.
    pub fn stored(&self, database: &str, id: &str) -> Option<JsonValue> {
        let state = self.state.lock();
        let revision = state.databases.get(database)?.live(id)?;
        Some(JsonValue::Object(revision_body(id, revision)))
    }

    fn handle(&self, method: &str, uri: &str, body: Body<'_>) -> Result<Reply> {
        let mut state = self.state.lock();
        state.requests.push((method.to_string(), uri.to_string()));
        if let Some(status) = state.failures.pop_front() {
            return Err(CouchError::from_status(status, "injected failure"));
        }
        let matched = state
            .canned
            .iter()
            .position(|canned| canned.method == method && uri.contains(&canned.fragment));
        if let Some(index) = matched {
            return match state.canned.remove(index).outcome {
                Ok(reply) => Ok(Reply::Json(reply)),
                Err(status) => Err(CouchError::from_status(status, "injected failure")),
            };
        }
        state.dispatch(method, &Request::parse(uri), body)
    }

    fn json(&self, method: &str, uri: &str, body: Body<'_>) -> Result<JsonValue> {
        match self.handle(method, uri, body)? {
            Reply::Json(value) => Ok(value),
            Reply::Raw(data) => Ok(serde_json::from_slice(&data)?),
        }
    }
}

impl Transport for MockCouch {
    fn get(&self, uri: &str) -> Result<JsonValue> {
        self.json("GET", uri, Body::Empty)
    }

    fn get_raw(&self, uri: &str) -> Result<Vec<u8>> {
        match self.handle("GET", uri, Body::Empty)? {
            Reply::Raw(data) => Ok(data),
            Reply::Json(value) => Ok(value.to_string().into_bytes()),
        }
    }

    fn put(&self, uri: &str, body: Option<&JsonValue>) -> Result<JsonValue> {
        self.json("PUT", uri, body.map_or(Body::Empty, Body::Json))
    }

    fn put_raw(&self, uri: &str, data: &[u8], content_type: &str) -> Result<JsonValue> {
        self.json("PUT", uri, Body::Raw(data, content_type))
    }

    fn post(&self, uri: &str, body: Option<&JsonValue>) -> Result<JsonValue> {
        self.json("POST", uri, body.map_or(Body::Empty, Body::Json))
    }

    fn delete(&self, uri: &str) -> Result<JsonValue> {
        self.json("DELETE", uri, Body::Empty)
    }

    fn copy(&self, uri: &str, destination: &str) -> Result<JsonValue> {
        self.json("COPY", uri, Body::Destination(destination))
    }
}
