//! HTTP transport seam.
//!
//! The document, database and design-document engines only ever talk to a
//! [`Transport`]. The production implementation is [`HttpTransport`]; tests
//! plug in an in-memory database behind the same trait.

use std::time::Duration;

use log::debug;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Method;
use serde_json::Value as JsonValue;

use crate::couch_error::{CouchError, Result};

/// Default request timeout for [`HttpTransport::default`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Verbs the core issues against the database. Every JSON-returning call
/// decodes the response body; non-2xx responses surface as [`CouchError`].
pub trait Transport: Send + Sync {
    fn get(&self, uri: &str) -> Result<JsonValue>;

    /// GET without JSON decoding, used for attachment bodies.
    fn get_raw(&self, uri: &str) -> Result<Vec<u8>>;

    fn put(&self, uri: &str, body: Option<&JsonValue>) -> Result<JsonValue>;

    /// PUT of an opaque payload, used for standalone attachment uploads.
    fn put_raw(&self, uri: &str, data: &[u8], content_type: &str) -> Result<JsonValue>;

    fn post(&self, uri: &str, body: Option<&JsonValue>) -> Result<JsonValue>;

    fn delete(&self, uri: &str) -> Result<JsonValue>;

    /// COPY with a `Destination` header.
    fn copy(&self, uri: &str, destination: &str) -> Result<JsonValue>;
}

/// Blocking HTTP implementation backed by `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CouchError::RequestFailed(format!("build http client: {err}")))?;
        Ok(Self { client })
    }

    fn send(&self, method: &str, uri: &str, request: RequestBuilder) -> Result<Response> {
        debug!("{} {}", method, uri);
        let response = request.send()?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let reason = response
                .text()
                .unwrap_or_else(|err| format!("response body error: {err}"));
            Err(CouchError::from_status(status.as_u16(), reason))
        }
    }

    fn decode_response(response: Response) -> Result<JsonValue> {
        let text = response.text()?;
        serde_json::from_str(&text)
            .map_err(|err| CouchError::RequestFailed(format!("Invalid JSON response: {err}")))
    }

    fn with_body(request: RequestBuilder, body: Option<&JsonValue>) -> RequestBuilder {
        match body {
            Some(body) => request.json(body),
            None => request,
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            client: Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

impl Transport for HttpTransport {
    fn get(&self, uri: &str) -> Result<JsonValue> {
        let response = self.send("GET", uri, self.client.get(uri))?;
        Self::decode_response(response)
    }

    fn get_raw(&self, uri: &str) -> Result<Vec<u8>> {
        let response = self.send("GET", uri, self.client.get(uri))?;
        Ok(response.bytes()?.to_vec())
    }

    fn put(&self, uri: &str, body: Option<&JsonValue>) -> Result<JsonValue> {
        let request = Self::with_body(self.client.put(uri), body);
        let response = self.send("PUT", uri, request)?;
        Self::decode_response(response)
    }

    fn put_raw(&self, uri: &str, data: &[u8], content_type: &str) -> Result<JsonValue> {
        let request = self
            .client
            .put(uri)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data.to_vec());
        let response = self.send("PUT", uri, request)?;
        Self::decode_response(response)
    }

    fn post(&self, uri: &str, body: Option<&JsonValue>) -> Result<JsonValue> {
        let request = Self::with_body(self.client.post(uri), body);
        let response = self.send("POST", uri, request)?;
        Self::decode_response(response)
    }

    fn delete(&self, uri: &str) -> Result<JsonValue> {
        let response = self.send("DELETE", uri, self.client.delete(uri))?;
        Self::decode_response(response)
    }

    fn copy(&self, uri: &str, destination: &str) -> Result<JsonValue> {
        let method = Method::from_bytes(b"COPY")
            .map_err(|err| CouchError::RequestFailed(format!("COPY method: {err}")))?;
        let request = self
            .client
            .request(method, uri)
            .header("Destination", destination);
        let response = self.send("COPY", uri, request)?;
        Self::decode_response(response)
    }
}
