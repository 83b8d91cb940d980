//! Source- and sink-tracker API clients.
//!
//! The pipeline only sees the `SourceClient`/`SinkClient` traits; the HTTP
//! implementations here are thin REST wrappers with bounded timeouts. Every
//! failure is classified transient or permanent at this boundary so the
//! pipeline never has to inspect transport details.

use crate::error::ErrorClass;
use crate::event::ItemSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ClientError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ClientError {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
}

impl ClientError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            status: None,
            message: message.into(),
        }
    }

    fn from_reqwest(what: &str, err: reqwest::Error) -> Self {
        let class = if err.is_timeout() || err.is_connect() || err.is_request() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        };
        Self {
            class,
            status: None,
            message: format!("{what}: {err}"),
        }
    }
}

/// Map a non-success HTTP status to an error. 408/429/5xx retry; the rest
/// are configuration or schema problems.
fn check(
    what: &str,
    resp: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let code = status.as_u16();
    let class = if code == 408 || code == 429 || status.is_server_error() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    };
    Err(ClientError {
        class,
        status: Some(code),
        message: format!("{what}: HTTP {code}"),
    })
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Current state of a sink-tracker item, as much of it as steps need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkItem {
    pub key: String,
    pub project_key: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Read access to the source tracker, plus the one write the pipeline does
/// there (cross-linking the created sink item).
pub trait SourceClient: Send + Sync {
    /// Fetch the current item state. `Ok(None)` means the item is gone or
    /// no longer visible to us; that is an ignore, not a failure.
    fn fetch_item(&self, id: u64) -> Result<Option<ItemSnapshot>, ClientError>;

    /// First descriptive comment of the item, used as the created sink
    /// item's description.
    fn fetch_description(&self, id: u64) -> Result<String, ClientError>;

    fn add_link(&self, id: u64, url: &str) -> Result<(), ClientError>;

    fn item_url(&self, id: u64) -> String;
}

/// Write access to the sink tracker.
pub trait SinkClient: Send + Sync {
    /// `Ok(None)` when the key does not resolve to a readable item.
    fn fetch_item(&self, key: &str) -> Result<Option<SinkItem>, ClientError>;

    /// Create an item and return its key. `fields` carries at least
    /// `summary`, `description`, `issue_type`, and `source_item_id`.
    fn create_item(
        &self,
        project_key: &str,
        fields: &serde_json::Value,
    ) -> Result<String, ClientError>;

    fn update_item(&self, key: &str, fields: &serde_json::Value) -> Result<(), ClientError>;

    fn post_comment(&self, key: &str, body: &str) -> Result<(), ClientError>;

    /// Upsert a remote link on the item, keyed by URL on the sink side, so
    /// replays converge instead of stacking duplicates. Returns whether the
    /// link was newly created.
    fn create_link(&self, key: &str, url: &str, title: &str) -> Result<bool, ClientError>;

    fn update_labels(&self, key: &str, add: &[String], remove: &[String])
        -> Result<(), ClientError>;

    fn delete_item(&self, key: &str) -> Result<(), ClientError>;

    /// Keys of items in `project_key` already marked with this source item
    /// id. Lets `create_item` detect prior partial runs.
    fn find_linked(&self, project_key: &str, source_item_id: u64)
        -> Result<Vec<String>, ClientError>;

    fn item_url(&self, key: &str) -> String;
}

/// The pair of tracker clients a pipeline run works against.
#[derive(Clone)]
pub struct Services {
    pub source: Arc<dyn SourceClient>,
    pub sink: Arc<dyn SinkClient>,
}

// ---------------------------------------------------------------------------
// HTTP source client
// ---------------------------------------------------------------------------

pub struct HttpSourceClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl HttpSourceClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ClientError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| ClientError::permanent(format!("source api key: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::permanent(format!("source client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[derive(Deserialize)]
struct DescriptionBody {
    description: String,
}

impl SourceClient for HttpSourceClient {
    fn fetch_item(&self, id: u64) -> Result<Option<ItemSnapshot>, ClientError> {
        let url = format!("{}/rest/item/{id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .map_err(|e| ClientError::from_reqwest("fetch source item", e))?;
        if matches!(resp.status().as_u16(), 403 | 404) {
            return Ok(None);
        }
        let resp = check("fetch source item", resp)?;
        let item = resp
            .json::<ItemSnapshot>()
            .map_err(|e| ClientError::permanent(format!("decode source item: {e}")))?;
        Ok(Some(item))
    }

    fn fetch_description(&self, id: u64) -> Result<String, ClientError> {
        let url = format!("{}/rest/item/{id}/description", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .map_err(|e| ClientError::from_reqwest("fetch description", e))?;
        let resp = check("fetch description", resp)?;
        let body = resp
            .json::<DescriptionBody>()
            .map_err(|e| ClientError::permanent(format!("decode description: {e}")))?;
        Ok(body.description)
    }

    fn add_link(&self, id: u64, link: &str) -> Result<(), ClientError> {
        let url = format!("{}/rest/item/{id}/links", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "url": link }))
            .send()
            .map_err(|e| ClientError::from_reqwest("add source link", e))?;
        check("add source link", resp)?;
        Ok(())
    }

    fn item_url(&self, id: u64) -> String {
        format!("{}/item/{id}", self.base_url)
    }
}

// ---------------------------------------------------------------------------
// HTTP sink client
// ---------------------------------------------------------------------------

pub struct HttpSinkClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl HttpSinkClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ClientError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| ClientError::permanent(format!("sink api key: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::permanent(format!("sink client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[derive(Deserialize)]
struct CreatedBody {
    key: String,
}

#[derive(Deserialize)]
struct LinkedKeysBody {
    keys: Vec<String>,
}

impl SinkClient for HttpSinkClient {
    fn fetch_item(&self, key: &str) -> Result<Option<SinkItem>, ClientError> {
        let url = format!("{}/rest/issue/{key}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .map_err(|e| ClientError::from_reqwest("fetch sink item", e))?;
        if matches!(resp.status().as_u16(), 403 | 404) {
            return Ok(None);
        }
        let resp = check("fetch sink item", resp)?;
        let item = resp
            .json::<SinkItem>()
            .map_err(|e| ClientError::permanent(format!("decode sink item: {e}")))?;
        Ok(Some(item))
    }

    fn create_item(
        &self,
        project_key: &str,
        fields: &serde_json::Value,
    ) -> Result<String, ClientError> {
        let url = format!("{}/rest/issue", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "project_key": project_key, "fields": fields }))
            .send()
            .map_err(|e| ClientError::from_reqwest("create sink item", e))?;
        let resp = check("create sink item", resp)?;
        let body = resp
            .json::<CreatedBody>()
            .map_err(|e| ClientError::permanent(format!("decode create response: {e}")))?;
        Ok(body.key)
    }

    fn update_item(&self, key: &str, fields: &serde_json::Value) -> Result<(), ClientError> {
        let url = format!("{}/rest/issue/{key}", self.base_url);
        let resp = self
            .http
            .put(&url)
            .json(&serde_json::json!({ "fields": fields }))
            .send()
            .map_err(|e| ClientError::from_reqwest("update sink item", e))?;
        check("update sink item", resp)?;
        Ok(())
    }

    fn post_comment(&self, key: &str, body: &str) -> Result<(), ClientError> {
        let url = format!("{}/rest/issue/{key}/comment", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .map_err(|e| ClientError::from_reqwest("post sink comment", e))?;
        check("post sink comment", resp)?;
        Ok(())
    }

    fn create_link(&self, key: &str, link: &str, title: &str) -> Result<bool, ClientError> {
        let url = format!("{}/rest/issue/{key}/remotelink", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "url": link, "title": title }))
            .send()
            .map_err(|e| ClientError::from_reqwest("create sink link", e))?;
        let resp = check("create sink link", resp)?;
        // 201 for a new link, 200 when the URL was already linked.
        Ok(resp.status() == reqwest::StatusCode::CREATED)
    }

    fn update_labels(
        &self,
        key: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ClientError> {
        let url = format!("{}/rest/issue/{key}/labels", self.base_url);
        let resp = self
            .http
            .put(&url)
            .json(&serde_json::json!({ "add": add, "remove": remove }))
            .send()
            .map_err(|e| ClientError::from_reqwest("update sink labels", e))?;
        check("update sink labels", resp)?;
        Ok(())
    }

    fn delete_item(&self, key: &str) -> Result<(), ClientError> {
        let url = format!("{}/rest/issue/{key}", self.base_url);
        let resp = self
            .http
            .delete(&url)
            .send()
            .map_err(|e| ClientError::from_reqwest("delete sink item", e))?;
        check("delete sink item", resp)?;
        Ok(())
    }

    fn find_linked(
        &self,
        project_key: &str,
        source_item_id: u64,
    ) -> Result<Vec<String>, ClientError> {
        let url = format!(
            "{}/rest/issue?project={project_key}&source_item={source_item_id}",
            self.base_url
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .map_err(|e| ClientError::from_reqwest("find linked sink items", e))?;
        let resp = check("find linked sink items", resp)?;
        let body = resp
            .json::<LinkedKeysBody>()
            .map_err(|e| ClientError::permanent(format!("decode linked keys: {e}")))?;
        Ok(body.keys)
    }

    fn item_url(&self, key: &str) -> String {
        format!("{}/browse/{key}", self.base_url)
    }
}

// ---------------------------------------------------------------------------
// Test fakes
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn source(server: &mockito::ServerGuard) -> HttpSourceClient {
        HttpSourceClient::new(&server.url(), "k", Duration::from_secs(5)).unwrap()
    }

    fn sink(server: &mockito::ServerGuard) -> HttpSinkClient {
        HttpSinkClient::new(&server.url(), "k", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn fetch_source_item_decodes_snapshot() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/rest/item/42")
            .with_status(200)
            .with_body(r#"{"id": 42, "summary": "crash", "labels": "[proj]"}"#)
            .create();
        let item = source(&server).fetch_item(42).unwrap().unwrap();
        assert_eq!(item.id, 42);
        assert_eq!(item.labels.as_deref(), Some("[proj]"));
    }

    #[test]
    fn fetch_source_item_404_is_none() {
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/rest/item/42").with_status(404).create();
        assert!(source(&server).fetch_item(42).unwrap().is_none());
    }

    #[test]
    fn server_error_is_transient() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/rest/item/42/description")
            .with_status(503)
            .create();
        let err = source(&server).fetch_description(42).unwrap_err();
        assert_eq!(err.class, ErrorClass::Transient);
        assert_eq!(err.status, Some(503));
    }

    #[test]
    fn rate_limit_is_transient() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", "/rest/issue/PROJ-1/comment")
            .with_status(429)
            .create();
        let err = sink(&server).post_comment("PROJ-1", "hi").unwrap_err();
        assert_eq!(err.class, ErrorClass::Transient);
    }

    #[test]
    fn bad_request_is_permanent() {
        let mut server = mockito::Server::new();
        let _m = server.mock("PUT", "/rest/issue/PROJ-1").with_status(400).create();
        let err = sink(&server)
            .update_item("PROJ-1", &serde_json::json!({"status": "Done"}))
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Permanent);
        assert_eq!(err.status, Some(400));
    }

    #[test]
    fn create_item_returns_key() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", "/rest/issue")
            .with_status(201)
            .with_body(r#"{"key": "PROJ-7"}"#)
            .create();
        let key = sink(&server)
            .create_item("PROJ", &serde_json::json!({"summary": "s"}))
            .unwrap();
        assert_eq!(key, "PROJ-7");
    }

    #[test]
    fn fetch_sink_item_404_is_none() {
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/rest/issue/PROJ-9").with_status(404).create();
        assert!(sink(&server).fetch_item("PROJ-9").unwrap().is_none());
    }

    #[test]
    fn connection_refused_is_transient() {
        // Port 1 is never listening.
        let client =
            HttpSourceClient::new("http://127.0.0.1:1", "k", Duration::from_millis(200)).unwrap();
        let err = client.fetch_description(1).unwrap_err();
        assert_eq!(err.class, ErrorClass::Transient);
    }
}
