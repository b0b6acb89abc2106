//! Remote data service
//!
//! The seam to the authoritative backend. [`HttpRemote`] talks to a JSON
//! REST API; [`InMemoryRemote`] is a self-contained authority for local
//! sessions and tests, with failure injection and call instrumentation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::record::Entity;
use crate::error::{RemoteError, SyncError, SyncResult};

/// One page of a `list` call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    pub entities: Vec<Entity>,
    #[serde(rename = "nextPageToken", default)]
    pub next_page_token: Option<String>,
}

#[async_trait::async_trait]
pub trait RemoteDataService: Send + Sync {
    async fn create(&self, entity: &Entity) -> Result<Entity, RemoteError>;

    async fn update(&self, entity: &Entity) -> Result<Entity, RemoteError>;

    async fn delete(&self, entity_type: &str, id: &str) -> Result<(), RemoteError>;

    async fn get(&self, entity_type: &str, id: &str) -> Result<Entity, RemoteError>;

    async fn list(
        &self,
        entity_type: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Page, RemoteError>;
}

/// Remote data service over HTTP/JSON
///
/// Routes: `POST {base}/{type}s`, `PUT|GET|DELETE {base}/{type}s/{id}`,
/// `GET {base}/{type}s?page_size=..&page_token=..`.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn collection_url(&self, entity_type: &str) -> String {
        format!("{}/{}s", self.base_url, entity_type)
    }

    fn entity_url(&self, entity_type: &str, id: &str) -> String {
        format!("{}/{}", self.collection_url(entity_type), id)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| status.to_string());
        Err(status_error(status, body))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Unknown(format!("Malformed response: {}", e)))
    }
}

/// Map a non-success HTTP status onto the remote error taxonomy
pub fn status_error(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::BAD_GATEWAY
        | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Unavailable(body)
        }
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
            RemoteError::DeadlineExceeded(body)
        }
        StatusCode::UNAUTHORIZED => RemoteError::Unauthenticated(body),
        StatusCode::FORBIDDEN => RemoteError::PermissionDenied(body),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            RemoteError::InvalidArgument(body)
        }
        StatusCode::NOT_FOUND => RemoteError::NotFound(body),
        StatusCode::CONFLICT => RemoteError::AlreadyExists(body),
        StatusCode::PRECONDITION_FAILED => RemoteError::FailedPrecondition(body),
        _ => RemoteError::Unknown(format!("HTTP {}: {}", status.as_u16(), body)),
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::DeadlineExceeded(err.to_string())
    } else if err.is_connect() {
        RemoteError::Unavailable(err.to_string())
    } else {
        RemoteError::Unknown(err.to_string())
    }
}

#[async_trait::async_trait]
impl RemoteDataService for HttpRemote {
    async fn create(&self, entity: &Entity) -> Result<Entity, RemoteError> {
        let url = self.collection_url(&entity.entity_type);
        self.send_json(self.client.post(url).json(entity)).await
    }

    async fn update(&self, entity: &Entity) -> Result<Entity, RemoteError> {
        let url = self.entity_url(&entity.entity_type, &entity.id);
        self.send_json(self.client.put(url).json(entity)).await
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.entity_url(entity_type, id);
        self.send(self.client.delete(url)).await.map(|_| ())
    }

    async fn get(&self, entity_type: &str, id: &str) -> Result<Entity, RemoteError> {
        let url = self.entity_url(entity_type, id);
        self.send_json(self.client.get(url)).await
    }

    async fn list(
        &self,
        entity_type: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Page, RemoteError> {
        let mut query = vec![("page_size", page_size.to_string())];
        if let Some(token) = page_token {
            query.push(("page_token", token.to_string()));
        }
        let url = self.collection_url(entity_type);
        self.send_json(self.client.get(url).query(&query)).await
    }
}

/// A recorded call against [`InMemoryRemote`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub method: &'static str,
    pub id: Option<String>,
    pub ok: bool,
}

struct FailureRule {
    method: &'static str,
    id: Option<String>,
    error: RemoteError,
    remaining: Option<u32>,
}

/// In-process authority holding the canonical entity set
#[derive(Default)]
pub struct InMemoryRemote {
    entities: Mutex<BTreeMap<String, Entity>>,
    failures: Mutex<Vec<FailureRule>>,
    calls: Mutex<Vec<RemoteCall>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to widen race windows
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fail `method` (optionally for one id) on every call
    pub fn fail_always(&self, method: &'static str, id: Option<&str>, error: RemoteError) {
        self.push_rule(method, id, error, None);
    }

    /// Fail `method` (optionally for one id) for the next `times` calls
    pub fn fail_times(
        &self,
        method: &'static str,
        id: Option<&str>,
        error: RemoteError,
        times: u32,
    ) {
        self.push_rule(method, id, error, Some(times));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    fn push_rule(
        &self,
        method: &'static str,
        id: Option<&str>,
        error: RemoteError,
        remaining: Option<u32>,
    ) {
        self.failures.lock().push(FailureRule {
            method,
            id: id.map(str::to_string),
            error,
            remaining,
        });
    }

    /// Store an entity as if another client had written it
    pub fn seed(&self, entity: Entity) {
        self.entities.lock().insert(entity.id.clone(), entity);
    }

    /// Change an entity as another client would, bumping its version
    pub fn modify(&self, id: &str, payload: serde_json::Value) -> Option<Entity> {
        let mut entities = self.entities.lock();
        let entity = entities.get_mut(id)?;
        entity.payload = payload;
        entity.version += 1;
        entity.last_modified = Utc::now();
        Some(entity.clone())
    }

    /// Delete an entity as another client would
    pub fn remove(&self, id: &str) -> Option<Entity> {
        self.entities.lock().remove(id)
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.entities.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.lock().is_empty()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Successful mutating calls, in the order they were applied
    pub fn applied(&self) -> Vec<(&'static str, String)> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.ok && matches!(c.method, "create" | "update" | "delete"))
            .filter_map(|c| c.id.clone().map(|id| (c.method, id)))
            .collect()
    }

    /// Highest number of calls observed running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn injected_failure(&self, method: &'static str, id: Option<&str>) -> Option<RemoteError> {
        let mut failures = self.failures.lock();
        let pos = failures.iter().position(|rule| {
            rule.method == method
                && rule.id.as_deref().map_or(true, |rid| Some(rid) == id)
                && rule.remaining != Some(0)
        })?;
        let rule = &mut failures[pos];
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.error.clone())
    }

    fn finish<T>(
        &self,
        method: &'static str,
        id: Option<&str>,
        result: Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        self.calls.lock().push(RemoteCall {
            method,
            id: id.map(str::to_string),
            ok: result.is_ok(),
        });
        result
    }
}

#[async_trait::async_trait]
impl RemoteDataService for InMemoryRemote {
    async fn create(&self, entity: &Entity) -> Result<Entity, RemoteError> {
        let _guard = self.enter().await;
        let id = Some(entity.id.as_str());
        if let Some(err) = self.injected_failure("create", id) {
            return self.finish("create", id, Err(err));
        }

        let mut entities = self.entities.lock();
        let result = if entities.contains_key(&entity.id) {
            Err(RemoteError::AlreadyExists(entity.id.clone()))
        } else {
            let stored = Entity {
                version: 1,
                last_modified: Utc::now(),
                ..entity.clone()
            };
            entities.insert(stored.id.clone(), stored.clone());
            Ok(stored)
        };
        drop(entities);
        self.finish("create", id, result)
    }

    async fn update(&self, entity: &Entity) -> Result<Entity, RemoteError> {
        let _guard = self.enter().await;
        let id = Some(entity.id.as_str());
        if let Some(err) = self.injected_failure("update", id) {
            return self.finish("update", id, Err(err));
        }

        let mut entities = self.entities.lock();
        let result = match entities.get_mut(&entity.id) {
            Some(current) => {
                current.payload = entity.payload.clone();
                current.version += 1;
                current.last_modified = Utc::now();
                Ok(current.clone())
            }
            None => Err(RemoteError::NotFound(entity.id.clone())),
        };
        drop(entities);
        self.finish("update", id, result)
    }

    async fn delete(&self, _entity_type: &str, id: &str) -> Result<(), RemoteError> {
        let _guard = self.enter().await;
        if let Some(err) = self.injected_failure("delete", Some(id)) {
            return self.finish("delete", Some(id), Err(err));
        }

        let removed = self.entities.lock().remove(id);
        let result = match removed {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(id.to_string())),
        };
        self.finish("delete", Some(id), result)
    }

    async fn get(&self, _entity_type: &str, id: &str) -> Result<Entity, RemoteError> {
        let _guard = self.enter().await;
        if let Some(err) = self.injected_failure("get", Some(id)) {
            return self.finish("get", Some(id), Err(err));
        }

        let result = self
            .entities
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()));
        self.finish("get", Some(id), result)
    }

    async fn list(
        &self,
        entity_type: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Page, RemoteError> {
        let _guard = self.enter().await;
        if let Some(err) = self.injected_failure("list", None) {
            return self.finish("list", None, Err(err));
        }

        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| RemoteError::InvalidArgument(format!("bad page token {}", token))),
            None => Ok(0),
        };
        let result = offset.map(|offset| {
            let matching: Vec<Entity> = self
                .entities
                .lock()
                .values()
                .filter(|e| e.entity_type == entity_type)
                .cloned()
                .collect();
            let page_size = page_size.max(1);
            let end = (offset + page_size).min(matching.len());
            Page {
                entities: matching.get(offset..end).unwrap_or_default().to_vec(),
                next_page_token: (end < matching.len()).then(|| end.to_string()),
            }
        });
        self.finish("list", None, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lesson(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            entity_type: "lesson".to_string(),
            version: 0,
            last_modified: Utc::now(),
            payload: json!({"title": id}),
        }
    }

    #[test]
    fn test_status_mapping() {
        use crate::sync::retry::{ErrorClass, RetryPolicy};

        let cases = [
            (StatusCode::SERVICE_UNAVAILABLE, ErrorClass::Retryable),
            (StatusCode::GATEWAY_TIMEOUT, ErrorClass::Retryable),
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorClass::Retryable),
            (StatusCode::UNAUTHORIZED, ErrorClass::Fatal),
            (StatusCode::FORBIDDEN, ErrorClass::Fatal),
            (StatusCode::UNPROCESSABLE_ENTITY, ErrorClass::Fatal),
            (StatusCode::CONFLICT, ErrorClass::Fatal),
        ];
        for (status, class) in cases {
            let err = status_error(status, String::new());
            assert_eq!(RetryPolicy::classify(&err), class, "{}", status);
        }
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "L1".into()),
            RemoteError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_http_remote_unreachable_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let remote =
            HttpRemote::new(format!("http://{}/api/", addr), Duration::from_secs(2)).unwrap();
        assert_eq!(
            remote.entity_url("lesson", "L1"),
            format!("http://{}/api/lessons/L1", addr)
        );

        let err = remote.get("lesson", "L1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_in_memory_versioning() {
        let remote = InMemoryRemote::new();
        let created = remote.create(&lesson("L1")).await.unwrap();
        assert_eq!(created.version, 1);

        let mut changed = created.clone();
        changed.payload = json!({"title": "changed"});
        let updated = remote.update(&changed).await.unwrap();
        assert_eq!(updated.version, 2);

        assert!(matches!(
            remote.create(&lesson("L1")).await,
            Err(RemoteError::AlreadyExists(_))
        ));

        remote.delete("lesson", "L1").await.unwrap();
        assert!(matches!(
            remote.get("lesson", "L1").await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_pagination() {
        let remote = InMemoryRemote::new();
        for i in 0..5 {
            remote.create(&lesson(&format!("L{}", i))).await.unwrap();
        }

        let first = remote.list("lesson", 2, None).await.unwrap();
        assert_eq!(first.entities.len(), 2);
        let token = first.next_page_token.unwrap();

        let second = remote.list("lesson", 2, Some(&token)).await.unwrap();
        let third = remote
            .list("lesson", 2, second.next_page_token.as_deref())
            .await
            .unwrap();
        assert_eq!(third.entities.len(), 1);
        assert!(third.next_page_token.is_none());

        assert!(remote.list("note", 10, None).await.unwrap().entities.is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = InMemoryRemote::new();
        remote.fail_times("create", Some("L1"), RemoteError::Unavailable("down".into()), 1);

        assert!(remote.create(&lesson("L1")).await.is_err());
        assert!(remote.create(&lesson("L1")).await.is_ok());
        assert!(remote.create(&lesson("L2")).await.is_ok());

        assert_eq!(
            remote.applied(),
            vec![("create", "L1".to_string()), ("create", "L2".to_string())]
        );
        assert_eq!(remote.calls().len(), 3);
    }
}
