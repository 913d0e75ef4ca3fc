use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use speckle_transport::{BlobStore, ObjectStore, TransportError, TransportResult};
use speckle_types::{Fragment, ObjectId};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::account::{validate_stream, Account};
use crate::api;
use crate::config::RemoteConfig;

/// Object server tier: fragments and blobs of one stream on a remote server.
///
/// Reads and existence checks are idempotent and retried on transient
/// failures with exponential backoff. Uploads are never retried blindly: a
/// failed batch is diffed against the server again and only what is still
/// missing is resent.
pub struct ServerTransport {
    name: String,
    base: Url,
    stream: String,
    config: RemoteConfig,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl ServerTransport {
    pub fn new(account: &Account, stream: impl Into<String>, config: RemoteConfig) -> TransportResult<Self> {
        let stream = stream.into();
        let name = format!("server:{stream}");
        let invalid = |reason: String| TransportError::Request {
            backend: name.clone(),
            reason,
        };
        let base = account.base_url().map_err(|e| invalid(e.to_string()))?;
        validate_stream(&stream).map_err(|e| invalid(e.to_string()))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &account.token {
            let mut value =
                HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| invalid(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .pool_max_idle_per_host(config.max_connections)
            .default_headers(headers)
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            name,
            base,
            stream,
            config,
            client,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> TransportResult<()> {
        let url = self.url(api::PING)?;
        self.retrying("ping", || async {
            let response = self.client.get(url.clone()).send().await.map_err(|e| self.request_err(e))?;
            self.check(&url, response).await?;
            Ok(())
        })
        .await
    }

    fn url(&self, path: &str) -> TransportResult<Url> {
        self.base.join(path).map_err(|e| TransportError::Request {
            backend: self.name.clone(),
            reason: format!("bad endpoint {path}: {e}"),
        })
    }

    fn request_err(&self, e: reqwest::Error) -> TransportError {
        TransportError::Request {
            backend: self.name.clone(),
            reason: e.to_string(),
        }
    }

    async fn check(&self, url: &Url, response: Response) -> TransportResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(200);
        Err(TransportError::Status {
            backend: self.name.clone(),
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    /// Run an idempotent request, retrying transient failures. Each attempt
    /// holds one connection permit.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> TransportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self.permits.acquire().await.map_err(|_| TransportError::Closed {
                    backend: self.name.clone(),
                })?;
                op().await
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.backoff_for(attempt);
                    warn!(backend = %self.name, what, attempt, error = %e, ?delay, "retrying request");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn get_chunk(&self, ids: &[ObjectId]) -> TransportResult<Vec<(ObjectId, String)>> {
        let url = self.url(&api::get_objects(&self.stream))?;
        let body = api::IdList::new(ids);
        self.retrying("getobjects", || async {
            let response = self
                .client
                .post(url.clone())
                .header(ACCEPT, "text/plain")
                .json(&body)
                .send()
                .await
                .map_err(|e| self.request_err(e))?;
            let text = self
                .check(&url, response)
                .await?
                .text()
                .await
                .map_err(|e| self.request_err(e))?;
            api::parse_object_lines(&text).map_err(|reason| TransportError::corrupt(self.name.clone(), &url, reason))
        })
        .await
    }

    async fn diff_chunk(&self, ids: &[ObjectId]) -> TransportResult<api::DiffResponse> {
        let url = self.url(&api::diff(&self.stream))?;
        let body = api::IdList::new(ids);
        self.retrying("diff", || async {
            let response = self
                .client
                .post(url.clone())
                .json(&body)
                .send()
                .await
                .map_err(|e| self.request_err(e))?;
            self.check(&url, response)
                .await?
                .json::<api::DiffResponse>()
                .await
                .map_err(|e| TransportError::corrupt(self.name.clone(), &url, e.to_string()))
        })
        .await
    }

    async fn upload_once(&self, fragments: &[&Fragment]) -> TransportResult<()> {
        let url = self.url(&api::upload(&self.stream))?;
        let gzip = self.config.gzip_uploads;
        let bytes = api::encode_batch(fragments, gzip).map_err(|e| TransportError::io(self.name.clone(), e))?;
        let mime = if gzip { api::GZIP_MIME } else { api::JSON_MIME };
        let part_name = format!("{}1", api::BATCH_PART_PREFIX);
        let part = Part::bytes(bytes)
            .file_name(part_name.clone())
            .mime_str(mime)
            .map_err(|e| self.request_err(e))?;
        let form = Form::new().part(part_name, part);

        let _permit = self.permits.acquire().await.map_err(|_| TransportError::Closed {
            backend: self.name.clone(),
        })?;
        let response = self
            .client
            .post(url.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.request_err(e))?;
        self.check(&url, response).await?;
        Ok(())
    }

    async fn upload_blob_once(&self, id: ObjectId, path: &Path) -> TransportResult<()> {
        let url = self.url(&api::blob_upload(&self.stream))?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| TransportError::io(self.name.clone(), e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_hex());
        let form = Form::new().part(
            format!("{}{}", api::BLOB_PART_PREFIX, id.to_hex()),
            Part::bytes(bytes).file_name(file_name),
        );

        let _permit = self.permits.acquire().await.map_err(|_| TransportError::Closed {
            backend: self.name.clone(),
        })?;
        let response = self
            .client
            .post(url.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.request_err(e))?;
        self.check(&url, response).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for ServerTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let url = self.url(&api::single(&self.stream, id))?;
        self.retrying("single", || async {
            let response = self.client.get(url.clone()).send().await.map_err(|e| self.request_err(e))?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let text = self
                .check(&url, response)
                .await?
                .text()
                .await
                .map_err(|e| self.request_err(e))?;
            Ok(Some(text))
        })
        .await
    }

    /// Upload a batch as one multipart request.
    async fn put_batch(&self, fragments: &[Fragment]) -> TransportResult<()> {
        let mut remaining: Vec<&Fragment> = fragments.iter().collect();
        let mut attempt = 0;
        while !remaining.is_empty() {
            match self.upload_once(&remaining).await {
                Ok(()) => {
                    debug!(backend = %self.name, count = remaining.len(), "uploaded batch");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(backend = %self.name, attempt, error = %e, "upload failed, re-checking before retry");
                    tokio::time::sleep(self.config.backoff_for(attempt)).await;
                    let ids: Vec<ObjectId> = remaining.iter().map(|f| f.id).collect();
                    let still_missing: HashSet<ObjectId> = self.missing(&ids).await?.into_iter().collect();
                    remaining.retain(|f| still_missing.contains(&f.id));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn get_batch(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, String>> {
        let mut found = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.max_ids_per_request.max(1)) {
            found.extend(self.get_chunk(chunk).await?);
        }
        Ok(found)
    }

    async fn has_batch(&self, ids: &[ObjectId]) -> TransportResult<HashSet<ObjectId>> {
        let missing: HashSet<ObjectId> = self.missing(ids).await?.into_iter().collect();
        Ok(ids.iter().filter(|id| !missing.contains(id)).copied().collect())
    }

    async fn missing(&self, ids: &[ObjectId]) -> TransportResult<Vec<ObjectId>> {
        let mut missing = Vec::new();
        for chunk in ids.chunks(self.config.max_ids_per_request.max(1)) {
            let answer = self.diff_chunk(chunk).await?;
            missing.extend(
                chunk
                    .iter()
                    .filter(|id| !answer.get(&id.to_hex()).copied().unwrap_or(false))
                    .copied(),
            );
        }
        Ok(missing)
    }

    fn blobs(&self) -> Option<&dyn BlobStore> {
        Some(self)
    }
}

#[async_trait]
impl BlobStore for ServerTransport {
    async fn missing_blobs(&self, ids: &[ObjectId]) -> TransportResult<Vec<ObjectId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(&api::blob_diff(&self.stream))?;
        self.retrying("blob diff", || async {
            let response = self
                .client
                .post(url.clone())
                .json(&ids)
                .send()
                .await
                .map_err(|e| self.request_err(e))?;
            self.check(&url, response)
                .await?
                .json::<Vec<ObjectId>>()
                .await
                .map_err(|e| TransportError::corrupt(self.name.clone(), &url, e.to_string()))
        })
        .await
    }

    async fn put_blob(&self, id: ObjectId, path: &Path) -> TransportResult<()> {
        let mut attempt = 0;
        loop {
            match self.upload_blob_once(id, path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(backend = %self.name, blob = %id, attempt, error = %e, "blob upload failed, re-checking");
                    tokio::time::sleep(self.config.backoff_for(attempt)).await;
                    if self.missing_blobs(&[id]).await?.is_empty() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_blob(&self, id: &ObjectId, dest: &Path) -> TransportResult<bool> {
        let url = self.url(&api::blob_download(&self.stream, id))?;
        let bytes = self
            .retrying("blob download", || async {
                let response = self.client.get(url.clone()).send().await.map_err(|e| self.request_err(e))?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let bytes = self
                    .check(&url, response)
                    .await?
                    .bytes()
                    .await
                    .map_err(|e| self.request_err(e))?;
                Ok(Some(bytes))
            })
            .await?;
        match bytes {
            Some(bytes) => {
                tokio::fs::write(dest, &bytes)
                    .await
                    .map_err(|e| TransportError::io(self.name.clone(), e))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransport")
            .field("base", &self.base.as_str())
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn id(n: u8) -> ObjectId {
        ObjectId::from_bytes([n; 16])
    }

    fn fragment(n: u8) -> Fragment {
        Fragment::new(id(n), format!(r#"{{"n":{n},"id":"{}"}}"#, id(n)), "Base")
    }

    fn fast() -> RemoteConfig {
        RemoteConfig {
            retry_backoff_ms: 1,
            gzip_uploads: false,
            ..RemoteConfig::default()
        }
    }

    fn transport(server: &MockServer, config: RemoteConfig) -> ServerTransport {
        ServerTransport::new(&Account::new(server.uri(), Some("tok".into())), "s1", config).unwrap()
    }

    #[tokio::test]
    async fn get_batch_parses_lines_and_sends_token() {
        let server = MockServer::start().await;
        let mut body = String::new();
        api::write_object_line(&mut body, &id(1), &fragment(1).json);
        Mock::given(method("POST"))
            .and(path("/api/getobjects/s1"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(api::IdList::new(&[id(1), id(2)])))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let found = transport(&server, fast()).get_batch(&[id(1), id(2)]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&id(1)], fragment(1).json);
    }

    #[tokio::test]
    async fn single_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        assert!(transport(&server, fast()).get(&id(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_reads_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/objects/s1/{}/single", id(1))))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/objects/s1/{}/single", id(1))))
            .respond_with(ResponseTemplate::new(200).set_body_string(fragment(1).json))
            .mount(&server)
            .await;

        let json = transport(&server, fast()).get(&id(1)).await.unwrap();
        assert_eq!(json, Some(fragment(1).json));
    }

    #[tokio::test]
    async fn retries_give_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;
        let config = RemoteConfig {
            max_retries: 1,
            ..fast()
        };
        let err = transport(&server, config).get(&id(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/objects/s1"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .expect(1)
            .mount(&server)
            .await;
        let err = transport(&server, fast()).put_batch(&[fragment(1)]).await.unwrap_err();
        match err {
            TransportError::Status { status, body, .. } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad token");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn diff_reports_missing_in_order() {
        let server = MockServer::start().await;
        let answer: api::DiffResponse = [(id(1).to_hex(), true), (id(2).to_hex(), false)].into_iter().collect();
        Mock::given(method("POST"))
            .and(path("/api/diff/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer))
            .mount(&server)
            .await;

        let t = transport(&server, fast());
        assert_eq!(t.missing(&[id(3), id(1), id(2)]).await.unwrap(), vec![id(3), id(2)]);
        assert_eq!(t.has_batch(&[id(1), id(2)]).await.unwrap(), HashSet::from([id(1)]));
    }

    #[tokio::test]
    async fn failed_upload_resends_only_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/objects/s1"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/objects/s1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        let answer: api::DiffResponse = [(id(1).to_hex(), true), (id(2).to_hex(), false)].into_iter().collect();
        Mock::given(method("POST"))
            .and(path("/api/diff/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer))
            .expect(1)
            .mount(&server)
            .await;

        transport(&server, fast())
            .put_batch(&[fragment(1), fragment(2)])
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let last_upload = requests
            .iter()
            .filter(|r| r.url.path() == "/objects/s1")
            .last()
            .unwrap();
        let body = String::from_utf8_lossy(&last_upload.body);
        assert!(body.contains(&fragment(2).json));
        assert!(!body.contains(&fragment(1).json));
    }

    #[tokio::test]
    async fn upload_already_present_after_failure_is_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/objects/s1"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let answer: api::DiffResponse = [(id(1).to_hex(), true)].into_iter().collect();
        Mock::given(method("POST"))
            .and(path("/api/diff/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer))
            .mount(&server)
            .await;
        transport(&server, fast()).put_batch(&[fragment(1)]).await.unwrap();
    }

    #[tokio::test]
    async fn blobs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/stream/s1/blob/diff"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![id(7)]))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/stream/s1/blob"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/stream/s1/blob/{}", id(7))))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plan.pdf");
        std::fs::write(&src, b"bytes").unwrap();
        let t = transport(&server, fast());

        assert_eq!(t.missing_blobs(&[id(7), id(8)]).await.unwrap(), vec![id(7)]);
        t.put_blob(id(7), &src).await.unwrap();
        let dest = dir.path().join("down.pdf");
        assert!(t.get_blob(&id(7), &dest).await.unwrap());
        assert_eq!(std::fs::read(dest).unwrap(), b"bytes");
        assert!(!t.get_blob(&id(9), &dir.path().join("none")).await.unwrap());

        let uploads = server.received_requests().await.unwrap();
        let upload = uploads.iter().find(|r| r.url.path() == "/api/stream/s1/blob").unwrap();
        let body = String::from_utf8_lossy(&upload.body);
        assert!(body.contains(&format!("name=\"hash:{}\"", id(7))));
        assert!(body.contains("filename=\"plan.pdf\""));
    }

    #[test]
    fn rejects_bad_stream_ids() {
        let account = Account::new("http://localhost:3000", None);
        assert!(ServerTransport::new(&account, "a/b", RemoteConfig::default()).is_err());
    }
}
