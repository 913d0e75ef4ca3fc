use std::sync::Arc;

use speckle_codec::{BaseSerializer, SerializedGraph};
use speckle_model::{Base, TypeRegistry};
use speckle_transport::ObjectStore;
use speckle_types::ObjectId;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::OperationResult;
use crate::options::{ReceiveOptions, SendOptions};
use crate::progress::Progress;
use crate::receive::{self, Received};
use crate::send::{self, SendResult};

/// Entry point for sending and receiving object graphs.
///
/// Owns the type registry and the pipeline settings; each call runs in its
/// own tracing span tagged with a fresh operation id.
#[derive(Clone, Debug)]
pub struct Operations {
    registry: Arc<TypeRegistry>,
    send_options: SendOptions,
    receive_options: ReceiveOptions,
}

impl Operations {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self::with_options(registry, SendOptions::default(), ReceiveOptions::default())
    }

    pub fn with_options(registry: Arc<TypeRegistry>, send_options: SendOptions, receive_options: ReceiveOptions) -> Self {
        Self {
            registry,
            send_options,
            receive_options,
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn send_options(&self) -> &SendOptions {
        &self.send_options
    }

    pub fn receive_options(&self) -> &ReceiveOptions {
        &self.receive_options
    }

    /// Serialize `root` and store it in every target.
    pub async fn send(
        &self,
        root: Arc<Base>,
        targets: &[Arc<dyn ObjectStore>],
        cancel: &CancelToken,
        progress: &Progress,
    ) -> OperationResult<SendResult> {
        let span = info_span!("send", op = %Uuid::now_v7());
        async {
            let names: Vec<&str> = targets.iter().map(|t| t.name()).collect();
            info!(targets = ?names, "send started");
            send::send(&self.registry, root, targets, &self.send_options, cancel, progress).await
        }
        .instrument(span)
        .await
    }

    /// Rebuild `root_id` from `local`, downloading what it lacks from
    /// `remote`.
    pub async fn receive(
        &self,
        root_id: ObjectId,
        local: &Arc<dyn ObjectStore>,
        remote: Option<&Arc<dyn ObjectStore>>,
        cancel: &CancelToken,
        progress: &Progress,
    ) -> OperationResult<Received> {
        let span = info_span!("receive", op = %Uuid::now_v7(), root = %root_id);
        async {
            info!(local = local.name(), remote = ?remote.map(|r| r.name()), "receive started");
            receive::receive(
                self.registry.clone(),
                root_id,
                local,
                remote,
                &self.receive_options,
                cancel,
                progress,
            )
            .await
        }
        .instrument(span)
        .await
    }

    /// Serialize in memory without storing anything.
    pub fn serialize(&self, root: &Base) -> OperationResult<SerializedGraph> {
        let serializer = BaseSerializer::with_registry(&self.registry, self.send_options.serializer());
        Ok(serializer.serialize(root)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationError;
    use speckle_model::{FieldType, TypeSchema, Value};
    use speckle_remote::{Account, RemoteConfig, ServerTransport};
    use speckle_server::{ServerConfig, ServerState, SpeckleServer};
    use speckle_transport::{MemoryStore, SqliteConfig, SqliteStore};

    fn registry() -> Arc<TypeRegistry> {
        let registry = TypeRegistry::with_builtins();
        registry.register(
            TypeSchema::builder("Objects.Geometry.Point")
                .field("x", FieldType::Float)
                .field("y", FieldType::Float)
                .field("z", FieldType::Float)
                .build()
                .unwrap(),
        );
        Arc::new(registry)
    }

    fn model(registry: &TypeRegistry, points: usize) -> Arc<Base> {
        let root = Base::dynamic().with("name", "level 1").unwrap();
        let list: Vec<Value> = (0..points)
            .map(|i| {
                let p = registry.create("Objects.Geometry.Point");
                p.set("x", i as f64).unwrap();
                p.set("y", 2.0 * i as f64).unwrap();
                Value::Object(Arc::new(p))
            })
            .collect();
        root.set("@points", Value::List(list)).unwrap();
        root.set("@(100)heights", Value::list((0..250).map(|i| i as f64))).unwrap();
        Arc::new(root)
    }

    async fn server(token: &str) -> (Arc<ServerState>, Arc<dyn ObjectStore>) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            required_token: Some(token.to_string()),
            ..ServerConfig::default()
        };
        let server = SpeckleServer::new(config);
        let state = server.state();
        let (addr, _handle) = server.spawn().await.unwrap();
        let account = Account::new(format!("http://{addr}"), Some(token.to_string()));
        let config = RemoteConfig {
            retry_backoff_ms: 1,
            ..RemoteConfig::default()
        };
        let transport = ServerTransport::new(&account, "project-1", config).unwrap();
        (state, Arc::new(transport))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_then_receive_through_a_server() {
        let registry = registry();
        let ops = Operations::new(registry.clone());
        let (state, remote) = server("tok").await;
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn ObjectStore> =
            Arc::new(SqliteStore::open(dir.path().join("send.db"), SqliteConfig::default()).unwrap());

        let root = model(&registry, 40);
        let sent = ops
            .send(root.clone(), &[remote.clone(), cache.clone()], &CancelToken::new(), &Progress::none())
            .await
            .unwrap();
        let expected = ops.serialize(&root).unwrap();
        assert_eq!(sent.root_id, expected.root_id());
        assert_eq!(state.object_count("project-1"), expected.len());
        assert_eq!(cache.missing(&[sent.root_id]).await.unwrap(), Vec::<ObjectId>::new());

        let fresh: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let received = ops
            .receive(sent.root_id, &fresh, Some(&remote), &CancelToken::new(), &Progress::none())
            .await
            .unwrap();
        assert!(received.root.content_eq(&root));
        assert_eq!(received.downloaded, expected.len());
        let points = received.root.get("@points").unwrap();
        assert_eq!(points.as_list().unwrap().len(), 40);
        let first = points.as_list().unwrap()[1].as_object().unwrap().clone();
        assert_eq!(first.speckle_type(), "Objects.Geometry.Point");
        assert_eq!(first.get("y").unwrap().as_f64(), Some(2.0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resending_to_a_server_uploads_nothing() {
        let registry = registry();
        let ops = Operations::new(registry.clone());
        let (state, remote) = server("tok").await;

        let first = ops
            .send(model(&registry, 10), &[remote.clone()], &CancelToken::new(), &Progress::none())
            .await
            .unwrap();
        let stored = state.stored_objects();
        let requests = state.upload_requests();

        let second = ops
            .send(model(&registry, 10), &[remote], &CancelToken::new(), &Progress::none())
            .await
            .unwrap();
        assert_eq!(second.root_id, first.root_id);
        assert_eq!(second.targets[0].uploaded, 0);
        assert_eq!(second.targets[0].skipped, first.fragment_count);
        assert_eq!(state.stored_objects(), stored);
        assert_eq!(state.upload_requests(), requests);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_prefers_the_local_cache() {
        let registry = registry();
        let ops = Operations::new(registry.clone());
        let (_state, remote) = server("tok").await;
        let local: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());

        let sent = ops
            .send(model(&registry, 5), &[remote.clone(), local.clone()], &CancelToken::new(), &Progress::none())
            .await
            .unwrap();
        let received = ops
            .receive(sent.root_id, &local, Some(&remote), &CancelToken::new(), &Progress::none())
            .await
            .unwrap();
        assert_eq!(received.downloaded, 0);
        assert_eq!(received.from_cache, sent.fragment_count);
    }

    #[tokio::test]
    async fn unknown_root_on_the_server() {
        let ops = Operations::new(registry());
        let (_state, remote) = server("tok").await;
        let local: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let missing = ObjectId::from_bytes([3; 16]);
        let err = ops
            .receive(missing, &local, Some(&remote), &CancelToken::new(), &Progress::none())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::MissingReference { id, .. } if id == missing));
    }

    #[test]
    fn serialize_is_deterministic() {
        let registry = registry();
        let ops = Operations::new(registry.clone());
        let a = ops.serialize(&model(&registry, 3)).unwrap();
        let b = ops.serialize(&model(&registry, 3)).unwrap();
        assert_eq!(a.root_id(), b.root_id());
        assert_eq!(a.root.json, b.root.json);
    }
}
