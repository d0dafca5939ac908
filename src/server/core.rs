use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::config::{EngineConfig, StateHandling};
use crate::document::{DocumentEnv, FormDocument, Stimulus};
use crate::error::{Result, StateError};
use crate::form::FormDefinition;
use crate::logging::{LogLevel, emit, json_kv, json_str};
use crate::model::BindingEvaluator;
use crate::protocol::ChangeSet;
use crate::refresh::{EventHandler, RefreshAudit};
use crate::state::{
    Checkout, DynamicState, InstanceLoader, ObjectPool, PoolKey, SESSION_PREFIX,
    SessionStateStore, SharedInstanceCache, StateCodec, StateToken, TokenPair, new_session_id,
};

const TARGET: &str = "formtree::server";

/// One client exchange: the state tokens from the previous response and the
/// stimuli to apply, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub static_state: String,
    pub dynamic_state: String,
    #[serde(default)]
    pub stimuli: Vec<Stimulus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Only sent with the first response of a document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_state: Option<String>,
    pub dynamic_state: String,
    pub changes: ChangeSet,
}

/// Serves form documents across stateless exchanges, reusing pooled
/// documents when the client presents the tokens they were returned under.
pub struct FormServer {
    config: EngineConfig,
    evaluator: Arc<dyn BindingEvaluator>,
    loader: Arc<dyn InstanceLoader>,
    audit: Option<Arc<dyn RefreshAudit>>,
    pool: ObjectPool<FormDocument>,
    store: SessionStateStore,
    shared: SharedInstanceCache,
    codec: StateCodec,
    started: Instant,
}

impl FormServer {
    pub fn new(
        config: EngineConfig,
        evaluator: Arc<dyn BindingEvaluator>,
        loader: Arc<dyn InstanceLoader>,
    ) -> Self {
        let logger = config.logger.clone();
        let metrics = config.metrics_handle();
        Self {
            pool: ObjectPool::new(config.pool_capacity)
                .with_logger(logger.clone())
                .with_metrics(metrics.clone()),
            store: SessionStateStore::new(config.session_store_bytes)
                .with_logger(logger.clone())
                .with_metrics(metrics.clone()),
            shared: SharedInstanceCache::new(config.shared_instance_capacity)
                .with_logger(logger)
                .with_metrics(metrics),
            codec: StateCodec::new(&config.state_secret),
            config,
            evaluator,
            loader,
            audit: None,
            started: Instant::now(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn RefreshAudit>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &ObjectPool<FormDocument> {
        &self.pool
    }

    pub fn store(&self) -> &SessionStateStore {
        &self.store
    }

    pub fn shared_instances(&self) -> &SharedInstanceCache {
        &self.shared
    }

    /// Drop cached copies of a shared instance so the next document that
    /// needs it loads it again. Documents already holding it are unaffected.
    pub fn invalidate_shared(&self, uri: &str) -> usize {
        let removed = self.shared.remove(uri);
        emit(
            self.config.logger.as_ref(),
            LogLevel::Info,
            TARGET,
            "shared instance invalidated",
            [json_str("uri", uri), json_kv("entries", removed)],
        );
        removed
    }

    /// Create a document for `form` and produce its first response.
    pub fn initialize(
        &self,
        form: FormDefinition,
        handler: &mut dyn EventHandler,
    ) -> Result<Response> {
        let form = Arc::new(form);
        let env = self.env();
        let mut document = FormDocument::create(Arc::clone(&form), &env, handler)?;
        let changes = document.respond(true);

        let static_blob = self.codec.encode(form.as_ref())?;
        let dynamic_blob = self.codec.encode(&document.dynamic_state())?;
        let (static_state, dynamic_state) = match self.config.state_handling {
            StateHandling::Inline => (static_blob, dynamic_blob),
            StateHandling::Session => {
                let static_id = new_session_id();
                let dynamic_id = new_session_id();
                self.store.add_state(
                    &static_id,
                    None,
                    &dynamic_id,
                    Some(static_blob.as_str()),
                    &dynamic_blob,
                    true,
                );
                (
                    format!("{SESSION_PREFIX}{static_id}"),
                    format!("{SESSION_PREFIX}{dynamic_id}"),
                )
            }
        };
        if self.config.cache_documents {
            self.pool
                .put(PoolKey::of(&static_state, &dynamic_state), document);
        }

        emit(
            self.config.logger.as_ref(),
            LogLevel::Info,
            TARGET,
            "document initialized",
            [
                json_str("form", form.id.clone()),
                json_kv("controls", changes.controls.len()),
            ],
        );
        Ok(Response {
            static_state: Some(static_state),
            dynamic_state,
            changes,
        })
    }

    /// Apply a request's stimuli to its document and produce the response.
    ///
    /// Any error discards the document: the next request presenting the same
    /// tokens rebuilds it from serialized state.
    pub fn handle(&self, request: Request, handler: &mut dyn EventHandler) -> Result<Response> {
        let Request {
            static_state,
            dynamic_state,
            stimuli,
        } = request;
        let tokens = TokenPair::parse(&static_state, &dynamic_state)?;
        let mut op = self
            .config
            .logger
            .as_ref()
            .map(|l| l.operation(TARGET, "request"));
        if let Some(op) = op.as_mut() {
            op.record("stimuli", stimuli.len())
                .record("session", tokens.static_state.is_session());
        }

        let cache = self.config.cache_documents;
        let work = |document: &mut FormDocument,
                    how: Checkout|
         -> Result<(Response, Option<PoolKey>)> {
            if let Some(op) = op.as_mut() {
                op.record("reused", how == Checkout::Reused);
            }
            let env = self.env();
            for stimulus in stimuli {
                document.apply(stimulus, &env, &mut *handler)?;
            }
            let changes = document.respond(false);
            let dynamic_state = self.persist(&tokens, document)?;
            let destination = cache.then(|| PoolKey::of(&static_state, &dynamic_state));
            let response = Response {
                static_state: None,
                dynamic_state,
                changes,
            };
            Ok((response, destination))
        };

        let result = if cache {
            self.pool
                .checkout(Some(&tokens.pool_key()), || self.rebuild(&tokens), work)
        } else {
            self.rebuild(&tokens)
                .and_then(|mut document| work(&mut document, Checkout::Rebuilt))
                .map(|(response, _)| response)
        };
        if let Err(err) = &result {
            emit(
                self.config.logger.as_ref(),
                LogLevel::Error,
                TARGET,
                "request failed",
                [json_str("error", err.to_string())],
            );
        }
        result
    }

    /// Emit a metrics snapshot through the configured logger.
    pub fn log_metrics(&self) {
        let (Some(logger), Some(metrics)) = (&self.config.logger, &self.config.metrics) else {
            return;
        };
        let snapshot = match metrics.lock() {
            Ok(guard) => guard.snapshot(self.started.elapsed()),
            Err(_) => return,
        };
        let _ = logger.log_event(snapshot.to_log_event(&self.config.metrics_target));
    }

    fn env(&self) -> DocumentEnv<'_> {
        DocumentEnv::new(self.evaluator.as_ref(), &self.shared, self.loader.as_ref())
            .with_logger(self.config.logger.as_ref())
            .with_metrics(self.config.metrics.as_ref())
            .with_audit(self.audit.as_ref())
    }

    fn rebuild(&self, tokens: &TokenPair) -> Result<FormDocument> {
        let (static_blob, dynamic_blob) = match (&tokens.static_state, &tokens.dynamic_state) {
            (StateToken::Inline(s), StateToken::Inline(d)) => (s.clone(), d.clone()),
            (StateToken::Session(s), StateToken::Session(d)) => self
                .store
                .find_state(s, d)
                .ok_or_else(|| StateError::Expired(d.clone()))?,
            _ => return Err(StateError::InconsistentTokens.into()),
        };
        let form: FormDefinition = self.codec.decode(&static_blob)?;
        let state: DynamicState = self.codec.decode(&dynamic_blob)?;
        emit(
            self.config.logger.as_ref(),
            LogLevel::Debug,
            TARGET,
            "document rebuilt from state",
            [json_str("form", form.id.clone()), json_kv("sequence", state.sequence)],
        );
        FormDocument::restore(Arc::new(form), state, &self.env())
    }

    /// Serialize the document's dynamic state and return the token the
    /// client must present next.
    fn persist(&self, tokens: &TokenPair, document: &FormDocument) -> Result<String> {
        let blob = self.codec.encode(&document.dynamic_state())?;
        match (&tokens.static_state, &tokens.dynamic_state) {
            (StateToken::Session(static_id), StateToken::Session(previous)) => {
                let static_blob = if self.store.contains(static_id) {
                    None
                } else {
                    Some(self.codec.encode(document.form().as_ref())?)
                };
                let dynamic_id = new_session_id();
                self.store.add_state(
                    static_id,
                    Some(previous.as_str()),
                    &dynamic_id,
                    static_blob.as_deref(),
                    &blob,
                    false,
                );
                Ok(StateToken::session(dynamic_id).to_string())
            }
            _ => Ok(blob),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::form::{ControlDef, ListenerDef};
    use crate::logging::{Logger, MemorySink};
    use crate::metrics::MetricSnapshot;
    use crate::model::{InstanceDocument, PathEvaluator};
    use crate::refresh::{EventKind, NullHandler, RecordingHandler};
    use crate::state::MapInstanceLoader;
    use std::time::Duration;

    fn form() -> FormDefinition {
        let mut doc = InstanceDocument::new("data");
        let root = doc.root();
        doc.append(root, "name", "Ada").unwrap();
        FormDefinition::new("greeting", ControlDef::group("root").child(ControlDef::input("name", "name")))
            .with_instance("main", doc)
            .with_listener(ListenerDef::global(EventKind::ValueChanged))
    }

    fn server(state_handling: StateHandling) -> FormServer {
        let mut config = EngineConfig {
            state_handling,
            ..EngineConfig::default()
        };
        config.enable_metrics();
        FormServer::new(
            config,
            Arc::new(PathEvaluator::new()),
            Arc::new(MapInstanceLoader::new()),
        )
    }

    fn set_name(response: &Response, static_state: &str, value: &str) -> Request {
        Request {
            static_state: static_state.to_string(),
            dynamic_state: response.dynamic_state.clone(),
            stimuli: vec![Stimulus::SetValue {
                control: "name".into(),
                value: value.into(),
            }],
        }
    }

    fn metrics(server: &FormServer) -> MetricSnapshot {
        server
            .config()
            .metrics_handle()
            .unwrap()
            .lock()
            .unwrap()
            .snapshot(Duration::ZERO)
    }

    #[test]
    fn inline_exchanges_reuse_the_pooled_document() {
        let server = server(StateHandling::Inline);
        let first = server.initialize(form(), &mut NullHandler).unwrap();
        let static_state = first.static_state.clone().unwrap();
        assert!(static_state.starts_with("v1."));

        let second = server
            .handle(set_name(&first, &static_state, "Grace"), &mut NullHandler)
            .unwrap();
        assert!(second.static_state.is_none());
        assert_eq!(second.changes.controls[0].value.as_deref(), Some("Grace"));
        assert_eq!(metrics(&server).pool_hits, 1);

        // Replaying the earlier tokens rebuilds from the inline blobs.
        let replay = server
            .handle(set_name(&first, &static_state, "Linus"), &mut NullHandler)
            .unwrap();
        assert_eq!(replay.changes.controls[0].value.as_deref(), Some("Linus"));
        assert_eq!(metrics(&server).pool_misses, 1);
    }

    #[test]
    fn session_exchanges_keep_state_server_side() {
        let server = server(StateHandling::Session);
        let first = server.initialize(form(), &mut NullHandler).unwrap();
        let static_state = first.static_state.clone().unwrap();
        assert!(static_state.starts_with(SESSION_PREFIX));
        assert_eq!(server.store().len(), 2);

        let second = server
            .handle(set_name(&first, &static_state, "Grace"), &mut NullHandler)
            .unwrap();
        assert!(second.dynamic_state.starts_with(SESSION_PREFIX));
        assert_ne!(second.dynamic_state, first.dynamic_state);
        // The initial dynamic entry is kept next to the new one.
        assert_eq!(server.store().len(), 3);

        let expired = Request {
            static_state: static_state.clone(),
            dynamic_state: "session:gone".into(),
            stimuli: Vec::new(),
        };
        assert!(matches!(
            server.handle(expired, &mut NullHandler),
            Err(EngineError::State(StateError::Expired(_)))
        ));
        let mixed = Request {
            static_state,
            dynamic_state: "v1.e30.00".into(),
            stimuli: Vec::new(),
        };
        assert!(matches!(
            server.handle(mixed, &mut NullHandler),
            Err(EngineError::State(StateError::InconsistentTokens))
        ));
    }

    #[test]
    fn failed_requests_discard_the_document() {
        let server = server(StateHandling::Inline);
        let first = server.initialize(form(), &mut NullHandler).unwrap();
        let static_state = first.static_state.clone().unwrap();

        let mut failing = RecordingHandler::new().fail_on("name", EventKind::ValueChanged);
        let err = server
            .handle(set_name(&first, &static_state, "Grace"), &mut failing)
            .unwrap_err();
        assert!(matches!(err, EngineError::Reconciliation { .. }));
        let key = PoolKey::of(&static_state, &first.dynamic_state);
        assert_eq!(server.pool().idle(&key), 0);
        assert_eq!(metrics(&server).pool_discards, 1);

        let retry = server
            .handle(set_name(&first, &static_state, "Grace"), &mut NullHandler)
            .unwrap();
        assert_eq!(retry.changes.controls[0].value.as_deref(), Some("Grace"));
    }

    #[test]
    fn metrics_snapshots_go_through_the_logger() {
        let sink = MemorySink::new();
        let mut config = EngineConfig {
            logger: Some(Logger::new(sink.clone())),
            cache_documents: false,
            ..EngineConfig::default()
        };
        config.enable_metrics();
        let server = FormServer::new(
            config,
            Arc::new(PathEvaluator::new()),
            Arc::new(MapInstanceLoader::new()),
        );
        let first = server.initialize(form(), &mut NullHandler).unwrap();
        let static_state = first.static_state.clone().unwrap();
        server
            .handle(set_name(&first, &static_state, "Grace"), &mut NullHandler)
            .unwrap();
        assert_eq!(server.pool().len(), 0);

        server.log_metrics();
        let events = sink.events();
        let snapshot = events.iter().rev().find(|e| e.message == "engine_metrics").unwrap();
        assert_eq!(snapshot.target, "formtree::metrics");
        let refreshes = snapshot.field("refreshes").and_then(|v| v.as_u64()).unwrap();
        assert!(refreshes >= 2);
    }

    #[test]
    fn blobs_from_another_secret_are_rejected() {
        let server = server(StateHandling::Inline);
        let other = FormServer::new(
            EngineConfig {
                state_secret: "someone else".into(),
                ..EngineConfig::default()
            },
            Arc::new(PathEvaluator::new()),
            Arc::new(MapInstanceLoader::new()),
        );
        let foreign = other.initialize(form(), &mut NullHandler).unwrap();
        let static_state = foreign.static_state.clone().unwrap();
        assert!(matches!(
            server.handle(set_name(&foreign, &static_state, "Eve"), &mut NullHandler),
            Err(EngineError::State(StateError::Checksum))
        ));
        // The issuing server still accepts its own blobs.
        assert!(
            other
                .handle(set_name(&foreign, &static_state, "Eve"), &mut NullHandler)
                .is_ok()
        );
    }

    #[test]
    fn one_server_serves_concurrent_requests() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FormServer>();

        let server = server(StateHandling::Inline);
        let first = server.initialize(form(), &mut NullHandler).unwrap();
        let static_state = first.static_state.clone().unwrap();
        let (server_ref, first_ref, static_ref) = (&server, &first, static_state.as_str());
        let responses: Vec<Response> = std::thread::scope(|scope| {
            let workers: Vec<_> = ["Grace", "Linus"]
                .into_iter()
                .map(|name| {
                    scope.spawn(move || {
                        server_ref
                            .handle(set_name(first_ref, static_ref, name), &mut NullHandler)
                            .unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(responses.len(), 2);
        let snapshot = metrics(&server);
        assert_eq!((snapshot.pool_hits, snapshot.pool_misses), (1, 1));
    }
}
