//! In-process sandbox backend
//!
//! V8 isolates are single-threaded, so each loaded module gets a dedicated
//! worker thread that owns its isolate. Callers talk to the worker over a
//! command channel; the worker drives the isolate's event loop on a
//! current-thread Tokio runtime.

use async_trait::async_trait;
use deno_core::v8;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::backend::{BackendKind, ExecuteRequest, ExecutionBackend};
use super::context::ContextSpec;
use super::instance::{ExtensionInstance, LoadedExtensionInstance, Property};
use super::isolate::{Isolate, IsolateState};
use crate::core::config::EngineConfig;
use crate::core::error::{ConsumetError, Result};

/// Slack granted to the worker beyond its own timeout before the caller
/// terminates execution
const TERMINATION_GRACE: Duration = Duration::from_millis(500);

/// Command sent to an isolate worker thread
enum WorkerCommand {
    Evaluate {
        module_id: String,
        source: String,
        factory_name: Option<String>,
        spec: ContextSpec,
        timeout: Duration,
        resp: oneshot::Sender<Result<Vec<String>>>,
    },
    Instantiate {
        module_id: String,
        factory_name: String,
        timeout: Duration,
        resp: oneshot::Sender<Result<Value>>,
    },
    Call {
        module_id: String,
        method: String,
        args: Vec<Value>,
        timeout: Duration,
        resp: oneshot::Sender<Result<Value>>,
    },
    Execute {
        code: String,
        timeout: Duration,
        resp: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a thread that owns one isolate
pub struct IsolateWorker {
    name: String,
    tx: mpsc::Sender<WorkerCommand>,
    termination: v8::IsolateHandle,
}

impl IsolateWorker {
    /// Spawn a worker whose isolate carries the module loader
    pub async fn spawn(name: impl Into<String>, state: IsolateState) -> Result<Self> {
        Self::spawn_with(name.into(), state, true).await
    }

    /// Spawn a worker whose isolate only has host bindings
    pub async fn spawn_bare(name: impl Into<String>, state: IsolateState) -> Result<Self> {
        Self::spawn_with(name.into(), state, false).await
    }

    async fn spawn_with(name: String, state: IsolateState, with_loader: bool) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<WorkerCommand>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<v8::IsolateHandle>>();
        let worker_name = name.clone();

        thread::Builder::new()
            .name(format!("js-isolate-{}", name))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ConsumetError::InitializationError(format!(
                            "failed to create isolate runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let built = if with_loader {
                        Isolate::for_modules(state)
                    } else {
                        Isolate::new(state)
                    };
                    let mut isolate = match built {
                        Ok(isolate) => isolate,
                        Err(e) => {
                            error!(worker = %worker_name, error = %e, "Failed to create isolate");
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if ready_tx.send(Ok(isolate.termination_handle())).is_err() {
                        return;
                    }
                    debug!(worker = %worker_name, "Isolate worker ready");

                    while let Some(cmd) = rx.recv().await {
                        match cmd {
                            WorkerCommand::Evaluate {
                                module_id,
                                source,
                                factory_name,
                                spec,
                                timeout,
                                resp,
                            } => {
                                let result = isolate
                                    .evaluate(&module_id, &source, factory_name.as_deref(), &spec, timeout)
                                    .await;
                                let _ = resp.send(result);
                            }
                            WorkerCommand::Instantiate {
                                module_id,
                                factory_name,
                                timeout,
                                resp,
                            } => {
                                let result = isolate.instantiate(&module_id, &factory_name, timeout).await;
                                let _ = resp.send(result);
                            }
                            WorkerCommand::Call {
                                module_id,
                                method,
                                args,
                                timeout,
                                resp,
                            } => {
                                let result = isolate.call(&module_id, &method, args, timeout).await;
                                let _ = resp.send(result);
                            }
                            WorkerCommand::Execute { code, timeout, resp } => {
                                let result = match isolate.execute(code) {
                                    Ok(()) => isolate.run_event_loop(timeout).await,
                                    Err(e) => Err(e),
                                };
                                let _ = resp.send(result);
                            }
                            WorkerCommand::Shutdown { resp } => {
                                let _ = resp.send(Ok(()));
                                break;
                            }
                        }
                        // A caller may have terminated a runaway script
                        isolate.recover();
                    }

                    debug!(worker = %worker_name, "Isolate worker exiting");
                });
            })
            .map_err(|e| ConsumetError::InitializationError(format!("failed to spawn isolate thread: {}", e)))?;

        let termination = ready_rx
            .await
            .map_err(|_| ConsumetError::InitializationError("isolate worker exited during startup".to_string()))??;

        Ok(Self { name, tx, termination })
    }

    async fn request<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WorkerCommand,
    ) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(build(resp_tx))
            .await
            .map_err(|_| ConsumetError::ExecutionError(format!("isolate worker {} is gone", self.name)))?;

        match tokio::time::timeout(timeout + TERMINATION_GRACE, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsumetError::ExecutionError(format!(
                "isolate worker {} dropped the request",
                self.name
            ))),
            Err(_) => {
                self.termination.terminate_execution();
                Err(ConsumetError::Timeout(format!(
                    "{} did not respond within {}s",
                    self.name,
                    timeout.as_secs_f64()
                )))
            }
        }
    }

    pub async fn evaluate(
        &self,
        module_id: &str,
        source: &str,
        factory_name: Option<&str>,
        spec: ContextSpec,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        self.request(timeout, |resp| WorkerCommand::Evaluate {
            module_id: module_id.to_string(),
            source: source.to_string(),
            factory_name: factory_name.map(str::to_string),
            spec,
            timeout,
            resp,
        })
        .await
    }

    pub async fn instantiate(&self, module_id: &str, factory_name: &str, timeout: Duration) -> Result<Value> {
        self.request(timeout, |resp| WorkerCommand::Instantiate {
            module_id: module_id.to_string(),
            factory_name: factory_name.to_string(),
            timeout,
            resp,
        })
        .await
    }

    pub async fn call(&self, module_id: &str, method: &str, args: Vec<Value>, timeout: Duration) -> Result<Value> {
        self.request(timeout, |resp| WorkerCommand::Call {
            module_id: module_id.to_string(),
            method: method.to_string(),
            args,
            timeout,
            resp,
        })
        .await
    }

    /// Run a raw script and drive the event loop until it settles
    pub async fn execute(&self, code: String, timeout: Duration) -> Result<()> {
        self.request(timeout, |resp| WorkerCommand::Execute { code, timeout, resp })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(WorkerCommand::Shutdown { resp: resp_tx }).await.is_err() {
            // Already gone
            return Ok(());
        }
        resp_rx.await.unwrap_or(Ok(()))
    }
}

/// Runs each module in its own isolate inside this process
pub struct InProcessBackend {
    load_timeout: Duration,
    execute_timeout: Duration,
}

impl InProcessBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            load_timeout: config.load_timeout(),
            execute_timeout: config.execute_timeout(),
        }
    }
}

#[async_trait]
impl ExecutionBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<LoadedExtensionInstance> {
        let ExecuteRequest {
            module_id,
            source,
            factory_name,
            context,
        } = request;

        let spec = context.spec(&module_id);
        let worker = IsolateWorker::spawn(&module_id, IsolateState::from_context(&module_id, &context)).await?;

        let loaded = async {
            worker
                .evaluate(&module_id, &source, Some(&factory_name), spec, self.load_timeout)
                .await?;
            worker.instantiate(&module_id, &factory_name, self.load_timeout).await
        }
        .await;

        let description = match loaded {
            Ok(description) => description,
            Err(e) => {
                let _ = worker.shutdown().await;
                return Err(e);
            }
        };

        let instance = InProcessInstance::new(module_id, &description, worker, self.execute_timeout);
        info!(
            module_id = %instance.id,
            methods = instance.methods.len(),
            "Module instantiated in process"
        );
        Ok(Arc::new(instance))
    }
}

/// An instance living in a worker-owned isolate
///
/// Method names are known from instantiation, so unknown names fail without
/// a round trip.
pub struct InProcessInstance {
    id: String,
    data: Map<String, Value>,
    methods: Vec<String>,
    worker: IsolateWorker,
    call_timeout: Duration,
}

impl InProcessInstance {
    fn new(id: String, description: &Value, worker: IsolateWorker, call_timeout: Duration) -> Self {
        let data = description
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let methods = description
            .get("methods")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            id,
            data,
            methods,
            worker,
            call_timeout,
        }
    }
}

#[async_trait]
impl ExtensionInstance for InProcessInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend(&self) -> &'static str {
        BackendKind::InProcess.as_str()
    }

    fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    fn method_names(&self) -> Vec<String> {
        self.methods.clone()
    }

    fn property(&self, name: &str) -> Property<'_> {
        if let Some(value) = self.data.get(name) {
            return Property::Data(value);
        }
        if self.methods.iter().any(|m| m == name) {
            return Property::Method;
        }
        Property::Missing
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if !self.has_method(method) {
            return Err(ConsumetError::ExecutionError(format!(
                "{}.{} is not a function",
                self.id, method
            )));
        }
        debug!(module_id = %self.id, method = %method, "Calling in-process method");
        self.worker.call(&self.id, method, args, self.call_timeout).await
    }

    async fn teardown(&self) -> Result<()> {
        self.worker.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::context::{create_provider_context, ContextConfig};
    use crate::extension::static_module::StaticModule;
    use serde_json::json;
    use std::collections::HashMap;

    fn request(module_id: &str, source: &str, factory: &str) -> ExecuteRequest {
        let statics = HashMap::from([(
            "megacloud".to_string(),
            StaticModule::builder("megacloud")
                .method("extract", |args| async move {
                    Ok(json!({"sources": [{"url": args[0], "isM3U8": true}]}))
                })
                .shared(),
        )]);
        let context = create_provider_context(Some(ContextConfig {
            static_extractors: statics,
            ..Default::default()
        }))
        .unwrap();

        ExecuteRequest {
            module_id: module_id.to_string(),
            source: source.to_string(),
            factory_name: factory.to_string(),
            context: context.into(),
        }
    }

    fn backend() -> InProcessBackend {
        InProcessBackend::new(&EngineConfig::default())
    }

    const PROVIDER: &str = r#"
        function createZoro(ctx) {
            class Zoro extends ctx.AnimeParser {
                constructor() {
                    super();
                    this.name = 'Zoro';
                    this.baseUrl = 'https://zoro.example';
                }
                async fetchEpisodeSources(episodeId, server) {
                    return ctx.extractors.MegaCloud.extract(`${this.baseUrl}/embed/${episodeId}`);
                }
                async spin() {
                    for (;;) {}
                }
            }
            return new Zoro();
        }
    "#;

    #[tokio::test]
    async fn test_execute_and_call_through_extractors() {
        let instance = backend().execute(request("zoro", PROVIDER, "createZoro")).await.unwrap();

        assert_eq!(instance.backend(), "in_process");
        assert_eq!(instance.property("name"), Property::Data(&json!("Zoro")));
        assert_eq!(instance.property("fetchEpisodeSources"), Property::Method);
        assert_eq!(instance.property("nope"), Property::Missing);

        let sources = instance
            .call("fetchEpisodeSources", vec![json!("ep-1")])
            .await
            .unwrap();
        assert_eq!(sources["sources"][0]["url"], "https://zoro.example/embed/ep-1");

        let err = instance.call("search", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("zoro.search is not a function"));

        instance.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_factory_is_reported() {
        let err = backend()
            .execute(request("zoro", PROVIDER, "createGogo"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConsumetError::FactoryNotFound { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_runaway_script_is_terminated() {
        let mut config = EngineConfig::default();
        config.execute_timeout_secs = 1;
        let instance = InProcessBackend::new(&config)
            .execute(request("zoro", PROVIDER, "createZoro"))
            .await
            .unwrap();

        let err = instance.call("spin", vec![]).await.unwrap_err();
        assert!(matches!(err, ConsumetError::Timeout(_)), "{:?}", err);
        instance.teardown().await.unwrap();
    }
}
