//! Node.js bridge backend
//!
//! Modules run inside one long-lived `node` child process. The two sides
//! exchange line-delimited JSON over stdin/stdout; every request carries an
//! id and is matched with its response. The Node side may call back into the
//! host for HTTP and extractor access while a request is in flight.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, info, warn};

use super::backend::{BackendKind, ExecuteRequest, ExecutionBackend};
use super::context::{ContextSpec, ModuleContext};
use super::http::HttpRequest;
use super::instance::LoadedExtensionInstance;
use super::isolate::{module_runtime_source, validate_factory_name};
use super::proxy::{script_error, RemoteChannel, RemoteInstance};
use crate::core::config::EngineConfig;
use crate::core::error::{ConsumetError, Result};

const HOST_SCRIPT: &str = include_str!("js/node_host.js");
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingRequest {
    id: String,
    responder: oneshot::Sender<Value>,
    created_at: Instant,
}

struct Shared {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    contexts: Mutex<HashMap<String, ModuleContext>>,
    ready: AtomicBool,
}

impl Shared {
    async fn send(&self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ConsumetError::BridgeError(format!("failed to write to node: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ConsumetError::BridgeError(format!("failed to flush node stdin: {}", e)))
    }

    /// Context of the module a callback claims to come from
    ///
    /// Callbacks without a `moduleId`, or naming an unregistered module, are refused.
    fn context(&self, module_id: Option<&str>) -> Result<ModuleContext> {
        let module_id = module_id.ok_or_else(|| {
            ConsumetError::ExecutionError("host callback does not name its module".to_string())
        })?;
        lock(&self.contexts).get(module_id).cloned().ok_or_else(|| {
            ConsumetError::ModuleNotFound(format!("no context registered for module {}", module_id))
        })
    }

    fn resolve(&self, message: Value) {
        let Some(id) = message.get("id").and_then(Value::as_str).map(str::to_string) else {
            debug!("Dropping node reply without id");
            return;
        };
        let pending = lock(&self.pending).remove(&id);
        match pending {
            Some(request) => {
                debug!(
                    request_id = %request.id,
                    elapsed_ms = request.created_at.elapsed().as_millis() as u64,
                    "Node request completed"
                );
                let _ = request.responder.send(message);
            }
            None => debug!(request_id = %id, "Dropping late node reply"),
        }
    }
}

async fn answer_extractor_call(shared: Arc<Shared>, id: String, payload: Value) {
    let module_id = payload.get("moduleId").and_then(Value::as_str);
    let name = payload.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let method = payload.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
    let args = match payload.get("args") {
        Some(Value::Array(args)) => args.clone(),
        _ => Vec::new(),
    };

    let outcome = match shared.context(module_id) {
        Ok(context) => match context.extractors() {
            Some(extractors) => extractors.call(&name, &method, args).await,
            None => Err(ConsumetError::ExecutionError(
                "extractors are only available to providers".to_string(),
            )),
        },
        Err(e) => Err(e),
    };

    let reply = match outcome {
        Ok(result) => json!({"type": "extractorResult", "id": id, "success": true, "result": result}),
        Err(e) => json!({"type": "extractorResult", "id": id, "success": false, "error": {"message": e.to_string()}}),
    };
    if let Err(e) = shared.send(&reply).await {
        warn!(error = %e, "Failed to answer extractor call");
    }
}

async fn answer_host_request(shared: Arc<Shared>, id: String, payload: Value) {
    let module_id = payload.get("moduleId").and_then(Value::as_str);
    let context = shared.context(module_id);
    let request: std::result::Result<HttpRequest, _> =
        serde_json::from_value(payload.get("request").cloned().unwrap_or(Value::Null));

    let outcome = match (context, request) {
        (Ok(context), Ok(request)) => {
            debug!(module_id = ?module_id, method = %request.method, url = %request.url, "Module HTTP request");
            context.capabilities().http.execute(request).await
        }
        (Err(e), _) => Err(e),
        (_, Err(e)) => Err(ConsumetError::DeserializationError(e.to_string())),
    };

    let reply = match outcome.and_then(|response| Ok(serde_json::to_value(response)?)) {
        Ok(result) => json!({"type": "hostResult", "id": id, "success": true, "result": result}),
        Err(e) => json!({"type": "hostResult", "id": id, "success": false, "error": {"message": e.to_string()}}),
    };
    if let Err(e) = shared.send(&reply).await {
        warn!(error = %e, "Failed to answer host request");
    }
}

fn handle_line(shared: &Arc<Shared>, line: &str) {
    let message: Value = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(_) => {
            debug!(line = %line, "Ignoring non-JSON output from node");
            return;
        }
    };

    match message.get("type").and_then(Value::as_str).unwrap_or_default() {
        "ready" => {
            shared.ready.store(true, Ordering::SeqCst);
            info!(pid = ?message.get("pid"), version = ?message.get("version"), "Node host ready");
        }
        "response" | "pong" => shared.resolve(message),
        "log" => {
            let module = message.get("module").and_then(Value::as_str).unwrap_or("node");
            let text = message.get("message").and_then(Value::as_str).unwrap_or_default();
            match message.get("level").and_then(Value::as_str).unwrap_or("info") {
                "error" => tracing::error!(module_id = %module, "{}", text),
                "warn" => tracing::warn!(module_id = %module, "{}", text),
                "debug" => tracing::debug!(module_id = %module, "{}", text),
                _ => tracing::info!(module_id = %module, "{}", text),
            }
        }
        kind @ ("extractorCall" | "hostRequest") => {
            let id = message.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let payload = message.get("payload").cloned().unwrap_or(Value::Null);
            let shared = shared.clone();
            if kind == "extractorCall" {
                tokio::spawn(answer_extractor_call(shared, id, payload));
            } else {
                tokio::spawn(answer_host_request(shared, id, payload));
            }
        }
        other => debug!(kind = %other, "Ignoring unknown node message"),
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => handle_line(&shared, &line),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from node");
                break;
            }
        }
    }

    shared.ready.store(false, Ordering::SeqCst);
    // Dropping the responders fails every waiter
    let abandoned = lock(&shared.pending).drain().count();
    if abandoned > 0 {
        warn!(abandoned, "Node output closed with requests in flight");
    }
}

/// Connection to a Node host speaking the line protocol
pub struct NodeBridge {
    shared: Arc<Shared>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl NodeBridge {
    /// Bridge over an arbitrary byte stream pair
    pub fn from_stream<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        });
        tokio::spawn(read_loop(shared.clone(), reader));

        Arc::new(Self {
            shared,
            child: tokio::sync::Mutex::new(None),
        })
    }

    /// Start `node` with the host script
    pub async fn spawn(node_binary: &Path) -> Result<Arc<Self>> {
        let script = format!("{}\n{}", module_runtime_source(), HOST_SCRIPT);
        let mut child = Command::new(node_binary)
            .arg("-e")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ConsumetError::InitializationError(format!(
                    "failed to start {}: {}",
                    node_binary.display(),
                    e
                ))
            })?;

        let missing = |what: &str| ConsumetError::InitializationError(format!("node {} is not piped", what));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "node", "{}", line);
                }
            });
        }

        info!(binary = %node_binary.display(), pid = ?child.id(), "Spawned node host");
        let bridge = Self::from_stream(stdout, stdin);
        *bridge.child.lock().await = Some(child);
        Ok(bridge)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Poll until the host has announced itself, or fail after `timeout`
    pub async fn wait_for_node_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_ready() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ConsumetError::Timeout(format!(
                    "node host not ready after {}s",
                    timeout.as_secs_f64()
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Send one request and wait for its reply
    ///
    /// Refused until the host has sent `ready`.
    async fn request(&self, kind: &str, payload: Value, timeout: Duration) -> Result<Value> {
        if !self.is_ready() {
            return Err(ConsumetError::BridgeError(format!(
                "node host is not ready; refusing {}",
                kind
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (responder, response) = oneshot::channel();
        lock(&self.shared.pending).insert(
            id.clone(),
            PendingRequest {
                id: id.clone(),
                responder,
                created_at: Instant::now(),
            },
        );

        let message = json!({"type": kind, "id": id, "payload": payload});
        if let Err(e) = self.shared.send(&message).await {
            lock(&self.shared.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ConsumetError::BridgeError(format!(
                "node closed before answering {}",
                kind
            ))),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                Err(ConsumetError::Timeout(format!(
                    "node did not answer {} within {}s",
                    kind,
                    timeout.as_secs_f64()
                )))
            }
        }
    }

    /// Round-trip latency
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.request("ping", Value::Null, CONTROL_TIMEOUT).await?;
        Ok(started.elapsed())
    }

    /// Run a provider operation in Node and return the reply envelope
    ///
    /// With `code`, the module is (re)evaluated first. Without `method`, the
    /// factory is called and the instance described as `{data, methods}`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_provider(
        &self,
        module_id: &str,
        code: Option<&str>,
        factory_name: &str,
        method: Option<&str>,
        args: Vec<Value>,
        spec: &ContextSpec,
        timeout: Duration,
    ) -> Result<Value> {
        let payload = json!({
            "moduleId": module_id,
            "providerCode": code,
            "factoryName": factory_name,
            "methodName": method,
            "args": args,
            "context": spec,
        });
        self.request("executeProvider", payload, timeout).await
    }

    pub fn register_context(&self, module_id: &str, context: ModuleContext) {
        lock(&self.shared.contexts).insert(module_id.to_string(), context);
    }

    /// Drop a module on both sides; the process keeps running
    pub async fn forget(&self, module_id: &str) -> Result<()> {
        lock(&self.shared.contexts).remove(module_id);
        self.request("unload", json!({"moduleId": module_id}), CONTROL_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shared.send(&json!({"type": "shutdown"})).await;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill node host");
            }
        }
        lock(&self.shared.pending).clear();
        self.shared.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn envelope_error_kind(envelope: &Value) -> Option<&str> {
    envelope.get("error").and_then(|e| e.get("kind")).and_then(Value::as_str)
}

fn envelope_result(envelope: Value, module_id: &str, factory: &str) -> Result<Value> {
    if envelope.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(envelope.get("result").cloned().unwrap_or(Value::Null));
    }
    let kind = envelope_error_kind(&envelope).unwrap_or("execution").to_string();
    let message = envelope
        .get("error")
        .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
        .unwrap_or("unknown node error")
        .to_string();
    Err(script_error(&kind, message, module_id, factory))
}

struct NodeChannel {
    bridge: Arc<NodeBridge>,
    module_id: String,
    factory_name: String,
    source: String,
    spec: ContextSpec,
    timeout: Duration,
}

#[async_trait]
impl RemoteChannel for NodeChannel {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let envelope = self
            .bridge
            .execute_provider(&self.module_id, None, &self.factory_name, Some(method), args.clone(), &self.spec, self.timeout)
            .await?;
        if envelope_error_kind(&envelope) != Some("module") {
            return Ok(envelope);
        }

        // The host lost the instance (restart or unload); rebuild it once
        debug!(module_id = %self.module_id, "Reloading module in node");
        let reloaded = self
            .bridge
            .execute_provider(&self.module_id, Some(&self.source), &self.factory_name, None, Vec::new(), &self.spec, self.timeout)
            .await?;
        envelope_result(reloaded, &self.module_id, &self.factory_name)?;
        self.bridge
            .execute_provider(&self.module_id, None, &self.factory_name, Some(method), args, &self.spec, self.timeout)
            .await
    }

    async fn close(&self) -> Result<()> {
        self.bridge.forget(&self.module_id).await
    }
}

/// Runs modules in a shared Node process started on first use
pub struct NodeBackend {
    node_binary: PathBuf,
    ready_timeout: Duration,
    load_timeout: Duration,
    call_timeout: Duration,
    bridge: OnceCell<Arc<NodeBridge>>,
}

impl NodeBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            node_binary: config.node_binary.clone(),
            ready_timeout: config.node_ready_timeout(),
            load_timeout: config.load_timeout(),
            call_timeout: config.execute_timeout(),
            bridge: OnceCell::new(),
        }
    }

    /// Backend over an already connected bridge
    pub fn with_bridge(bridge: Arc<NodeBridge>, config: &EngineConfig) -> Self {
        Self {
            bridge: OnceCell::new_with(Some(bridge)),
            ..Self::new(config)
        }
    }

    /// The bridge, spawned on first use, once its host has signalled `ready`
    async fn bridge(&self) -> Result<Arc<NodeBridge>> {
        let bridge = self
            .bridge
            .get_or_try_init(|| NodeBridge::spawn(&self.node_binary))
            .await?;
        bridge.wait_for_node_ready(self.ready_timeout).await?;
        Ok(bridge.clone())
    }

    pub async fn ping(&self) -> Result<Duration> {
        self.bridge().await?.ping().await
    }
}

#[async_trait]
impl ExecutionBackend for NodeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Node
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<LoadedExtensionInstance> {
        let ExecuteRequest {
            module_id,
            source,
            factory_name,
            context,
        } = request;
        validate_factory_name(&factory_name)?;

        let bridge = self.bridge().await?;
        let spec = context.spec(&module_id);
        bridge.register_context(&module_id, context);

        let described = bridge
            .execute_provider(&module_id, Some(&source), &factory_name, None, Vec::new(), &spec, self.load_timeout)
            .await
            .and_then(|envelope| envelope_result(envelope, &module_id, &factory_name));
        let description = match described {
            Ok(description) => description,
            Err(e) => {
                lock(&bridge.shared.contexts).remove(&module_id);
                return Err(e);
            }
        };

        let channel = Arc::new(NodeChannel {
            bridge,
            module_id: module_id.clone(),
            factory_name,
            source,
            spec,
            timeout: self.call_timeout,
        });
        Ok(Arc::new(RemoteInstance::from_description(
            module_id,
            BackendKind::Node.as_str(),
            &description,
            channel,
        )))
    }

    async fn shutdown(&self) -> Result<()> {
        match self.bridge.get() {
            Some(bridge) => bridge.shutdown().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::context::create_provider_context;
    use crate::extension::context::ContextConfig;
    use crate::extension::http::{HttpClient, HttpResponse};
    use crate::extension::instance::Property;
    use crate::extension::static_module::StaticModule;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};

    struct FakeNode {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeNode {
        async fn next(&mut self) -> Option<Value> {
            let line = self.lines.next_line().await.ok()??;
            serde_json::from_str(&line).ok()
        }

        async fn send(&mut self, message: Value) {
            let line = format!("{}\n", message);
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn connect() -> (Arc<NodeBridge>, FakeNode) {
        let (host_side, node_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (node_read, node_write) = tokio::io::split(node_side);
        let bridge = NodeBridge::from_stream(host_read, host_write);
        let node = FakeNode {
            lines: BufReader::new(node_read).lines(),
            writer: node_write,
        };
        (bridge, node)
    }

    /// Answers every request with its own label as the body
    struct LabelClient(&'static str);

    #[async_trait]
    impl HttpClient for LabelClient {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            Ok(HttpResponse {
                status: 200,
                status_text: "OK".to_string(),
                url: request.url,
                headers: HashMap::new(),
                body: self.0.to_string(),
            })
        }
    }

    async fn connect_ready() -> (Arc<NodeBridge>, FakeNode) {
        let (bridge, mut node) = connect();
        node.send(json!({"type": "ready", "pid": 1, "version": "v20.0.0"})).await;
        bridge.wait_for_node_ready(Duration::from_secs(2)).await.unwrap();
        (bridge, node)
    }

    fn spec(module_id: &str) -> ContextSpec {
        ModuleContext::from(create_provider_context(None).unwrap()).spec(module_id)
    }

    #[tokio::test]
    async fn test_ready_handshake_and_ping() {
        let (bridge, mut node) = connect();

        assert!(bridge.wait_for_node_ready(Duration::from_millis(150)).await.is_err());
        node.send(json!({"type": "ready", "pid": 42, "version": "v20.0.0"})).await;
        bridge.wait_for_node_ready(Duration::from_secs(2)).await.unwrap();

        let pinger = bridge.clone();
        let ping = tokio::spawn(async move { pinger.ping().await });
        let message = node.next().await.unwrap();
        assert_eq!(message["type"], "ping");
        node.send(json!({"type": "pong", "id": message["id"]})).await;

        ping.await.unwrap().unwrap();
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let (bridge, mut node) = connect_ready().await;
        let spec = spec("gogo");

        let caller = bridge.clone();
        let call = tokio::spawn(async move {
            caller
                .execute_provider("gogo", Some("x"), "createGogo", None, Vec::new(), &spec, Duration::from_millis(100))
                .await
        });
        let message = node.next().await.unwrap();
        assert_eq!(message["type"], "executeProvider");
        assert_eq!(message["payload"]["factoryName"], "createGogo");
        assert_eq!(message["payload"]["methodName"], Value::Null);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ConsumetError::Timeout(_)));
        assert_eq!(bridge.pending_count(), 0);

        // A late answer finds nothing waiting
        node.send(json!({"type": "response", "id": message["id"], "success": true})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_extractor_calls_from_node_are_answered() {
        let (bridge, mut node) = connect();
        let statics = HashMap::from([(
            "vidstreaming".to_string(),
            StaticModule::builder("vidstreaming")
                .method("extract", |args| async move { Ok(json!({"sources": [{"url": args[0]}]})) })
                .shared(),
        )]);
        let context = create_provider_context(Some(ContextConfig {
            static_extractors: statics,
            ..Default::default()
        }))
        .unwrap();
        bridge.register_context("gogo", context.into());

        node.send(json!({
            "type": "extractorCall",
            "id": "node-1",
            "payload": {"moduleId": "gogo", "name": "VidStreaming", "method": "extract", "args": ["https://v/1"]}
        }))
        .await;

        let reply = node.next().await.unwrap();
        assert_eq!(reply["type"], "extractorResult");
        assert_eq!(reply["id"], "node-1");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["result"]["sources"][0]["url"], "https://v/1");
    }

    #[tokio::test]
    async fn test_backend_reloads_lost_instances() {
        let (bridge, mut node) = connect();
        let loads = Arc::new(AtomicUsize::new(0));
        let seen_loads = loads.clone();

        tokio::spawn(async move {
            node.send(json!({"type": "ready", "pid": 7, "version": "v20.0.0"})).await;
            let mut lost_once = true;
            while let Some(message) = node.next().await {
                let payload = message["payload"].clone();
                if payload["providerCode"].is_string() {
                    seen_loads.fetch_add(1, Ordering::SeqCst);
                }
                let mut reply = match (message["type"].as_str(), payload["methodName"].as_str()) {
                    (Some("executeProvider"), None) => json!({
                        "success": true,
                        "result": {"data": {"name": "Gogo"}, "methods": ["search"]}
                    }),
                    (Some("executeProvider"), Some("search")) if lost_once => {
                        lost_once = false;
                        json!({"success": false, "error": {"kind": "module", "message": "Module gogo is not loaded"}})
                    }
                    (Some("executeProvider"), Some("search")) => json!({
                        "success": true,
                        "result": {"currentPage": 1, "hasNextPage": false, "results": [{"id": payload["args"][0]}]}
                    }),
                    (Some("unload"), _) => json!({"success": true}),
                    _ => continue,
                };
                reply["type"] = json!("response");
                reply["id"] = message["id"].clone();
                node.send(reply).await;
            }
        });

        let backend = NodeBackend::with_bridge(bridge.clone(), &EngineConfig::default());
        let instance = backend
            .execute(ExecuteRequest {
                module_id: "gogo".to_string(),
                source: "function createGogo(ctx) { return {}; }".to_string(),
                factory_name: "createGogo".to_string(),
                context: create_provider_context(None).unwrap().into(),
            })
            .await
            .unwrap();

        assert_eq!(instance.backend(), "node");
        assert_eq!(instance.property("name"), Property::Data(&json!("Gogo")));
        let results = instance.call("search", vec![json!("one piece")]).await.unwrap();
        assert_eq!(results["results"][0]["id"], "one piece");
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        instance.teardown().await.unwrap();
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_requests_are_refused_before_ready() {
        let (bridge, mut node) = connect();

        let err = bridge.ping().await.unwrap_err();
        assert!(matches!(err, ConsumetError::BridgeError(ref m) if m.contains("not ready")), "{}", err);
        assert_eq!(bridge.pending_count(), 0);

        let mut config = EngineConfig::default();
        config.node_ready_timeout_secs = 1;
        let backend = NodeBackend::with_bridge(bridge.clone(), &config);
        let err = backend
            .execute(ExecuteRequest {
                module_id: "gogo".to_string(),
                source: "function createGogo() { return {}; }".to_string(),
                factory_name: "createGogo".to_string(),
                context: create_provider_context(None).unwrap().into(),
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConsumetError::Timeout(_)), "{}", err);

        // Nothing reached the host while it was not ready
        node.send(json!({"type": "ready", "pid": 3, "version": "v20.0.0"})).await;
        bridge.wait_for_node_ready(Duration::from_secs(2)).await.unwrap();
        let pinger = bridge.clone();
        let ping = tokio::spawn(async move { pinger.ping().await });
        let message = node.next().await.unwrap();
        assert_eq!(message["type"], "ping");
        node.send(json!({"type": "pong", "id": message["id"]})).await;
        ping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_host_requests_use_their_own_module_context() {
        let (bridge, mut node) = connect_ready().await;
        for (module_id, label) in [("gogo", "gogo-client"), ("zoro", "zoro-client")] {
            let http: Arc<dyn HttpClient> = Arc::new(LabelClient(label));
            let context = create_provider_context(Some(ContextConfig {
                http_client: Some(http),
                ..Default::default()
            }))
            .unwrap();
            bridge.register_context(module_id, context.into());
        }

        for (id, module_id, expected) in [("r-1", "zoro", "zoro-client"), ("r-2", "gogo", "gogo-client")] {
            node.send(json!({
                "type": "hostRequest",
                "id": id,
                "payload": {"moduleId": module_id, "request": {"method": "GET", "url": "https://site.example/"}}
            }))
            .await;
            let reply = node.next().await.unwrap();
            assert_eq!(reply["type"], "hostResult");
            assert_eq!(reply["id"], id);
            assert_eq!(reply["success"], true);
            assert_eq!(reply["result"]["body"], expected);
        }

        for payload in [
            json!({"request": {"method": "GET", "url": "https://site.example/"}}),
            json!({"moduleId": "flixhq", "request": {"method": "GET", "url": "https://site.example/"}}),
        ] {
            node.send(json!({"type": "hostRequest", "id": "r-x", "payload": payload})).await;
            let reply = node.next().await.unwrap();
            assert_eq!(reply["success"], false);
        }

        node.send(json!({
            "type": "extractorCall",
            "id": "e-x",
            "payload": {"name": "VidStreaming", "method": "extract", "args": []}
        }))
        .await;
        let reply = node.next().await.unwrap();
        assert_eq!(reply["type"], "extractorResult");
        assert_eq!(reply["success"], false);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let mut config = EngineConfig::default();
        config.node_binary = PathBuf::from("/nonexistent/node-binary");
        let backend = NodeBackend::new(&config);
        let err = backend.ping().await.unwrap_err();
        assert!(matches!(err, ConsumetError::InitializationError(_)));
    }
}
