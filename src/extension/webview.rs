//! WebView backend
//!
//! Each module runs in its own hidden page. The bridge injects the module
//! runtime and the source as scripts, then waits for the page to post back
//! `loaded`, `instantiated` and `result` messages. A page handles one
//! operation at a time; messages that do not match the pending operation
//! are dropped.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{mpsc as std_mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::{BackendKind, ExecuteRequest, ExecutionBackend};
use super::context::ModuleContext;
use super::instance::LoadedExtensionInstance;
use super::isolate::{module_runtime_source, validate_factory_name, IsolateState};
use super::proxy::{script_error, RemoteChannel, RemoteInstance};
use super::sandbox::IsolateWorker;
use crate::core::config::EngineConfig;
use crate::core::error::{ConsumetError, Result};

const PAGE_BRIDGE: &str = include_str!("js/webview_bridge.js");

pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Creates hidden pages
#[async_trait]
pub trait WebViewHost: Send + Sync {
    async fn create_page(&self, label: &str, context: &ModuleContext) -> Result<Arc<dyn WebViewPage>>;
}

/// One page. Scripts are fire-and-forget; answers arrive as messages.
#[async_trait]
pub trait WebViewPage: Send + Sync {
    async fn evaluate_javascript(&self, script: String) -> Result<()>;

    /// Receiver for every string the page posts through `ConsumetNative.postMessage`
    fn set_message_handler(&self, handler: MessageHandler);

    async fn destroy(&self) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Blocking countdown latch
pub struct CountdownLatch {
    count: Mutex<usize>,
    released: Condvar,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = lock(&self.count);
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.released.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *lock(&self.count)
    }

    /// Block until the count reaches zero; false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.count);
        let (guard, _) = self
            .released
            .wait_timeout_while(guard, timeout, |count| *count > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard == 0
    }
}

struct Expected {
    kind: &'static str,
    call_id: Option<String>,
    reply: Arc<Mutex<Option<Value>>>,
    latch: Arc<CountdownLatch>,
}

#[derive(Default)]
struct Inbox {
    expected: Mutex<Option<Expected>>,
}

impl Inbox {
    fn expect(&self, expected: Expected) {
        *lock(&self.expected) = Some(expected);
    }

    fn clear(&self) {
        lock(&self.expected).take();
    }

    fn deliver(&self, raw: String) {
        let message: Value = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed page message");
                return;
            }
        };
        let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
        let call_id = message.get("callId").and_then(Value::as_str);

        let mut expected = lock(&self.expected);
        let matches = expected.as_ref().map_or(false, |exp| {
            exp.kind == kind && (exp.call_id.is_none() || exp.call_id.as_deref() == call_id)
        });
        if !matches {
            debug!(kind = %kind, call_id = ?call_id, "Dropping page message with no pending operation");
            return;
        }
        if let Some(exp) = expected.take() {
            *lock(&exp.reply) = Some(message);
            exp.latch.count_down();
        }
    }
}

/// Host-side half of the bridge for one page
pub struct PageBridge {
    label: String,
    page: Arc<dyn WebViewPage>,
    inbox: Arc<Inbox>,
    op_lock: tokio::sync::Mutex<()>,
}

impl PageBridge {
    pub fn attach(label: impl Into<String>, page: Arc<dyn WebViewPage>) -> Arc<Self> {
        let inbox = Arc::new(Inbox::default());
        let handler_inbox = inbox.clone();
        page.set_message_handler(Arc::new(move |message| handler_inbox.deliver(message)));

        Arc::new(Self {
            label: label.into(),
            page,
            inbox,
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Evaluate `script` and wait for the message of `kind` it triggers
    async fn round_trip(
        &self,
        kind: &'static str,
        call_id: Option<String>,
        script: String,
        timeout: Duration,
    ) -> Result<Value> {
        let _guard = self.op_lock.lock().await;

        let latch = Arc::new(CountdownLatch::new(1));
        let reply = Arc::new(Mutex::new(None));
        self.inbox.expect(Expected {
            kind,
            call_id,
            reply: reply.clone(),
            latch: latch.clone(),
        });

        if let Err(e) = self.page.evaluate_javascript(script).await {
            self.inbox.clear();
            return Err(e);
        }

        let waiter = latch.clone();
        let arrived = tokio::task::spawn_blocking(move || waiter.wait_timeout(timeout))
            .await
            .map_err(|e| ConsumetError::BridgeError(format!("latch wait failed: {}", e)))?;
        self.inbox.clear();

        if !arrived {
            return Err(ConsumetError::Timeout(format!(
                "{}: no '{}' message within {}s",
                self.label,
                kind,
                timeout.as_secs_f64()
            )));
        }

        let message = lock(&reply).take();
        message.ok_or_else(|| ConsumetError::BridgeError(format!("{}: '{}' reply went missing", self.label, kind)))
    }

    pub async fn close(&self) -> Result<()> {
        self.page.destroy().await
    }
}

fn script_call(function: &str, payload: &Value) -> Result<String> {
    Ok(format!("globalThis.__consumetPage.{}({});", function, serde_json::to_string(payload)?))
}

fn failure(message: &Value, module_id: &str, factory: &str) -> ConsumetError {
    let error = message.get("error");
    let kind = error
        .and_then(|e| e.get("kind"))
        .and_then(Value::as_str)
        .unwrap_or("execution");
    let text = error
        .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
        .unwrap_or("unknown page error")
        .to_string();
    script_error(kind, text, module_id, factory)
}

fn succeeded(message: &Value) -> bool {
    message.get("success").and_then(Value::as_bool).unwrap_or(false)
}

struct PageChannel {
    module_id: String,
    bridge: Arc<PageBridge>,
    timeout: Duration,
}

#[async_trait]
impl RemoteChannel for PageChannel {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let script = script_call(
            "call",
            &json!({"callId": call_id, "moduleId": self.module_id, "method": method, "args": args}),
        )?;
        self.bridge.round_trip("result", Some(call_id), script, self.timeout).await
    }

    async fn close(&self) -> Result<()> {
        self.bridge.close().await
    }
}

pub struct WebViewBackend {
    host: Arc<dyn WebViewHost>,
    load_timeout: Duration,
    call_timeout: Duration,
}

impl WebViewBackend {
    pub fn new(host: Arc<dyn WebViewHost>, config: &EngineConfig) -> Self {
        Self {
            host,
            load_timeout: config.load_timeout(),
            call_timeout: config.execute_timeout(),
        }
    }

    async fn load_into(&self, bridge: &Arc<PageBridge>, request: &ExecuteRequest) -> Result<Value> {
        let module_id = request.module_id.as_str();
        let factory = request.factory_name.as_str();
        validate_factory_name(factory)?;

        let payload = json!({
            "moduleId": module_id,
            "source": request.source,
            "factoryName": factory,
            "spec": request.context.spec(module_id),
        });
        let script = format!(
            "{}\n{}\n{}",
            module_runtime_source(),
            PAGE_BRIDGE,
            script_call("load", &payload)?
        );

        let loaded = bridge.round_trip("loaded", None, script, self.load_timeout).await?;
        if !succeeded(&loaded) {
            return Err(failure(&loaded, module_id, factory));
        }
        debug!(module_id = %module_id, exported = %loaded["exportedKeys"], "Page loaded module");

        let script = script_call("instantiate", &json!({"moduleId": module_id, "factoryName": factory}))?;
        let instantiated = bridge
            .round_trip("instantiated", None, script, self.load_timeout)
            .await?;
        if !succeeded(&instantiated) {
            return Err(failure(&instantiated, module_id, factory));
        }
        Ok(instantiated)
    }
}

#[async_trait]
impl ExecutionBackend for WebViewBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WebView
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<LoadedExtensionInstance> {
        let page = self.host.create_page(&request.module_id, &request.context).await?;
        let bridge = PageBridge::attach(request.module_id.clone(), page);

        let description = match self.load_into(&bridge, &request).await {
            Ok(description) => description,
            Err(e) => {
                if let Err(close_err) = bridge.close().await {
                    warn!(module_id = %request.module_id, error = %close_err, "Failed to destroy page");
                }
                return Err(e);
            }
        };

        let channel = Arc::new(PageChannel {
            module_id: request.module_id.clone(),
            bridge,
            timeout: self.call_timeout,
        });
        Ok(Arc::new(RemoteInstance::from_description(
            request.module_id,
            BackendKind::WebView.as_str(),
            &description,
            channel,
        )))
    }
}

/// Pages backed by blank embedded isolates
///
/// Stands in for a platform WebView: each page is a fresh isolate offering
/// `ConsumetNative` and nothing else until the bridge injects its scripts.
#[derive(Debug, Default)]
pub struct IsolatePageHost {
    script_timeout: Option<Duration>,
}

impl IsolatePageHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script_timeout(timeout: Duration) -> Self {
        Self {
            script_timeout: Some(timeout),
        }
    }
}

#[async_trait]
impl WebViewHost for IsolatePageHost {
    async fn create_page(&self, label: &str, context: &ModuleContext) -> Result<Arc<dyn WebViewPage>> {
        let (outbox, messages) = std_mpsc::channel::<String>();
        let state = IsolateState::from_context(label, context).with_outbox(outbox);
        let worker = IsolateWorker::spawn_bare(format!("page-{}", label), state).await?;

        let handler: Arc<Mutex<Option<MessageHandler>>> = Arc::new(Mutex::new(None));
        let forward_to = handler.clone();
        thread::Builder::new()
            .name(format!("page-messages-{}", label))
            .spawn(move || {
                // Ends once the isolate and its outbox are dropped
                while let Ok(message) = messages.recv() {
                    let current = lock(&forward_to).clone();
                    match current {
                        Some(handler) => handler(message),
                        None => debug!("Page message arrived before a handler was set"),
                    }
                }
            })
            .map_err(|e| ConsumetError::InitializationError(format!("failed to spawn page message thread: {}", e)))?;

        Ok(Arc::new(IsolatePage {
            label: label.to_string(),
            worker: Arc::new(worker),
            handler,
            script_timeout: self.script_timeout.unwrap_or(Duration::from_secs(60)),
        }))
    }
}

struct IsolatePage {
    label: String,
    worker: Arc<IsolateWorker>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    script_timeout: Duration,
}

#[async_trait]
impl WebViewPage for IsolatePage {
    async fn evaluate_javascript(&self, script: String) -> Result<()> {
        let worker = self.worker.clone();
        let label = self.label.clone();
        let timeout = self.script_timeout;
        tokio::spawn(async move {
            if let Err(e) = worker.execute(script, timeout).await {
                warn!(page = %label, error = %e, "Page script failed");
            }
        });
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *lock(&self.handler) = Some(handler);
    }

    async fn destroy(&self) -> Result<()> {
        lock(&self.handler).take();
        self.worker.shutdown().await
    }
}
