//! Embedded V8 isolates
//!
//! Every capability a module can reach is a Rust op registered here. The
//! scripts under `js/` build fetch, axios, cheerio, URL and the CommonJS
//! loader on top of those ops.

use deno_core::{op2, v8, Extension, JsRuntime, Op, OpState, RuntimeOptions};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::oneshot;

use super::context::{Capabilities, ContextSpec, Extractors, ModuleContext};
use super::html::{HtmlNode, SelectScope};
use super::http::{HttpRequest, HttpResponse};
use super::proxy::script_error;
use crate::core::error::{ConsumetError, Result};

const HOST_BINDINGS: &str = include_str!("js/isolate_host.js");
const MODULE_RUNTIME: &str = include_str!("js/runtime.js");
const IN_PROCESS_ENTRY: &str = include_str!("js/in_process.js");

const UNLOAD_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    static ref IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier pattern is valid");
}

/// Factory names are spliced into generated scripts and must be identifiers
pub fn validate_factory_name(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(ConsumetError::ValidationError(format!(
            "factory name '{}' is not a valid identifier",
            name
        )))
    }
}

/// Source of the module loader shared by every JavaScript host
pub fn module_runtime_source() -> &'static str {
    MODULE_RUNTIME
}

/// Host state visible to the ops of one isolate
pub struct IsolateState {
    pub module_id: String,
    pub capabilities: Capabilities,
    pub extractors: Option<Extractors>,
    /// Receiver of `ConsumetNative.postMessage` calls, for page isolates
    pub outbox: Option<mpsc::Sender<String>>,
}

impl IsolateState {
    pub fn from_context(module_id: &str, context: &ModuleContext) -> Self {
        Self {
            module_id: module_id.to_string(),
            capabilities: context.capabilities().clone(),
            extractors: context.extractors().cloned(),
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, outbox: mpsc::Sender<String>) -> Self {
        self.outbox = Some(outbox);
        self
    }
}

fn with_state<T>(state: &OpState, f: impl FnOnce(&IsolateState) -> T) -> std::result::Result<T, anyhow::Error> {
    state
        .try_borrow::<IsolateState>()
        .map(f)
        .ok_or_else(|| anyhow::anyhow!("isolate state is not installed"))
}

#[derive(Deserialize)]
struct SelectArgs {
    html: String,
    selector: String,
    scope: SelectScope,
}

#[derive(Deserialize)]
struct ChildrenArgs {
    html: String,
    selector: Option<String>,
}

#[derive(Deserialize)]
struct TextArgs {
    html: String,
}

#[derive(Deserialize)]
struct UrlArgs {
    url: String,
    base: Option<String>,
}

#[derive(Debug, PartialEq, Serialize)]
struct UrlParts {
    href: String,
    protocol: String,
    username: String,
    password: String,
    host: String,
    hostname: String,
    port: String,
    pathname: String,
    search: String,
    hash: String,
}

#[derive(Deserialize)]
struct ConsoleRecord {
    level: String,
    module: String,
    message: String,
}

#[derive(Deserialize)]
struct ExtractorCall {
    name: String,
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Deserialize)]
struct TimerArgs {
    id: u32,
    ms: f64,
}

#[derive(Deserialize)]
struct TimerId {
    id: u32,
}

/// Armed timers keyed by JS timer id
///
/// A timer holds its cancel sender in `armed` until it fires or is cleared.
/// The receiver sits in `waiting` until `op_timer_wait` picks it up; a timer
/// cleared before that never sleeps.
#[derive(Default)]
struct TimerTable {
    armed: HashMap<u32, oneshot::Sender<()>>,
    waiting: HashMap<u32, oneshot::Receiver<()>>,
}

#[derive(Deserialize)]
struct PostMessageArgs {
    message: String,
}

#[op2(async)]
#[serde]
async fn op_http_request(
    state: Rc<RefCell<OpState>>,
    #[serde] request: HttpRequest,
) -> std::result::Result<HttpResponse, anyhow::Error> {
    let (module_id, client) = with_state(&state.borrow(), |s| {
        (s.module_id.clone(), s.capabilities.http.clone())
    })?;
    tracing::debug!(module_id = %module_id, method = %request.method, url = %request.url, "Module HTTP request");
    Ok(client.execute(request).await?)
}

#[op2]
#[serde]
fn op_html_select(
    state: &mut OpState,
    #[serde] args: SelectArgs,
) -> std::result::Result<Vec<HtmlNode>, anyhow::Error> {
    let parser = with_state(state, |s| s.capabilities.html.clone())?;
    Ok(parser.select(&args.html, &args.selector, args.scope)?)
}

#[op2]
#[serde]
fn op_html_children(
    state: &mut OpState,
    #[serde] args: ChildrenArgs,
) -> std::result::Result<Vec<HtmlNode>, anyhow::Error> {
    let parser = with_state(state, |s| s.capabilities.html.clone())?;
    Ok(parser.children(&args.html, args.selector.as_deref())?)
}

#[op2]
#[string]
fn op_html_text(
    state: &mut OpState,
    #[serde] args: TextArgs,
) -> std::result::Result<String, anyhow::Error> {
    let parser = with_state(state, |s| s.capabilities.html.clone())?;
    Ok(parser.text(&args.html))
}

fn parse_url(url: &str, base: Option<&str>) -> std::result::Result<UrlParts, url::ParseError> {
    let parsed = match base {
        Some(base) => url::Url::parse(base)?.join(url)?,
        None => url::Url::parse(url)?,
    };
    let hostname = parsed.host_str().unwrap_or_default().to_string();
    let port = parsed.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{}:{}", hostname, port)
    };

    Ok(UrlParts {
        href: parsed.to_string(),
        protocol: format!("{}:", parsed.scheme()),
        username: parsed.username().to_string(),
        password: parsed.password().unwrap_or_default().to_string(),
        host,
        hostname,
        port,
        pathname: parsed.path().to_string(),
        search: parsed.query().map(|q| format!("?{}", q)).unwrap_or_default(),
        hash: parsed.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
    })
}

#[op2]
#[serde]
fn op_url_parse(#[serde] args: UrlArgs) -> std::result::Result<UrlParts, anyhow::Error> {
    parse_url(&args.url, args.base.as_deref())
        .map_err(|e| anyhow::anyhow!("TypeError: Invalid URL '{}': {}", args.url, e))
}

#[op2]
fn op_log(#[serde] record: ConsoleRecord) {
    let ConsoleRecord { level, module, message } = record;
    match level.as_str() {
        "error" => tracing::error!(module_id = %module, "{}", message),
        "warn" => tracing::warn!(module_id = %module, "{}", message),
        "debug" => tracing::debug!(module_id = %module, "{}", message),
        _ => tracing::info!(module_id = %module, "{}", message),
    }
}

#[op2(async)]
#[serde]
async fn op_extractor_call(
    state: Rc<RefCell<OpState>>,
    #[serde] call: ExtractorCall,
) -> std::result::Result<serde_json::Value, anyhow::Error> {
    let (module_id, extractors) = with_state(&state.borrow(), |s| {
        (s.module_id.clone(), s.extractors.clone())
    })?;
    let extractors = extractors.ok_or_else(|| {
        ConsumetError::ExecutionError(format!("{}: extractors are only available to providers", module_id))
    })?;
    tracing::debug!(module_id = %module_id, extractor = %call.name, method = %call.method, "Extractor call");
    Ok(extractors.call(&call.name, &call.method, call.args).await?)
}

#[op2]
fn op_timer_arm(state: &mut OpState, #[serde] args: TimerId) -> std::result::Result<(), anyhow::Error> {
    let timers = state
        .try_borrow_mut::<TimerTable>()
        .ok_or_else(|| anyhow::anyhow!("timer table is not installed"))?;
    let (cancel, cancelled) = oneshot::channel();
    timers.armed.insert(args.id, cancel);
    timers.waiting.insert(args.id, cancelled);
    Ok(())
}

/// Resolves `true` once the delay passes, `false` if the timer was cleared first
#[op2(async)]
async fn op_timer_wait(
    state: Rc<RefCell<OpState>>,
    #[serde] args: TimerArgs,
) -> std::result::Result<bool, anyhow::Error> {
    let cancelled = state
        .borrow_mut()
        .try_borrow_mut::<TimerTable>()
        .and_then(|timers| timers.waiting.remove(&args.id));
    let Some(cancelled) = cancelled else {
        return Ok(false);
    };

    let ms = if args.ms.is_finite() && args.ms > 0.0 { args.ms as u64 } else { 0 };
    let fired = tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
        _ = cancelled => false,
    };

    if fired {
        if let Some(timers) = state.borrow_mut().try_borrow_mut::<TimerTable>() {
            timers.armed.remove(&args.id);
        }
    }
    Ok(fired)
}

#[op2]
fn op_timer_cancel(state: &mut OpState, #[serde] args: TimerId) {
    if let Some(timers) = state.try_borrow_mut::<TimerTable>() {
        timers.waiting.remove(&args.id);
        if let Some(cancel) = timers.armed.remove(&args.id) {
            let _ = cancel.send(());
        }
    }
}

#[op2]
fn op_post_message(
    state: &mut OpState,
    #[serde] args: PostMessageArgs,
) -> std::result::Result<(), anyhow::Error> {
    let outbox = with_state(state, |s| s.outbox.clone())?
        .ok_or_else(|| anyhow::anyhow!("this isolate has no message channel"))?;
    outbox
        .send(args.message)
        .map_err(|_| anyhow::anyhow!("message channel closed"))
}

fn host_extension() -> Extension {
    Extension {
        name: "consumet_host",
        ops: Cow::Borrowed(&[
            op_http_request::DECL,
            op_html_select::DECL,
            op_html_children::DECL,
            op_html_text::DECL,
            op_url_parse::DECL,
            op_log::DECL,
            op_extractor_call::DECL,
            op_timer_arm::DECL,
            op_timer_wait::DECL,
            op_timer_cancel::DECL,
            op_post_message::DECL,
        ]),
        ..Default::default()
    }
}

/// Failure reported by the module runtime
#[derive(Debug, Deserialize)]
struct ScriptFailure {
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Outcome {
    Success { result: String },
    Error { error: ScriptFailure },
    Pending,
    Missing,
}

fn classify_script_error(error: anyhow::Error) -> ConsumetError {
    let message = error.to_string();
    if message.contains("SyntaxError") {
        ConsumetError::SyntaxError(message)
    } else {
        ConsumetError::ExecutionError(message)
    }
}

/// One V8 isolate and the host state behind its ops
///
/// Not `Send`: an isolate stays on the thread that created it.
pub struct Isolate {
    runtime: JsRuntime,
    label: String,
    next_call: u64,
}

impl Isolate {
    /// Isolate with host bindings only (`ConsumetNative`, timers, console)
    pub fn new(state: IsolateState) -> Result<Self> {
        let label = state.module_id.clone();
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![host_extension()],
            ..Default::default()
        });
        {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(state);
            op_state.put(TimerTable::default());
        }

        let mut isolate = Self {
            runtime,
            label,
            next_call: 0,
        };
        isolate.install("<host_bindings>", HOST_BINDINGS)?;
        Ok(isolate)
    }

    /// Isolate that also carries the module loader, driven through [`Isolate::evaluate`] and friends
    pub fn for_modules(state: IsolateState) -> Result<Self> {
        let mut isolate = Self::new(state)?;
        isolate.install("<module_runtime>", MODULE_RUNTIME)?;
        isolate.install("<in_process>", IN_PROCESS_ENTRY)?;
        Ok(isolate)
    }

    fn install(&mut self, name: &'static str, code: &str) -> Result<()> {
        self.runtime
            .execute_script(name, code.to_string().into())
            .map(|_| ())
            .map_err(|e| ConsumetError::InitializationError(format!("{} failed: {}", name, e)))
    }

    /// Handle for terminating runaway execution from another thread
    pub fn termination_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Clear a termination requested through [`Isolate::termination_handle`]
    pub fn recover(&mut self) {
        self.runtime.v8_isolate().cancel_terminate_execution();
    }

    /// Run a script to completion of its synchronous part
    pub fn execute(&mut self, code: String) -> Result<()> {
        self.runtime
            .execute_script("<page_script>", code.into())
            .map(|_| ())
            .map_err(classify_script_error)
    }

    /// Drive pending ops and timers until nothing is left or `timeout` passes
    pub async fn run_event_loop(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.runtime.run_event_loop(Default::default())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(classify_script_error(e)),
            Err(_) => Err(ConsumetError::Timeout(format!(
                "{} did not settle within {}s",
                self.label,
                timeout.as_secs_f64()
            ))),
        }
    }

    async fn invoke(
        &mut self,
        op: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<std::result::Result<Value, ScriptFailure>> {
        self.next_call += 1;
        let call_id = self.next_call;
        let payload_json = serde_json::to_string(payload)?;

        // Call __consumet_invoke through the V8 API so payloads are never compiled as code
        {
            let scope = &mut self.runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);
            let bridge = |what: &str| ConsumetError::BridgeError(format!("{} failed", what));

            let invoke_name = v8::String::new(scope, "__consumet_invoke")
                .ok_or_else(|| bridge("allocating invoke name"))?;
            let invoke_val = global
                .get(scope, invoke_name.into())
                .ok_or_else(|| bridge("looking up __consumet_invoke"))?;
            let invoke_func = v8::Local::<v8::Function>::try_from(invoke_val)
                .map_err(|_| bridge("resolving __consumet_invoke"))?;

            let id_val = v8::Number::new(scope, call_id as f64);
            let op_val = v8::String::new(scope, op).ok_or_else(|| bridge("allocating op name"))?;
            let payload_str =
                v8::String::new(scope, &payload_json).ok_or_else(|| bridge("allocating payload"))?;
            let payload_val =
                v8::json::parse(scope, payload_str).ok_or_else(|| bridge("parsing payload"))?;

            let recv = v8::undefined(scope).into();
            let args = [id_val.into(), op_val.into(), payload_val];
            if invoke_func.call(scope, recv, &args).is_none() {
                return Err(bridge("calling __consumet_invoke"));
            }
        }

        let driven = self.drive_call(call_id, timeout).await;
        let outcome = self.take_outcome(call_id);

        // A recorded outcome wins over whatever the rest of the loop did
        match (outcome, driven) {
            (Ok(Outcome::Success { result }), _) => Ok(Ok(serde_json::from_str(&result)?)),
            (Ok(Outcome::Error { error }), _) => Ok(Err(error)),
            (_, Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Ok(Outcome::Pending), Ok(())) => Err(ConsumetError::ExecutionError(format!(
                "{}: {} never settled (a promise was left pending)",
                self.label, op
            ))),
            (Ok(Outcome::Missing), Ok(())) => Err(ConsumetError::BridgeError(format!(
                "{}: no outcome recorded for {}",
                self.label, op
            ))),
        }
    }

    /// Poll the event loop until call `call_id` settles, the loop runs dry or `timeout` passes
    ///
    /// Timers and ops the call leaves behind stay queued and keep running on later polls.
    async fn drive_call(&mut self, call_id: u64, timeout: Duration) -> Result<()> {
        let driven = tokio::time::timeout(
            timeout,
            std::future::poll_fn(|cx| {
                let polled = self.runtime.poll_event_loop(cx, Default::default());
                let settled = self.call_settled(call_id);
                match (polled, settled) {
                    (_, Ok(true)) => Poll::Ready(Ok(())),
                    (Poll::Ready(Err(e)), _) => Poll::Ready(Err(classify_script_error(e))),
                    (_, Err(e)) => Poll::Ready(Err(e)),
                    (Poll::Ready(Ok(())), Ok(false)) => Poll::Ready(Ok(())),
                    (Poll::Pending, Ok(false)) => Poll::Pending,
                }
            }),
        )
        .await;

        driven.unwrap_or_else(|_| {
            Err(ConsumetError::Timeout(format!(
                "{} did not settle within {}s",
                self.label,
                timeout.as_secs_f64()
            )))
        })
    }

    fn call_settled(&mut self, call_id: u64) -> Result<bool> {
        let value = self
            .runtime
            .execute_script(
                "<call_settled>",
                format!("globalThis.__consumet_settled({})", call_id).into(),
            )
            .map_err(|e| ConsumetError::BridgeError(e.to_string()))?;
        let scope = &mut self.runtime.handle_scope();
        Ok(v8::Local::new(scope, value).is_true())
    }

    fn take_outcome(&mut self, call_id: u64) -> Result<Outcome> {
        let value = self
            .runtime
            .execute_script(
                "<take_outcome>",
                format!("globalThis.__consumet_take({})", call_id).into(),
            )
            .map_err(|e| ConsumetError::BridgeError(e.to_string()))?;

        let text = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, value);
            local.to_rust_string_lossy(scope)
        };
        serde_json::from_str(&text)
            .map_err(|e| ConsumetError::BridgeError(format!("malformed outcome: {}", e)))
    }

    /// Evaluate `source` inside the CommonJS wrapper, returning its exported names
    pub async fn evaluate(
        &mut self,
        module_id: &str,
        source: &str,
        factory_name: Option<&str>,
        spec: &ContextSpec,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        if let Some(name) = factory_name {
            validate_factory_name(name)?;
        }
        let payload = json!({
            "moduleId": module_id,
            "source": source,
            "factoryName": factory_name,
            "spec": spec,
        });

        match self.invoke("evaluate", &payload, timeout).await? {
            Ok(value) => Ok(value
                .get("exportedKeys")
                .and_then(Value::as_array)
                .map(|keys| keys.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default()),
            Err(failure) => Err(script_error(
                &failure.kind,
                failure.message,
                module_id,
                factory_name.unwrap_or_default(),
            )),
        }
    }

    /// Call the module's factory with its context; returns `{data, methods}`
    pub async fn instantiate(&mut self, module_id: &str, factory_name: &str, timeout: Duration) -> Result<Value> {
        validate_factory_name(factory_name)?;
        let payload = json!({"moduleId": module_id, "factoryName": factory_name});
        self.invoke("instantiate", &payload, timeout)
            .await?
            .map_err(|f| script_error(&f.kind, f.message, module_id, factory_name))
    }

    pub async fn call(&mut self, module_id: &str, method: &str, args: Vec<Value>, timeout: Duration) -> Result<Value> {
        let payload = json!({"moduleId": module_id, "method": method, "args": args});
        self.invoke("call", &payload, timeout)
            .await?
            .map_err(|f| script_error(&f.kind, f.message, module_id, ""))
    }

    pub async fn unload(&mut self, module_id: &str) -> Result<()> {
        let payload = json!({"moduleId": module_id});
        self.invoke("unload", &payload, UNLOAD_TIMEOUT)
            .await?
            .map(|_| ())
            .map_err(|f| ConsumetError::ExecutionError(f.message))
    }
}
