//! deno_core implementation of the hosting capability.
//!
//! V8 isolates are `!Send`, so every sandbox lives on a dedicated thread with
//! its own single-threaded tokio runtime. The thread owns one [`JsRuntime`]
//! that is bootstrapped once from the [`SandboxDefinition`] and then serves
//! invocations serially from a queue. The public handle is `Send + Sync`.
//!
//! An invocation that has to be forcibly stopped (CPU watchdog, event-loop
//! timeout, heap limit) leaves the isolate unusable. The sandbox is then
//! retired: its thread exits and the handle reports [`SandboxHandle::is_retired`].
//!
//! Queued invocations are not timed. A caller's guard starts when the sandbox
//! thread picks the job up, and a job whose caller has already gone away is
//! dropped without running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::{mpsc, oneshot};

use crate::bridge::{decode_envelope, Outcome};
use crate::error::SandboxError;
use crate::ops::{anvil_ext, Completion, InvocationCredential};
use crate::template::SandboxDefinition;
use crate::{DefinitionFactory, SandboxHandle, SandboxHost, UpstreamDispatcher};

/// Slack granted on top of [`HostConfig::timeout`] before a caller gives up on
/// a running invocation that failed to report back.
pub const INVOCATION_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the deno host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Maximum time a single invocation may run.
    pub timeout: Duration,
    /// V8 heap limit per sandbox in bytes.
    pub max_heap_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_heap_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Hosting capability backed by deno_core isolates.
pub struct DenoHost {
    config: HostConfig,
    upstream: Option<Arc<dyn UpstreamDispatcher>>,
    live: Mutex<HashMap<String, Weak<DenoSandbox>>>,
}

impl DenoHost {
    /// Create a host. `upstream` serves the fetch op of sandboxes that were
    /// defined with egress; without it every fetch fails.
    pub fn new(config: HostConfig, upstream: Option<Arc<dyn UpstreamDispatcher>>) -> Self {
        Self {
            config,
            upstream,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn find_live(&self, id: &str, digest: &str) -> Option<Arc<DenoSandbox>> {
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        live.retain(|_, w| w.strong_count() > 0);
        live.get(id)
            .and_then(Weak::upgrade)
            .filter(|s| s.digest == digest && !s.is_retired())
    }

    fn register(&self, sandbox: &Arc<DenoSandbox>) {
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        live.insert(sandbox.id.clone(), Arc::downgrade(sandbox));
    }
}

#[async_trait::async_trait]
impl SandboxHost for DenoHost {
    async fn instantiate(
        &self,
        id: &str,
        factory: DefinitionFactory,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let definition = factory()?;
        let digest = definition.digest();

        if let Some(existing) = self.find_live(id, &digest) {
            tracing::debug!(id = %id, "instantiate: reusing live sandbox");
            return Ok(existing);
        }

        tracing::debug!(id = %id, source_len = definition.source.len(), "instantiate: starting");

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Invocation>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let retired = Arc::new(AtomicBool::new(false));

        let thread_retired = retired.clone();
        let config = self.config.clone();
        let upstream = self.upstream.clone();
        std::thread::Builder::new()
            .name(format!("anvil-{}", id))
            .spawn(move || {
                sandbox_thread(definition, config, upstream, thread_retired, ready_tx, jobs_rx)
            })
            .map_err(|e| SandboxError::Execution(e.into()))?;

        ready_rx.await.map_err(|_| SandboxError::Instantiation {
            reason: "sandbox thread exited before reporting".into(),
        })??;

        let sandbox = Arc::new(DenoSandbox {
            id: id.to_string(),
            digest,
            jobs: jobs_tx,
            retired,
            guard: self.config.timeout.saturating_add(INVOCATION_GRACE),
        });
        self.register(&sandbox);
        tracing::debug!(id = %id, "instantiate: ready");
        Ok(sandbox)
    }
}

struct Invocation {
    credential: Option<String>,
    started: oneshot::Sender<()>,
    reply: oneshot::Sender<Result<Outcome, SandboxError>>,
}

/// Handle to a sandbox running on its own thread.
pub struct DenoSandbox {
    id: String,
    digest: String,
    jobs: mpsc::UnboundedSender<Invocation>,
    retired: Arc<AtomicBool>,
    guard: Duration,
}

#[async_trait::async_trait]
impl SandboxHandle for DenoSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, credential: Option<String>) -> Result<Outcome, SandboxError> {
        let retired = || SandboxError::Retired {
            id: self.id.clone(),
        };
        if self.is_retired() {
            return Err(retired());
        }

        let (started, started_rx) = oneshot::channel();
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Invocation {
                credential,
                started,
                reply,
            })
            .map_err(|_| retired())?;

        // Waiting behind other invocations is unbounded; the guard covers
        // only this invocation's own run.
        started_rx.await.map_err(|_| retired())?;
        match tokio::time::timeout(self.guard, rx).await {
            Ok(result) => result.map_err(|_| retired())?,
            Err(_elapsed) => {
                tracing::warn!(id = %self.id, "invocation overran its guard, retiring sandbox");
                self.retired.store(true, Ordering::SeqCst);
                Err(SandboxError::Timeout {
                    timeout_ms: self.guard.as_millis() as u64,
                })
            }
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

fn sandbox_thread(
    definition: SandboxDefinition,
    config: HostConfig,
    upstream: Option<Arc<dyn UpstreamDispatcher>>,
    retired: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), SandboxError>>,
    mut jobs: mpsc::UnboundedReceiver<Invocation>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            if ready.send(Err(SandboxError::Execution(e.into()))).is_err() {
                tracing::warn!("sandbox creator dropped");
            }
            return;
        }
    };

    rt.block_on(async move {
        let mut sandbox = match LoadedSandbox::load(&definition, &config, upstream) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                if ready.send(Err(e)).is_err() {
                    tracing::warn!(id = %definition.id, "sandbox creator dropped");
                }
                return;
            }
        };
        if ready.send(Ok(())).is_err() {
            return;
        }

        while let Some(job) = jobs.recv().await {
            if job.reply.is_closed() || job.started.send(()).is_err() {
                tracing::debug!(id = %definition.id, "caller gone, skipping queued invocation");
                continue;
            }
            let result = sandbox.invoke(job.credential, config.timeout).await;
            let fatal = matches!(&result, Err(e) if e.is_fatal_to_sandbox());
            if fatal {
                retired.store(true, Ordering::SeqCst);
            }
            if job.reply.send(result).is_err() {
                tracing::warn!(id = %definition.id, "invocation result receiver dropped");
            }
            if fatal {
                tracing::warn!(id = %definition.id, "sandbox retired");
                break;
            }
        }
    });
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed `HeapLimitState` owned by the
    // `LoadedSandbox` whose isolate registered this callback. The runtime field
    // is dropped before the state, so the isolate never outlives the box.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

// Field order matters: `runtime` must drop before `heap_state`.
struct LoadedSandbox {
    runtime: JsRuntime,
    heap_state: Box<HeapLimitState>,
    next_invocation: u32,
}

impl LoadedSandbox {
    fn load(
        definition: &SandboxDefinition,
        config: &HostConfig,
        upstream: Option<Arc<dyn UpstreamDispatcher>>,
    ) -> Result<Self, SandboxError> {
        let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![anvil_ext::init_ops_and_esm()],
            create_params: Some(create_params),
            ..Default::default()
        });

        {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            if let Some(egress) = &definition.egress {
                op_state.put(egress.clone());
                if let Some(upstream) = upstream {
                    op_state.put(upstream);
                }
            }
            op_state.put(InvocationCredential(None));
        }

        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );

        // From here on the struct owns both halves, so every exit drops them
        // in field order.
        let mut sandbox = Self {
            runtime,
            heap_state,
            next_invocation: 0,
        };

        let bootstrap = sandbox
            .runtime
            .execute_script("[anvil:bootstrap]", definition.source.clone());
        if sandbox.heap_state.triggered.load(Ordering::SeqCst) {
            return Err(SandboxError::HeapLimitExceeded);
        }
        bootstrap.map_err(|e| SandboxError::Instantiation {
            reason: e.to_string(),
        })?;

        Ok(sandbox)
    }

    /// Run the user function once and collect its envelope.
    ///
    /// A CPU watchdog thread terminates V8 if the timeout elapses (handles
    /// synchronous infinite loops); the event loop is bounded separately for
    /// code that is stuck awaiting.
    async fn invoke(
        &mut self,
        credential: Option<String>,
        timeout: Duration,
    ) -> Result<Outcome, SandboxError> {
        self.next_invocation = self.next_invocation.wrapping_add(1);
        let id = self.next_invocation;
        {
            let op_state = self.runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            let _ = op_state.try_take::<Completion>();
            op_state.put(InvocationCredential(credential));
        }

        let watchdog_handle = self.runtime.v8_isolate().thread_safe_handle();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog_timed_out = timed_out.clone();
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

        let watchdog = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout)
            {
                watchdog_timed_out.store(true, Ordering::SeqCst);
                watchdog_handle.terminate_execution();
            }
        });

        let exec_error = match self
            .runtime
            .execute_script("[anvil:invoke]", format!("globalThis.__anvilInvoke({id});"))
        {
            Ok(_) => {
                match tokio::time::timeout(
                    timeout,
                    self.runtime.run_event_loop(PollEventLoopOptions::default()),
                )
                .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => {
                        timed_out.store(true, Ordering::SeqCst);
                        Some("async timeout".to_string())
                    }
                }
            }
            Err(e) => Some(e.to_string()),
        };

        // The watchdog must be gone before the isolate handle can be dropped.
        let _ = cancel_tx.send(());
        let _ = watchdog.join();

        // Credentials never outlive the invocation that supplied them.
        self.runtime
            .op_state()
            .borrow_mut()
            .put(InvocationCredential(None));

        if self.heap_state.triggered.load(Ordering::SeqCst) {
            return Err(SandboxError::HeapLimitExceeded);
        }
        if timed_out.load(Ordering::SeqCst) {
            return Err(SandboxError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let completion = self.runtime.op_state().borrow_mut().try_take::<Completion>();
        match (completion, exec_error) {
            (Some(Completion(done, envelope)), _) if done == id => decode_envelope(&envelope),
            (Some(Completion(done, _)), _) => Err(SandboxError::Protocol {
                reason: format!("expected outcome of invocation {id}, got {done}"),
            }),
            (None, Some(message)) => Err(SandboxError::JsError {
                message,
                trace: String::new(),
            }),
            (None, None) => Err(SandboxError::Protocol {
                reason: "sandbox finished without reporting an outcome".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateBuilder;

    fn host() -> DenoHost {
        DenoHost::new(HostConfig::default(), None)
    }

    fn factory(id: &str, code: &str) -> DefinitionFactory {
        let id = id.to_string();
        let code = code.to_string();
        Box::new(move || TemplateBuilder::new(id).code(code).build())
    }

    #[tokio::test]
    async fn invokes_async_function() {
        let host = host();
        let sandbox = host
            .instantiate("t1", factory("t1", "async () => 41 + 1"))
            .await
            .unwrap();
        let outcome = sandbox.invoke(None).await.unwrap();
        assert_eq!(outcome, Outcome::Value(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn non_function_code_is_wrapped() {
        let host = host();
        let sandbox = host
            .instantiate("t2", factory("t2", "({ answer: 42 })"))
            .await
            .unwrap();
        let value = sandbox.invoke(None).await.unwrap().into_result().unwrap();
        assert_eq!(value["answer"], 42);
    }

    #[tokio::test]
    async fn sandbox_serves_repeated_invocations() {
        let host = host();
        let sandbox = host
            .instantiate("t3", factory("t3", "async () => [1, 2, 3].map(x => x * 2)"))
            .await
            .unwrap();
        for _ in 0..3 {
            let value = sandbox.invoke(None).await.unwrap().into_result().unwrap();
            assert_eq!(value, serde_json::json!([2, 4, 6]));
        }
    }

    #[tokio::test]
    async fn thrown_error_becomes_fault_and_sandbox_survives() {
        let host = host();
        let sandbox = host
            .instantiate("t4", factory("t4", r#"async () => { throw new Error("kaboom"); }"#))
            .await
            .unwrap();
        for _ in 0..2 {
            match sandbox.invoke(None).await.unwrap() {
                Outcome::Error(fault) => {
                    assert_eq!(fault.message, "kaboom");
                    assert!(fault.trace.contains("kaboom"));
                }
                other => panic!("expected fault, got {other:?}"),
            }
        }
        assert!(!sandbox.is_retired());
    }

    #[tokio::test]
    async fn non_serializable_result_is_a_fault() {
        let host = host();
        let sandbox = host
            .instantiate("t5", factory("t5", "async () => 10n"))
            .await
            .unwrap();
        let outcome = sandbox.invoke(None).await.unwrap();
        assert!(matches!(outcome, Outcome::Error(_)), "got {outcome:?}");
    }

    #[tokio::test]
    async fn undefined_result_is_null() {
        let host = host();
        let sandbox = host
            .instantiate("t6", factory("t6", "async () => {}"))
            .await
            .unwrap();
        let outcome = sandbox.invoke(None).await.unwrap();
        assert_eq!(outcome, Outcome::Value(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn syntax_error_fails_instantiation() {
        let host = host();
        let err = host
            .instantiate("t7", factory("t7", "async () => { return 1 +; }"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::Instantiation { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn fetch_is_unavailable_without_egress() {
        let host = host();
        let code = r#"async () => {
            try {
                await Deno.core.ops.op_anvil_fetch("GET", "https://example.com", false, "");
                return "ESCAPED";
            } catch (e) {
                return "CONTAINED";
            }
        }"#;
        let sandbox = host.instantiate("t8", factory("t8", code)).await.unwrap();
        let value = sandbox.invoke(None).await.unwrap().into_result().unwrap();
        assert_eq!(value, "CONTAINED");
    }

    #[tokio::test]
    async fn code_generation_is_blocked() {
        let host = host();
        let code = r#"async () => {
            const ctor = (() => {}).constructor;
            return ctor === undefined && typeof eval === "undefined";
        }"#;
        let sandbox = host.instantiate("t9", factory("t9", code)).await.unwrap();
        let value = sandbox.invoke(None).await.unwrap().into_result().unwrap();
        assert_eq!(value, true);
    }

    #[tokio::test]
    async fn cpu_loop_times_out_and_retires() {
        let host = DenoHost::new(
            HostConfig {
                timeout: Duration::from_millis(300),
                ..Default::default()
            },
            None,
        );
        let sandbox = host
            .instantiate("t10", factory("t10", "async () => { while (true) {} }"))
            .await
            .unwrap();

        let err = sandbox.invoke(None).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }), "got {err:?}");
        assert!(sandbox.is_retired());

        let err = sandbox.invoke(None).await.unwrap_err();
        assert!(matches!(err, SandboxError::Retired { .. }));
    }

    #[tokio::test]
    async fn same_id_and_source_reuses_sandbox() {
        let host = host();
        let a = host
            .instantiate("t11", factory("t11", "async () => 1"))
            .await
            .unwrap();
        let b = host
            .instantiate("t11", factory("t11", "async () => 1"))
            .await
            .unwrap();
        assert_eq!(a.id(), b.id());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn same_id_with_other_source_is_a_new_sandbox() {
        let host = host();
        let a = host
            .instantiate("t12", factory("t12", "async () => 'a'"))
            .await
            .unwrap();
        let b = host
            .instantiate("t12", factory("t12", "async () => 'b'"))
            .await
            .unwrap();
        assert_eq!(a.invoke(None).await.unwrap(), Outcome::Value("a".into()));
        assert_eq!(b.invoke(None).await.unwrap(), Outcome::Value("b".into()));
    }

    #[tokio::test]
    async fn literals_are_frozen() {
        let host = host();
        let id = "t13".to_string();
        let factory: DefinitionFactory = Box::new(move || {
            TemplateBuilder::new(id)
                .literal("spec", &serde_json::json!({"paths": {"/a": {"get": {"summary": "A"}}}}))?
                .code(
                    r#"async () => {
                        spec.paths["/a"].get.summary = "changed";
                        spec.extra = 1;
                        return [spec.paths["/a"].get.summary, spec.extra === undefined];
                    }"#,
                )
                .build()
        });
        let sandbox = host.instantiate("t13", factory).await.unwrap();
        let value = sandbox.invoke(None).await.unwrap().into_result().unwrap();
        assert_eq!(value, serde_json::json!(["A", true]));
    }

    fn busy_counter(id: &str, busy_ms: u64) -> DefinitionFactory {
        factory(
            id,
            &format!(
                r#"(() => {{
                    let runs = 0;
                    return async () => {{
                        const until = Date.now() + {busy_ms};
                        while (Date.now() < until) {{}}
                        return ++runs;
                    }};
                }})()"#
            ),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queue_wait_is_not_a_timeout() {
        // 12 x 250ms of work is past timeout + grace, but no single run is.
        let host = DenoHost::new(
            HostConfig {
                timeout: Duration::from_millis(500),
                ..Default::default()
            },
            None,
        );
        let sandbox = host.instantiate("t14", busy_counter("t14", 250)).await.unwrap();

        let calls: Vec<_> = (0..12)
            .map(|_| {
                let sandbox = sandbox.clone();
                tokio::spawn(async move { sandbox.invoke(None).await })
            })
            .collect();

        let mut runs = Vec::new();
        for call in calls {
            match call.await.unwrap().unwrap() {
                Outcome::Value(v) => runs.push(v.as_u64().unwrap()),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        runs.sort_unstable();
        assert_eq!(runs, (1..=12u64).collect::<Vec<_>>());
        assert!(!sandbox.is_retired());
    }

    #[tokio::test]
    async fn abandoned_queued_invocation_never_runs() {
        let host = host();
        let sandbox = host.instantiate("t15", busy_counter("t15", 300)).await.unwrap();

        let first = tokio::spawn({
            let sandbox = sandbox.clone();
            async move { sandbox.invoke(None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Queued behind `first`, then abandoned before it can start.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), sandbox.invoke(None)).await;
        assert!(abandoned.is_err());

        assert_eq!(first.await.unwrap().unwrap(), Outcome::Value(1.into()));
        assert_eq!(sandbox.invoke(None).await.unwrap(), Outcome::Value(2.into()));
    }
}
