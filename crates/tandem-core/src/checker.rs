//! Persistent checker worker pool.
//!
//! A fixed number of long-lived child processes speak newline-delimited JSON
//! over stdin/stdout, one request in flight per worker. Timeouts free the
//! worker without killing it; worker death fails the in-flight request and a
//! replacement is spawned behind a per-slot single-flight guard.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use smol_str::SmolStr;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::CheckerConfig;
use crate::diagnostics::Diagnostic;
use crate::epoch_ms;
use crate::error::AnalysisError;
use crate::protocol::{CheckerRequest, CheckerResponse, Completion, LineDecoder, TypeInfo};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const SHUTDOWN_FORCE: Duration = Duration::from_secs(5);

/// Inspector row for one worker process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub pid: u32,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_uri: Option<SmolStr>,
    pub started_at_ms: u64,
    pub request_count: u64,
    pub last_health_ms: u64,
}

/// Diagnostics produced by one checker pass.
#[derive(Debug, Clone)]
pub struct CheckerAnalysis {
    pub diagnostics: Vec<Diagnostic>,
    pub duration_ms: u64,
}

struct Worker {
    generation: u64,
    pid: u32,
    busy: bool,
    active_uri: Option<SmolStr>,
    started_at_ms: u64,
    request_count: u64,
    last_health_ms: u64,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    child: Arc<tokio::sync::Mutex<Child>>,
    /// Completion for the single in-flight request; taken on response,
    /// timeout, or death. `None` means the worker is idle.
    listener: Arc<Mutex<Option<oneshot::Sender<CheckerResponse>>>>,
    reader: JoinHandle<()>,
}

struct Pending {
    request: CheckerRequest,
    uri: SmolStr,
    reply: oneshot::Sender<Result<CheckerResponse, AnalysisError>>,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Option<Worker>>,
    queue: VecDeque<Pending>,
    respawning: Vec<bool>,
}

struct Dispatch {
    slot: usize,
    generation: u64,
    pid: u32,
    uri: SmolStr,
    line: String,
    timeout_ms: u64,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    listener: Arc<Mutex<Option<oneshot::Sender<CheckerResponse>>>>,
    response: oneshot::Receiver<CheckerResponse>,
    reply: oneshot::Sender<Result<CheckerResponse, AnalysisError>>,
}

struct PoolInner {
    config: RwLock<CheckerConfig>,
    state: Mutex<PoolState>,
    shutting_down: AtomicBool,
    started: AtomicBool,
    generation: AtomicU64,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

/// The pool handle.
#[derive(Clone)]
pub struct CheckerPool {
    inner: Arc<PoolInner>,
}

impl CheckerPool {
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config: RwLock::new(config),
                state: Mutex::new(PoolState::default()),
                shutting_down: AtomicBool::new(false),
                started: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawns the workers and begins the health and liveness timers.
    ///
    /// Fails only when no worker at all could be spawned; partial pools run
    /// and the liveness timer keeps retrying vacant slots.
    pub async fn start(&self) -> Result<(), AnalysisError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pool_size = self.inner.config.read().pool_size.max(1);
        {
            let mut state = self.inner.state.lock();
            state.workers = (0..pool_size).map(|_| None).collect();
            state.respawning = vec![false; pool_size];
        }

        let mut last_error = None;
        let mut spawned = 0usize;
        for slot in 0..pool_size {
            match spawn_worker(&self.inner, slot).await {
                Ok(worker) => {
                    self.inner.state.lock().workers[slot] = Some(worker);
                    spawned += 1;
                }
                Err(err) => {
                    warn!("Failed to spawn checker worker {slot}: {err}");
                    last_error = Some(err);
                }
            }
        }
        if spawned == 0 {
            return Err(last_error.unwrap_or_else(|| {
                AnalysisError::AnalyzerFailed(SmolStr::new("checker pool is empty"))
            }));
        }
        info!("Checker pool started with {spawned}/{pool_size} workers");

        let mut timers = self.inner.timers.lock();
        timers.push(spawn_health_timer(self.inner.clone()));
        timers.push(spawn_liveness_timer(self.inner.clone()));
        Ok(())
    }

    /// Full analysis of one file.
    pub async fn analyze(
        &self,
        uri: &str,
        content: &str,
    ) -> Result<CheckerAnalysis, AnalysisError> {
        let flags = self.inner.config.read().flags.clone();
        let started = Instant::now();
        let response = self
            .request(CheckerRequest::Analyze {
                uri: SmolStr::new(uri),
                content: content.to_string(),
                flags,
            })
            .await?;
        match response {
            CheckerResponse::Result {
                diagnostics,
                duration_ms,
                ..
            } => {
                let duration_ms =
                    duration_ms.unwrap_or_else(|| started.elapsed().as_millis() as u64);
                let diagnostics = diagnostics
                    .into_iter()
                    .map(|raw| raw.into_diagnostic(uri, duration_ms))
                    .collect();
                Ok(CheckerAnalysis {
                    diagnostics,
                    duration_ms,
                })
            }
            CheckerResponse::Error { error, .. } => Err(AnalysisError::AnalyzerFailed(
                SmolStr::new(error.unwrap_or_else(|| "checker error".to_string())),
            )),
        }
    }

    /// Type information at a position.
    pub async fn type_info(
        &self,
        uri: &str,
        content: &str,
        line: u32,
        column: u32,
    ) -> Result<Option<TypeInfo>, AnalysisError> {
        let response = self
            .request(CheckerRequest::TypeInfo {
                uri: SmolStr::new(uri),
                content: content.to_string(),
                line,
                column,
            })
            .await?;
        match response {
            CheckerResponse::Result { type_info, .. } => Ok(type_info),
            CheckerResponse::Error { error, .. } => Err(AnalysisError::AnalyzerFailed(
                SmolStr::new(error.unwrap_or_else(|| "checker error".to_string())),
            )),
        }
    }

    /// Completion items at a position.
    pub async fn completions(
        &self,
        uri: &str,
        content: &str,
        line: u32,
        column: u32,
    ) -> Result<Vec<Completion>, AnalysisError> {
        let response = self
            .request(CheckerRequest::Completions {
                uri: SmolStr::new(uri),
                content: content.to_string(),
                line,
                column,
            })
            .await?;
        match response {
            CheckerResponse::Result { completions, .. } => Ok(completions),
            CheckerResponse::Error { error, .. } => Err(AnalysisError::AnalyzerFailed(
                SmolStr::new(error.unwrap_or_else(|| "checker error".to_string())),
            )),
        }
    }

    /// Applies new settings to future requests and spawns.
    pub fn update_config(&self, config: CheckerConfig) {
        *self.inner.config.write() = config;
    }

    /// Inspector rows for the live workers.
    pub fn workers(&self) -> Vec<WorkerStatus> {
        let state = self.inner.state.lock();
        state
            .workers
            .iter()
            .flatten()
            .map(|worker| WorkerStatus {
                pid: worker.pid,
                busy: worker.busy,
                active_uri: worker.active_uri.clone(),
                started_at_ms: worker.started_at_ms,
                request_count: worker.request_count,
                last_health_ms: worker.last_health_ms,
            })
            .collect()
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Graceful stop: shutdown request, grace wait, then kill.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for timer in self.inner.timers.lock().drain(..) {
            timer.abort();
        }
        let (queued, workers) = {
            let mut state = self.inner.state.lock();
            let queued = std::mem::take(&mut state.queue);
            let workers: Vec<Worker> = state
                .workers
                .iter_mut()
                .filter_map(|slot| slot.take())
                .collect();
            (queued, workers)
        };
        for pending in queued {
            let _ = pending.reply.send(Err(AnalysisError::ShuttingDown));
        }
        let line = CheckerRequest::Shutdown
            .to_line()
            .unwrap_or_else(|_| "{\"type\":\"shutdown\"}\n".to_string());
        for worker in workers {
            drop(worker.listener.lock().take());
            {
                let mut stdin = worker.stdin.lock().await;
                let _ = stdin.write_all(line.as_bytes()).await;
                let _ = stdin.flush().await;
            }
            let mut child = worker.child.lock().await;
            if timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                let _ = child.start_kill();
                if timeout(SHUTDOWN_FORCE, child.wait()).await.is_err() {
                    warn!("Checker worker (pid {}) survived force kill window", worker.pid);
                }
            }
            worker.reader.abort();
        }
    }

    async fn request(
        &self,
        request: CheckerRequest,
    ) -> Result<CheckerResponse, AnalysisError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AnalysisError::ShuttingDown);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(AnalysisError::AnalyzerFailed(SmolStr::new(
                "checker pool has not been started",
            )));
        }
        let uri = request.uri().cloned().unwrap_or_default();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            state.queue.push_back(Pending {
                request,
                uri,
                reply: reply_tx,
            });
        }
        self.inner.pump();
        reply_rx.await.map_err(|_| AnalysisError::ChannelClosed)?
    }
}

impl PoolInner {
    /// Dispatches queued requests onto idle workers.
    fn pump(self: &Arc<Self>) {
        loop {
            let dispatch = {
                let timeout_ms = self.config.read().file_timeout_ms;
                let mut state = self.state.lock();
                if state.queue.is_empty() {
                    return;
                }
                let Some(slot) = state
                    .workers
                    .iter()
                    .position(|worker| worker.as_ref().is_some_and(|w| !w.busy))
                else {
                    return;
                };
                let Some(pending) = state.queue.pop_front() else {
                    return;
                };
                let line = match pending.request.to_line() {
                    Ok(line) => line,
                    Err(err) => {
                        let _ = pending.reply.send(Err(AnalysisError::Protocol(SmolStr::new(
                            err.to_string(),
                        ))));
                        continue;
                    }
                };
                let Some(worker) = state.workers[slot].as_mut() else {
                    continue;
                };
                worker.busy = true;
                worker.active_uri = Some(pending.uri.clone());
                worker.request_count += 1;
                let (response_tx, response_rx) = oneshot::channel();
                *worker.listener.lock() = Some(response_tx);
                Dispatch {
                    slot,
                    generation: worker.generation,
                    pid: worker.pid,
                    uri: pending.uri,
                    line,
                    timeout_ms,
                    stdin: worker.stdin.clone(),
                    listener: worker.listener.clone(),
                    response: response_rx,
                    reply: pending.reply,
                }
            };
            let inner = self.clone();
            tokio::spawn(async move {
                run_request(inner, dispatch).await;
            });
        }
    }

    /// Marks a worker idle again, if it is still the same process.
    fn release_worker(&self, slot: usize, generation: u64) {
        let mut state = self.state.lock();
        if let Some(worker) = state.workers.get_mut(slot).and_then(Option::as_mut) {
            if worker.generation == generation {
                worker.busy = false;
                worker.active_uri = None;
            }
        }
    }
}

async fn run_request(inner: Arc<PoolInner>, dispatch: Dispatch) {
    {
        let mut stdin = dispatch.stdin.lock().await;
        let write = async {
            stdin.write_all(dispatch.line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(err) = write.await {
            drop(stdin);
            // The reader will observe the dead pipe; free the slot now.
            drop(dispatch.listener.lock().take());
            inner.release_worker(dispatch.slot, dispatch.generation);
            let _ = dispatch
                .reply
                .send(Err(AnalysisError::Io(SmolStr::new(err.to_string()))));
            inner.pump();
            return;
        }
    }

    match timeout(Duration::from_millis(dispatch.timeout_ms), dispatch.response).await {
        Ok(Ok(response)) => {
            inner.release_worker(dispatch.slot, dispatch.generation);
            let _ = dispatch.reply.send(Ok(response));
            inner.pump();
        }
        Ok(Err(_)) => {
            // Listener dropped: the worker died or the pool is stopping.
            let error = if inner.shutting_down.load(Ordering::SeqCst) {
                AnalysisError::ShuttingDown
            } else {
                AnalysisError::WorkerExited { pid: dispatch.pid }
            };
            let _ = dispatch.reply.send(Err(error));
        }
        Err(_) => {
            // Timed out: detach the listener so a late reply is discarded as
            // an idle line, and keep the worker alive.
            drop(dispatch.listener.lock().take());
            inner.release_worker(dispatch.slot, dispatch.generation);
            let _ = dispatch.reply.send(Err(AnalysisError::Timeout {
                uri: dispatch.uri,
                after_ms: dispatch.timeout_ms,
            }));
            inner.pump();
        }
    }
}

async fn spawn_worker(inner: &Arc<PoolInner>, slot: usize) -> Result<Worker, AnalysisError> {
    let config = inner.config.read().clone();
    let binary = config.binary();
    let mut command = Command::new(&binary);
    command.arg("--lsp-stdio");
    command.args(&config.flags);
    command.env(
        "NODE_OPTIONS",
        format!("--max-old-space-size={}", config.max_memory_mb),
    );
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|err| AnalysisError::Spawn {
        binary: SmolStr::new(binary.to_string_lossy().as_ref()),
        message: SmolStr::new(err.to_string()),
    })?;
    let pid = child.id().unwrap_or(0);
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AnalysisError::Protocol(SmolStr::new("checker stdin not piped")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AnalysisError::Protocol(SmolStr::new("checker stdout not piped")))?;

    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let listener: Arc<Mutex<Option<oneshot::Sender<CheckerResponse>>>> =
        Arc::new(Mutex::new(None));
    let reader = spawn_reader(inner.clone(), slot, generation, stdout, listener.clone());
    debug!("Spawned checker worker {slot} (pid {pid})");
    let now = epoch_ms();
    Ok(Worker {
        generation,
        pid,
        busy: false,
        active_uri: None,
        started_at_ms: now,
        request_count: 0,
        last_health_ms: now,
        stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
        child: Arc::new(tokio::sync::Mutex::new(child)),
        listener,
        reader,
    })
}

fn spawn_reader(
    inner: Arc<PoolInner>,
    slot: usize,
    generation: u64,
    mut stdout: tokio::process::ChildStdout,
    listener: Arc<Mutex<Option<oneshot::Sender<CheckerResponse>>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = LineDecoder::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    for line in decoder.push(&chunk[..read]) {
                        match serde_json::from_str::<CheckerResponse>(&line) {
                            Ok(response) => {
                                let sender = listener.lock().take();
                                match sender {
                                    Some(sender) => {
                                        let _ = sender.send(response);
                                    }
                                    None => {
                                        debug!(
                                            "Checker worker {slot}: discarding line while idle"
                                        );
                                    }
                                }
                            }
                            Err(err) => {
                                debug!(
                                    "Checker worker {slot}: discarding unparseable line: {err}"
                                );
                            }
                        }
                    }
                }
            }
        }
        handle_worker_exit(&inner, slot, generation).await;
    })
}

/// Removes a dead worker, fails its in-flight request, and respawns.
async fn handle_worker_exit(inner: &Arc<PoolInner>, slot: usize, generation: u64) {
    if inner.shutting_down.load(Ordering::SeqCst) {
        return;
    }
    let removed = {
        let mut state = inner.state.lock();
        match state.workers.get_mut(slot) {
            Some(entry) if entry.as_ref().is_some_and(|w| w.generation == generation) => {
                entry.take()
            }
            _ => None,
        }
    };
    let Some(worker) = removed else {
        return;
    };
    warn!("Checker worker (pid {}) exited; scheduling respawn", worker.pid);
    // Failing the in-flight listener frees the caller immediately.
    drop(worker.listener.lock().take());
    respawn_slot(inner, slot).await;
}

/// Single-flight respawn of one slot; queued requests re-dispatch after.
async fn respawn_slot(inner: &Arc<PoolInner>, slot: usize) {
    {
        let mut state = inner.state.lock();
        match state.respawning.get_mut(slot) {
            Some(flag) if !*flag => *flag = true,
            _ => return,
        }
    }
    let spawned = spawn_worker(inner, slot).await;
    enum Outcome {
        Kill(Worker),
        Pump,
        None,
    }
    let outcome = {
        let mut state = inner.state.lock();
        if let Some(flag) = state.respawning.get_mut(slot) {
            *flag = false;
        }
        match spawned {
            Ok(worker) => {
                if inner.shutting_down.load(Ordering::SeqCst) {
                    Outcome::Kill(worker)
                } else {
                    state.workers[slot] = Some(worker);
                    Outcome::Pump
                }
            }
            Err(err) => {
                // The liveness timer retries vacant slots on its next tick.
                warn!("Failed to respawn checker worker {slot}: {err}");
                Outcome::None
            }
        }
    };
    match outcome {
        Outcome::Kill(worker) => {
            let mut child = worker.child.lock().await;
            let _ = child.start_kill();
        }
        Outcome::Pump => inner.pump(),
        Outcome::None => {}
    }
}

fn spawn_health_timer(inner: Arc<PoolInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(HEALTH_INTERVAL);
        ticker.tick().await;
        let line = match CheckerRequest::Health.to_line() {
            Ok(line) => line,
            Err(_) => return,
        };
        loop {
            ticker.tick().await;
            if inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let idle: Vec<Arc<tokio::sync::Mutex<ChildStdin>>> = {
                let mut state = inner.state.lock();
                let now = epoch_ms();
                state
                    .workers
                    .iter_mut()
                    .flatten()
                    .filter(|worker| !worker.busy)
                    .map(|worker| {
                        worker.last_health_ms = now;
                        worker.stdin.clone()
                    })
                    .collect()
            };
            for stdin in idle {
                let mut stdin = stdin.lock().await;
                let _ = stdin.write_all(line.as_bytes()).await;
                let _ = stdin.flush().await;
            }
        }
    })
}

fn spawn_liveness_timer(inner: Arc<PoolInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(LIVENESS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let (present, vacant) = {
                let state = inner.state.lock();
                let present: Vec<(usize, u64, Arc<tokio::sync::Mutex<Child>>)> = state
                    .workers
                    .iter()
                    .enumerate()
                    .filter_map(|(slot, worker)| {
                        worker
                            .as_ref()
                            .map(|w| (slot, w.generation, w.child.clone()))
                    })
                    .collect();
                let vacant: Vec<usize> = state
                    .workers
                    .iter()
                    .enumerate()
                    .filter(|(slot, worker)| worker.is_none() && !state.respawning[*slot])
                    .map(|(slot, _)| slot)
                    .collect();
                (present, vacant)
            };
            for (slot, generation, child) in present {
                let exited = {
                    let mut child = child.lock().await;
                    child.try_wait().map(|status| status.is_some()).unwrap_or(true)
                };
                if exited {
                    handle_worker_exit(&inner, slot, generation).await;
                }
            }
            for slot in vacant {
                respawn_slot(&inner, slot).await;
            }
        }
    })
}
