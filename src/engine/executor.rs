use std::{path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Child,
    sync::{
        Mutex, mpsc,
        oneshot::{self, error::TryRecvError},
    },
};

use crate::engine::{
    config::{ConflictPolicy, RunnerConfig},
    error::RunnerError,
    language::{CommandSpec, LanguageSpec, LanguageTable},
    launcher::{ProcessLauncher, StageIo},
    metrics::{MetricsRegistry, SessionOutcome},
    models::{RunEvent, RunRequest, SessionSummary, Stage},
    registry::{SessionHandle, SessionRegistry, StopReason},
    relay::EventSink,
    timeout::TimeoutGuard,
    workspace::{WorkspaceProvisioner, validate_client_id},
};

const CHUNK_SIZE: usize = 4096;
const INPUT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long an abandoned process gets between SIGTERM and SIGKILL.
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub run_timeout: Duration,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    pub conflict_policy: ConflictPolicy,
}

impl From<&RunnerConfig> for ExecutorSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            run_timeout: config.run_timeout,
            max_code_bytes: config.max_code_bytes,
            max_input_bytes: config.max_input_bytes,
            conflict_policy: config.conflict_policy,
        }
    }
}

/// Which session currently owns a client's event stream. `open` is cleared once the owner
/// has sent its terminal event.
#[derive(Debug, Default)]
struct ClientStream {
    generation: u64,
    open: bool,
}

/// Starts sessions and routes input/kill requests to them.
pub struct PipelineExecutor {
    languages: Arc<LanguageTable>,
    workspaces: WorkspaceProvisioner,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn EventSink>,
    launcher: Arc<dyn ProcessLauncher>,
    metrics: Arc<MetricsRegistry>,
    settings: ExecutorSettings,
    streams: DashMap<String, Arc<Mutex<ClientStream>>>,
}

impl PipelineExecutor {
    pub fn new(
        languages: Arc<LanguageTable>,
        workspaces: WorkspaceProvisioner,
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn EventSink>,
        launcher: Arc<dyn ProcessLauncher>,
        metrics: Arc<MetricsRegistry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            languages,
            workspaces,
            registry,
            sink,
            launcher,
            metrics,
            settings,
            streams: DashMap::new(),
        }
    }

    pub fn languages(&self) -> &LanguageTable {
        &self.languages
    }

    pub fn session(&self, client_id: &str) -> Option<SessionSummary> {
        self.registry.get(client_id)
    }

    fn stream(&self, client_id: &str) -> Arc<Mutex<ClientStream>> {
        self.streams
            .entry(client_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Validates and provisions synchronously, then hands the pipeline to a session task.
    /// Everything after this returns `Ok` is reported through the client's event stream.
    pub async fn run(self: &Arc<Self>, request: RunRequest) -> Result<(), RunnerError> {
        let result = self.start_session(request).await;
        if let Err(err) = &result {
            self.metrics.rejected();
            tracing::info!(error = %err, "run rejected");
        }
        result
    }

    async fn start_session(self: &Arc<Self>, request: RunRequest) -> Result<(), RunnerError> {
        let RunRequest {
            language,
            code,
            client_id,
        } = request;

        validate_client_id(&client_id)?;
        let spec = self.languages.lookup(&language)?.clone();
        if code.len() > self.settings.max_code_bytes {
            return Err(RunnerError::InvalidRequest("code too large".to_string()));
        }

        // Held until `start` is out: runs for one client provision and announce one at a time.
        let stream = self.stream(&client_id);
        let mut owner = stream.lock().await;

        let generation = self.registry.next_generation();
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = SessionHandle::new(
            generation,
            language.clone(),
            self.workspaces.dir_for(&client_id),
            stop_tx,
        );
        if let Some(previous) =
            self.registry
                .register(&client_id, handle, self.settings.conflict_policy)?
        {
            tracing::info!(
                client_id = %client_id,
                previous_generation = previous.generation,
                "superseding running session"
            );
            self.stop_session(previous, StopReason::Superseded);
        }

        let workspace = match self.prepare_workspace(&client_id, &spec, &code).await {
            Ok(dir) => dir,
            Err(err) => {
                self.registry.remove_if_current(&client_id, generation);
                return Err(err);
            }
        };

        if owner.open {
            // The previous session is superseded or still draining after a kill.
            self.sink.send(&client_id, &RunEvent::Close { code: -1 });
        }
        *owner = ClientStream {
            generation,
            open: true,
        };

        self.metrics.started();
        tracing::info!(
            client_id = %client_id,
            language = %language,
            generation,
            compiled = spec.is_compiled(),
            launcher = self.launcher.name(),
            "session started"
        );
        self.sink.send(&client_id, &RunEvent::Start);
        drop(owner);

        let task = SessionTask {
            executor: Arc::clone(self),
            client_id,
            generation,
            workspace,
            stream,
            stop: stop_rx,
            stopped: None,
            stdout: Utf8Carry::default(),
            stderr: Utf8Carry::default(),
        };
        tokio::spawn(task.drive(spec));
        Ok(())
    }

    async fn prepare_workspace(
        &self,
        client_id: &str,
        spec: &LanguageSpec,
        code: &str,
    ) -> Result<PathBuf, RunnerError> {
        let dir = self.workspaces.provision(client_id).await?;
        self.workspaces
            .write_source(&dir, spec.source_file, code)
            .await?;
        Ok(dir)
    }

    /// Writes one line and closes the process's input.
    pub async fn send_input(&self, client_id: &str, input: &str) -> Result<(), RunnerError> {
        let mut line = input.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write_stdin(client_id, line.as_bytes(), true).await
    }

    /// Writes raw keystrokes, leaving the input stream open.
    pub async fn stream_input(&self, client_id: &str, data: &str) -> Result<(), RunnerError> {
        self.write_stdin(client_id, data.as_bytes(), false).await
    }

    async fn write_stdin(
        &self,
        client_id: &str,
        bytes: &[u8],
        close: bool,
    ) -> Result<(), RunnerError> {
        if bytes.len() > self.settings.max_input_bytes {
            return Err(RunnerError::InvalidRequest("input too large".to_string()));
        }
        let slot = self
            .registry
            .stdin(client_id)
            .ok_or(RunnerError::ProcessNotFound)?;
        let mut slot = slot.lock().await;
        tokio::time::timeout(INPUT_WRITE_TIMEOUT, slot.write(bytes, close))
            .await
            .map_err(|_| RunnerError::NotWritable)?
    }

    pub fn kill(&self, client_id: &str) -> Result<(), RunnerError> {
        let handle = self
            .registry
            .unregister(client_id)
            .ok_or(RunnerError::ProcessNotFound)?;
        tracing::info!(
            client_id,
            generation = handle.generation,
            pid = ?handle.pid,
            workspace = %handle.workspace.display(),
            "killing session"
        );
        self.stop_session(handle, StopReason::Killed);
        Ok(())
    }

    fn stop_session(&self, handle: SessionHandle, reason: StopReason) {
        if let Some(pid) = handle.pid {
            self.terminate(pid);
        }
        handle.notify_stop(reason);
    }

    fn terminate(&self, pid: u32) {
        if let Err(err) = self.launcher.terminate(pid) {
            tracing::warn!(pid, error = %err, "failed to signal process");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
enum Outcome {
    Exited(i32),
    CompileFailed(i32),
    SpawnFailed(String),
    TimedOut,
    Stopped(StopReason, i32),
}

/// Owns the children of one session and is the only emitter of its events after `start`.
struct SessionTask {
    executor: Arc<PipelineExecutor>,
    client_id: String,
    generation: u64,
    workspace: PathBuf,
    stream: Arc<Mutex<ClientStream>>,
    stop: oneshot::Receiver<StopReason>,
    stopped: Option<StopReason>,
    stdout: Utf8Carry,
    stderr: Utf8Carry,
}

impl SessionTask {
    async fn drive(mut self, spec: LanguageSpec) {
        // Armed before compilation: compile time counts against the budget.
        let mut guard = TimeoutGuard::arm(self.executor.settings.run_timeout);

        if let Some(compile) = &spec.compile {
            match self.run_stage(Stage::Compiling, compile, &mut guard).await {
                Outcome::Exited(0) => {}
                Outcome::Exited(code) => {
                    return self.conclude(guard, Outcome::CompileFailed(code)).await;
                }
                other => return self.conclude(guard, other).await,
            }
        }

        let outcome = self.run_stage(Stage::Running, &spec.run, &mut guard).await;
        self.conclude(guard, outcome).await;
    }

    async fn run_stage(
        &mut self,
        stage: Stage,
        command: &CommandSpec,
        guard: &mut TimeoutGuard,
    ) -> Outcome {
        if let Some(reason) = self.observe_stop() {
            return Outcome::Stopped(reason, -1);
        }

        let pipes = match stage {
            Stage::Compiling => StageIo::COMPILE,
            Stage::Provisioning | Stage::Running => StageIo::RUN,
        };
        let mut child = match self
            .executor
            .launcher
            .launch(command, &self.workspace, pipes)
            .await
        {
            Ok(child) => child,
            Err(err) => {
                let (program, _) = command.argv();
                tracing::warn!(
                    client_id = %self.client_id,
                    ?stage,
                    program = %program,
                    error = %err,
                    "failed to spawn stage"
                );
                return Outcome::SpawnFailed(format!("failed to start {program}: {err}"));
            }
        };
        let pid = child.id();
        tracing::debug!(client_id = %self.client_id, ?stage, pid, "stage spawned");

        let attached = self
            .executor
            .registry
            .attach(&self.client_id, self.generation, stage, pid, child.stdin.take())
            .await;
        if !attached {
            // Stopped while spawning: whoever removed the entry never saw this pid.
            if let Some(pid) = pid {
                self.executor.terminate(pid);
            }
            self.observe_stop();
        }

        let (tx, mut chunks) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut exit_code = None;
        let mut streams_open = true;
        while exit_code.is_none() || streams_open {
            tokio::select! {
                chunk = chunks.recv(), if streams_open => match chunk {
                    Some((stream, bytes)) => self.relay(stream, &bytes).await,
                    None => {
                        streams_open = false;
                        self.flush_output().await;
                    }
                },
                status = child.wait(), if exit_code.is_none() => {
                    exit_code = Some(match status {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(err) => {
                            tracing::warn!(client_id = %self.client_id, error = %err, "wait failed");
                            -1
                        }
                    });
                }
                reason = &mut self.stop, if self.stopped.is_none() => {
                    self.stopped = Some(reason.unwrap_or(StopReason::Killed));
                }
                () = guard.expired() => {
                    let owned = self.observe_stop().is_none()
                        && self
                            .executor
                            .registry
                            .remove_if_current(&self.client_id, self.generation)
                            .is_some();
                    if owned && let Some(pid) = pid {
                        self.executor.terminate(pid);
                    }
                    reap(child, Arc::clone(&self.executor.launcher));
                    return if owned {
                        Outcome::TimedOut
                    } else {
                        Outcome::Stopped(self.observe_stop().unwrap_or(StopReason::Killed), -1)
                    };
                }
            }
        }

        let code = exit_code.unwrap_or(-1);
        match self.stopped {
            Some(reason) => Outcome::Stopped(reason, code),
            None => Outcome::Exited(code),
        }
    }

    async fn conclude(mut self, guard: TimeoutGuard, outcome: Outcome) {
        let timeout_message = guard.message();
        guard.disarm();

        // Timeouts and stops have already lost their registry entry.
        let settled = match outcome {
            Outcome::TimedOut | Outcome::Stopped(..) => None,
            _ => self.settle(),
        };
        let superseded = matches!(outcome, Outcome::Stopped(StopReason::Superseded, _))
            || settled == Some(StopReason::Superseded);

        let (events, result) = match outcome {
            Outcome::Exited(code) => {
                let result = if settled == Some(StopReason::Killed) {
                    SessionOutcome::Killed
                } else {
                    SessionOutcome::Closed
                };
                (vec![RunEvent::Close { code }], result)
            }
            Outcome::CompileFailed(code) => {
                tracing::info!(client_id = %self.client_id, code, "compilation failed");
                (vec![RunEvent::Close { code: -1 }], SessionOutcome::Failed)
            }
            Outcome::SpawnFailed(message) => {
                (vec![RunEvent::Error { data: message }], SessionOutcome::Failed)
            }
            Outcome::TimedOut => (
                vec![
                    RunEvent::Error {
                        data: timeout_message,
                    },
                    RunEvent::Close { code: -1 },
                ],
                SessionOutcome::TimedOut,
            ),
            Outcome::Stopped(_, code) => (vec![RunEvent::Close { code }], SessionOutcome::Killed),
        };

        let result = if superseded {
            SessionOutcome::Superseded
        } else {
            result
        };
        if !self.emit(&events).await {
            tracing::debug!(
                client_id = %self.client_id,
                generation = self.generation,
                "stream already handed over; terminal events dropped"
            );
        }

        self.executor.metrics.finished(result);
        tracing::info!(
            client_id = %self.client_id,
            generation = self.generation,
            outcome = ?result,
            "session finished"
        );
    }

    /// Releases the registry entry. `None` means this task removed it; otherwise someone
    /// else stopped the session first.
    fn settle(&mut self) -> Option<StopReason> {
        if self
            .executor
            .registry
            .remove_if_current(&self.client_id, self.generation)
            .is_some()
        {
            return None;
        }
        if let Some(reason) = self.observe_stop() {
            return Some(reason);
        }
        // Entry replaced but the stop notice is still in flight.
        if self.executor.registry.contains(&self.client_id) {
            Some(StopReason::Superseded)
        } else {
            Some(StopReason::Killed)
        }
    }

    fn observe_stop(&mut self) -> Option<StopReason> {
        if self.stopped.is_none() {
            self.stopped = match self.stop.try_recv() {
                Ok(reason) => Some(reason),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => Some(StopReason::Killed),
            };
        }
        self.stopped
    }

    async fn relay(&mut self, stream: OutputStream, bytes: &[u8]) {
        let data = match stream {
            OutputStream::Stdout => self.stdout.decode(bytes),
            OutputStream::Stderr => self.stderr.decode(bytes),
        };
        if let Some(event) = output_event(stream, data) {
            self.emit(&[event]).await;
        }
    }

    async fn flush_output(&mut self) {
        let events: Vec<RunEvent> = [
            output_event(OutputStream::Stdout, self.stdout.finish()),
            output_event(OutputStream::Stderr, self.stderr.finish()),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !events.is_empty() {
            self.emit(&events).await;
        }
    }

    /// Sends `events` while this session still owns the client's stream. Returns false once
    /// a newer session has taken it over or the stream is already closed.
    async fn emit(&self, events: &[RunEvent]) -> bool {
        let mut owner = self.stream.lock().await;
        if owner.generation != self.generation || !owner.open {
            return false;
        }
        for event in events {
            self.executor.sink.send(&self.client_id, event);
            if event.is_terminal() {
                owner.open = false;
            }
        }
        true
    }
}

fn output_event(stream: OutputStream, data: String) -> Option<RunEvent> {
    if data.is_empty() {
        return None;
    }
    Some(match stream {
        OutputStream::Stdout => RunEvent::Stdout { data },
        OutputStream::Stderr => RunEvent::Stderr { data },
    })
}

/// Holds back a trailing partial UTF-8 sequence so multi-byte characters split across
/// reads are not mangled.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let tail = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, Bytes)>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx
                    .send((stream, Bytes::copy_from_slice(&chunk[..n])))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Waits out a signalled child in the background. If it outlives the grace period the
/// whole process group is SIGKILLed.
fn reap(mut child: Child, launcher: Arc<dyn ProcessLauncher>) {
    let pid = child.id();
    tokio::spawn(async move {
        if tokio::time::timeout(REAP_GRACE, child.wait()).await.is_err() {
            if let Some(pid) = pid
                && let Err(err) = launcher.force_kill(pid)
            {
                tracing::warn!(pid, error = %err, "failed to kill process group");
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    });
}
