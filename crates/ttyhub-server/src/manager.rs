//! Session lifecycle management.
//!
//! Owns live process handles, routes output through the title filter,
//! activity tracker, and recording writer, runs an IPC listener per
//! session, and exposes create/input/resize/rename/kill/cleanup. Sessions
//! without an in-memory handle (owned by another process, e.g. a
//! forwarder) are reached through their persisted descriptor and socket.

use crate::activity::ActivityTracker;
use crate::cast::{discard_sink, open_cast, CastHeader, CastSink, OutputRecorder, CAST_VERSION};
use crate::config::Config;
use crate::events::SessionEvent;
use crate::ipc::{IpcClient, SessionCommand, SessionIpc};
use crate::process;
use crate::pty::{resize_master, spawn_pty};
use crate::store::{SessionDescriptor, SessionStatus, SessionStore};
use crate::title::{
    dynamic_title, osc_title, static_title, TitleFilter, TitleInjector, TitleMode,
    MONITOR_INTERVAL,
};
use portable_pty::MasterPty;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ttyhub_core::{ControlCommand, HubError, HubResult, SpawnFailure, StatusUpdate};

/// Environment variable stamped into every session process. Its presence
/// marks "already inside a ttyhub session" and prevents recursive
/// self-invocation by the forwarder.
pub const SESSION_ENV_VAR: &str = "TTYHUB_SESSION";

/// A browser-originated resize outranks terminal-originated resizes for
/// this long.
const BROWSER_RESIZE_PRIORITY: Duration = Duration::from_millis(1000);

/// Cadence of the dynamic title refresh.
const TITLE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the background zombie sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Where a resize request originated; browser resizes win ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeSource {
    Browser,
    Terminal,
}

/// Input accepted by [`SessionManager::send_input`].
#[derive(Debug, Clone)]
pub enum SessionInput {
    Text(String),
    SpecialKey(String),
}

/// Options for session creation.
#[derive(Debug, Default)]
pub struct SessionOptions {
    /// Display name; defaults to the command line. Deduplicated with a
    /// `"name (2)"` suffix on collision.
    pub name: Option<String>,
    /// Working directory; defaults to the server's current directory.
    pub cwd: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Title mode; defaults to the configured mode.
    pub title_mode: Option<TitleMode>,
    /// When run as a foreground forwarder: queue mirroring output to the
    /// controlling terminal.
    pub forward: Option<UnboundedSender<Vec<u8>>>,
}

struct TitleCtx {
    mode: TitleMode,
    name: String,
    command: Vec<String>,
    cwd: PathBuf,
}

struct LiveSession {
    pid: u32,
    initial_cols: u16,
    initial_rows: u16,
    master: Arc<StdMutex<Box<dyn MasterPty + Send>>>,
    input_tx: UnboundedSender<Vec<u8>>,
    sink: CastSink,
    title_ctx: Arc<StdMutex<TitleCtx>>,
    injector: Arc<StdMutex<TitleInjector>>,
    last_browser_resize: Option<Instant>,
}

struct InjectState {
    last_output: Instant,
    quiescent: bool,
}

/// Kills and reaps a freshly spawned child if session wiring fails before
/// the exit watcher takes ownership of the handle.
struct SpawnRollback {
    pid: u32,
    armed: bool,
}

impl SpawnRollback {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SpawnRollback {
    fn drop(&mut self) {
        if self.armed {
            warn!(pid = self.pid, "session wiring failed, killing spawned child");
            process::kill_and_reap(self.pid);
        }
    }
}

/// The session orchestrator.
pub struct SessionManager {
    store: SessionStore,
    config: Config,
    version: String,
    sessions: Arc<RwLock<HashMap<String, LiveSession>>>,
    events: broadcast::Sender<SessionEvent>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    /// Self-handle for the per-session tasks spawned by `start_session`.
    weak: Weak<SessionManager>,
}

impl SessionManager {
    /// Initialize the manager: open the control root, drop sessions from a
    /// different software version, reconcile zombies, start the sweep.
    pub fn new(config: Config) -> HubResult<Arc<Self>> {
        let store = SessionStore::new(config.control_root.clone())?;
        let version = env!("CARGO_PKG_VERSION").to_string();

        let removed = store.cleanup_stale_versions(&version);
        if !removed.is_empty() {
            info!(count = removed.len(), "removed stale-version sessions");
        }
        store.reap_zombies();

        let (events, _) = broadcast::channel(1024);
        let manager = Arc::new_cyclic(|weak| Self {
            store,
            config,
            version,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
            sweeper: StdMutex::new(None),
            weak: weak.clone(),
        });

        let sweep_store = manager.store.clone();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                sweep_store.reap_zombies();
            }
        });
        *manager.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(sweeper);

        Ok(manager)
    }

    /// Subscribe to session events (creation, output, resize, exit, …).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn control_root(&self) -> &std::path::Path {
        self.store.root()
    }

    /// Create a session: resolve the command, allocate the session
    /// directory, open the recording, spawn the process, and wire the
    /// output pipelines.
    pub async fn create_session(
        &self,
        command: Vec<String>,
        options: SessionOptions,
    ) -> HubResult<(String, SessionDescriptor)> {
        if command.is_empty() {
            return Err(HubError::SpawnFailed {
                command: String::new(),
                cause: SpawnFailure::NotFound,
                detail: "empty command".into(),
            });
        }

        let id = generate_session_id();
        let cols = options.cols.unwrap_or(80);
        let rows = options.rows.unwrap_or(24);
        let title_mode = options.title_mode.unwrap_or(self.config.default_title_mode);
        let cwd = match options.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()?,
        };
        let desired_name = options
            .name
            .unwrap_or_else(|| command.join(" "));
        let name = self.store.unique_name(&desired_name, &[]);

        self.store.create_session_dir(&id)?;
        match self
            .start_session(&id, command, options.forward, name, cwd, cols, rows, title_mode)
            .await
        {
            Ok(descriptor) => {
                let _ = self.events.send(SessionEvent::Created { id: id.clone() });
                Ok((id, descriptor))
            }
            Err(e) => {
                // Roll back the partially created directory.
                if let Err(cleanup) = self.store.remove(&id) {
                    warn!(session_id = %id, error = %cleanup, "rollback cleanup failed");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_session(
        &self,
        id: &str,
        command: Vec<String>,
        forward: Option<UnboundedSender<Vec<u8>>>,
        name: String,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
        title_mode: TitleMode,
    ) -> HubResult<SessionDescriptor> {
        let mut descriptor = SessionDescriptor {
            id: id.to_string(),
            command: command.clone(),
            name: name.clone(),
            working_dir: cwd.to_string_lossy().into_owned(),
            status: SessionStatus::Starting,
            started_at: chrono::Utc::now().to_rfc3339(),
            pid: None,
            exit_code: None,
            cols,
            rows,
            version: self.version.clone(),
            last_modified: String::new(),
        };
        self.store.save(&mut descriptor)?;

        let mut env = HashMap::new();
        env.insert(SESSION_ENV_VAR.to_string(), id.to_string());
        let spawned = spawn_pty(&command, &cwd, &env, cols, rows)?;
        let pid = spawned.pid;
        let mut rollback = SpawnRollback { pid, armed: true };

        descriptor.status = SessionStatus::Running;
        descriptor.pid = Some(pid);
        self.store.save(&mut descriptor)?;

        // Recording writer.
        let header = CastHeader {
            version: CAST_VERSION,
            width: cols,
            height: rows,
            timestamp: chrono::Utc::now().timestamp(),
            command: Some(command.join(" ")),
            title: Some(name.clone()),
            env: Some(captured_env()),
        };
        let (sink, writer_task) = if self.config.recording_enabled {
            let stdout_path = self.store.stdout_path(id)?;
            open_cast(&stdout_path, header, self.config.flush_each_event).await?
        } else {
            discard_sink()
        };

        let title_ctx = Arc::new(StdMutex::new(TitleCtx {
            mode: title_mode,
            name: name.clone(),
            command: command.clone(),
            cwd: cwd.clone(),
        }));
        let injector = Arc::new(StdMutex::new(TitleInjector::new()));
        let activity = Arc::new(StdMutex::new(ActivityTracker::new()));
        let status_cache: Arc<StdMutex<Option<StatusUpdate>>> = Arc::new(StdMutex::new(None));
        let inject_state = Arc::new(StdMutex::new(InjectState {
            last_output: Instant::now(),
            quiescent: true,
        }));

        if matches!(title_mode, TitleMode::Static | TitleMode::Dynamic) {
            let initial = static_title(&cwd, &command, &name);
            injector
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .queue(initial);
        }

        // Reader thread: blocking PTY reads feeding the async pump.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let mut reader = spawned.reader;
            let id = id.to_string();
            std::thread::Builder::new()
                .name(format!("ttyhub-read-{id}"))
                .spawn(move || {
                    let mut buf = [0u8; 8192];
                    loop {
                        match reader.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                if out_tx.send(buf[..n].to_vec()).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                })
                .map_err(|e| HubError::Other(format!("reader thread: {e}")))?;
        }

        // Output pump: classifier + recorder + activity + fan-out, in
        // exactly the order chunks arrive.
        let pump_task = {
            let id = id.to_string();
            let mut recorder = OutputRecorder::new(sink.clone());
            let mut filter = (title_mode == TitleMode::Filter).then(TitleFilter::new);
            let activity = Arc::clone(&activity);
            let inject_state = Arc::clone(&inject_state);
            let events = self.events.clone();
            let forward = forward.clone();
            tokio::spawn(async move {
                while let Some(chunk) = out_rx.recv().await {
                    let data = match filter.as_mut() {
                        Some(filter) => filter.filter(&chunk),
                        None => chunk,
                    };
                    if data.is_empty() {
                        continue;
                    }
                    recorder.output(&data);
                    activity
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .note_output(&data);
                    {
                        let mut state =
                            inject_state.lock().unwrap_or_else(|e| e.into_inner());
                        state.last_output = Instant::now();
                        state.quiescent = recorder.is_quiescent();
                    }
                    if let Some(forward) = forward.as_ref() {
                        let _ = forward.send(data.clone());
                    }
                    let _ = events.send(SessionEvent::Output {
                        id: id.clone(),
                        data,
                    });
                }
                recorder.finish();
            })
        };

        // Input queue: the single consumer owning the PTY writer.
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let mut writer = spawned.writer;
            let sink = sink.clone();
            let stdin_path = self.store.stdin_path(id)?;
            let title_ctx = Arc::clone(&title_ctx);
            let injector = Arc::clone(&injector);
            let id = id.to_string();
            std::thread::Builder::new()
                .name(format!("ttyhub-input-{id}"))
                .spawn(move || {
                    let mut stdin_log = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&stdin_path)
                        .ok();
                    let mut line = Vec::new();
                    while let Some(bytes) = input_rx.blocking_recv() {
                        if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                            warn!(session_id = %id, error = %e, "PTY write failed");
                            break;
                        }
                        sink.input(&String::from_utf8_lossy(&bytes));
                        if let Some(log) = stdin_log.as_mut() {
                            let _ = log.write_all(&bytes);
                        }
                        track_directory_changes(&mut line, &bytes, &title_ctx, &injector);
                    }
                })
                .map_err(|e| HubError::Other(format!("input thread: {e}")))?;
        }

        // The spawned tasks below outlive this call and need an owned
        // handle back to the manager.
        let strong = self
            .weak
            .upgrade()
            .ok_or_else(|| HubError::Other("session manager shut down".into()))?;

        // IPC listener + per-session dispatcher.
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<SessionCommand>();
        let ipc = SessionIpc::spawn(self.store.socket_path(id)?, id.to_string(), commands_tx)?;
        {
            let manager = Arc::clone(&strong);
            let id = id.to_string();
            let status_cache = Arc::clone(&status_cache);
            tokio::spawn(async move {
                while let Some(cmd) = commands_rx.recv().await {
                    manager.dispatch(&id, cmd, &status_cache).await;
                }
            });
        }

        // Timers: title refresh (dynamic) and injection monitor.
        let mut timer_tasks = Vec::new();
        if title_mode == TitleMode::Dynamic {
            let title_ctx = Arc::clone(&title_ctx);
            let injector = Arc::clone(&injector);
            let activity = Arc::clone(&activity);
            let status_cache = Arc::clone(&status_cache);
            timer_tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(TITLE_REFRESH_INTERVAL);
                loop {
                    tick.tick().await;
                    let title = {
                        let ctx = title_ctx.lock().unwrap_or_else(|e| e.into_inner());
                        let tracker = activity.lock().unwrap_or_else(|e| e.into_inner());
                        let cached = status_cache.lock().unwrap_or_else(|e| e.into_inner());
                        let status = cached
                            .as_ref()
                            .map(|s| s.status.clone())
                            .or_else(|| tracker.app_status().map(|s| s.status));
                        dynamic_title(
                            &ctx.cwd,
                            &ctx.command,
                            &ctx.name,
                            tracker.is_active(),
                            status.as_deref(),
                        )
                    };
                    injector
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .queue(title);
                }
            }));
        }
        if matches!(title_mode, TitleMode::Static | TitleMode::Dynamic) {
            let injector = Arc::clone(&injector);
            let inject_state = Arc::clone(&inject_state);
            let events = self.events.clone();
            let forward = forward.clone();
            let id = id.to_string();
            timer_tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(MONITOR_INTERVAL);
                loop {
                    tick.tick().await;
                    let (idle, quiescent) = {
                        let state = inject_state.lock().unwrap_or_else(|e| e.into_inner());
                        (state.last_output.elapsed(), state.quiescent)
                    };
                    let taken = injector
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take_if_ready(idle, quiescent);
                    if let Some(title) = taken {
                        let osc = osc_title(&title);
                        if let Some(forward) = forward.as_ref() {
                            let _ = forward.send(osc.clone());
                        }
                        let _ = events.send(SessionEvent::Output {
                            id: id.clone(),
                            data: osc,
                        });
                    }
                }
            }));
        }

        // Exit watcher: reaps the child, drains the pipelines, finalizes
        // the recording, reconciles the descriptor, and removes the handle.
        {
            let manager = strong;
            let id = id.to_string();
            let sink = sink.clone();
            let mut child = spawned.child;
            tokio::spawn(async move {
                let exit_code = tokio::task::spawn_blocking(move || child.wait())
                    .await
                    .map(|r| r.map(|s| s.exit_code() as i32).unwrap_or(-1))
                    .unwrap_or(-1);

                if tokio::time::timeout(Duration::from_secs(5), pump_task)
                    .await
                    .is_err()
                {
                    warn!(session_id = %id, "output pump did not drain in time");
                }

                sink.exit_marker(exit_code, &id);
                sink.shutdown();
                if tokio::time::timeout(Duration::from_secs(5), writer_task)
                    .await
                    .is_err()
                {
                    warn!(session_id = %id, "recording writer did not drain in time");
                }

                for task in timer_tasks {
                    task.abort();
                }
                ipc.shutdown();

                match manager.store.load(&id) {
                    Ok(Some(mut desc)) => {
                        desc.status = SessionStatus::Exited;
                        desc.exit_code = Some(exit_code);
                        if let Err(e) = manager.store.save(&mut desc) {
                            warn!(session_id = %id, error = %e, "cannot persist exit");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(session_id = %id, error = %e, "cannot load descriptor at exit"),
                }

                manager.sessions.write().await.remove(&id);
                info!(session_id = %id, exit_code, "session exited");
                let _ = manager.events.send(SessionEvent::Exited {
                    id: id.clone(),
                    exit_code,
                });
            });
        }

        // The exit watcher owns the child handle from here.
        rollback.disarm();

        let live = LiveSession {
            pid,
            initial_cols: cols,
            initial_rows: rows,
            master: Arc::new(StdMutex::new(spawned.master)),
            input_tx,
            sink,
            title_ctx,
            injector,
            last_browser_resize: None,
        };
        self.sessions.write().await.insert(id.to_string(), live);
        info!(session_id = %id, pid, name = %descriptor.name, "session created");

        Ok(descriptor)
    }

    async fn dispatch(
        &self,
        id: &str,
        cmd: SessionCommand,
        status_cache: &Arc<StdMutex<Option<StatusUpdate>>>,
    ) {
        match cmd {
            SessionCommand::Stdin(bytes) => {
                if let Err(e) = self.send_input_bytes(id, bytes).await {
                    warn!(session_id = %id, error = %e, "IPC stdin rejected");
                }
            }
            SessionCommand::Control(ControlCommand::Resize { cols, rows }) => {
                if let Err(e) = self
                    .resize_session(id, cols, rows, ResizeSource::Browser)
                    .await
                {
                    warn!(session_id = %id, error = %e, "IPC resize failed");
                }
            }
            SessionCommand::Control(ControlCommand::Kill { signal }) => {
                if let Err(e) = self.kill_session(id, signal).await {
                    warn!(session_id = %id, error = %e, "IPC kill failed");
                }
            }
            SessionCommand::Control(ControlCommand::ResetSize) => {
                if let Err(e) = self.reset_session_size(id).await {
                    warn!(session_id = %id, error = %e, "IPC reset-size failed");
                }
            }
            SessionCommand::Control(ControlCommand::UpdateTitle { title }) => {
                if let Err(e) = self.update_session_name(id, &title).await {
                    warn!(session_id = %id, error = %e, "IPC rename failed");
                }
            }
            SessionCommand::Status(update) => {
                *status_cache.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(update.clone());
                let _ = self.events.send(SessionEvent::Status {
                    id: id.to_string(),
                    update,
                });
            }
        }
    }

    /// Send text or a named special key to the session's stdin.
    pub async fn send_input(&self, id: &str, input: SessionInput) -> HubResult<()> {
        let bytes = match input {
            SessionInput::Text(text) => text.into_bytes(),
            SessionInput::SpecialKey(key) => special_key_bytes(&key)
                .ok_or(HubError::UnknownKey(key))?
                .to_vec(),
        };
        self.send_input_bytes(id, bytes).await
    }

    /// Raw input path: bytes land on the session's single input queue in
    /// enqueue order, regardless of the originating connection.
    pub async fn send_input_bytes(&self, id: &str, bytes: Vec<u8>) -> HubResult<()> {
        {
            let sessions = self.sessions.read().await;
            if let Some(live) = sessions.get(id) {
                return live
                    .input_tx
                    .send(bytes)
                    .map_err(|_| HubError::SendInputFailed {
                        session_id: id.to_string(),
                        detail: "input queue closed".into(),
                    });
            }
        }
        // External session: reach it over its socket.
        let desc = self.load_external(id)?;
        if desc.status == SessionStatus::Exited {
            return Err(HubError::SendInputFailed {
                session_id: id.to_string(),
                detail: "session exited".into(),
            });
        }
        let mut client = IpcClient::connect(&self.store.socket_path(id)?, id).await?;
        client.send_stdin(&bytes).await
    }

    /// Resize the session terminal. Terminal-sourced resizes are dropped
    /// while a browser-sourced resize is less than a second old.
    pub async fn resize_session(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
        source: ResizeSource,
    ) -> HubResult<()> {
        let resized_live = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(id) {
                Some(live) => {
                    if source == ResizeSource::Terminal {
                        let recently = live
                            .last_browser_resize
                            .map(|t| t.elapsed() < BROWSER_RESIZE_PRIORITY)
                            .unwrap_or(false);
                        if recently {
                            debug!(session_id = %id, "terminal resize yields to recent browser resize");
                            return Ok(());
                        }
                    }
                    {
                        let master = live.master.lock().unwrap_or_else(|e| e.into_inner());
                        resize_master(master.as_ref(), cols, rows).map_err(|e| {
                            HubError::ResizeFailed {
                                session_id: id.to_string(),
                                detail: e.to_string(),
                            }
                        })?;
                    }
                    if source == ResizeSource::Browser {
                        live.last_browser_resize = Some(Instant::now());
                    }
                    live.sink.resize(cols, rows);
                    true
                }
                None => false,
            }
        };

        if resized_live {
            if let Ok(Some(mut desc)) = self.store.load(id) {
                desc.cols = cols;
                desc.rows = rows;
                if let Err(e) = self.store.save(&mut desc) {
                    warn!(session_id = %id, error = %e, "cannot persist geometry");
                }
            }
            let _ = self.events.send(SessionEvent::Resized {
                id: id.to_string(),
                cols,
                rows,
            });
            return Ok(());
        }

        // External session: forward over IPC, keep the descriptor current.
        let mut desc = self.load_external(id)?;
        let mut client = IpcClient::connect(&self.store.socket_path(id)?, id).await?;
        client
            .send_control(&ControlCommand::Resize { cols, rows })
            .await?;
        desc.cols = cols;
        desc.rows = rows;
        if let Err(e) = self.store.save(&mut desc) {
            warn!(session_id = %id, error = %e, "cannot persist geometry");
        }
        Ok(())
    }

    /// Restore the session to its initial geometry.
    pub async fn reset_session_size(&self, id: &str) -> HubResult<()> {
        let initial = {
            let sessions = self.sessions.read().await;
            sessions.get(id).map(|l| (l.initial_cols, l.initial_rows))
        };
        match initial {
            Some((cols, rows)) => self
                .resize_session(id, cols, rows, ResizeSource::Browser)
                .await
                .map_err(|e| HubError::ResetSizeFailed {
                    session_id: id.to_string(),
                    detail: e.to_string(),
                }),
            None => {
                self.load_external(id)?;
                let mut client =
                    IpcClient::connect(&self.store.socket_path(id)?, id).await?;
                client.send_control(&ControlCommand::ResetSize).await
            }
        }
    }

    /// Terminate the session. Default: two-phase escalation: graceful
    /// signal to process and group, liveness polls, then force-kill. An
    /// explicit SIGKILL bypasses escalation. Resolves only after the
    /// process is confirmed dead.
    pub async fn kill_session(&self, id: &str, signal: Option<i32>) -> HubResult<()> {
        let live_pid = {
            let sessions = self.sessions.read().await;
            sessions.get(id).map(|l| l.pid)
        };

        let pid = match live_pid {
            Some(pid) => pid,
            None => {
                let desc = self.load_external(id)?;
                if desc.status == SessionStatus::Exited {
                    return Ok(());
                }
                // Cooperative shutdown via the owning process, if reachable.
                if let Ok(mut client) =
                    IpcClient::connect(&self.store.socket_path(id)?, id).await
                {
                    let _ = client.send_control(&ControlCommand::Kill { signal }).await;
                }
                match desc.pid {
                    Some(pid) => pid,
                    None => return Ok(()),
                }
            }
        };

        self.escalate_kill(id, pid, signal).await?;

        // A session without an in-memory handle has no exit watcher here;
        // reconcile its descriptor now.
        if live_pid.is_none() {
            if let Ok(Some(mut desc)) = self.store.load(id) {
                if desc.status != SessionStatus::Exited {
                    desc.status = SessionStatus::Exited;
                    desc.exit_code = Some(crate::store::ZOMBIE_EXIT_CODE);
                    let _ = self.store.save(&mut desc);
                }
            }
        }
        Ok(())
    }

    async fn escalate_kill(&self, id: &str, pid: u32, signal: Option<i32>) -> HubResult<()> {
        let fail = |detail: String| HubError::KillFailed {
            session_id: id.to_string(),
            detail,
        };

        let sig = signal.unwrap_or(process::SIGTERM);
        process::send_signal(pid, sig).map_err(|e| fail(e.to_string()))?;
        let _ = process::send_signal_group(pid, sig);

        if sig == process::SIGKILL {
            // Explicit force: no escalation, just a short wait for effect.
            tokio::time::sleep(self.config.kill_force_wait).await;
            return self.confirm_death(id, pid, Duration::from_secs(1)).await;
        }

        let deadline = Instant::now() + self.config.kill_escalation_timeout;
        while Instant::now() < deadline {
            if !process::process_alive(pid) {
                return Ok(());
            }
            tokio::time::sleep(self.config.kill_poll_interval).await;
        }

        warn!(session_id = %id, pid, "graceful kill timed out, forcing");
        process::send_signal(pid, process::SIGKILL).map_err(|e| fail(e.to_string()))?;
        let _ = process::send_signal_group(pid, process::SIGKILL);
        self.confirm_death(id, pid, Duration::from_secs(2)).await
    }

    async fn confirm_death(&self, id: &str, pid: u32, window: Duration) -> HubResult<()> {
        let deadline = Instant::now() + window;
        loop {
            if !process::process_alive(pid) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HubError::KillFailed {
                    session_id: id.to_string(),
                    detail: format!("pid {pid} survived SIGKILL"),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Rename a session. Returns the final (possibly suffixed) name.
    pub async fn update_session_name(&self, id: &str, name: &str) -> HubResult<String> {
        let mut desc = self
            .store
            .load(id)?
            .ok_or_else(|| HubError::SessionNotFound(id.to_string()))?;

        let taken: Vec<String> = self
            .store
            .list()
            .into_iter()
            .filter(|d| d.id != id)
            .map(|d| d.name)
            .collect();
        let final_name = SessionStore::pick_unique(name, &taken);

        desc.name = final_name.clone();
        self.store.save(&mut desc)?;

        let sessions = self.sessions.read().await;
        if let Some(live) = sessions.get(id) {
            let queue_title = {
                let mut ctx = live.title_ctx.lock().unwrap_or_else(|e| e.into_inner());
                ctx.name = final_name.clone();
                matches!(ctx.mode, TitleMode::Static | TitleMode::Dynamic)
                    .then(|| static_title(&ctx.cwd, &ctx.command, &ctx.name))
            };
            if let Some(title) = queue_title {
                live.injector
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .queue(title);
            }
        }
        drop(sessions);

        let _ = self.events.send(SessionEvent::Renamed {
            id: id.to_string(),
            name: final_name.clone(),
        });
        Ok(final_name)
    }

    /// All known sessions, zombies reconciled first.
    pub fn list_sessions(&self) -> Vec<SessionDescriptor> {
        self.store.reap_zombies();
        self.store.list()
    }

    /// Kill (if needed) and remove a session's directory.
    pub async fn cleanup_session(&self, id: &str) -> HubResult<()> {
        let is_live = self.sessions.read().await.contains_key(id);
        if is_live {
            self.kill_session(id, None).await?;
            // The exit watcher tears the handle down; give it a moment.
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.sessions.read().await.contains_key(id) {
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        self.store.remove(id)
    }

    /// Remove every exited session's directory. Returns the removed ids.
    pub fn cleanup_exited(&self) -> Vec<String> {
        let mut removed = Vec::new();
        for desc in self.list_sessions() {
            if desc.status == SessionStatus::Exited {
                match self.store.remove(&desc.id) {
                    Ok(()) => removed.push(desc.id),
                    Err(e) => warn!(session_id = %desc.id, error = %e, "cleanup failed"),
                }
            }
        }
        removed
    }

    /// Terminate all live sessions and stop background work. Waits
    /// briefly for forceful kills to take effect.
    pub async fn shutdown(&self) {
        let pids: Vec<(String, u32)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(id, l)| (id.clone(), l.pid)).collect()
        };
        if !pids.is_empty() {
            info!(count = pids.len(), "shutting down live sessions");
        }
        for (_, pid) in &pids {
            let _ = process::send_signal(*pid, process::SIGTERM);
            let _ = process::send_signal_group(*pid, process::SIGTERM);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        for (id, pid) in &pids {
            if process::process_alive(*pid) {
                debug!(session_id = %id, pid, "force-killing at shutdown");
                let _ = process::send_signal(*pid, process::SIGKILL);
                let _ = process::send_signal_group(*pid, process::SIGKILL);
            }
        }
        // Let exit watchers drain the pipelines and reconcile descriptors.
        let deadline = Instant::now() + Duration::from_secs(3);
        while !self.sessions.read().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            sweeper.abort();
        }
    }

    fn load_external(&self, id: &str) -> HubResult<SessionDescriptor> {
        self.store
            .load(id)?
            .ok_or_else(|| HubError::SessionNotFound(id.to_string()))
    }
}

/// Watch typed input for `cd` commands and keep the title's working
/// directory current. Heuristic: only whole typed lines are considered.
fn track_directory_changes(
    line: &mut Vec<u8>,
    bytes: &[u8],
    title_ctx: &Arc<StdMutex<TitleCtx>>,
    injector: &Arc<StdMutex<TitleInjector>>,
) {
    for &b in bytes {
        if b == b'\r' || b == b'\n' {
            let typed = String::from_utf8_lossy(line).trim().to_string();
            line.clear();
            let target = if typed == "cd" {
                dirs::home_dir()
            } else if let Some(arg) = typed.strip_prefix("cd ") {
                let arg = arg.trim().trim_matches('"').trim_matches('\'');
                if arg == "~" || arg.is_empty() {
                    dirs::home_dir()
                } else if let Some(rest) = arg.strip_prefix("~/") {
                    dirs::home_dir().map(|h| h.join(rest))
                } else if arg == "-" {
                    None
                } else {
                    let ctx = title_ctx.lock().unwrap_or_else(|e| e.into_inner());
                    Some(if arg.starts_with('/') {
                        PathBuf::from(arg)
                    } else {
                        ctx.cwd.join(arg)
                    })
                }
            } else {
                None
            };
            if let Some(target) = target {
                let queue_title = {
                    let mut ctx = title_ctx.lock().unwrap_or_else(|e| e.into_inner());
                    ctx.cwd = target;
                    (ctx.mode == TitleMode::Static)
                        .then(|| static_title(&ctx.cwd, &ctx.command, &ctx.name))
                };
                if let Some(title) = queue_title {
                    injector
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .queue(title);
                }
            }
        } else if b == 0x7f || b == 0x08 {
            line.pop();
        } else {
            line.push(b);
            if line.len() > 1024 {
                line.clear();
            }
        }
    }
}

/// Map a named special key to its terminal byte sequence.
fn special_key_bytes(key: &str) -> Option<&'static [u8]> {
    let bytes: &'static [u8] = match key {
        "enter" => b"\r",
        "escape" => b"\x1b",
        "backspace" => b"\x7f",
        "tab" => b"\t",
        "shift_tab" => b"\x1b[Z",
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "page_up" => b"\x1b[5~",
        "page_down" => b"\x1b[6~",
        "home" => b"\x1b[H",
        "end" => b"\x1b[F",
        "delete" => b"\x1b[3~",
        "ctrl_enter" => b"\n",
        _ => return None,
    };
    Some(bytes)
}

/// Short random id from a safe filename alphabet; keeps socket paths
/// well under the platform limit.
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Environment captured into the recording header.
fn captured_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in ["TERM", "SHELL", "LANG"] {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_keys_map_to_sequences() {
        assert_eq!(special_key_bytes("enter"), Some(b"\r" as &[u8]));
        assert_eq!(special_key_bytes("arrow_up"), Some(b"\x1b[A" as &[u8]));
        assert_eq!(special_key_bytes("meta_q"), None);
    }

    #[test]
    fn session_ids_are_short_and_safe() {
        let id = generate_session_id();
        assert_eq!(id.len(), 16);
        assert!(SessionStore::validate_id(&id).is_ok());
    }

    #[test]
    fn cd_heuristic_tracks_absolute_and_relative() {
        let ctx = Arc::new(StdMutex::new(TitleCtx {
            mode: TitleMode::Static,
            name: "t".into(),
            command: vec!["sh".into()],
            cwd: PathBuf::from("/srv"),
        }));
        let injector = Arc::new(StdMutex::new(TitleInjector::new()));
        let mut line = Vec::new();

        track_directory_changes(&mut line, b"cd /opt/app\r", &ctx, &injector);
        assert_eq!(ctx.lock().unwrap().cwd, PathBuf::from("/opt/app"));
        assert!(injector.lock().unwrap().has_pending());

        track_directory_changes(&mut line, b"cd sub\r", &ctx, &injector);
        assert_eq!(ctx.lock().unwrap().cwd, PathBuf::from("/opt/app/sub"));
    }

    #[test]
    fn cd_heuristic_ignores_other_commands() {
        let ctx = Arc::new(StdMutex::new(TitleCtx {
            mode: TitleMode::Static,
            name: "t".into(),
            command: vec!["sh".into()],
            cwd: PathBuf::from("/srv"),
        }));
        let injector = Arc::new(StdMutex::new(TitleInjector::new()));
        let mut line = Vec::new();

        track_directory_changes(&mut line, b"ls -la /etc\r", &ctx, &injector);
        assert_eq!(ctx.lock().unwrap().cwd, PathBuf::from("/srv"));
        assert!(!injector.lock().unwrap().has_pending());
    }

    #[test]
    fn backspace_edits_the_tracked_line() {
        let ctx = Arc::new(StdMutex::new(TitleCtx {
            mode: TitleMode::Static,
            name: "t".into(),
            command: vec!["sh".into()],
            cwd: PathBuf::from("/srv"),
        }));
        let injector = Arc::new(StdMutex::new(TitleInjector::new()));
        let mut line = Vec::new();

        track_directory_changes(&mut line, b"cd /tmpX\x7f\r", &ctx, &injector);
        assert_eq!(ctx.lock().unwrap().cwd, PathBuf::from("/tmp"));
    }

    #[tokio::test]
    async fn unknown_special_key_is_rejected() {
        let (_tmp, manager) = test_manager().await;
        let err = manager
            .send_input("nope", SessionInput::SpecialKey("meta_q".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnknownKey(_)));
    }

    fn test_config(root: PathBuf) -> Config {
        Config {
            control_root: root,
            recording_enabled: true,
            flush_each_event: false,
            default_title_mode: TitleMode::None,
            kill_poll_interval: Duration::from_millis(50),
            kill_escalation_timeout: Duration::from_millis(500),
            kill_force_wait: Duration::from_millis(100),
        }
    }

    async fn test_manager() -> (tempfile::TempDir, Arc<SessionManager>) {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(tmp.path().join("control"))).unwrap();
        (tmp, manager)
    }

    async fn wait_for_exit(
        events: &mut broadcast::Receiver<SessionEvent>,
        id: &str,
    ) -> i32 {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Exited {
                        id: exited,
                        exit_code,
                    }) if exited == id => return exit_code,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event stream closed before exit")
                    }
                }
            }
        })
        .await
        .expect("session did not exit in time")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_session_runs_records_and_exits() {
        let (_tmp, manager) = test_manager().await;
        let mut events = manager.subscribe();

        let (id, descriptor) = manager
            .create_session(
                vec!["echo".into(), "hub-test".into()],
                SessionOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(descriptor.status, SessionStatus::Running);
        assert!(descriptor.pid.is_some());

        let exit_code = wait_for_exit(&mut events, &id).await;
        assert_eq!(exit_code, 0);

        let listed = manager.list_sessions();
        let desc = listed.iter().find(|d| d.id == id).unwrap();
        assert_eq!(desc.status, SessionStatus::Exited);
        assert_eq!(desc.exit_code, Some(0));

        let recording = std::fs::read_to_string(
            manager.control_root().join(&id).join(crate::store::STDOUT_FILE),
        )
        .unwrap();
        let lines: Vec<&str> = recording.lines().collect();
        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["version"], 2);
        assert!(recording.contains("hub-test"));
        let last: serde_json::Value = serde_json::from_str(lines.last().unwrap()).unwrap();
        assert_eq!(last[0], "exit");
        assert_eq!(last[1], 0);
        assert_eq!(last[2], id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn input_round_trips_through_a_live_session() {
        let (_tmp, manager) = test_manager().await;
        let mut events = manager.subscribe();

        let (id, _) = manager
            .create_session(vec!["cat".into()], SessionOptions::default())
            .await
            .unwrap();

        manager
            .send_input(&id, SessionInput::Text("ping\n".into()))
            .await
            .unwrap();

        // Wait until the echoed bytes appear in the output stream.
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Output { id: from, data }) if from == id => {
                        if String::from_utf8_lossy(&data).contains("ping") {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("events closed"),
                }
            }
        })
        .await
        .expect("input was never echoed");

        manager.kill_session(&id, None).await.unwrap();
        wait_for_exit(&mut events, &id).await;

        // Input was mirrored to the stdin file.
        let stdin = std::fs::read(
            manager.control_root().join(&id).join(crate::store::STDIN_FILE),
        )
        .unwrap();
        assert_eq!(stdin, b"ping\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminal_resize_yields_to_recent_browser_resize() {
        let (_tmp, manager) = test_manager().await;
        let mut events = manager.subscribe();

        let (id, _) = manager
            .create_session(vec!["cat".into()], SessionOptions::default())
            .await
            .unwrap();

        manager
            .resize_session(&id, 100, 30, ResizeSource::Browser)
            .await
            .unwrap();
        manager
            .resize_session(&id, 80, 24, ResizeSource::Terminal)
            .await
            .unwrap();

        let desc = manager.list_sessions().into_iter().find(|d| d.id == id).unwrap();
        assert_eq!((desc.cols, desc.rows), (100, 30));

        manager.kill_session(&id, None).await.unwrap();
        wait_for_exit(&mut events, &id).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn back_to_back_browser_resizes_apply_in_order() {
        let (_tmp, manager) = test_manager().await;
        let mut events = manager.subscribe();

        let (id, _) = manager
            .create_session(vec!["cat".into()], SessionOptions::default())
            .await
            .unwrap();

        manager
            .resize_session(&id, 120, 40, ResizeSource::Browser)
            .await
            .unwrap();
        manager
            .resize_session(&id, 80, 24, ResizeSource::Browser)
            .await
            .unwrap();

        // Last browser resize wins; both reach the recording in order.
        let desc = manager.list_sessions().into_iter().find(|d| d.id == id).unwrap();
        assert_eq!((desc.cols, desc.rows), (80, 24));

        manager.kill_session(&id, None).await.unwrap();
        wait_for_exit(&mut events, &id).await;

        let recording = std::fs::read_to_string(
            manager.control_root().join(&id).join(crate::store::STDOUT_FILE),
        )
        .unwrap();
        let resizes: Vec<String> = recording
            .lines()
            .skip(1)
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter(|ev| ev[1] == "r")
            .map(|ev| ev[2].as_str().unwrap().to_string())
            .collect();
        assert_eq!(resizes, ["120x40", "80x24"]);
    }

    #[test]
    fn spawn_rollback_kills_orphaned_child() {
        let spawned = spawn_pty(
            &["sleep".to_string(), "30".to_string()],
            std::path::Path::new("/tmp"),
            &HashMap::new(),
            80,
            24,
        )
        .unwrap();
        let pid = spawned.pid;

        drop(SpawnRollback { pid, armed: true });
        assert!(!process::process_alive(pid));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_session_names_are_suffixed() {
        let (_tmp, manager) = test_manager().await;
        let mut events = manager.subscribe();

        let options = || SessionOptions {
            name: Some("job".into()),
            ..Default::default()
        };
        let (id1, d1) = manager
            .create_session(vec!["cat".into()], options())
            .await
            .unwrap();
        let (id2, d2) = manager
            .create_session(vec!["cat".into()], options())
            .await
            .unwrap();
        assert_eq!(d1.name, "job");
        assert_eq!(d2.name, "job (2)");

        for id in [&id1, &id2] {
            manager.kill_session(id, None).await.unwrap();
            wait_for_exit(&mut events, id).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_escalates_when_sigterm_is_ignored() {
        let (_tmp, manager) = test_manager().await;
        let mut events = manager.subscribe();

        let (id, _) = manager
            .create_session(
                vec![
                    "sh".into(),
                    "-c".into(),
                    "trap '' TERM; while true; do sleep 1; done".into(),
                ],
                SessionOptions::default(),
            )
            .await
            .unwrap();

        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.kill_session(&id, None).await.unwrap();
        let exit_code = wait_for_exit(&mut events, &id).await;
        assert_ne!(exit_code, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_removes_exited_sessions() {
        let (_tmp, manager) = test_manager().await;
        let mut events = manager.subscribe();

        let (id, _) = manager
            .create_session(vec!["true".into()], SessionOptions::default())
            .await
            .unwrap();
        wait_for_exit(&mut events, &id).await;

        let removed = manager.cleanup_exited();
        assert_eq!(removed, vec![id.clone()]);
        assert!(!manager.control_root().join(&id).exists());
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rename_persists_and_emits_event() {
        let (_tmp, manager) = test_manager().await;
        let mut events = manager.subscribe();

        let (id, _) = manager
            .create_session(vec!["cat".into()], SessionOptions::default())
            .await
            .unwrap();

        let final_name = manager.update_session_name(&id, "renamed").await.unwrap();
        assert_eq!(final_name, "renamed");
        let desc = manager.list_sessions().into_iter().find(|d| d.id == id).unwrap();
        assert_eq!(desc.name, "renamed");

        manager.kill_session(&id, None).await.unwrap();
        wait_for_exit(&mut events, &id).await;
    }
}
