use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use runlink_protocol::paths::ipc_socket_path;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::display::{ActivityFn, DisplayInfo, DisplayProvider, LocalDisplays};
use crate::error::RunError;
use crate::ids::IdAllocator;
use crate::ipc::{IpcClients, IpcServer, MessageFn};
use crate::output::{self, OutputFn, PumpConfig};
use crate::privilege::{self, PrivilegeDrop, UserSpec};
use crate::pty::{self, PtyMaster};

/// Channels a running program may send on.
pub const LISTEN_CHANNELS: [&str; 2] = ["video", "keylisten"];
/// Channel the program listens on for key events.
pub const KEYEVENT_CHANNEL: &str = "keyevent";
/// Pending `stdin` writes per process before further input is refused.
pub const INPUT_QUEUE: usize = 64;

/// Receives everything a handler reports about its process.
pub trait ProcessCallbacks: Send + Sync {
    fn on_start(&self);
    fn on_stop(&self, exit_code: i32);
    fn on_output(&self, channel: &str, text: String);
    fn on_display_activity(&self, _info: &DisplayInfo) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner {
    Python3,
    Shell,
    Exec,
}

impl Runner {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "python3" => Some(Runner::Python3),
            "shell" => Some(Runner::Shell),
            "exec" => Some(Runner::Exec),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Runner::Python3 => "python3",
            Runner::Shell => "shell",
            Runner::Exec => "exec",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Runner::Python3 => "py",
            Runner::Shell | Runner::Exec => "sh",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub runner: Runner,
    pub code: Option<String>,
    pub path: Option<PathBuf>,
    /// Defaults to the directory of `path`, else the scratch directory.
    pub work_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub pty: bool,
    pub novnc: bool,
}

impl StartOptions {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            code: None,
            path: None,
            work_dir: None,
            env: Vec::new(),
            pty: false,
            novnc: false,
        }
    }

    pub fn with_code(runner: Runner, code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::new(runner)
        }
    }
}

/// Services and settings shared by the handlers of one run manager.
pub struct ProcessContext {
    pub ids: Arc<IdAllocator>,
    pub ipc_clients: Arc<IpcClients>,
    pub display: Arc<dyn DisplayProvider>,
    pub ipc_dir: PathBuf,
    /// Where entrypoints for submitted code are written.
    pub scratch_dir: PathBuf,
    pub pump: PumpConfig,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    /// How long output pumps may keep draining after exit.
    pub flush_window: Duration,
}

impl ProcessContext {
    pub fn new(ids: Arc<IdAllocator>, ipc_dir: PathBuf, scratch_dir: PathBuf) -> Self {
        Self {
            ids,
            ipc_clients: Arc::new(IpcClients::new(ipc_dir.clone())),
            display: Arc::new(LocalDisplays::new()),
            ipc_dir,
            scratch_dir,
            pump: PumpConfig::default(),
            stop_grace: Duration::from_secs(1),
            flush_window: Duration::from_secs(2),
        }
    }
}

type InputSink = Box<dyn AsyncWrite + Send + Unpin>;
type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Default)]
enum Phase {
    #[default]
    Idle,
    Running(Running),
    Finished,
}

struct Running {
    pgid: i32,
    /// Kept for resizing; reading and writing use their own handles.
    pty: Option<PtyMaster>,
    exit: watch::Receiver<Option<i32>>,
}

#[derive(Default)]
struct Shared {
    phase: Mutex<Phase>,
    /// Queue feeding the input writer task.
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn input(&self) -> MutexGuard<'_, Option<mpsc::Sender<Vec<u8>>>> {
        self.input.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Process group and exit watch of a process that has not exited yet.
    fn live(&self) -> Result<(i32, watch::Receiver<Option<i32>>), RunError> {
        match &*self.phase() {
            Phase::Running(run) if run.exit.borrow().is_none() => Ok((run.pgid, run.exit.clone())),
            _ => Err(RunError::invalid_operation("process is not running")),
        }
    }
}

/// Frees its id when dropped.
struct IdReservation {
    ids: Arc<IdAllocator>,
    id: u32,
}

impl Drop for IdReservation {
    fn drop(&mut self) {
        self.ids.free(self.id);
    }
}

/// One program started on behalf of a client.
pub struct ProcessHandler {
    id: u32,
    user: Option<UserSpec>,
    ctx: Arc<ProcessContext>,
    callbacks: Arc<dyn ProcessCallbacks>,
    reservation: Mutex<Option<IdReservation>>,
    shared: Arc<Shared>,
}

struct Launched {
    child: Child,
    pumps: Vec<JoinHandle<()>>,
    finished: watch::Sender<bool>,
    exit: watch::Sender<Option<i32>>,
}

impl ProcessHandler {
    /// Reserve an id for a new handler. Fails with `TooManyProcesses` when
    /// the allocator is exhausted.
    pub fn new(
        ctx: Arc<ProcessContext>,
        callbacks: Arc<dyn ProcessCallbacks>,
        user: Option<UserSpec>,
    ) -> Result<Self, RunError> {
        let id = ctx.ids.create()?;
        Ok(Self {
            id,
            user,
            reservation: Mutex::new(Some(IdReservation {
                ids: Arc::clone(&ctx.ids),
                id,
            })),
            ctx,
            callbacks,
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn pgid(&self) -> Option<i32> {
        match &*self.shared.phase() {
            Phase::Running(run) => Some(run.pgid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.live().is_ok()
    }

    /// Spawn the program. `on_start` fires before any output; `on_stop`
    /// fires once, after cleanup, when the process has exited.
    pub async fn start(&self, opts: StartOptions) -> Result<(), RunError> {
        let reservation = self
            .reservation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| RunError::invalid_operation("process already started"))?;
        let mut cleanup = Cleanup {
            process_id: self.id,
            reservation,
            ctx: Arc::clone(&self.ctx),
            shared: Arc::clone(&self.shared),
            entrypoint: None,
            input_writer: None,
            display: false,
            ipc_servers: Vec::new(),
            pgid: None,
        };

        match self.launch(opts, &mut cleanup).await {
            Ok(launched) => {
                self.supervise(launched, cleanup);
                Ok(())
            }
            Err(e) => {
                cleanup.run().await;
                Err(e)
            }
        }
    }

    async fn launch(&self, opts: StartOptions, cleanup: &mut Cleanup) -> Result<Launched, RunError> {
        tokio::fs::create_dir_all(&self.ctx.scratch_dir).await?;
        let cwd = opts
            .work_dir
            .clone()
            .or_else(|| opts.path.as_deref().and_then(Path::parent).map(Path::to_path_buf))
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| self.ctx.scratch_dir.clone());
        let (program, args) = self.entrypoint(&opts, cleanup).await?;

        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PWD".to_string(), cwd.display().to_string()),
        ];
        if let Some(user) = &self.user {
            env.extend(user.login_env());
        }
        if let Some(display) = self.display_for(&opts, cleanup).await {
            env.push(("DISPLAY".to_string(), display));
        }
        env.extend(opts.env.iter().cloned());

        let mut command = Command::new(&program);
        command.args(&args).current_dir(&cwd).envs(env);

        let mut pty_handles = None;
        if opts.pty {
            let (master, slave) = pty::open_pty(pty::DEFAULT_ROWS, pty::DEFAULT_COLS)?;
            if let Some(user) = &self.user {
                std::os::unix::fs::fchown(&slave, Some(user.uid), Some(user.gid))?;
            }
            let writer = master.try_clone()?;
            let resizer = master.try_clone()?;
            command
                .stdin(Stdio::from(slave.try_clone()?))
                .stdout(Stdio::from(slave.try_clone()?))
                .stderr(Stdio::from(slave));
            pty_handles = Some((master, writer, resizer));
        } else {
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let credentials = self.user.as_ref().map(PrivilegeDrop::new);
        let controlling_tty = opts.pty;
        // SAFETY: runs between fork and exec; only async-signal-safe syscalls
        // on data prepared before the fork.
        unsafe {
            command.pre_exec(move || {
                privilege::enter_new_session(controlling_tty)?;
                if let Some(credentials) = &credentials {
                    credentials.apply()?;
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| RunError::Spawn(format!("{}: {e}", program.to_string_lossy())))?;
        // Our copies of the PTY slave live in the command.
        drop(command);
        let pgid = child
            .id()
            .map(|pid| pid as i32)
            .ok_or_else(|| RunError::Spawn("child exited before its pid was read".to_string()))?;
        cleanup.pgid = Some(pgid);

        let (readers, input, resizer) = match pty_handles {
            Some((master, writer, resizer)) => (
                vec![(Box::new(master) as OutputStream, "stdout")],
                Some(Box::new(writer) as InputSink),
                Some(resizer),
            ),
            None => {
                let mut readers = Vec::new();
                if let Some(stdout) = child.stdout.take() {
                    readers.push((Box::new(stdout) as OutputStream, "stdout"));
                }
                if let Some(stderr) = child.stderr.take() {
                    readers.push((Box::new(stderr) as OutputStream, "stderr"));
                }
                let input = child.stdin.take().map(|stdin| Box::new(stdin) as InputSink);
                (readers, input, None)
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        if let Some(sink) = input {
            let (queue, pending) = mpsc::channel(INPUT_QUEUE);
            *self.shared.input() = Some(queue);
            cleanup.input_writer = Some(tokio::spawn(write_input(sink, pending, self.id)));
        }
        *self.shared.phase() = Phase::Running(Running {
            pgid,
            pty: resizer,
            exit: exit_rx,
        });

        info!(process_id = self.id, pgid, runner = opts.runner.as_str(), pty = opts.pty, "process started");
        self.callbacks.on_start();

        let (finished_tx, finished_rx) = watch::channel(false);
        let pumps = readers
            .into_iter()
            .map(|(stream, channel)| self.spawn_pump(stream, channel, finished_rx.clone()))
            .collect();

        for channel in LISTEN_CHANNELS {
            let callbacks = Arc::clone(&self.callbacks);
            let on_message: MessageFn = Arc::new(move |message| {
                callbacks.on_output(channel, String::from_utf8_lossy(&message).into_owned());
            });
            match IpcServer::bind(&self.ctx.ipc_dir, pgid, channel, on_message) {
                Ok(server) => cleanup.ipc_servers.push(server),
                Err(e) => warn!(process_id = self.id, pgid, channel, "side channel unavailable: {e}"),
            }
        }

        Ok(Launched {
            child,
            pumps,
            finished: finished_tx,
            exit: exit_tx,
        })
    }

    /// Program and arguments to exec; writes submitted code to a file first
    /// when the runner needs one.
    async fn entrypoint(
        &self,
        opts: &StartOptions,
        cleanup: &mut Cleanup,
    ) -> Result<(OsString, Vec<OsString>), RunError> {
        let code = opts.code.as_deref();
        let path = opts.path.as_deref();
        match (opts.runner, code, path) {
            (_, None, None) => Err(RunError::bad_message("start needs code or a path")),
            (Runner::Shell, Some(code), _) => Ok(("sh".into(), vec!["-c".into(), code.into()])),
            (Runner::Shell, None, Some(path)) => Ok(("sh".into(), vec![path.into()])),
            (Runner::Python3, None, Some(path)) => {
                Ok(("python3".into(), vec!["-u".into(), path.into()]))
            }
            (Runner::Exec, None, Some(path)) => Ok((path.into(), Vec::new())),
            (runner, Some(code), _) => {
                let file = self.write_entrypoint(runner, code, cleanup).await?;
                Ok(match runner {
                    Runner::Python3 => ("python3".into(), vec!["-u".into(), file.into()]),
                    _ => (file.into(), Vec::new()),
                })
            }
        }
    }

    async fn write_entrypoint(
        &self,
        runner: Runner,
        code: &str,
        cleanup: &mut Cleanup,
    ) -> Result<PathBuf, RunError> {
        let file = self
            .ctx
            .scratch_dir
            .join(format!("{}.{}", self.id, runner.extension()));
        let mut contents = String::with_capacity(code.len() + 10);
        if runner == Runner::Exec && !code.starts_with("#!") {
            contents.push_str("#!/bin/sh\n");
        }
        contents.push_str(code);

        cleanup.entrypoint = Some(file.clone());
        tokio::fs::write(&file, contents).await?;
        let mode = if runner == Runner::Exec { 0o755 } else { 0o644 };
        tokio::fs::set_permissions(&file, std::fs::Permissions::from_mode(mode)).await?;
        if let Some(user) = &self.user {
            std::os::unix::fs::chown(&file, Some(user.uid), Some(user.gid))?;
        }
        Ok(file)
    }

    /// `DISPLAY` for the program: its own display when one was requested
    /// and could be started, else whatever is already running.
    async fn display_for(&self, opts: &StartOptions, cleanup: &mut Cleanup) -> Option<String> {
        if opts.novnc {
            let callbacks = Arc::clone(&self.callbacks);
            let on_activity: ActivityFn = Arc::new(move |info| callbacks.on_display_activity(info));
            let user = self.user.as_ref().map(|user| user.name.as_str());
            match self.ctx.display.start(self.id, user, on_activity).await {
                Ok(info) => {
                    cleanup.display = true;
                    return Some(info.display);
                }
                Err(e) => warn!(process_id = self.id, "could not start display: {e}"),
            }
        }
        self.ctx.display.first_running_display()
    }

    fn spawn_pump(
        &self,
        stream: OutputStream,
        channel: &'static str,
        finished: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let callbacks = Arc::clone(&self.callbacks);
        let emit: OutputFn = Arc::new(move |text| callbacks.on_output(channel, text));
        tokio::spawn(output::pump(stream, finished, self.ctx.pump, emit))
    }

    fn supervise(&self, launched: Launched, cleanup: Cleanup) {
        let callbacks = Arc::clone(&self.callbacks);
        let flush_window = self.ctx.flush_window;
        let process_id = self.id;

        tokio::spawn(async move {
            let Launched {
                mut child,
                pumps,
                finished,
                exit,
            } = launched;

            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(process_id, "waiting for process failed: {e}");
                    -1
                }
            };
            let _ = exit.send(Some(code));
            let _ = finished.send(true);

            let deadline = tokio::time::Instant::now() + flush_window;
            for mut pump in pumps {
                if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
                    debug!(process_id, "output still pending after exit, abandoning it");
                    pump.abort();
                }
            }

            cleanup.run().await;
            info!(process_id, exit_code = code, "process stopped");
            callbacks.on_stop(code);
        });
    }

    /// SIGTERM the process group, then SIGKILL once the grace period passes.
    pub async fn stop(&self) -> Result<(), RunError> {
        let (pgid, mut exit) = self.shared.live()?;
        signal_group(pgid, Signal::SIGTERM);

        let exited = tokio::time::timeout(self.ctx.stop_grace, exit.wait_for(Option::is_some))
            .await
            .map(|waited| waited.is_ok())
            .unwrap_or(false);
        if !exited {
            warn!(process_id = self.id, pgid, "process ignored SIGTERM, killing");
            signal_group(pgid, Signal::SIGKILL);
        }
        Ok(())
    }

    /// Queue `text` for the program's stdin. Never waits on the program:
    /// a full queue is refused instead.
    pub async fn send_input(&self, text: &str) -> Result<(), RunError> {
        self.shared.live()?;
        let queue = self
            .shared
            .input()
            .clone()
            .ok_or_else(|| RunError::invalid_operation("input is closed"))?;
        match queue.try_send(text.as_bytes().to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(RunError::invalid_operation("process is not reading its input"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RunError::invalid_operation("process closed its input"))
            }
        }
    }

    pub fn resize_pty(&self, rows: u16, cols: u16) -> Result<(), RunError> {
        match &*self.shared.phase() {
            Phase::Running(run) if run.exit.borrow().is_none() => match &run.pty {
                Some(master) => Ok(master.resize(rows, cols)?),
                None => Err(RunError::invalid_operation("process has no terminal")),
            },
            _ => Err(RunError::invalid_operation("process is not running")),
        }
    }

    /// Forward a key event to the program. Delivery is best effort.
    pub async fn send_key_event(&self, key: &str, event: &str) -> Result<(), RunError> {
        let (pgid, _) = self.shared.live()?;
        let message = format!("{key} {event}");
        self.ctx
            .ipc_clients
            .send(pgid, KEYEVENT_CHANNEL, message.as_bytes())
            .await;
        Ok(())
    }
}

/// Everything a started handler must release once its process is gone.
/// Consumed by `run`, so it happens exactly once per handler.
struct Cleanup {
    process_id: u32,
    reservation: IdReservation,
    ctx: Arc<ProcessContext>,
    shared: Arc<Shared>,
    entrypoint: Option<PathBuf>,
    input_writer: Option<JoinHandle<()>>,
    display: bool,
    ipc_servers: Vec<IpcServer>,
    pgid: Option<i32>,
}

impl Cleanup {
    async fn run(self) {
        let Cleanup {
            process_id,
            reservation,
            ctx,
            shared,
            entrypoint,
            input_writer,
            display,
            ipc_servers,
            pgid,
        } = self;

        if let Some(path) = entrypoint {
            cleanup_step(process_id, "remove entrypoint", tokio::fs::remove_file(&path).await);
        }
        // Closes stdin, or the PTY writer and resize handles.
        shared.input().take();
        if let Some(writer) = input_writer {
            writer.abort();
        }
        *shared.phase() = Phase::Finished;

        if display {
            ctx.display.stop(process_id).await;
        }
        drop(ipc_servers);
        if let Some(pgid) = pgid {
            let program_socket = ipc_socket_path(&ctx.ipc_dir, pgid, KEYEVENT_CHANNEL);
            cleanup_step(process_id, "remove keyevent socket", std::fs::remove_file(program_socket));
            ctx.ipc_clients.forget(pgid).await;
        }
        drop(reservation);
        debug!(process_id, "cleanup complete");
    }
}

/// Owns the program's stdin so a program that stops reading blocks only
/// this task.
async fn write_input(mut sink: InputSink, mut queue: mpsc::Receiver<Vec<u8>>, process_id: u32) {
    while let Some(bytes) = queue.recv().await {
        let written = match sink.write_all(&bytes).await {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(process_id, "input closed: {e}");
            return;
        }
    }
}

/// Teardown never stops on a failed step.
fn cleanup_step(process_id: u32, step: &str, result: std::io::Result<()>) {
    match result {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(process_id, step, "cleanup step failed: {e}"),
    }
}

fn signal_group(pgid: i32, signal: Signal) {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => debug!(pgid, ?signal, "signalled process group"),
        Err(Errno::ESRCH) => debug!(pgid, "process group already gone"),
        Err(e) => warn!(pgid, ?signal, "failed to signal process group: {e}"),
    }
}

/// Exit code, or the negated signal number for a killed process.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_names_round_trip() {
        for runner in [Runner::Python3, Runner::Shell, Runner::Exec] {
            assert_eq!(Runner::parse(runner.as_str()), Some(runner));
        }
        assert_eq!(Runner::parse("ruby"), None);
    }

    #[test]
    fn exit_code_negates_signals() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGTERM)), -15);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), -9);
    }

    struct Quiet;

    impl ProcessCallbacks for Quiet {
        fn on_start(&self) {}
        fn on_stop(&self, _exit_code: i32) {}
        fn on_output(&self, _channel: &str, _text: String) {}
    }

    fn context(dir: &Path, max: u32) -> Arc<ProcessContext> {
        Arc::new(ProcessContext::new(
            Arc::new(IdAllocator::new(max)),
            dir.to_path_buf(),
            dir.join("scratch"),
        ))
    }

    #[test]
    fn handler_reserves_and_releases_its_id() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 1);
        let handler = ProcessHandler::new(Arc::clone(&ctx), Arc::new(Quiet), None).unwrap();
        assert_eq!(handler.id(), 1);
        assert!(matches!(
            ProcessHandler::new(Arc::clone(&ctx), Arc::new(Quiet), None),
            Err(RunError::TooManyProcesses(1))
        ));
        drop(handler);
        assert_eq!(ctx.ids.in_use(), 0);
    }

    #[tokio::test]
    async fn start_without_code_or_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 4);
        let handler = ProcessHandler::new(Arc::clone(&ctx), Arc::new(Quiet), None).unwrap();
        let err = handler.start(StartOptions::new(Runner::Python3)).await.unwrap_err();
        assert!(matches!(err, RunError::BadMessage(_)));
        assert_eq!(ctx.ids.in_use(), 0);
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn operations_on_idle_handler_are_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 4);
        let handler = ProcessHandler::new(ctx, Arc::new(Quiet), None).unwrap();
        assert!(matches!(handler.stop().await, Err(RunError::InvalidOperation(_))));
        assert!(matches!(handler.send_input("x").await, Err(RunError::InvalidOperation(_))));
        assert!(matches!(handler.resize_pty(10, 10), Err(RunError::InvalidOperation(_))));
        assert!(matches!(
            handler.send_key_event("a", "keydown").await,
            Err(RunError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn failed_spawn_removes_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 4);
        let handler = ProcessHandler::new(Arc::clone(&ctx), Arc::new(Quiet), None).unwrap();
        let mut opts = StartOptions::with_code(Runner::Exec, "echo hi\n");
        opts.work_dir = Some(dir.path().join("does-not-exist"));
        let err = handler.start(opts).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn(_)));
        assert!(!ctx.scratch_dir.join("1.sh").exists());
        assert_eq!(ctx.ids.in_use(), 0);
    }
}
