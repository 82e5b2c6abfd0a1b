//! Out-of-process expression evaluation.
//!
//! A [`Worker`] launches a child evaluator process, connects to it over a
//! unix-domain socket, and streams typed requests and responses across it.
//! Four supervisory threads per worker coordinate the lifecycle:
//!
//! - *process-watch* owns the child handle, reaps it on exit, and triggers
//!   termination
//! - *output-redirect* (one thread per captured stream) forwards the
//!   child's stdout/stderr lines to a configurable sink
//! - *response-reader* deserializes responses and fulfills the matching
//!   result slot
//! - *request-sender* drains the submission channel onto the pipe
//!
//! Shutdown converges through a single atomic `terminated` flag: exactly
//! one path (explicit [`Worker::terminate`], child exit, transport error,
//! protocol violation) wins the flag and performs cleanup; every other
//! path observes the flag and stands down. Cleanup cancels all in-flight
//! futures with [`WorkerErrorKind::Terminated`], escalates signals against
//! the child (SIGTERM, then SIGINT, finally SIGKILL, with grace periods in
//! between), and closes the pipe.
//!
//! # Example
//!
//! ```no_run
//! use taskutil::worker::WorkerOptions;
//!
//! let worker = WorkerOptions::new("/usr/local/bin/taskutil-worker")
//!     .spawn()
//!     .expect("spawn worker");
//!
//! let value = worker.remote_fetch("Main", "1+2").expect("eval");
//! assert_eq!(value, serde_json::json!(3));
//! worker.close();
//! ```

mod error;
mod eval;
mod future;
pub mod protocol;
mod serve;

pub use error::{WorkerError, WorkerErrorKind};
pub use eval::{Evaluator, ExprEvaluator};
pub use future::EvalFuture;
pub use protocol::EvalError;
pub use serve::serve_requests;

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::timeout::try_with_timeout;
use crate::worker::future::FutureSlot;
use crate::worker::protocol::{read_frame, write_frame, Request, Response};

/// Sink receiving the child's output lines.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Default time a parent waits for the child to connect back.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period between signal escalation steps during terminate.
const SIGNAL_GRACE: Duration = Duration::from_millis(500);

/// Configuration for launching a [`Worker`].
///
/// The child program is started with the caller's arguments plus
/// `--pipe <socket-path>` appended; it is expected to connect back to that
/// path and serve requests (see [`serve_requests`]). The bundled
/// `taskutil-worker` binary does exactly that with an [`ExprEvaluator`].
///
/// Environment is inherited from the parent by default (so module search
/// paths and the like propagate); individual variables can be overridden
/// with [`env`](WorkerOptions::env).
#[must_use = "worker options do nothing unless spawned"]
pub struct WorkerOptions {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    connect_timeout: Duration,
    output_sink: Option<OutputSink>,
    socket_dir: Option<PathBuf>,
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl WorkerOptions {
    /// Creates options for launching `program` as the child evaluator.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            output_sink: None,
            socket_dir: None,
        }
    }

    /// Appends an argument passed to the child before `--pipe`.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Sets how long to wait for the child to connect back (default 60s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Replaces the default output sink.
    ///
    /// The default prefixes each child output line with
    /// `  Worker <pid>:  ` and prints it to the parent's stdout.
    pub fn output_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.output_sink = Some(Arc::new(sink));
        self
    }

    /// Directory for the rendezvous socket (default: the OS temp dir).
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    /// Launches the worker.
    pub fn spawn(self) -> Result<Worker, WorkerError> {
        Worker::spawn(self)
    }
}

/// What flows through the submission channel to the request-sender thread.
enum Submission {
    Eval(Request),
    Shutdown,
}

/// State shared between the worker handle and its supervisory threads.
struct Shared {
    pid: u32,
    terminated: AtomicBool,
    /// In-flight request slots, keyed by request id. The single piece of
    /// shared mutable state across threads; only touched under this mutex.
    futures: Mutex<HashMap<u64, Arc<FutureSlot>>>,
    /// Submission side of the channel; taken (disconnecting the channel)
    /// when the worker terminates.
    submit_tx: Mutex<Option<Sender<Submission>>>,
    /// Kept for shutting the pipe down on terminate; the reader and sender
    /// threads own their own clones.
    stream: UnixStream,
    socket_path: PathBuf,
}

impl Shared {
    /// Transitions the worker into the terminated state.
    ///
    /// Exactly one caller wins the flag and performs cleanup; losers return
    /// false immediately. Cleanup is idempotent-by-construction: cancel all
    /// pending futures, escalate signals against the child, close the pipe,
    /// remove the socket path.
    fn terminate(&self, from: &str) -> bool {
        if self
            .terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::info!(pid = self.pid, from, "terminating worker");

        // Disconnect the submission channel; the sender thread drains out.
        drop(
            self.submit_tx
                .lock()
                .expect("worker submit channel poisoned")
                .take(),
        );

        let pending: Vec<Arc<FutureSlot>> = {
            let mut futures = self.futures.lock().expect("worker futures map poisoned");
            futures.drain().map(|(_, slot)| slot).collect()
        };
        if !pending.is_empty() {
            tracing::debug!(
                pid = self.pid,
                cancelled = pending.len(),
                "cancelling in-flight evaluations"
            );
        }
        for slot in pending {
            slot.fulfill(Err(WorkerError::terminated()));
        }

        self.escalate_signals();

        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = fs::remove_file(&self.socket_path);
        true
    }

    /// SIGTERM, then SIGINT, finally SIGKILL, with a grace period between
    /// steps; stops as soon as the child is gone.
    fn escalate_signals(&self) {
        let Ok(raw) = i32::try_from(self.pid) else {
            return;
        };
        let pid = Pid::from_raw(raw);

        for signal in [Signal::SIGTERM, Signal::SIGINT] {
            if kill(pid, None).is_err() {
                return;
            }
            tracing::debug!(pid = self.pid, ?signal, "signalling worker child");
            let _ = kill(pid, signal);
            let deadline = Instant::now() + SIGNAL_GRACE;
            while Instant::now() < deadline {
                if kill(pid, None).is_err() {
                    return;
                }
                thread::sleep(Duration::from_millis(20));
            }
        }

        if kill(pid, None).is_ok() {
            tracing::warn!(pid = self.pid, "worker child survived SIGTERM and SIGINT; killing");
            let _ = kill(pid, Signal::SIGKILL);
        }
    }
}

/// Handle to a child evaluator process.
///
/// Evaluations are submitted with [`remote_eval`](Worker::remote_eval)
/// (returning an [`EvalFuture`]) or synchronously with
/// [`remote_fetch`](Worker::remote_fetch). [`close`](Worker::close) asks
/// the child to exit and waits for an orderly teardown;
/// [`terminate`](Worker::terminate) tears the worker down immediately.
///
/// Dropping a live worker terminates it.
pub struct Worker {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.shared.pid)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Launches a child evaluator per `options`.
    ///
    /// Binds a fresh rendezvous socket, spawns the child with
    /// `--pipe <path>` appended to its arguments, waits (bounded by the
    /// connect timeout) for the child to connect back, and starts the
    /// supervisory threads.
    pub fn spawn(options: WorkerOptions) -> Result<Worker, WorkerError> {
        let socket_path = socket_path_in(options.socket_dir.as_deref());
        let listener = UnixListener::bind(&socket_path).map_err(|err| {
            WorkerError::new(WorkerErrorKind::Spawn)
                .with_context(format!("binding {}", socket_path.display()))
                .with_source(err)
        })?;

        let mut command = Command::new(&options.program);
        command
            .args(&options.args)
            .arg("--pipe")
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &options.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            let _ = fs::remove_file(&socket_path);
            WorkerError::new(WorkerErrorKind::Spawn)
                .with_context(format!("spawning {}", options.program.display()))
                .with_source(err)
        })?;
        let pid = child.id();
        tracing::info!(
            pid,
            program = %options.program.display(),
            socket = %socket_path.display(),
            "worker child spawned"
        );

        let stdout = child.stdout.take().expect("child stdout was piped");
        let stderr = child.stderr.take().expect("child stderr was piped");

        let stream = match accept_within(listener, options.connect_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = fs::remove_file(&socket_path);
                return Err(err);
            }
        };
        stream.set_nonblocking(false).map_err(WorkerError::from)?;
        let reader = stream.try_clone().map_err(WorkerError::from)?;
        let writer = stream.try_clone().map_err(WorkerError::from)?;

        let (submit_tx, submit_rx) = mpsc::channel::<Submission>();
        let shared = Arc::new(Shared {
            pid,
            terminated: AtomicBool::new(false),
            futures: Mutex::new(HashMap::new()),
            submit_tx: Mutex::new(Some(submit_tx)),
            stream,
            socket_path,
        });

        let sink = options.output_sink.unwrap_or_else(|| default_sink(pid));

        let mut threads = Vec::with_capacity(5);
        threads.push(spawn_thread("worker-watch", {
            let shared = Arc::clone(&shared);
            move || watch_child(child, &shared)
        }));
        threads.push(spawn_thread("worker-stdout", {
            let sink = Arc::clone(&sink);
            move || redirect_output(stdout, &sink)
        }));
        threads.push(spawn_thread("worker-stderr", {
            let sink = Arc::clone(&sink);
            move || redirect_output(stderr, &sink)
        }));
        threads.push(spawn_thread("worker-recv", {
            let shared = Arc::clone(&shared);
            move || read_responses(reader, &shared)
        }));
        threads.push(spawn_thread("worker-send", {
            let shared = Arc::clone(&shared);
            move || send_requests(&submit_rx, writer, &shared)
        }));

        Ok(Worker {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// The child's process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    /// Returns true once the worker has transitioned to terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    /// Schedules an evaluation and returns a handle to its result.
    ///
    /// Never blocks on the child. If the worker is already terminated the
    /// returned future fails immediately with
    /// [`WorkerErrorKind::Terminated`].
    pub fn remote_eval(&self, module: &str, expr: &str) -> EvalFuture {
        let slot = Arc::new(FutureSlot::new());
        let future = EvalFuture::new(Arc::clone(&slot));
        let id = rand::random::<u64>();
        let request = Request::eval(module, expr, id);

        // Register under the futures-map mutex. terminate() sets the flag
        // before draining under the same mutex, so this either observes the
        // flag or gets its entry included in the drain; a slot can never be
        // stranded unresolved.
        {
            let mut futures = self.shared.futures.lock().expect("worker futures map poisoned");
            if self.shared.terminated.load(Ordering::Acquire) {
                drop(futures);
                slot.fulfill(Err(WorkerError::terminated()));
                return future;
            }
            futures.insert(id, Arc::clone(&slot));
        }

        let sent = {
            let submit = self
                .shared
                .submit_tx
                .lock()
                .expect("worker submit channel poisoned");
            submit
                .as_ref()
                .is_some_and(|tx| tx.send(Submission::Eval(request)).is_ok())
        };
        if !sent {
            self.shared
                .futures
                .lock()
                .expect("worker futures map poisoned")
                .remove(&id);
            slot.fulfill(Err(WorkerError::terminated()));
        }
        future
    }

    /// Evaluates synchronously: `remote_eval` then fetch.
    pub fn remote_fetch(
        &self,
        module: &str,
        expr: &str,
    ) -> Result<serde_json::Value, WorkerError> {
        self.remote_eval(module, expr).fetch()
    }

    /// Sends the child a shutdown request and waits for orderly teardown.
    ///
    /// Returns once the child has exited and every supervisory thread has
    /// joined. In-flight evaluations submitted before the close are
    /// answered before the child sees the shutdown request.
    pub fn close(&self) {
        tracing::info!(pid = self.shared.pid, "closing worker");
        {
            let submit = self
                .shared
                .submit_tx
                .lock()
                .expect("worker submit channel poisoned");
            if let Some(tx) = submit.as_ref() {
                let _ = tx.send(Submission::Shutdown);
            }
        }
        self.join_threads();
    }

    /// Tears the worker down immediately.
    ///
    /// Cancels all in-flight evaluations with
    /// [`WorkerErrorKind::Terminated`], signals the child (SIGTERM, SIGINT,
    /// SIGKILL with grace periods), and closes the pipe. Returns true if
    /// this call performed the termination, false if the worker was already
    /// terminating.
    pub fn terminate(&self) -> bool {
        self.shared.terminate("api")
    }

    /// Waits for the worker to finish without initiating shutdown.
    ///
    /// Returns once the child has exited (for any reason) and all
    /// supervisory threads have joined.
    pub fn wait(&self) {
        self.join_threads();
    }

    fn join_threads(&self) {
        let threads: Vec<JoinHandle<()>> = {
            let mut guard = self.threads.lock().expect("worker threads poisoned");
            guard.drain(..).collect()
        };
        for handle in threads {
            if let Err(panic) = handle.join() {
                tracing::error!(pid = self.shared.pid, ?panic, "worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // A dropped handle must not leave the child running.
        if !self.is_terminated() {
            self.shared.terminate("drop");
        }
        self.join_threads();
    }
}

/// Accepts the child's connection, bounded by `timeout`.
///
/// Polls a non-blocking accept on a spawned thread so the wait composes
/// with [`try_with_timeout`]; the poll loop observes the timeout handle and
/// exits promptly when the caller gives up.
fn accept_within(listener: UnixListener, timeout: Duration) -> Result<UnixStream, WorkerError> {
    listener.set_nonblocking(true).map_err(WorkerError::from)?;

    let accepted = try_with_timeout(
        move |timed_out| loop {
            match listener.accept() {
                Ok((stream, _)) => return Ok(stream),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if timed_out.timed_out() {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "listener poll abandoned",
                        ));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => return Err(err),
            }
        },
        timeout,
    );

    match accepted {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(WorkerError::new(WorkerErrorKind::Connect)
            .with_context("accepting worker connection")
            .with_source(err)),
        Err(timeout_err) => Err(WorkerError::new(WorkerErrorKind::Timeout)
            .with_context(format!("worker did not connect within {timeout:?}"))
            .with_source(timeout_err)),
    }
}

fn spawn_thread(name: &str, body: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("failed to spawn worker supervisory thread")
}

/// process-watch: reap the child, then drive termination.
fn watch_child(mut child: Child, shared: &Arc<Shared>) {
    match child.wait() {
        Ok(status) => tracing::info!(pid = shared.pid, %status, "worker child exited"),
        Err(err) => tracing::warn!(pid = shared.pid, error = %err, "waiting on worker child failed"),
    }
    shared.terminate("process-watch");
}

/// output-redirect: forward child output lines to the sink until EOF.
fn redirect_output(stream: impl io::Read, sink: &OutputSink) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        match line {
            Ok(line) => sink(&line),
            Err(_) => break,
        }
    }
}

/// response-reader: pair responses with their slots by id.
fn read_responses(stream: UnixStream, shared: &Arc<Shared>) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<_, Response>(&mut reader) {
            Ok(Some(response)) => {
                let slot = shared
                    .futures
                    .lock()
                    .expect("worker futures map poisoned")
                    .remove(&response.id);
                let Some(slot) = slot else {
                    if shared.terminated.load(Ordering::Acquire) {
                        // Benign race: the drain beat this response in.
                        break;
                    }
                    tracing::error!(
                        pid = shared.pid,
                        id = response.id,
                        "response with unknown or duplicate id; terminating worker"
                    );
                    shared.terminate("response-reader-protocol");
                    break;
                };
                match (response.result, response.error) {
                    (Some(value), None) => slot.fulfill(Ok(value)),
                    (None, Some(err)) => slot.fulfill(Err(WorkerError::eval(err))),
                    _ => {
                        tracing::error!(
                            pid = shared.pid,
                            id = response.id,
                            "response carries neither value nor error; terminating worker"
                        );
                        slot.fulfill(Err(WorkerError::new(WorkerErrorKind::Protocol)
                            .with_context("malformed response")));
                        shared.terminate("response-reader-protocol");
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(pid = shared.pid, "worker pipe reached EOF");
                shared.terminate("response-reader-eof");
                break;
            }
            Err(err) => {
                if !shared.terminated.load(Ordering::Acquire) {
                    tracing::warn!(pid = shared.pid, error = %err, "worker pipe read failed");
                    shared.terminate("response-reader-io");
                }
                break;
            }
        }
    }
}

/// request-sender: serialize submissions onto the pipe.
fn send_requests(rx: &Receiver<Submission>, stream: UnixStream, shared: &Arc<Shared>) {
    let mut writer = BufWriter::new(stream);
    loop {
        match rx.recv() {
            Ok(Submission::Eval(request)) => {
                if let Err(err) = write_frame(&mut writer, &request) {
                    if !shared.terminated.load(Ordering::Acquire) {
                        tracing::warn!(pid = shared.pid, error = %err, "worker pipe write failed");
                        shared.terminate("request-sender-io");
                    }
                    break;
                }
            }
            Ok(Submission::Shutdown) => {
                if let Err(err) = write_frame(&mut writer, &Request::shutdown()) {
                    tracing::debug!(pid = shared.pid, error = %err, "shutdown request not delivered");
                }
                let _ = writer.flush();
                break;
            }
            // Channel disconnected: the worker terminated.
            Err(_) => break,
        }
    }
}

fn default_sink(pid: u32) -> OutputSink {
    Arc::new(move |line: &str| {
        println!("  Worker {pid}:  {line}");
    })
}

fn socket_path_in(dir: Option<&std::path::Path>) -> PathBuf {
    let nonce: u64 = rand::random();
    let name = format!("taskutil-worker-{nonce:016x}.sock");
    match dir {
        Some(dir) => dir.join(name),
        None => std::env::temp_dir().join(name),
    }
}
