//! Handles of started commands.
//!
//! A [`Process`] is created by the executor for every command, either in a dedicated channel or in
//! the interactive shell. It owns the queue fed by the stream readers and turns the queued chunks
//! into captured output lines, the process ID and the exit code.

pub mod marker;
pub(crate) mod reader;

use crate::error::{cmd_failed_msg, Error, Result};
use crate::executor::guard::ShellLease;
use crate::transport::{Channel, ExitWaiter, StreamId};
use log::{debug, warn};
use marker::{Marker, MarkerMatcher};
use reader::{spawn_reader, Chunk, QueueItem, Utf8Decoder};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long to wait for the line with the process ID.
const PID_TIMEOUT: Duration = Duration::from_secs(10);

/// Longer "PIDs" are certainly garbage.
const MAX_PID_LEN: usize = 128;

/// Destination for output echoed while a command runs, shared with the caller.
pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

/// Options for [`Process::wait`].
#[derive(Clone)]
pub struct WaitOptions {
    /// How long to wait. `None` waits without a limit, zero processes at most one queued chunk.
    pub timeout: Option<Duration>,
    /// Whether to keep the output. When false, the output is read and thrown away.
    pub capture_output: bool,
    /// Stop waiting once a stream has this many lines, and return at most that many lines of it.
    pub lines: [Option<usize>; 2],
    /// Sinks of stdout and stderr. Output is written to them as it arrives, whether it is
    /// captured or not.
    pub sinks: [Option<OutputSink>; 2],
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            capture_output: true,
            lines: [None, None],
            sinks: [None, None],
        }
    }
}

impl std::fmt::Debug for WaitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitOptions")
            .field("timeout", &self.timeout)
            .field("capture_output", &self.capture_output)
            .field("lines", &self.lines)
            .field("stdout_sink", &self.sinks[0].is_some())
            .field("stderr_sink", &self.sinks[1].is_some())
            .finish()
    }
}

impl WaitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_lines(mut self, stdout: Option<usize>, stderr: Option<usize>) -> Self {
        self.lines = [stdout, stderr];
        self
    }

    pub fn with_sinks(mut self, stdout: Option<OutputSink>, stderr: Option<OutputSink>) -> Self {
        self.sinks = [stdout, stderr];
        self
    }
}

/// Output collected by one [`Process::wait`] call. Lines keep their newline characters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// `None` if the process has not finished yet.
    pub exit_code: Option<i32>,
}

impl ProcOutput {
    pub fn stdout_text(&self) -> String {
        self.stdout.concat()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.concat()
    }
}

/// Standard streams of a running channel: stdin, the reader threads and their queue.
pub(crate) struct ChannelIo {
    stdin: Option<Box<dyn Write + Send>>,
    pub(crate) waiter: Box<dyn ExitWaiter>,
    pub(crate) queue: Receiver<QueueItem>,
    readers: [Option<JoinHandle<()>>; 2],
    stop: Arc<AtomicBool>,
}

impl ChannelIo {
    /// Starts the stream readers of `channel`.
    pub(crate) fn start(channel: Channel) -> Result<Self> {
        let Channel {
            stdin,
            stdout,
            stderr,
            waiter,
        } = channel;

        let (tx, queue) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let spawn_err =
            |e: std::io::Error| Error::Transport(format!("failed to start a stream reader: {}", e));

        let stdout_reader = spawn_reader(StreamId::Stdout, stdout, tx.clone(), Arc::clone(&stop))
            .map_err(spawn_err)?;
        let stderr_reader =
            spawn_reader(StreamId::Stderr, stderr, tx, Arc::clone(&stop)).map_err(spawn_err)?;

        Ok(Self {
            stdin: Some(stdin),
            waiter,
            queue,
            readers: [Some(stdout_reader), Some(stderr_reader)],
            stop,
        })
    }

    pub(crate) fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        stdin.write_all(data)?;
        stdin.flush()
    }

    pub(crate) fn close_stdin(&mut self) {
        self.stdin = None;
    }

    fn join_reader(&mut self, id: StreamId) {
        if let Some(handle) = self.readers[id.index()].take() {
            let _ = handle.join();
        }
    }

    /// Stops the readers and releases the channel without killing the process.
    pub(crate) fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.close_stdin();
        self.waiter.close();
    }
}

impl Drop for ChannelIo {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

enum Next {
    Item(QueueItem),
    TimedOut,
    Disconnected,
}

fn next_item(queue: &Receiver<QueueItem>, timeout: Option<Duration>, start: Instant) -> Next {
    let result = match timeout {
        None => queue.recv().map_err(|_| RecvTimeoutError::Disconnected),
        Some(timeout) => queue.recv_timeout(timeout.saturating_sub(start.elapsed())),
    };
    match result {
        Ok(item) => Next::Item(item),
        Err(RecvTimeoutError::Timeout) => Next::TimedOut,
        Err(RecvTimeoutError::Disconnected) => Next::Disconnected,
    }
}

fn timed_out(timeout: Option<Duration>, start: Instant) -> bool {
    timeout.is_some_and(|timeout| start.elapsed() >= timeout)
}

/// Writes `text` to `sink`. A failing sink is dropped, the output is still captured.
fn echo(sink: &mut Option<OutputSink>, text: &str) {
    let Some(writer) = sink.as_ref() else {
        return;
    };
    let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Err(err) = writer.write_all(text.as_bytes()) {
        warn!("failed to echo command output, not echoing anymore: {}", err);
        drop(writer);
        *sink = None;
    }
}

/// Captured output lines plus the not yet newline-terminated tail of every stream.
#[derive(Default)]
struct Capture {
    lines: [Vec<String>; 2],
    partial: [String; 2],
    decoders: [Utf8Decoder; 2],
    combine: bool,
    sinks: [Option<OutputSink>; 2],
}

impl Capture {
    fn push_bytes(&mut self, id: StreamId, data: &[u8], capture: bool) {
        let text = self.decoders[id.index()].decode(data);
        self.push_text(id, &text, capture);
    }

    fn push_text(&mut self, id: StreamId, text: &str, capture: bool) {
        if text.is_empty() {
            return;
        }

        let idx = if self.combine { 0 } else { id.index() };
        echo(&mut self.sinks[idx], text);
        if !capture {
            return;
        }

        let partial = &mut self.partial[idx];
        partial.push_str(text);

        let mut start = 0;
        for (pos, _) in partial.match_indices('\n') {
            self.lines[idx].push(partial[start..=pos].to_string());
            start = pos + 1;
        }
        partial.drain(..start);
    }

    /// Moves incomplete last lines into the captured lines, done once the process finished.
    fn flush(&mut self, capture: bool) {
        for id in StreamId::ALL {
            let tail = self.decoders[id.index()].finish();
            self.push_text(id, &tail, capture);
        }
        for idx in 0..2 {
            if !self.partial[idx].is_empty() {
                let line = std::mem::take(&mut self.partial[idx]);
                self.lines[idx].push(line);
            }
        }
    }

    /// Echoes what was captured before any sink was given, such as output read together with the
    /// process ID line.
    fn echo_backlog(&mut self) {
        for idx in 0..2 {
            let mut text = self.lines[idx].concat();
            text.push_str(&self.partial[idx]);
            if !text.is_empty() {
                echo(&mut self.sinks[idx], &text);
            }
        }
    }

    fn flush_sinks(&mut self) {
        for sink in self.sinks.iter_mut().flatten() {
            let mut writer = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(err) = writer.flush() {
                debug!("failed to flush an output sink: {}", err);
            }
        }
    }

    /// Takes everything not returned yet: remaining lines, the incomplete last lines and bytes
    /// still waiting in the decoders.
    fn take_rest(&mut self, capture: bool) -> [String; 2] {
        for id in StreamId::ALL {
            let tail = self.decoders[id.index()].finish();
            self.push_text(id, &tail, capture);
        }
        let mut take = |idx: usize| {
            let mut text = std::mem::take(&mut self.lines[idx]).concat();
            text.push_str(&std::mem::take(&mut self.partial[idx]));
            text
        };
        [take(0), take(1)]
    }

    fn have_enough_lines(&self, lines: &[Option<usize>; 2]) -> bool {
        (0..2).any(|idx| matches!(lines[idx], Some(n) if n > 0 && self.lines[idx].len() >= n))
    }

    fn take_lines(&mut self, limits: &[Option<usize>; 2]) -> [Vec<String>; 2] {
        let mut take = |idx: usize| match limits[idx] {
            Some(n) => {
                let n = n.min(self.lines[idx].len());
                self.lines[idx].drain(..n).collect()
            }
            None => std::mem::take(&mut self.lines[idx]),
        };
        [take(0), take(1)]
    }

    fn combine(&mut self) {
        self.combine = true;
        let stderr = std::mem::take(&mut self.lines[1]);
        self.lines[0].extend(stderr);
        let partial = std::mem::take(&mut self.partial[1]);
        self.partial[0].push_str(&partial);
    }
}

enum Backend {
    /// The command runs in its own channel.
    Dedicated { io: ChannelIo, closed: [bool; 2] },
    /// The command runs in the interactive shell, which is returned once the command finishes.
    Interactive {
        lease: ShellLease,
        /// Trailer matchers of stdout and stderr.
        matchers: [MarkerMatcher; 2],
        /// Status carried by the trailer of each stream, once seen.
        codes: [Option<i32>; 2],
    },
}

/// A command started on a host.
pub struct Process {
    cmd: String,
    real_cmd: String,
    hostname: Option<String>,
    shell: bool,
    pid: Option<u32>,
    exit_code: Option<i32>,
    /// Timeout of the last `wait()`, used in failure messages.
    timeout: Option<Duration>,
    /// Whether the last `wait()` captured the output.
    capture_output: bool,
    /// Whether output was echoed to a sink yet.
    echoing: bool,
    capture: Capture,
    backend: Backend,
}

impl Process {
    /// Creates the handle of a command running in its own channel. When `shell` is true, the
    /// command was wrapped to print its process ID first, which is read right away.
    pub(crate) fn new_dedicated(
        io: ChannelIo,
        cmd: &str,
        real_cmd: String,
        shell: bool,
        hostname: Option<String>,
    ) -> Result<Self> {
        let pid = if shell { None } else { io.waiter.pid() };
        let mut proc = Self {
            cmd: cmd.to_string(),
            real_cmd,
            hostname,
            shell,
            pid,
            exit_code: None,
            timeout: None,
            capture_output: true,
            echoing: false,
            capture: Capture::default(),
            backend: Backend::Dedicated {
                io,
                closed: [false, false],
            },
        };
        if shell {
            proc.read_pid()?;
        }
        Ok(proc)
    }

    /// Creates the handle of a command just submitted to the interactive shell.
    pub(crate) fn new_interactive(
        lease: ShellLease,
        marker: Marker,
        cmd: &str,
        real_cmd: String,
        hostname: Option<String>,
    ) -> Result<Self> {
        let mut proc = Self {
            cmd: cmd.to_string(),
            real_cmd,
            hostname,
            shell: true,
            pid: None,
            exit_code: None,
            timeout: None,
            capture_output: true,
            echoing: false,
            capture: Capture::default(),
            backend: Backend::Interactive {
                lease,
                matchers: [
                    MarkerMatcher::new(marker.clone()),
                    MarkerMatcher::new(marker),
                ],
                codes: [None, None],
            },
        };
        proc.read_pid()?;
        Ok(proc)
    }

    /// The command as requested by the caller.
    pub fn command(&self) -> &str {
        &self.cmd
    }

    /// The command as actually submitted, including the wrapping.
    pub fn real_command(&self) -> &str {
        &self.real_cmd
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn uses_shell(&self) -> bool {
        self.shell
    }

    /// Whether the command runs in the interactive shell rather than its own channel.
    pub fn is_interactive(&self) -> bool {
        matches!(self.backend, Backend::Interactive { .. })
    }

    pub fn hostmsg(&self) -> String {
        self.hostname
            .as_deref()
            .map(|h| format!(" on host '{}'", h))
            .unwrap_or_default()
    }

    /// Merges standard error into standard output from now on, including what was captured.
    pub fn set_combine_streams(&mut self, combine: bool) {
        if combine && !self.capture.combine {
            self.capture.combine();
        }
    }

    /// Writes to the standard input of the command.
    ///
    /// Commands in the interactive shell read their input from `/dev/null`, so this is not
    /// supported for them.
    pub fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.backend {
            Backend::Dedicated { io, .. } => io.send(data).map_err(|e| {
                Error::Transport(format!(
                    "failed to write to stdin of the following command{}:\n  {}\nThe error is: {}",
                    self.hostname
                        .as_deref()
                        .map(|h| format!(" on host '{}'", h))
                        .unwrap_or_default(),
                    self.cmd,
                    e
                ))
            }),
            Backend::Interactive { .. } => Err(Error::NotSupported(format!(
                "commands in the interactive shell have no standard input, the command was:\n  {}",
                self.cmd
            ))),
        }
    }

    /// Closes the standard input, so that the command sees end of file.
    pub fn close_stdin(&mut self) {
        if let Backend::Dedicated { io, .. } = &mut self.backend {
            io.close_stdin();
        }
    }

    /// Returns the exit code if the process has finished, without waiting.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        match &mut self.backend {
            Backend::Dedicated { io, .. } => io.waiter.poll(),
            Backend::Interactive { .. } => Ok(None),
        }
    }

    /// Waits for the process and returns the output captured since the previous call.
    ///
    /// Waiting stops when the process finishes, when `opts.timeout` expires, or when a stream has
    /// the requested number of lines. A timeout is not an error: the exit code is then `None` and
    /// the process keeps running.
    pub fn wait(&mut self, opts: &WaitOptions) -> Result<ProcOutput> {
        self.timeout = opts.timeout;
        self.capture_output = opts.capture_output;
        self.capture.sinks = opts.sinks.clone();
        if !self.echoing && opts.sinks.iter().any(Option::is_some) {
            self.echoing = true;
            self.capture.echo_backlog();
        }
        if self.exit_code.is_none() {
            let result = match self.backend {
                Backend::Dedicated { .. } => self.wait_dedicated(opts),
                Backend::Interactive { .. } => self.wait_interactive(opts),
            };
            self.capture.flush_sinks();
            result?;
        }

        let [stdout, stderr] = self.capture.take_lines(&opts.lines);
        Ok(ProcOutput {
            stdout,
            stderr,
            exit_code: self.exit_code,
        })
    }

    /// Takes the output which [`Process::wait`] has not returned, most notably text which does not
    /// end with a newline yet. Returns the stdout and stderr text.
    ///
    /// This is for giving up on a process which did not finish in time. Output held back because
    /// it might be the start of the interactive shell marker is returned as well, so waiting for
    /// the process afterwards is not reliable.
    pub fn take_partial(&mut self) -> [String; 2] {
        if let Backend::Interactive {
            matchers, codes, ..
        } = &mut self.backend
        {
            for id in StreamId::ALL {
                let idx = id.index();
                if codes[idx].is_none() {
                    let held = matchers[idx].take_pending();
                    self.capture.push_text(id, &held, self.capture_output);
                }
            }
        }
        let rest = self.capture.take_rest(self.capture_output);
        self.capture.flush_sinks();
        rest
    }

    fn set_exit_code(&mut self, code: i32) {
        if self.exit_code.is_none() {
            self.exit_code = Some(code);
        }
    }

    fn wait_dedicated(&mut self, opts: &WaitOptions) -> Result<()> {
        let start = Instant::now();
        let mut status = None;
        let Backend::Dedicated { io, closed } = &mut self.backend else {
            return Ok(());
        };

        debug!("waiting for: {} (timeout {:?})", self.cmd, opts.timeout);
        while !self.capture.have_enough_lines(&opts.lines) {
            match next_item(&io.queue, opts.timeout, start) {
                Next::Item((id, Chunk::Data(data))) => {
                    self.capture.push_bytes(id, &data, opts.capture_output);
                }
                Next::Item((id, Chunk::Closed)) => {
                    debug!("{} of '{}' closed", id.name(), self.cmd);
                    io.join_reader(id);
                    closed[id.index()] = true;
                }
                Next::TimedOut => debug!("nothing in the queue for {:?}", opts.timeout),
                Next::Disconnected => *closed = [true, true],
            }

            if closed.iter().all(|c| *c) {
                debug!("both streams of '{}' closed", self.cmd);
                let left = opts.timeout.map(|t| t.saturating_sub(start.elapsed()));
                status = io.waiter.wait(left)?;
                break;
            }
            if timed_out(opts.timeout, start) {
                debug!("stop waiting for '{}' - timeout", self.cmd);
                break;
            }
        }

        if let Some(code) = status {
            debug!("'{}' exited with status {}", self.cmd, code);
            self.set_exit_code(code);
            self.capture.flush(opts.capture_output);
        }
        Ok(())
    }

    fn wait_interactive(&mut self, opts: &WaitOptions) -> Result<()> {
        let start = Instant::now();
        let hostmsg = self.hostmsg();
        let Backend::Interactive {
            lease,
            matchers,
            codes,
        } = &mut self.backend
        else {
            return Ok(());
        };
        let queue = &lease.shell_mut()?.io.queue;

        // Both trailers must be seen, the stdout one carries the exit status.
        while codes.iter().any(Option::is_none) && !self.capture.have_enough_lines(&opts.lines) {
            match next_item(queue, opts.timeout, start) {
                Next::Item((id, Chunk::Data(data))) => {
                    let idx = id.index();
                    let text = self.capture.decoders[idx].decode(&data);
                    if codes[idx].is_some() {
                        debug!("ignoring {} data after the marker: {:?}", id.name(), text);
                        continue;
                    }
                    let (released, code) = matchers[idx].feed(&text).map_err(|trailer| {
                        Error::Protocol(format!(
                            "the process was running{} under the interactive shell and finished \
                             with a correct marker, but unexpected {} trailer '{}'.\nThe command \
                             was: {}",
                            hostmsg,
                            id.name(),
                            trailer,
                            self.cmd
                        ))
                    })?;
                    self.capture.push_text(id, &released, opts.capture_output);
                    codes[idx] = code;
                }
                Next::Item((id, Chunk::Closed)) => {
                    return Err(Error::Transport(format!(
                        "the interactive shell process{} closed {} while running the following \
                         command:\n  {}",
                        hostmsg,
                        id.name(),
                        self.cmd
                    )));
                }
                Next::Disconnected => {
                    return Err(Error::Transport(format!(
                        "lost the interactive shell process{} while running the following \
                         command:\n  {}",
                        hostmsg, self.cmd
                    )));
                }
                Next::TimedOut => debug!("nothing in the queue for {:?}", opts.timeout),
            }

            if timed_out(opts.timeout, start) {
                debug!("stop waiting for '{}' - timeout", self.cmd);
                break;
            }
        }

        let [Some(code), Some(_)] = *codes else {
            return Ok(());
        };

        debug!("'{}' exited with status {} (interactive shell)", self.cmd, code);
        lease.release(&self.cmd);
        self.set_exit_code(code);
        self.capture.flush(opts.capture_output);
        Ok(())
    }

    /// Reads the line with the process ID, printed by the command wrapper.
    fn read_pid(&mut self) -> Result<()> {
        debug!("reading PID for command: {}", self.cmd);
        let opts = WaitOptions::default()
            .with_timeout(PID_TIMEOUT)
            .with_lines(Some(1), Some(0));
        let output = self.wait(&opts)?;

        let msg = format!(
            "\nThe command{} was:\n  {}\nThe actual (real) command was:\n  {}",
            self.hostmsg(),
            self.cmd,
            self.real_cmd
        );

        if output.stdout.len() != 1 {
            return Err(Error::Command(format!(
                "expected only one line with PID in stdout, got {} lines instead.{}",
                output.stdout.len(),
                msg
            )));
        }

        let pid = output.stdout[0].trim();
        if pid.len() > MAX_PID_LEN {
            return Err(Error::Command(format!(
                "received too long and probably bogus PID: {}{}",
                pid, msg
            )));
        }
        let pid: u32 = pid.parse().map_err(|_| {
            Error::Command(format!("received a bogus non-integer PID: {}{}", pid, msg))
        })?;

        debug!("PID is {} for command: {}", pid, self.cmd);
        self.pid = Some(pid);
        Ok(())
    }

    /// Formats a failure message for this command.
    pub fn cmd_failed_msg(&self, stdout: &str, stderr: &str, exit_code: Option<i32>) -> String {
        let mut cmd = self.cmd.clone();
        if log::log_enabled!(log::Level::Debug) && self.cmd != self.real_cmd {
            cmd.push_str(&format!("\nReal command: {}", self.real_cmd));
        }
        cmd_failed_msg(
            &cmd,
            stdout,
            stderr,
            exit_code,
            self.hostname.as_deref(),
            self.timeout,
        )
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("cmd", &self.cmd)
            .field("hostname", &self.hostname)
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .field("interactive", &self.is_interactive())
            .finish()
    }
}
