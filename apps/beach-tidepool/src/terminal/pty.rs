use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, PtyPair, PtySize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Exit code reported when the real one is unknown (forced removal, lost waiter).
pub const UNKNOWN_EXIT_CODE: i32 = -1;

#[derive(Clone, Debug)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub inherit_env: bool,
    pub cwd: Option<PathBuf>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            inherit_env: true,
            cwd: None,
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Replace the inherited environment with exactly `vars`.
    pub fn exact_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.inherit_env = false;
        self.env = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct SpawnConfig {
    pub command: Command,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnConfig {
    pub fn new(command: Command, cols: u16, rows: u16) -> Self {
        Self {
            command,
            cols,
            rows,
        }
    }
}

/// Control surface of a running PTY child. Owned exclusively by its session.
pub trait PtyHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Queue raw input for the child. Never blocks on the PTY itself.
    fn write(&self, bytes: &[u8]) -> Result<()>;

    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Ask the child to exit (SIGTERM on unix).
    fn terminate(&self) -> Result<()>;

    /// Force the child down.
    fn kill(&self) -> Result<()>;
}

/// A freshly spawned child: its handle, its decoded output feed and its exit code.
pub struct SpawnedPty {
    pub handle: Box<dyn PtyHandle>,
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
}

pub trait PtySpawner: Send + Sync {
    fn spawn(&self, config: SpawnConfig) -> Result<SpawnedPty>;
}

/// Spawns real shells through `portable-pty`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeSpawner;

impl PtySpawner for NativeSpawner {
    fn spawn(&self, config: SpawnConfig) -> Result<SpawnedPty> {
        let mut pair = spawn_pair(config.rows, config.cols)?;
        let mut child = spawn_child(&mut pair, &config.command)?;
        let PtyPair { master, slave } = pair;
        // The slave end must close here or the reader never sees EOF.
        drop(slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = master.try_clone_reader().context("clone PTY reader")?;
        let writer = master.take_writer().context("take PTY writer")?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("tidepool-pty-read".into())
            .spawn(move || read_loop(reader, output_tx))
            .context("spawn PTY reader thread")?;

        let (input_tx, input_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        thread::Builder::new()
            .name("tidepool-pty-write".into())
            .spawn(move || write_loop(writer, input_rx))
            .context("spawn PTY writer thread")?;

        let (exit_tx, exit_rx) = oneshot::channel();
        thread::Builder::new()
            .name("tidepool-pty-wait".into())
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => i32::try_from(status.exit_code()).unwrap_or(UNKNOWN_EXIT_CODE),
                    Err(err) => {
                        warn!(target = "tidepool::pty", error = %err, "wait for PTY child failed");
                        UNKNOWN_EXIT_CODE
                    }
                };
                let _ = exit_tx.send(code);
            })
            .context("spawn PTY wait thread")?;

        debug!(
            target = "tidepool::pty",
            pid = ?pid,
            program = %config.command.program,
            cols = config.cols,
            rows = config.rows,
            "spawned PTY child"
        );

        Ok(SpawnedPty {
            handle: Box::new(NativePty {
                master: Mutex::new(master),
                input: input_tx,
                killer: Mutex::new(killer),
                pid,
            }),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

struct NativePty {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    input: crossbeam_channel::Sender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyHandle for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        self.input
            .send(bytes.to_vec())
            .map_err(|_| anyhow::anyhow!("PTY writer closed"))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master.lock().resize(size).context("resize PTY")
    }

    #[cfg(unix)]
    fn terminate(&self) -> Result<()> {
        match self.pid {
            Some(pid) => signal(pid, libc::SIGTERM),
            None => self.kill(),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> Result<()> {
        self.kill()
    }

    #[cfg(unix)]
    fn kill(&self) -> Result<()> {
        match self.pid {
            // The child leads its own process group; take the whole group down.
            Some(pid) => signal_group(pid, libc::SIGKILL).or_else(|_| signal(pid, libc::SIGKILL)),
            None => self.killer.lock().kill().context("kill PTY child"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) -> Result<()> {
        self.killer.lock().kill().context("kill PTY child")
    }
}

#[cfg(unix)]
fn signal(pid: u32, sig: libc::c_int) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("pid out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("signal PTY child")
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("pid out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("signal PTY process group")
    }
}

const READ_CHUNK: usize = 4096;

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<String>) {
    let mut buffer = [0u8; READ_CHUNK];
    let mut decoder = Utf8Decoder::default();
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() && tx.send(text).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // Linux reports EIO once the child side has gone away.
                trace!(target = "tidepool::pty", error = %err, "PTY read ended");
                break;
            }
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = tx.send(tail);
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, rx: crossbeam_channel::Receiver<Vec<u8>>) {
    for bytes in rx {
        if let Err(err) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            debug!(target = "tidepool::pty", error = %err, "PTY write failed");
            break;
        }
    }
}

/// Incremental UTF-8 decoding that holds back a multi-byte sequence split
/// across reads instead of replacing it.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

fn spawn_pair(rows: u16, cols: u16) -> Result<PtyPair> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    pty_system.openpty(size).context("open PTY pair")
}

fn spawn_child(pair: &mut PtyPair, command: &Command) -> Result<Box<dyn Child + Send + Sync>> {
    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    if !command.inherit_env {
        cmd.env_clear();
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &command.cwd {
        cmd.cwd(Path::new(cwd));
    }
    pair.slave.spawn_command(cmd).context("spawn PTY child")
}
