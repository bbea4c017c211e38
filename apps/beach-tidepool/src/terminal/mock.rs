use super::pty::{PtyHandle, PtySpawner, SpawnConfig, SpawnedPty};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// What a mock process has been asked to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MockJournal {
    pub writes: Vec<Vec<u8>>,
    pub resizes: Vec<(u16, u16)>,
    pub terminate_calls: usize,
    pub kill_calls: usize,
}

#[derive(Default)]
struct MockShared {
    journal: Mutex<MockJournal>,
    output: Mutex<Option<mpsc::UnboundedSender<String>>>,
    exit: Mutex<Option<oneshot::Sender<i32>>>,
    fail_resize: AtomicBool,
    /// Exit with this code as soon as a graceful terminate arrives.
    exit_on_terminate: Mutex<Option<i32>>,
}

impl MockShared {
    fn exit(&self, code: i32) {
        self.output.lock().take();
        if let Some(exit) = self.exit.lock().take() {
            let _ = exit.send(code);
        }
    }
}

/// Test-side controller of one spawned mock process.
#[derive(Clone)]
pub struct MockProcess {
    config: SpawnConfig,
    shared: Arc<MockShared>,
}

impl MockProcess {
    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Pretends the shell printed `text`.
    pub fn emit(&self, text: &str) {
        if let Some(output) = self.shared.output.lock().as_ref() {
            let _ = output.send(text.to_string());
        }
    }

    /// Closes the output stream and reports `code` as the exit status.
    pub fn exit(&self, code: i32) {
        self.shared.exit(code);
    }

    pub fn journal(&self) -> MockJournal {
        self.shared.journal.lock().clone()
    }

    pub fn fail_resizes(&self, fail: bool) {
        self.shared.fail_resize.store(fail, Ordering::SeqCst);
    }

    pub fn exit_on_terminate(&self, code: Option<i32>) {
        *self.shared.exit_on_terminate.lock() = code;
    }
}

struct MockPty {
    shared: Arc<MockShared>,
}

impl PtyHandle for MockPty {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        self.shared.journal.lock().writes.push(bytes.to_vec());
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.shared.fail_resize.load(Ordering::SeqCst) {
            return Err(anyhow!("mock resize failure"));
        }
        self.shared.journal.lock().resizes.push((cols, rows));
        Ok(())
    }

    fn terminate(&self) -> Result<()> {
        self.shared.journal.lock().terminate_calls += 1;
        let code = *self.shared.exit_on_terminate.lock();
        if let Some(code) = code {
            self.shared.exit(code);
        }
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        self.shared.journal.lock().kill_calls += 1;
        Ok(())
    }
}

/// In-memory spawner. Every spawn is recorded and can be driven from tests.
#[derive(Clone, Default)]
pub struct MockSpawner {
    spawned: Arc<Mutex<Vec<MockProcess>>>,
    fail: Arc<AtomicBool>,
    exit_on_terminate: Arc<Mutex<Option<i32>>>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent spawns fail.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Processes spawned from now on exit with `code` on graceful terminate.
    pub fn exit_on_terminate(&self, code: Option<i32>) {
        *self.exit_on_terminate.lock() = code;
    }

    pub fn spawned(&self) -> Vec<MockProcess> {
        self.spawned.lock().clone()
    }

    pub fn last(&self) -> Option<MockProcess> {
        self.spawned.lock().last().cloned()
    }
}

impl PtySpawner for MockSpawner {
    fn spawn(&self, config: SpawnConfig) -> Result<SpawnedPty> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("mock spawn failure"));
        }
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let shared = Arc::new(MockShared {
            output: Mutex::new(Some(output_tx)),
            exit: Mutex::new(Some(exit_tx)),
            exit_on_terminate: Mutex::new(*self.exit_on_terminate.lock()),
            ..MockShared::default()
        });
        self.spawned.lock().push(MockProcess {
            config,
            shared: shared.clone(),
        });
        Ok(SpawnedPty {
            handle: Box::new(MockPty { shared }),
            output: output_rx,
            exit: exit_rx,
        })
    }
}
