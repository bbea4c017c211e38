mod session_test;

use crate::terminal::launch::AllowAnyPath;
use crate::terminal::mock::{MockProcess, MockSpawner};
use crate::terminal::registry::RegistryConfig;
use crate::terminal::shell::{Platform, ShellResolver};
use crate::terminal::termination::TerminationSequencer;
use crate::terminal::{SessionEvent, SessionRegistry, SessionSettings};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub(crate) struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub spawner: MockSpawner,
    pub home: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(tweak: impl FnOnce(&mut RegistryConfig)) -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let shells = ShellResolver::new(Platform::Unix, None).with_probe(|path| path.ends_with("bash"));
        let mut config = RegistryConfig::new(shells, Arc::new(AllowAnyPath));
        config.home = home.path().to_path_buf();
        config.settings = SessionSettings::default();
        config.termination = TerminationSequencer::new(Duration::from_millis(1000));
        tweak(&mut config);
        let spawner = MockSpawner::new();
        let registry = SessionRegistry::new(config, Arc::new(spawner.clone()));
        Self {
            registry,
            spawner,
            home,
        }
    }

    pub fn process(&self) -> MockProcess {
        self.spawner.last().expect("a spawned process")
    }
}

/// Lets spawned tasks and due timers run. With a paused clock this also
/// advances time by `ms`.
pub(crate) async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub(crate) fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) fn data_of(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Data(data) => Some(data.clone()),
            SessionEvent::Exit { .. } => None,
        })
        .collect()
}
