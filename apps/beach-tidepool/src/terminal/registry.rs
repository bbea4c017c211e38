use super::launch::{build_env, home_dir, process_env, resolve_cwd, PathGuard};
use super::output::{OutputSettings, SessionEvent, SubscriberId};
use super::pty::{Command, PtySpawner, SpawnConfig, SpawnedPty, UNKNOWN_EXIT_CODE};
use super::resize::{Dimensions, ResizeIgnored, ResizeOutcome};
use super::session::{Session, SessionId, SessionSettings, SessionSummary};
use super::shell::{ResolvedShell, ShellResolver};
use super::termination::TerminationSequencer;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

pub const MAX_SESSIONS_RANGE: RangeInclusive<usize> = 1..=1000;
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// How long the exit handler waits for the output pump to drain.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(100);
const EXIT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("maximum number of terminal sessions reached ({limit})")]
    MaxSessionsReached { limit: usize },
    #[error("terminal session {0} not found")]
    NotFound(SessionId),
    #[error("failed to spawn shell {shell}: {reason}")]
    Spawn { shell: String, reason: String },
}

/// Caller-supplied options for a new session. Everything is optional.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub cols: Option<i64>,
    #[serde(default)]
    pub rows: Option<i64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExit {
    pub id: SessionId,
    pub exit_code: i32,
}

/// Everything the registry needs besides its sessions.
pub struct RegistryConfig {
    pub max_sessions: usize,
    pub settings: SessionSettings,
    pub termination: TerminationSequencer,
    pub shells: ShellResolver,
    pub path_guard: Arc<dyn PathGuard>,
    pub home: PathBuf,
}

impl RegistryConfig {
    pub fn new(shells: ShellResolver, path_guard: Arc<dyn PathGuard>) -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            settings: SessionSettings::default(),
            termination: TerminationSequencer::default(),
            shells,
            path_guard,
            home: home_dir(),
        }
    }
}

/// Owner of every live session. The map is the single authority on whether a
/// session exists.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    max_sessions: AtomicUsize,
    settings: SessionSettings,
    termination: TerminationSequencer,
    shells: ShellResolver,
    path_guard: Arc<dyn PathGuard>,
    home: PathBuf,
    spawner: Arc<dyn PtySpawner>,
    exits: broadcast::Sender<SessionExit>,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, spawner: Arc<dyn PtySpawner>) -> Arc<Self> {
        let (exits, _) = broadcast::channel(EXIT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: AtomicUsize::new(clamp_max_sessions(config.max_sessions)),
            settings: config.settings,
            termination: config.termination,
            shells: config.shells,
            path_guard: config.path_guard,
            home: config.home,
            spawner,
            exits,
            this: this.clone(),
        })
    }

    pub fn output_settings(&self) -> OutputSettings {
        self.settings.output
    }

    /// The shell a session gets when it asks for none.
    pub fn default_shell(&self) -> ResolvedShell {
        self.shells.resolve()
    }

    /// Spawns a shell for `options`. The capacity check and the insert happen
    /// under one write lock.
    pub fn create(&self, options: SessionOptions) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.write();
        let limit = self.max_sessions();
        if sessions.len() >= limit {
            warn!(target = "tidepool::registry", limit, "session limit reached");
            return Err(SessionError::MaxSessionsReached { limit });
        }

        let cwd = resolve_cwd(options.cwd.as_deref(), self.path_guard.as_ref(), &self.home);
        let shell = self.shells.resolve_with_override(options.shell.as_deref());
        let dims = initial_dimensions(options.cols, options.rows);
        let env = build_env(process_env(), &options.env);

        let command = Command::new(shell.path.clone())
            .args(shell.args.iter().cloned())
            .exact_env(env)
            .cwd(cwd.clone());
        let SpawnedPty {
            handle,
            output,
            exit,
        } = self
            .spawner
            .spawn(SpawnConfig::new(command, dims.cols, dims.rows))
            .map_err(|err| SessionError::Spawn {
                shell: shell.path.clone(),
                reason: format!("{err:#}"),
            })?;

        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), shell.path.clone(), cwd, handle, self.settings);
        sessions.insert(id.clone(), session.clone());
        drop(sessions);

        info!(
            target = "tidepool::registry",
            session_id = %id,
            shell = %shell.path,
            cwd = %session.cwd().display(),
            pid = ?session.pid(),
            cols = dims.cols,
            rows = dims.rows,
            "terminal session created"
        );
        self.watch(&session, output, exit);
        Ok(session)
    }

    /// Pumps process output into the session and hands the exit code to
    /// [`SessionRegistry::finish`] once the output has drained.
    fn watch(
        &self,
        session: &Arc<Session>,
        mut output: mpsc::UnboundedReceiver<String>,
        exit: oneshot::Receiver<i32>,
    ) {
        let target = Arc::downgrade(session);
        let pump = tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                match target.upgrade() {
                    Some(session) => session.on_process_data(&chunk),
                    None => break,
                }
            }
        });

        let registry = self.this.clone();
        let id = session.id().to_string();
        tokio::spawn(async move {
            let exit_code = exit.await.unwrap_or(UNKNOWN_EXIT_CODE);
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, pump).await.is_err() {
                debug!(target = "tidepool::registry", session_id = %id, "output still open after exit");
            }
            if let Some(registry) = registry.upgrade() {
                registry.finish(&id, exit_code);
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Summaries ordered by creation time.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> =
            self.sessions.read().values().map(|session| session.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, id: &str, data: &[u8]) -> bool {
        match self.get(id) {
            Some(session) => session.write(data),
            None => false,
        }
    }

    pub fn resize(&self, id: &str, cols: i64, rows: i64, suppress_output: bool) -> ResizeOutcome {
        match self.get(id) {
            Some(session) => session.resize(cols, rows, suppress_output),
            None => ResizeOutcome::Ignored(ResizeIgnored::Closed),
        }
    }

    /// Starts the graceful-then-forced shutdown of a session. False if the
    /// session is unknown.
    pub fn kill(&self, id: &str) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        info!(target = "tidepool::registry", session_id = %id, "terminating session");
        let registry = self.this.clone();
        let target = id.to_string();
        self.termination.begin(&session, move || {
            if let Some(registry) = registry.upgrade() {
                registry.force_remove(&target);
            }
        });
        true
    }

    fn force_remove(&self, id: &str) {
        let Some(session) = self.get(id) else {
            return;
        };
        warn!(target = "tidepool::registry", session_id = %id, "session ignored graceful shutdown; killing");
        if let Err(err) = session.force_kill() {
            warn!(target = "tidepool::registry", session_id = %id, error = %err, "forced kill failed");
        }
        self.finish(id, UNKNOWN_EXIT_CODE);
    }

    /// Removes the session, closes it with `exit_code` and notifies exit
    /// subscribers. Only the first call for a session has any effect.
    pub fn finish(&self, id: &str, exit_code: i32) -> bool {
        let removed = self.sessions.write().remove(id);
        let Some(session) = removed else {
            return false;
        };
        session.close(exit_code);
        info!(target = "tidepool::registry", session_id = %id, exit_code, "terminal session exited");
        let _ = self.exits.send(SessionExit {
            id: id.to_string(),
            exit_code,
        });
        true
    }

    pub fn subscribe_exits(&self) -> broadcast::Receiver<SessionExit> {
        self.exits.subscribe()
    }

    /// Live output tap for a session, without scrollback.
    pub fn subscribe_data(
        &self,
        id: &str,
        queue_depth: usize,
    ) -> Option<(SubscriberId, mpsc::Receiver<SessionEvent>)> {
        self.get(id)?.subscribe(queue_depth)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Relaxed)
    }

    /// Stores the clamped limit and returns it. Live sessions above the new
    /// limit are left alone.
    pub fn set_max_sessions(&self, limit: usize) -> usize {
        let limit = clamp_max_sessions(limit);
        self.max_sessions.store(limit, Ordering::Relaxed);
        info!(target = "tidepool::registry", limit, "session limit updated");
        limit
    }

    /// Begins termination of every session. Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        ids.iter().filter(|id| self.kill(id)).count()
    }
}

pub fn clamp_max_sessions(limit: usize) -> usize {
    limit.clamp(*MAX_SESSIONS_RANGE.start(), *MAX_SESSIONS_RANGE.end())
}

fn initial_dimensions(cols: Option<i64>, rows: Option<i64>) -> Dimensions {
    let cols = cols.unwrap_or(i64::from(Dimensions::DEFAULT.cols));
    let rows = rows.unwrap_or(i64::from(Dimensions::DEFAULT.rows));
    Dimensions::checked(cols, rows).unwrap_or(Dimensions::DEFAULT)
}
