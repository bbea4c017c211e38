use crate::auth::{
    constant_time_eq, ApiKeyAuthenticator, Authenticator, TokenStore, TERMINAL_TOKEN_TTL,
    WS_TOKEN_TTL,
};
use crate::config::Config;
use crate::terminal::launch::{AllowAnyPath, AllowedRoots, PathGuard};
use crate::terminal::pty::PtySpawner;
use crate::terminal::registry::RegistryConfig;
use crate::terminal::shell::ShellResolver;
use crate::terminal::termination::TerminationSequencer;
use crate::terminal::SessionRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Issued by `POST /api/terminal/auth` when a terminal password is set.
    pub terminal_tokens: Arc<TokenStore>,
    /// Short-lived single-use tokens for opening a WebSocket.
    pub ws_tokens: Arc<TokenStore>,
}

impl AppState {
    pub fn new(config: Config, spawner: Arc<dyn PtySpawner>) -> Self {
        Self::with_shells(config, spawner, ShellResolver::from_env())
    }

    pub fn with_shells(config: Config, spawner: Arc<dyn PtySpawner>, shells: ShellResolver) -> Self {
        let path_guard: Arc<dyn PathGuard> = if config.allowed_roots.is_empty() {
            Arc::new(AllowAnyPath)
        } else {
            Arc::new(AllowedRoots::new(&config.allowed_roots))
        };
        let mut registry_config = RegistryConfig::new(shells, path_guard);
        registry_config.max_sessions = config.max_sessions;
        registry_config.settings = config.session_settings();
        registry_config.termination = TerminationSequencer::new(config.kill_grace);

        let authenticator = Arc::new(ApiKeyAuthenticator::new(config.api_key.clone()));
        Self {
            registry: SessionRegistry::new(registry_config, spawner),
            authenticator,
            terminal_tokens: Arc::new(TokenStore::new(TERMINAL_TOKEN_TTL, false)),
            ws_tokens: Arc::new(TokenStore::new(WS_TOKEN_TTL, true)),
            config: Arc::new(config),
        }
    }

    pub fn terminal_enabled(&self) -> bool {
        self.config.terminal_enabled
    }

    pub fn password_required(&self) -> bool {
        self.config.password_required()
    }

    pub fn check_password(&self, candidate: &str) -> bool {
        match self.config.terminal_password.as_deref() {
            Some(expected) => constant_time_eq(candidate.as_bytes(), expected.as_bytes()),
            None => true,
        }
    }

    /// True when no password is configured or `token` is a live terminal token.
    pub fn terminal_token_ok(&self, token: Option<&str>) -> bool {
        if !self.password_required() {
            return true;
        }
        token.is_some_and(|token| self.terminal_tokens.validate(token))
    }
}
