use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// POSIX shells we are willing to launch, in preference order.
pub const POSIX_SHELLS: &[&str] = &[
    "/bin/zsh",
    "/usr/bin/zsh",
    "/usr/local/bin/zsh",
    "/opt/homebrew/bin/zsh",
    "/bin/bash",
    "/usr/bin/bash",
    "/usr/local/bin/bash",
    "/opt/homebrew/bin/bash",
    "/usr/bin/fish",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/fish",
    "/bin/sh",
    "/usr/bin/sh",
];

pub const WINDOWS_SHELLS: &[&str] = &[
    r"C:\Program Files\PowerShell\7\pwsh.exe",
    r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
    r"C:\Windows\System32\cmd.exe",
];

pub const WSL_FALLBACK: &str = "/bin/bash";
pub const POSIX_FALLBACK: &str = "/bin/sh";
pub const WINDOWS_FALLBACK: &str = "cmd.exe";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Unix,
    /// Linux running under Windows' compatibility layer.
    Wsl,
    Windows,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(windows) {
            return Platform::Windows;
        }
        if std::env::var_os("WSL_DISTRO_NAME").is_some() || std::env::var_os("WSL_INTEROP").is_some() {
            return Platform::Wsl;
        }
        match std::fs::read_to_string("/proc/version") {
            Ok(version) if version.to_ascii_lowercase().contains("microsoft") => Platform::Wsl,
            _ => Platform::Unix,
        }
    }

    fn allow_list(self) -> &'static [&'static str] {
        match self {
            Platform::Windows => WINDOWS_SHELLS,
            Platform::Unix | Platform::Wsl => POSIX_SHELLS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedShell {
    pub path: String,
    pub args: Vec<String>,
}

impl ResolvedShell {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            args: login_args(path),
        }
    }
}

type ExistsProbe = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Platform-aware shell lookup against a fixed allow-list. Always answers.
#[derive(Clone)]
pub struct ShellResolver {
    platform: Platform,
    configured: Option<String>,
    exists: ExistsProbe,
}

impl fmt::Debug for ShellResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellResolver")
            .field("platform", &self.platform)
            .field("configured", &self.configured)
            .finish_non_exhaustive()
    }
}

impl ShellResolver {
    pub fn new(platform: Platform, configured: Option<String>) -> Self {
        Self {
            platform,
            configured: configured.filter(|shell| !shell.is_empty()),
            exists: Arc::new(|path: &Path| path.is_file()),
        }
    }

    /// Detects the platform and reads the user's `$SHELL`.
    pub fn from_env() -> Self {
        Self::new(Platform::detect(), std::env::var("SHELL").ok())
    }

    /// Replaces the filesystem existence check.
    pub fn with_probe<F>(mut self, exists: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.exists = Arc::new(exists);
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn resolve(&self) -> ResolvedShell {
        let allow_list = self.platform.allow_list();
        if self.platform != Platform::Windows {
            if let Some(shell) = self
                .configured
                .as_deref()
                .filter(|shell| self.is_usable(allow_list, shell))
            {
                return ResolvedShell::new(shell);
            }
        }

        if let Some(shell) = allow_list.iter().find(|shell| (self.exists)(Path::new(shell))) {
            return ResolvedShell::new(shell);
        }

        ResolvedShell::new(match self.platform {
            Platform::Wsl => WSL_FALLBACK,
            Platform::Windows => WINDOWS_FALLBACK,
            Platform::Unix => POSIX_FALLBACK,
        })
    }

    /// Honors a caller-requested shell only when it is allow-listed and
    /// present; otherwise resolves as usual.
    pub fn resolve_with_override(&self, requested: Option<&str>) -> ResolvedShell {
        match requested.map(str::trim) {
            Some(shell) if self.is_usable(self.platform.allow_list(), shell) => {
                ResolvedShell::new(shell)
            }
            _ => self.resolve(),
        }
    }

    fn is_usable(&self, allow_list: &[&str], shell: &str) -> bool {
        allow_list.contains(&shell) && (self.exists)(Path::new(shell))
    }
}

/// Login flag for the shell at `path`, if it takes one.
pub fn login_args(path: &str) -> Vec<String> {
    let name = shell_name(path);
    match name.as_str() {
        "powershell" | "pwsh" | "cmd" | "sh" => Vec::new(),
        "ksh" | "dash" => vec!["-l".to_string()],
        _ => vec!["--login".to_string()],
    }
}

/// Lowercase file stem, accepting both separators.
fn shell_name(path: &str) -> String {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = file
        .strip_suffix(".exe")
        .or_else(|| file.strip_suffix(".EXE"))
        .unwrap_or(file);
    stem.to_ascii_lowercase()
}
