use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Application variables that must not leak into user shells.
pub const ENV_DENY_LIST: &[&str] = &[
    "PORT",
    "DATA_DIR",
    "TIDEPOOL_PORT",
    "TIDEPOOL_HOST",
    "TIDEPOOL_DATA_DIR",
    "TIDEPOOL_API_KEY",
    "TIDEPOOL_TERMINAL_PASSWORD",
];

pub const DEFAULT_LANG: &str = "en_US.UTF-8";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("path {path} is outside the allowed roots")]
pub struct PathRejected {
    pub path: PathBuf,
}

/// Security boundary for working directories.
pub trait PathGuard: Send + Sync {
    fn validate(&self, path: &Path) -> Result<PathBuf, PathRejected>;
}

/// Accepts every path as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAnyPath;

impl PathGuard for AllowAnyPath {
    fn validate(&self, path: &Path) -> Result<PathBuf, PathRejected> {
        Ok(path.to_path_buf())
    }
}

/// Accepts paths that canonicalize to somewhere under one of `roots`.
#[derive(Clone, Debug, Default)]
pub struct AllowedRoots {
    roots: Vec<PathBuf>,
}

impl AllowedRoots {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let roots = roots
            .into_iter()
            .map(|root| {
                let root = root.as_ref();
                root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
            })
            .collect();
        Self { roots }
    }
}

impl PathGuard for AllowedRoots {
    fn validate(&self, path: &Path) -> Result<PathBuf, PathRejected> {
        let rejected = || PathRejected {
            path: path.to_path_buf(),
        };
        let canonical = path.canonicalize().map_err(|_| rejected())?;
        if self.roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(canonical)
        } else {
            Err(rejected())
        }
    }
}

pub fn home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Picks the working directory for a new session, falling back to `home`
/// whenever the request is missing, malformed, absent on disk, not a
/// directory or rejected by `guard`.
pub fn resolve_cwd(requested: Option<&str>, guard: &dyn PathGuard, home: &Path) -> PathBuf {
    let Some(raw) = requested.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return home.to_path_buf();
    };
    if raw.contains(['\0', '\r', '\n']) {
        debug!(target = "tidepool::launch", "cwd contains control characters; using home");
        return home.to_path_buf();
    }

    let expanded = if raw == "~" {
        home.to_path_buf()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(raw)
    };

    if !expanded.is_dir() {
        debug!(target = "tidepool::launch", cwd = %expanded.display(), "cwd is not a directory; using home");
        return home.to_path_buf();
    }
    match guard.validate(&expanded) {
        Ok(path) => path,
        Err(err) => {
            debug!(target = "tidepool::launch", error = %err, "cwd rejected; using home");
            home.to_path_buf()
        }
    }
}

/// Child environment: `base` minus the deny-list, then terminal capability
/// variables, locale defaults, and finally caller overrides.
pub fn build_env<I>(base: I, overrides: &HashMap<String, String>) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = base
        .into_iter()
        .filter(|(key, _)| !ENV_DENY_LIST.contains(&key.as_str()))
        .collect();

    env.insert("TERM".into(), "xterm-256color".into());
    env.insert("COLORTERM".into(), "truecolor".into());
    env.insert("TERM_PROGRAM".into(), "tidepool".into());
    env.insert(
        "TERM_PROGRAM_VERSION".into(),
        env!("CARGO_PKG_VERSION").into(),
    );
    env.entry("LANG".into())
        .or_insert_with(|| DEFAULT_LANG.into());
    let lang = env.get("LANG").cloned().unwrap_or_else(|| DEFAULT_LANG.into());
    env.entry("LC_ALL".into()).or_insert(lang);

    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// The current process environment, skipping entries that are not valid
/// Unicode.
pub fn process_env() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(vars: &[(&str, &str)]) -> Vec<(String, String)> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test_timeout::timeout]
    fn missing_cwd_defaults_to_home() {
        let home = tempfile::tempdir().unwrap();
        assert_eq!(resolve_cwd(None, &AllowAnyPath, home.path()), home.path());
        assert_eq!(resolve_cwd(Some("  "), &AllowAnyPath, home.path()), home.path());
    }

    #[test_timeout::timeout]
    fn existing_directory_is_used() {
        let home = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let requested = work.path().to_str().unwrap();
        assert_eq!(resolve_cwd(Some(requested), &AllowAnyPath, home.path()), work.path());
    }

    #[test_timeout::timeout]
    fn tilde_expands_against_home() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join("repo")).unwrap();
        assert_eq!(resolve_cwd(Some("~"), &AllowAnyPath, home.path()), home.path());
        assert_eq!(
            resolve_cwd(Some("~/repo"), &AllowAnyPath, home.path()),
            home.path().join("repo")
        );
    }

    #[test_timeout::timeout]
    fn bad_requests_fall_back_to_home() {
        let home = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("notes.txt");
        std::fs::write(&file, "x").unwrap();

        let cases = [
            work.path().join("missing").display().to_string(),
            file.display().to_string(),
            format!("{}\nrm -rf /", work.path().display()),
            format!("{}\0", work.path().display()),
        ];
        for case in cases {
            assert_eq!(
                resolve_cwd(Some(&case), &AllowAnyPath, home.path()),
                home.path(),
                "case {case:?}"
            );
        }
    }

    #[test_timeout::timeout]
    fn allowed_roots_reject_outside_paths() {
        let home = tempfile::tempdir().unwrap();
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let inner = allowed.path().join("project");
        std::fs::create_dir(&inner).unwrap();
        let guard = AllowedRoots::new([allowed.path()]);

        let resolved = resolve_cwd(inner.to_str(), &guard, home.path());
        assert_eq!(resolved, inner.canonicalize().unwrap());
        assert_eq!(resolve_cwd(outside.path().to_str(), &guard, home.path()), home.path());
    }

    #[test_timeout::timeout]
    fn deny_list_is_stripped_and_overrides_win() {
        let overrides = HashMap::from([
            ("EDITOR".to_string(), "vim".to_string()),
            ("TERM".to_string(), "dumb".to_string()),
        ]);
        let env = build_env(
            base(&[
                ("PATH", "/usr/bin"),
                ("PORT", "3008"),
                ("TIDEPOOL_API_KEY", "secret"),
                ("TIDEPOOL_TERMINAL_PASSWORD", "hunter2"),
                ("DATA_DIR", "/var/lib/tidepool"),
            ]),
            &overrides,
        );

        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        for denied in ["PORT", "TIDEPOOL_API_KEY", "TIDEPOOL_TERMINAL_PASSWORD", "DATA_DIR"] {
            assert!(!env.contains_key(denied), "{denied} leaked");
        }
        assert_eq!(env.get("COLORTERM").map(String::as_str), Some("truecolor"));
        assert_eq!(env.get("TERM_PROGRAM").map(String::as_str), Some("tidepool"));
        assert_eq!(env.get("TERM").map(String::as_str), Some("dumb"));
        assert_eq!(env.get("EDITOR").map(String::as_str), Some("vim"));
    }

    #[test_timeout::timeout]
    fn locale_defaults_only_fill_gaps() {
        let env = build_env(Vec::new(), &HashMap::new());
        assert_eq!(env.get("LANG").map(String::as_str), Some(DEFAULT_LANG));
        assert_eq!(env.get("LC_ALL").map(String::as_str), Some(DEFAULT_LANG));

        let env = build_env(base(&[("LANG", "de_DE.UTF-8")]), &HashMap::new());
        assert_eq!(env.get("LANG").map(String::as_str), Some("de_DE.UTF-8"));
        assert_eq!(env.get("LC_ALL").map(String::as_str), Some("de_DE.UTF-8"));
    }
}
