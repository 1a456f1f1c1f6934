use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DrydockErr;
use crate::error::Result;

/// Directory under `$DRYDOCK_HOME` (default `~/.drydock`) holding approval
/// profiles as `<name>.json`.
const PROFILES_SUBDIR: &str = "profiles";

/// Remote targets table, keyed config inside the drydock home.
const TARGETS_FILE: &str = "targets.toml";

const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_REPLAY_OP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Immutable application context. Built once in `main` before any request
/// is accepted and threaded through the supervisor, approval engine, and
/// RPC server; never mutated after construction.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Root of all drydock state (`~/.drydock` or `$DRYDOCK_HOME`).
    pub home: PathBuf,

    /// Where session directories live (`$DRYDOCK_SESSION_ROOT` or
    /// `<home>/sessions`).
    pub session_root: PathBuf,

    /// Bundled restricted-interpreter runtime (`$DRYDOCK_RUNTIME_DIR` or
    /// `<home>/runtime`). Contains `bin/` with the interpreter and
    /// `stdlib/` with its standard library.
    pub runtime_dir: PathBuf,

    /// Where approved pending writes are materialised during replay. Every
    /// virtual path maps into this shadow, so replay never writes through
    /// the read-only view.
    pub shadow_root: PathBuf,

    /// Profile name used when a submit request names none
    /// (`$DRYDOCK_PROFILE` or `"default"`).
    pub default_profile: String,

    /// Named remote targets from `targets.toml`. This table is the only
    /// source of remote hosts; free-form `user@host` strings are rejected.
    pub targets: BTreeMap<String, Target>,

    pub capture_timeout: Duration,
    pub replay_op_timeout: Duration,
    pub session_ttl: Duration,

    pub version: &'static str,
}

/// One named remote host. Names are restricted to `[A-Za-z0-9._-]+`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Target {
    pub host: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Deserialize, Default)]
struct TargetsFile {
    #[serde(default)]
    targets: BTreeMap<String, Target>,
}

impl AppContext {
    /// Resolve the context from the environment. Creates no directories;
    /// callers that need the session root or shadow on disk create them
    /// lazily.
    pub fn load() -> Result<Self> {
        let home = drydock_home()?;
        let session_root = env_path("DRYDOCK_SESSION_ROOT", || home.join("sessions"));
        let runtime_dir = env_path("DRYDOCK_RUNTIME_DIR", || home.join("runtime"));
        let default_profile =
            std::env::var("DRYDOCK_PROFILE").unwrap_or_else(|_| "default".to_string());
        let targets = load_targets(&home.join(TARGETS_FILE))?;

        Ok(AppContext {
            shadow_root: home.join("shadow"),
            home,
            session_root,
            runtime_dir,
            default_profile,
            targets,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            replay_op_timeout: DEFAULT_REPLAY_OP_TIMEOUT,
            session_ttl: DEFAULT_SESSION_TTL,
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    /// Path of the bundled restricted interpreter.
    pub fn interpreter_path(&self) -> PathBuf {
        self.runtime_dir.join("bin").join("drydock-python")
    }

    /// Standard library directory handed to the child via its search path.
    pub fn stdlib_dir(&self) -> PathBuf {
        self.runtime_dir.join("stdlib")
    }

    /// Whether the bundled runtime looks usable on this machine.
    pub fn runtime_present(&self) -> bool {
        self.interpreter_path().is_file()
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.home.join(PROFILES_SUBDIR)
    }

    /// Look up a named target, refusing anything not present in the table.
    pub fn target(&self, name: &str) -> Result<&Target> {
        self.targets
            .get(name)
            .ok_or_else(|| DrydockErr::InvalidInput(format!("unknown target: {name}")))
    }
}

/// `$DRYDOCK_HOME` or `~/.drydock`.
pub fn drydock_home() -> Result<PathBuf> {
    match std::env::var("DRYDOCK_HOME") {
        Ok(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => {
            let home = dirs::home_dir().ok_or_else(|| {
                DrydockErr::Internal("could not determine a home directory".to_string())
            })?;
            Ok(home.join(".drydock"))
        }
    }
}

fn env_path(var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => default(),
    }
}

pub fn is_valid_target_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Parse the targets table. A missing file means no targets; a present but
/// malformed file is an error rather than a silent empty table.
pub fn load_targets(path: &Path) -> Result<BTreeMap<String, Target>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let parsed: TargetsFile = toml::from_str(&raw)
        .map_err(|e| DrydockErr::InvalidInput(format!("malformed {TARGETS_FILE}: {e}")))?;
    for name in parsed.targets.keys() {
        if !is_valid_target_name(name) {
            return Err(DrydockErr::InvalidInput(format!(
                "illegal target name: {name:?}"
            )));
        }
    }
    Ok(parsed.targets)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn targets_file_parses_the_keyed_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("targets.toml");
        std::fs::write(
            &path,
            r#"
[targets.prod]
host = "prod.example.com"
user = "deploy"
port = 22

[targets.staging]
host = "staging.example.com"
user = "deploy"
"#,
        )
        .expect("write");

        let targets = load_targets(&path).expect("parse");
        assert_eq!(2, targets.len());
        assert_eq!(
            &Target {
                host: "prod.example.com".to_string(),
                user: "deploy".to_string(),
                port: 22,
            },
            targets.get("prod").expect("prod")
        );
        // Port defaults when omitted.
        assert_eq!(22, targets.get("staging").expect("staging").port);
    }

    #[test]
    fn missing_targets_file_is_an_empty_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let targets = load_targets(&dir.path().join("targets.toml")).expect("parse");
        assert!(targets.is_empty());
    }

    #[test]
    fn illegal_target_names_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("targets.toml");
        std::fs::write(
            &path,
            "[targets.\"bad name\"]\nhost = \"h\"\nuser = \"u\"\n",
        )
        .expect("write");
        assert!(load_targets(&path).is_err());
    }

    #[test]
    fn target_name_charset() {
        assert!(is_valid_target_name("prod"));
        assert!(is_valid_target_name("build-07.internal"));
        assert!(!is_valid_target_name(""));
        assert!(!is_valid_target_name("deploy@prod"));
        assert!(!is_valid_target_name("prod host"));
    }
}
