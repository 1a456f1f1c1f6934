//! Durable per-request session store.
//!
//! A session is a directory under the session root holding the submitted
//! script, metadata, the append-only capture log, a one-line state file,
//! and (once terminal) the approval and result documents. All mutations
//! are crash-safe: files are written to a sibling temp file and renamed
//! into place, and capture appends are fsynced before the call returns.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use drydock_protocol::ApprovalRecord;
use drydock_protocol::Capture;
use drydock_protocol::CaptureRecord;
use drydock_protocol::SessionMetadata;
use drydock_protocol::SessionResult;
use drydock_protocol::SessionState;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::warn;
use uuid::Uuid;

use crate::config::AppContext;
use crate::error::DrydockErr;
use crate::error::Result;

const METADATA_FILE: &str = "metadata.json";
const SCRIPT_FILE: &str = "script.py";
const CAPTURES_FILE: &str = "captures.log";
const STATE_FILE: &str = "state";
const RESULT_FILE: &str = "result.json";
const APPROVAL_FILE: &str = "approval.json";
const LOCK_FILE: &str = ".lock";

/// Interim capture-phase output, kept next to the log until the session
/// reaches a terminal state and the data folds into `result.json`. Not
/// part of the published directory surface.
const CAPTURE_OUTPUT_FILE: &str = "capture_output.json";

const ID_TIMESTAMP_FORMAT: &[FormatItem] =
    format_description!("[year][month][day][hour][minute][second]");

/// Aggregated stdout/stderr/exit of the sandboxed child itself, recorded
/// at the end of the capture phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOutput {
    #[serde(with = "drydock_protocol::b64")]
    pub stdout_bytes: Vec<u8>,
    #[serde(with = "drydock_protocol::b64")]
    pub stderr_bytes: Vec<u8>,
    pub exit_code: i32,
}

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub name: Option<String>,
    pub profile: String,
    pub target: Option<String>,
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Inspect only; no lock taken.
    Read,
    /// Take exclusive ownership for mutation.
    Mutate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    ttl: Duration,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn from_ctx(ctx: &AppContext) -> Self {
        Self::new(&ctx.session_root, ctx.session_ttl)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh session: assign an id, write script and metadata,
    /// set state to `running`, and take the lock.
    pub fn create(&self, script: &[u8], params: NewSession) -> Result<Session> {
        let created_at = OffsetDateTime::now_utc();
        let slug = slugify(params.name.as_deref().unwrap_or("script"));
        let id = session_id(&slug, script, created_at)?;
        let dir = self.root.join(&id);
        std::fs::create_dir_all(&dir)?;

        let meta = SessionMetadata {
            id: id.clone(),
            slug,
            created_at,
            profile: params.profile,
            target: params.target,
            analysis: params.analysis,
        };

        write_atomic(&dir, SCRIPT_FILE, script)?;
        write_atomic(&dir, METADATA_FILE, &serde_json::to_vec_pretty(&meta)?)?;
        write_atomic(&dir, STATE_FILE, SessionState::Running.to_string().as_bytes())?;
        let lock = SessionLock::acquire(&dir, &id)?;

        Ok(Session {
            dir,
            meta,
            lock: Some(lock),
            next_index: 0,
        })
    }

    /// Open an existing session. Expiry is lazy: the first open after the
    /// TTL rewrites the state file to `expired` (when the lock is free)
    /// before handing the session back.
    pub fn open(&self, id: &str, mode: OpenMode) -> Result<Session> {
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(DrydockErr::NotFound(format!("session {id}")));
        }
        let meta: SessionMetadata =
            serde_json::from_slice(&std::fs::read(dir.join(METADATA_FILE))?)?;

        SessionLock::reclaim_stale(&dir);
        self.expire_if_due(&dir, &meta)?;

        let lock = match mode {
            OpenMode::Read => None,
            OpenMode::Mutate => Some(SessionLock::acquire(&dir, id)?),
        };

        let next_index = match mode {
            OpenMode::Read => 0,
            OpenMode::Mutate => read_captures(&dir)?.len() as u32,
        };

        Ok(Session {
            dir,
            meta,
            lock,
            next_index,
        })
    }

    fn expire_if_due(&self, dir: &Path, meta: &SessionMetadata) -> Result<()> {
        let state = read_state(dir)?;
        if state.is_terminal() {
            return Ok(());
        }
        let age = OffsetDateTime::now_utc() - meta.created_at;
        if age < self.ttl {
            return Ok(());
        }
        // Only expire when nobody owns the session; a live owner is still
        // draining and will finalise on its own.
        match SessionLock::acquire(dir, &meta.id) {
            Ok(_lock) => {
                write_atomic(dir, STATE_FILE, SessionState::Expired.to_string().as_bytes())?;
                Ok(())
            }
            Err(DrydockErr::Locked(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Enumerate sessions, optionally restricted to one state.
    pub fn list(&self, state_filter: Option<SessionState>) -> Result<Vec<SessionSummary>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let Ok(state) = read_state(&dir) else {
                warn!("skipping session directory without a readable state: {dir:?}");
                continue;
            };
            if state_filter.is_some_and(|wanted| wanted != state) {
                continue;
            }
            let meta: SessionMetadata =
                serde_json::from_slice(&std::fs::read(dir.join(METADATA_FILE))?)?;
            out.push(SessionSummary {
                id: meta.id,
                state,
                created_at: meta.created_at,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Expire every non-terminal session past the TTL. Returns how many
    /// transitioned.
    pub fn sweep_expired(&self) -> Result<usize> {
        let mut expired = 0;
        for summary in self.list(None)? {
            if summary.state.is_terminal() {
                continue;
            }
            let before = summary.state;
            let session = self.open(&summary.id, OpenMode::Read)?;
            if before != SessionState::Expired && session.state()? == SessionState::Expired {
                expired += 1;
            }
        }
        Ok(expired)
    }
}

/// One open session. Holding the lock (from `create` or
/// `open(.., Mutate)`) is what authorises mutation.
pub struct Session {
    dir: PathBuf,
    meta: SessionMetadata,
    lock: Option<SessionLock>,
    next_index: u32,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn meta(&self) -> &SessionMetadata {
        &self.meta
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_owned(&self) -> bool {
        self.lock.is_some()
    }

    pub fn script(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.dir.join(SCRIPT_FILE))?)
    }

    pub fn state(&self) -> Result<SessionState> {
        read_state(&self.dir)
    }

    /// Atomically move to `next`, enforcing the legal transition table.
    pub fn set_state(&self, next: SessionState) -> Result<()> {
        self.require_lock()?;
        let current = self.state()?;
        if !current.can_transition_to(next) {
            return Err(DrydockErr::IllegalTransition {
                from: current,
                to: next,
            });
        }
        write_atomic(&self.dir, STATE_FILE, next.to_string().as_bytes())
    }

    /// Append one capture. The record is durable — written and fsynced —
    /// before this returns, so the supervisor can acknowledge the
    /// originating request to the child.
    pub fn append_capture(&mut self, capture: Capture) -> Result<u32> {
        self.require_lock()?;
        let record = CaptureRecord {
            index: self.next_index,
            capture,
        };
        let bytes = record.encode()?;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.dir.join(CAPTURES_FILE))?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        self.next_index += 1;
        Ok(record.index)
    }

    /// Async flavour of [`Session::append_capture`] for the supervisor's
    /// dispatch handlers, which must not block the frame task.
    pub async fn append_capture_async(&mut self, capture: Capture) -> Result<u32> {
        self.require_lock()?;
        let record = CaptureRecord {
            index: self.next_index,
            capture,
        };
        let bytes = record.encode()?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.dir.join(CAPTURES_FILE))
            .await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &bytes).await?;
        file.sync_data().await?;
        self.next_index += 1;
        Ok(record.index)
    }

    /// Decode the full capture log, verifying the gap-free index
    /// invariant.
    pub fn captures(&self) -> Result<Vec<CaptureRecord>> {
        read_captures(&self.dir)
    }

    pub fn write_capture_output(&self, output: &CaptureOutput) -> Result<()> {
        self.require_lock()?;
        write_atomic(
            &self.dir,
            CAPTURE_OUTPUT_FILE,
            &serde_json::to_vec(output)?,
        )
    }

    pub fn capture_output(&self) -> Result<Option<CaptureOutput>> {
        read_optional_json(&self.dir.join(CAPTURE_OUTPUT_FILE))
    }

    /// Persist the final result. Legal only while the session is in (or
    /// has just entered) a terminal state or is mid-replay.
    pub fn write_result(&self, result: &SessionResult) -> Result<()> {
        self.require_lock()?;
        let state = self.state()?;
        if !state.is_terminal() && state != SessionState::Executing {
            return Err(DrydockErr::Internal(format!(
                "result written while session is {state}"
            )));
        }
        write_atomic(&self.dir, RESULT_FILE, &serde_json::to_vec_pretty(result)?)
    }

    pub fn result(&self) -> Result<Option<SessionResult>> {
        read_optional_json(&self.dir.join(RESULT_FILE))
    }

    pub fn write_approval(&self, approval: &ApprovalRecord) -> Result<()> {
        self.require_lock()?;
        write_atomic(
            &self.dir,
            APPROVAL_FILE,
            &serde_json::to_vec_pretty(approval)?,
        )
    }

    pub fn approval(&self) -> Result<Option<ApprovalRecord>> {
        read_optional_json(&self.dir.join(APPROVAL_FILE))
    }

    /// Drop ownership early (normally released when the session is
    /// dropped).
    pub fn release(&mut self) {
        self.lock = None;
    }

    fn require_lock(&self) -> Result<()> {
        if self.lock.is_some() {
            Ok(())
        } else {
            Err(DrydockErr::Internal(format!(
                "session {} mutated without ownership",
                self.meta.id
            )))
        }
    }
}

/// O_EXCL lockfile marking exclusive ownership of a session directory.
/// The file records `pid uuid` so a later opener can reclaim locks left
/// behind by a crashed owner.
struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    fn acquire(dir: &Path, id: &str) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(DrydockErr::Locked(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let token = format!("{} {}", std::process::id(), Uuid::new_v4());
        file.write_all(token.as_bytes())?;
        file.sync_data()?;
        Ok(Self { path })
    }

    /// Remove a lockfile whose recorded pid is no longer alive.
    fn reclaim_stale(dir: &Path) {
        let path = dir.join(LOCK_FILE);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return;
        };
        let Some(pid) = contents
            .split_whitespace()
            .next()
            .and_then(|pid| pid.parse::<i32>().ok())
        else {
            return;
        };
        if pid_alive(pid) {
            return;
        }
        warn!("reclaiming stale session lock held by dead pid {pid}");
        let _ = std::fs::remove_file(&path);
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    if pid == std::process::id() as i32 {
        return true;
    }
    // kill(pid, 0) probes existence without delivering anything.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    true
}

fn read_state(dir: &Path) -> Result<SessionState> {
    let raw = std::fs::read_to_string(dir.join(STATE_FILE))?;
    SessionState::from_str(raw.trim())
        .map_err(|_| DrydockErr::Internal(format!("torn state file: {raw:?}")))
}

fn read_captures(dir: &Path) -> Result<Vec<CaptureRecord>> {
    let mut file = match std::fs::File::open(dir.join(CAPTURES_FILE)) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    while let Some(record) = CaptureRecord::decode_from(&mut file)? {
        if record.index as usize != records.len() {
            return Err(DrydockErr::Internal(format!(
                "capture index gap: found {} at position {}",
                record.index,
                records.len()
            )));
        }
        records.push(record);
    }
    Ok(records)
}

fn read_optional_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write-then-rename so readers never observe a torn file. Rename is
/// atomic within one directory on POSIX.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_data()?;
    tmp.persist(dir.join(name))
        .map_err(|e| DrydockErr::Io(e.error))?;
    Ok(())
}

fn session_id(slug: &str, script: &[u8], created_at: OffsetDateTime) -> Result<String> {
    let timestamp = created_at
        .format(ID_TIMESTAMP_FORMAT)
        .map_err(|e| DrydockErr::Internal(format!("failed to format timestamp: {e}")))?;
    let mut hasher = Sha1::new();
    hasher.update(script);
    hasher.update(rand::rng().random::<u32>().to_be_bytes());
    let digest = hasher.finalize();
    let short_hash: String = digest
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect();
    Ok(format!("{timestamp}-{slug}-{short_hash}"))
}

fn slugify(name: &str) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= 24 {
            break;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "script".to_string()
    } else {
        trimmed.to_string()
    }
}
