use std::collections::BTreeMap;
use std::io;
use std::io::Read;

use serde::Deserialize;
use serde::Serialize;

/// One effect the sandboxed script attempted. A capture describes the
/// effect without performing it; the replay phase performs it after
/// approval. Captures are immutable once appended to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capture {
    /// A buffered file write, keyed by the virtual path the script named.
    Write {
        vpath: String,
        #[serde(with = "crate::b64")]
        bytes: Vec<u8>,
        /// Unix permission bits requested at open time.
        mode: u32,
        created_at_ms: u64,
    },

    /// A subprocess the script tried to spawn.
    Subprocess {
        argv: Vec<String>,
        cwd: String,
        /// Environment entries the script added or changed relative to the
        /// child's base environment. Removals are not representable; the
        /// restricted interpreter never issues them.
        env_delta: BTreeMap<String, String>,
        /// Bytes the script had queued for the child's stdin, if it asked
        /// for a pipe. `None` means stdin is closed at replay time.
        #[serde(default, with = "crate::b64::opt", skip_serializing_if = "Option::is_none")]
        stdin: Option<Vec<u8>>,
        /// A required op that exits non-zero aborts the rest of the replay.
        #[serde(default)]
        required: bool,
        created_at_ms: u64,
    },

    /// A socket the script tried to open. Recorded for audit; never
    /// replayed.
    Socket {
        family: i32,
        socktype: i32,
        protocol: i32,
        created_at_ms: u64,
    },
}

impl Capture {
    pub fn kind(&self) -> CaptureKind {
        match self {
            Capture::Write { .. } => CaptureKind::Write,
            Capture::Subprocess { .. } => CaptureKind::Subprocess,
            Capture::Socket { .. } => CaptureKind::Socket,
        }
    }

    pub fn created_at_ms(&self) -> u64 {
        match self {
            Capture::Write { created_at_ms, .. }
            | Capture::Subprocess { created_at_ms, .. }
            | Capture::Socket { created_at_ms, .. } => *created_at_ms,
        }
    }
}

/// Discriminator byte persisted at the head of each `captures.log` record.
/// The values are part of the on-disk compatibility surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureKind {
    Write = 1,
    Subprocess = 2,
    Socket = 3,
}

impl CaptureKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CaptureKind::Write),
            2 => Some(CaptureKind::Subprocess),
            3 => Some(CaptureKind::Socket),
            _ => None,
        }
    }
}

/// A capture plus its position in the session. Indices are assigned by the
/// session store and are gap-free: the Nth record appended carries index
/// N−1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub index: u32,
    pub capture: Capture,
}

impl CaptureRecord {
    /// On-disk record layout: `u8` kind, `u32` BE index, `u64` BE
    /// created-at millis, `u32` BE body length, JSON body. Each record is
    /// individually decodable so a reader can stop at the last fsynced one.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let body = serde_json::to_vec(&self.capture)?;
        let mut out = Vec::with_capacity(1 + 4 + 8 + 4 + body.len());
        out.push(self.capture.kind().code());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.capture.created_at_ms().to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a single record from `reader`. Returns `Ok(None)` on clean
    /// EOF; a partial record is an error so a torn tail is never silently
    /// swallowed.
    pub fn decode_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut kind = [0u8; 1];
        match reader.read_exact(&mut kind) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let kind = CaptureKind::from_code(kind[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown capture kind byte {:#04x}", kind[0]),
            )
        })?;

        let mut index = [0u8; 4];
        reader.read_exact(&mut index)?;
        let index = u32::from_be_bytes(index);

        let mut created_at = [0u8; 8];
        reader.read_exact(&mut created_at)?;

        let mut body_len = [0u8; 4];
        reader.read_exact(&mut body_len)?;
        let body_len = u32::from_be_bytes(body_len) as usize;

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;
        let capture: Capture = serde_json::from_slice(&body)?;
        if capture.kind() != kind {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "capture body disagrees with its kind byte",
            ));
        }

        Ok(Some(CaptureRecord { index, capture }))
    }
}
