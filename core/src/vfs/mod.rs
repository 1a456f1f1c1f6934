//! Virtual filesystem presented to the sandboxed child.
//!
//! A finite table maps virtual directory prefixes to host locations
//! (read-only or with a writable shadow) or to the synthesised `/proc`
//! tree. Reads pass through to the host; writes never touch it — they
//! buffer in memory and become [`Capture::Write`] records when the handle
//! closes. Any path outside the table fails before a single host syscall
//! is issued.

mod proc_tree;

pub use proc_tree::ProcNode;
pub use proc_tree::ProcTree;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use drydock_protocol::Capture;

use crate::error::DrydockErr;
use crate::error::Result;
use crate::util::now_unix_ms;

/// Cap on a single read chunk handed back to the child.
const MAX_READ_CHUNK: usize = 1024 * 1024;

/// Cap on the total bytes buffered for one pending write.
const MAX_WRITE_BUFFER: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

impl FileKind {
    /// Wire encoding used in stat and readdir replies.
    pub fn wire_code(self) -> u64 {
        match self {
            FileKind::File => 0,
            FileKind::Dir => 1,
            FileKind::Symlink => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub mtime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// One rule translating a virtual prefix to a backing store.
#[derive(Debug, Clone)]
pub enum Mapping {
    /// Host directory, reads only.
    ReadOnly { host_root: PathBuf },
    /// Host directory for reads; approved writes materialise under the
    /// shadow root instead.
    Shadowed {
        host_root: PathBuf,
        shadow_root: PathBuf,
    },
    /// Synthesised subtree (`/proc`).
    Proc(ProcTree),
}

/// Immutable longest-prefix-wins mapping table.
#[derive(Debug, Clone)]
pub struct MappingTable {
    /// Sorted by prefix length, longest first, so the first hit wins.
    entries: Vec<(String, Mapping)>,
}

impl MappingTable {
    pub fn new(mut entries: Vec<(String, Mapping)>) -> Result<Self> {
        for (prefix, _) in &entries {
            let canonical = canonicalize_vpath(prefix)?;
            if &canonical != prefix {
                return Err(DrydockErr::InvalidInput(format!(
                    "mapping prefix {prefix:?} is not canonical"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for (prefix, _) in &entries {
            if !seen.insert(prefix.clone()) {
                return Err(DrydockErr::InvalidInput(format!(
                    "duplicate mapping prefix {prefix:?}"
                )));
            }
        }
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(Self { entries })
    }

    /// Longest mapping prefix covering `vpath`, with the remainder of the
    /// path relative to that prefix (no leading slash).
    pub fn resolve(&self, vpath: &str) -> Option<(&str, &Mapping, String)> {
        for (prefix, mapping) in &self.entries {
            if let Some(remainder) = strip_mapping_prefix(vpath, prefix) {
                return Some((prefix.as_str(), mapping, remainder));
            }
        }
        None
    }

    /// Host destination an approved write to `vpath` materialises at.
    /// Only shadowed mappings accept writes.
    pub fn shadow_destination(&self, vpath: &str) -> Result<PathBuf> {
        let vpath = canonicalize_vpath(vpath)?;
        match self.resolve(&vpath) {
            Some((_, Mapping::Shadowed { shadow_root, .. }, remainder)) => {
                Ok(shadow_root.join(remainder))
            }
            Some((prefix, _, _)) => Err(DrydockErr::NotPermitted(format!(
                "mapping {prefix:?} has no writable shadow"
            ))),
            None => Err(DrydockErr::NotFound(vpath)),
        }
    }

    /// Names of mapping roots that live directly under `vpath`. These show
    /// up as synthetic directory entries so a script can walk down to a
    /// mapped subtree through otherwise-unmapped ancestors.
    fn virtual_children(&self, vpath: &str) -> Vec<DirEntry> {
        let mut out = Vec::new();
        for (prefix, _) in &self.entries {
            let Some(remainder) = strip_mapping_prefix(prefix, vpath) else {
                continue;
            };
            if remainder.is_empty() {
                continue;
            }
            let first = remainder.split('/').next().unwrap_or(&remainder);
            out.push(DirEntry {
                name: first.to_string(),
                kind: FileKind::Dir,
            });
        }
        out
    }

    fn covers_or_contains(&self, vpath: &str) -> bool {
        self.resolve(vpath).is_some() || !self.virtual_children(vpath).is_empty()
    }
}

/// Treat `prefix` as a directory boundary: `/usr` covers `/usr` and
/// `/usr/bin` but not `/usrx`.
fn strip_mapping_prefix(vpath: &str, prefix: &str) -> Option<String> {
    if prefix == "/" {
        return Some(vpath.trim_start_matches('/').to_string());
    }
    if vpath == prefix {
        return Some(String::new());
    }
    vpath
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rest| rest.to_string())
}

/// Lexical canonicalisation: collapse `//` and `.`, resolve `..` without
/// ever escaping the root. Relative paths are rejected outright.
pub fn canonicalize_vpath(raw: &str) -> Result<String> {
    if !raw.starts_with('/') {
        return Err(DrydockErr::InvalidInput(format!(
            "virtual path must be absolute: {raw:?}"
        )));
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

enum ReadHandle {
    Host(std::fs::File),
    Mem(Vec<u8>),
}

struct WriteHandle {
    vpath: String,
    mode: u32,
    buf: Vec<u8>,
}

struct OverlayFile {
    bytes: Vec<u8>,
    mode: u32,
}

/// Per-session VFS state: the mapping table, the read-your-writes
/// overlay, and the open handle tables. All methods are synchronous; the
/// supervisor runs the host-touching ones on the blocking pool.
pub struct Vfs {
    table: MappingTable,
    overlay: HashMap<String, OverlayFile>,
    read_handles: HashMap<u64, ReadHandle>,
    write_handles: HashMap<u64, WriteHandle>,
    next_handle: u64,
}

impl Vfs {
    pub fn new(table: MappingTable) -> Self {
        Self {
            table,
            overlay: HashMap::new(),
            read_handles: HashMap::new(),
            write_handles: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    pub fn stat(&self, vpath: &str) -> Result<FileStat> {
        let vpath = canonicalize_vpath(vpath)?;
        if let Some(overlay) = self.overlay.get(&vpath) {
            return Ok(FileStat {
                kind: FileKind::File,
                size: overlay.bytes.len() as u64,
                mode: overlay.mode,
                mtime_ms: now_unix_ms(),
            });
        }
        match self.table.resolve(&vpath) {
            Some((_, Mapping::Proc(tree), remainder)) => {
                proc_stat(tree.lookup(&remainder)?)
            }
            Some((_, mapping, remainder)) => {
                let host_path = host_root(mapping).join(remainder);
                let meta = std::fs::metadata(&host_path)
                    .map_err(|e| host_error(e, &vpath))?;
                Ok(stat_from_metadata(&meta))
            }
            None if self.table.covers_or_contains(&vpath) => Ok(FileStat {
                kind: FileKind::Dir,
                size: 0,
                mode: 0o555,
                mtime_ms: 0,
            }),
            None => Err(DrydockErr::NotFound(vpath)),
        }
    }

    pub fn open_read(&mut self, vpath: &str) -> Result<u64> {
        let vpath = canonicalize_vpath(vpath)?;
        if let Some(overlay) = self.overlay.get(&vpath) {
            return Ok(self.insert_read(ReadHandle::Mem(overlay.bytes.clone())));
        }
        match self.table.resolve(&vpath) {
            Some((_, Mapping::Proc(tree), remainder)) => match tree.lookup(&remainder)? {
                ProcNode::File(bytes) => Ok(self.insert_read(ReadHandle::Mem(bytes))),
                ProcNode::Symlink(_) | ProcNode::Dir(_) => Err(DrydockErr::NotPermitted(
                    format!("{vpath} is not a regular file"),
                )),
            },
            Some((_, mapping, remainder)) => {
                let host_path = host_root(mapping).join(remainder);
                let file =
                    std::fs::File::open(&host_path).map_err(|e| host_error(e, &vpath))?;
                let meta = file.metadata()?;
                if meta.is_dir() {
                    return Err(DrydockErr::NotPermitted(format!(
                        "{vpath} is a directory"
                    )));
                }
                Ok(self.insert_read(ReadHandle::Host(file)))
            }
            None => Err(DrydockErr::NotFound(vpath)),
        }
    }

    pub fn read(&mut self, handle: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        let len = (len as usize).min(MAX_READ_CHUNK);
        match self.read_handles.get(&handle) {
            Some(ReadHandle::Mem(bytes)) => {
                let start = (offset as usize).min(bytes.len());
                let end = start.saturating_add(len).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            Some(ReadHandle::Host(file)) => {
                let mut buf = vec![0u8; len];
                let n = read_at(file, &mut buf, offset)?;
                buf.truncate(n);
                Ok(buf)
            }
            None => Err(DrydockErr::InvalidInput(format!(
                "unknown read handle {handle}"
            ))),
        }
    }

    pub fn close(&mut self, handle: u64) -> Result<()> {
        self.read_handles
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| DrydockErr::InvalidInput(format!("unknown read handle {handle}")))
    }

    pub fn readdir(&self, vpath: &str) -> Result<Vec<DirEntry>> {
        let vpath = canonicalize_vpath(vpath)?;
        let mut entries: BTreeMap<String, FileKind> = BTreeMap::new();
        let mut found_source = false;

        match self.table.resolve(&vpath) {
            Some((_, Mapping::Proc(tree), remainder)) => match tree.lookup(&remainder)? {
                ProcNode::Dir(listing) => {
                    found_source = true;
                    for (name, kind) in listing {
                        entries.insert(name, kind);
                    }
                }
                _ => {
                    return Err(DrydockErr::NotPermitted(format!(
                        "{vpath} is not a directory"
                    )));
                }
            },
            Some((_, mapping, remainder)) => {
                let host_path = host_root(mapping).join(remainder);
                let listing = std::fs::read_dir(&host_path).map_err(|e| host_error(e, &vpath))?;
                found_source = true;
                for entry in listing {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    // Host symlinks are pre-resolved; report the target's kind.
                    let kind = match std::fs::metadata(entry.path()) {
                        Ok(meta) if meta.is_dir() => FileKind::Dir,
                        Ok(_) => FileKind::File,
                        Err(_) => FileKind::File,
                    };
                    entries.insert(name, kind);
                }
            }
            None => {}
        }

        // Overlay files appear in their parent's listing.
        let dir_prefix = if vpath == "/" {
            "/".to_string()
        } else {
            format!("{vpath}/")
        };
        for overlay_path in self.overlay.keys() {
            if let Some(rest) = overlay_path.strip_prefix(&dir_prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    found_source = true;
                    entries.insert(rest.to_string(), FileKind::File);
                }
            }
        }

        // Mapping roots nested under this directory.
        for child in self.table.virtual_children(&vpath) {
            found_source = true;
            entries.entry(child.name).or_insert(child.kind);
        }

        if !found_source {
            return Err(DrydockErr::NotFound(vpath));
        }
        Ok(entries
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    pub fn open_write(&mut self, vpath: &str, mode: u64) -> Result<u64> {
        let vpath = canonicalize_vpath(vpath)?;
        match self.table.resolve(&vpath) {
            Some((_, Mapping::Shadowed { .. }, _)) => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.write_handles.insert(
                    handle,
                    WriteHandle {
                        vpath,
                        mode: (mode as u32) & 0o7777,
                        buf: Vec::new(),
                    },
                );
                Ok(handle)
            }
            Some((prefix, _, _)) => Err(DrydockErr::NotPermitted(format!(
                "mapping {prefix:?} is read-only"
            ))),
            None => Err(DrydockErr::NotFound(vpath)),
        }
    }

    pub fn write(&mut self, handle: u64, bytes: &[u8]) -> Result<u64> {
        let write = self
            .write_handles
            .get_mut(&handle)
            .ok_or_else(|| DrydockErr::InvalidInput(format!("unknown write handle {handle}")))?;
        if write.buf.len() + bytes.len() > MAX_WRITE_BUFFER {
            return Err(DrydockErr::NotPermitted(format!(
                "pending write to {} exceeds the {MAX_WRITE_BUFFER}-byte buffer cap",
                write.vpath
            )));
        }
        write.buf.extend_from_slice(bytes);
        Ok(bytes.len() as u64)
    }

    /// Seal a write handle into a capture. The buffered bytes also enter
    /// the overlay so later reads of the same virtual path observe them
    /// for the rest of the session.
    pub fn close_write(&mut self, handle: u64) -> Result<Capture> {
        let write = self
            .write_handles
            .remove(&handle)
            .ok_or_else(|| DrydockErr::InvalidInput(format!("unknown write handle {handle}")))?;
        self.overlay.insert(
            write.vpath.clone(),
            OverlayFile {
                bytes: write.buf.clone(),
                mode: write.mode,
            },
        );
        Ok(Capture::Write {
            vpath: write.vpath,
            bytes: write.buf,
            mode: write.mode,
            created_at_ms: now_unix_ms(),
        })
    }

    pub fn readlink(&self, vpath: &str) -> Result<String> {
        let vpath = canonicalize_vpath(vpath)?;
        match self.table.resolve(&vpath) {
            Some((prefix, Mapping::Proc(tree), remainder)) => match tree.lookup(&remainder)? {
                ProcNode::Symlink(target) => {
                    if target.starts_with('/') {
                        Ok(target)
                    } else {
                        Ok(format!("{prefix}/{target}"))
                    }
                }
                _ => Err(DrydockErr::InvalidInput(format!(
                    "{vpath} is not a symbolic link"
                ))),
            },
            // Host-side symlinks are resolved eagerly during lookup, so
            // nothing outside /proc ever reads as a link.
            Some(_) => Err(DrydockErr::InvalidInput(format!(
                "{vpath} is not a symbolic link"
            ))),
            None => Err(DrydockErr::NotFound(vpath)),
        }
    }
}

impl Vfs {
    fn insert_read(&mut self, handle: ReadHandle) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        self.read_handles.insert(id, handle);
        id
    }
}

fn host_root(mapping: &Mapping) -> &PathBuf {
    match mapping {
        Mapping::ReadOnly { host_root } | Mapping::Shadowed { host_root, .. } => host_root,
        Mapping::Proc(_) => unreachable!("proc mappings have no host root"),
    }
}

fn host_error(e: std::io::Error, vpath: &str) -> DrydockErr {
    match e.kind() {
        std::io::ErrorKind::NotFound => DrydockErr::NotFound(vpath.to_string()),
        std::io::ErrorKind::PermissionDenied => DrydockErr::NotPermitted(vpath.to_string()),
        _ => DrydockErr::Io(e),
    }
}

fn stat_from_metadata(meta: &std::fs::Metadata) -> FileStat {
    let kind = if meta.is_dir() {
        FileKind::Dir
    } else {
        FileKind::File
    };
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    FileStat {
        kind,
        size: meta.len(),
        mode: unix_mode(meta),
        mtime_ms,
    }
}

#[cfg(unix)]
fn unix_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o7777
}

#[cfg(not(unix))]
fn unix_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<usize> {
    use std::os::unix::fs::FileExt;
    Ok(file.read_at(buf, offset)?)
}

#[cfg(not(unix))]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<usize> {
    use std::io::Read;
    use std::io::Seek;
    let mut file = file;
    file.seek(std::io::SeekFrom::Start(offset))?;
    Ok(file.read(buf)?)
}

fn proc_stat(node: ProcNode) -> Result<FileStat> {
    let (kind, size) = match node {
        ProcNode::File(bytes) => (FileKind::File, bytes.len() as u64),
        ProcNode::Symlink(target) => (FileKind::Symlink, target.len() as u64),
        ProcNode::Dir(_) => (FileKind::Dir, 0),
    };
    Ok(FileStat {
        kind,
        size,
        mode: 0o444,
        mtime_ms: 0,
    })
}
