use std::collections::BTreeMap;

use crate::error::DrydockErr;
use crate::error::Result;
use crate::vfs::FileKind;

/// Fallbacks for hosts that do not expose a native procfs. The sandboxed
/// scripts only ever see these through the synthesised tree, so canned
/// values are acceptable.
const FALLBACK_VERSION: &str = "Linux version 0.0.0 (drydock)\n";
const FALLBACK_MEMINFO: &str = "MemTotal:        0 kB\nMemFree:         0 kB\n";
const FALLBACK_CPUINFO: &str = "processor\t: 0\n";

/// Synthesised `/proc` subtree. Deliberately small: `self`, the sandboxed
/// child's own numeric PID directory, and the three host-wide nodes
/// userspace probes most. Everything else is `NotFound` — not
/// `NotPermitted` — to match what scripts expect from a real procfs.
#[derive(Debug, Clone)]
pub struct ProcTree {
    pid: u32,
    cmdline: Vec<String>,
    environ: BTreeMap<String, String>,
    exe: String,
}

/// One resolved node in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcNode {
    File(Vec<u8>),
    Symlink(String),
    Dir(Vec<(String, FileKind)>),
}

impl ProcTree {
    pub fn new(
        pid: u32,
        cmdline: Vec<String>,
        environ: BTreeMap<String, String>,
        exe: String,
    ) -> Self {
        Self {
            pid,
            cmdline,
            environ,
            exe,
        }
    }

    /// Resolve a path relative to the `/proc` mount point (no leading
    /// slash, `""` for the root).
    pub fn lookup(&self, rel: &str) -> Result<ProcNode> {
        let rel = rel.trim_matches('/');
        // `self` is a symlink to the child's numeric directory; resolve it
        // eagerly for everything beneath it.
        let pid_str = self.pid.to_string();
        let resolved = if rel == "self" {
            return Ok(ProcNode::Symlink(pid_str));
        } else if let Some(rest) = rel.strip_prefix("self/") {
            format!("{pid_str}/{rest}")
        } else {
            rel.to_string()
        };

        match resolved.as_str() {
            "" => Ok(ProcNode::Dir(vec![
                ("self".to_string(), FileKind::Symlink),
                (pid_str, FileKind::Dir),
                ("version".to_string(), FileKind::File),
                ("meminfo".to_string(), FileKind::File),
                ("cpuinfo".to_string(), FileKind::File),
            ])),
            "version" => Ok(ProcNode::File(host_or(FALLBACK_VERSION, "/proc/version"))),
            "meminfo" => Ok(ProcNode::File(host_or(FALLBACK_MEMINFO, "/proc/meminfo"))),
            "cpuinfo" => Ok(ProcNode::File(host_or(FALLBACK_CPUINFO, "/proc/cpuinfo"))),
            other => self.lookup_pid_subtree(other),
        }
    }

    fn lookup_pid_subtree(&self, resolved: &str) -> Result<ProcNode> {
        let pid_str = self.pid.to_string();
        let not_found = || DrydockErr::NotFound(format!("/proc/{resolved}"));

        let rest = match resolved.strip_prefix(pid_str.as_str()) {
            Some("") => {
                return Ok(ProcNode::Dir(vec![
                    ("cmdline".to_string(), FileKind::File),
                    ("environ".to_string(), FileKind::File),
                    ("status".to_string(), FileKind::File),
                    ("exe".to_string(), FileKind::Symlink),
                ]));
            }
            Some(rest) => rest.strip_prefix('/').ok_or_else(not_found)?,
            None => return Err(not_found()),
        };

        match rest {
            // NUL-joined argv of the submitted script's invocation, with
            // the conventional trailing NUL.
            "cmdline" => {
                let mut bytes = Vec::new();
                for arg in &self.cmdline {
                    bytes.extend_from_slice(arg.as_bytes());
                    bytes.push(0);
                }
                Ok(ProcNode::File(bytes))
            }
            "environ" => {
                let mut bytes = Vec::new();
                for (key, value) in &self.environ {
                    bytes.extend_from_slice(key.as_bytes());
                    bytes.push(b'=');
                    bytes.extend_from_slice(value.as_bytes());
                    bytes.push(0);
                }
                Ok(ProcNode::File(bytes))
            }
            "status" => {
                let name = self
                    .cmdline
                    .first()
                    .map(|arg0| {
                        arg0.rsplit('/')
                            .next()
                            .unwrap_or(arg0.as_str())
                            .to_string()
                    })
                    .unwrap_or_else(|| "drydock-python".to_string());
                let status = format!(
                    "Name:\t{name}\nState:\tR (running)\nPid:\t{pid}\nPPid:\t{ppid}\n",
                    pid = self.pid,
                    ppid = std::process::id(),
                );
                Ok(ProcNode::File(status.into_bytes()))
            }
            "exe" => Ok(ProcNode::Symlink(self.exe.clone())),
            _ => Err(not_found()),
        }
    }
}

fn host_or(fallback: &str, host_path: &str) -> Vec<u8> {
    std::fs::read(host_path).unwrap_or_else(|_| fallback.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn tree() -> ProcTree {
        ProcTree::new(
            4242,
            vec!["drydock-python".to_string(), "/sandbox/script.py".to_string()],
            btreemap! {
                "LANG".to_string() => "C.UTF-8".to_string(),
                "PATH".to_string() => "/runtime/bin".to_string(),
            },
            "/runtime/bin/drydock-python".to_string(),
        )
    }

    #[test]
    fn self_is_a_symlink_to_the_child_pid() {
        assert_eq!(
            ProcNode::Symlink("4242".to_string()),
            tree().lookup("self").expect("self")
        );
    }

    #[test]
    fn cmdline_is_nul_joined() {
        let node = tree().lookup("self/cmdline").expect("cmdline");
        assert_eq!(
            ProcNode::File(b"drydock-python\0/sandbox/script.py\0".to_vec()),
            node
        );
        // Resolves identically through the numeric path.
        assert_eq!(node, tree().lookup("4242/cmdline").expect("cmdline"));
    }

    #[test]
    fn environ_reflects_the_declared_environment() {
        let node = tree().lookup("4242/environ").expect("environ");
        assert_eq!(
            ProcNode::File(b"LANG=C.UTF-8\0PATH=/runtime/bin\0".to_vec()),
            node
        );
    }

    #[test]
    fn unknown_entries_are_not_found_rather_than_not_permitted() {
        let err = tree().lookup("uptime").expect_err("no uptime node");
        assert!(matches!(err, DrydockErr::NotFound(_)));
        let err = tree().lookup("9999/cmdline").expect_err("other pids hidden");
        assert!(matches!(err, DrydockErr::NotFound(_)));
    }

    #[test]
    fn status_names_the_interpreter() {
        let ProcNode::File(bytes) = tree().lookup("self/status").expect("status") else {
            panic!("status should be a file");
        };
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("Name:\tdrydock-python"));
        assert!(text.contains("Pid:\t4242"));
    }
}
