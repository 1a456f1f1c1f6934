//! Approval profiles: two ordered pattern lists that classify a candidate
//! subprocess invocation. Matching is deliberately coarse — normalised
//! prefix at a word boundary — so a reviewer can predict exactly what a
//! pattern covers. The runtime interception is the security boundary; this
//! classifier only routes commands between auto-approval, auto-denial, and
//! human review.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::config::AppContext;
use crate::error::DrydockErr;
use crate::error::Result;

/// Outcome of classifying one candidate command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    AutoAllow,
    AutoDeny,
    NeedsReview,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    name: String,
    auto_approve: Vec<String>,
    always_deny: Vec<String>,
}

/// On-disk profile shape. Unknown keys are ignored on purpose so older
/// binaries can read newer profile files.
#[derive(Deserialize)]
struct ProfileFile {
    #[serde(default)]
    auto_approve: Vec<String>,
    #[serde(default)]
    always_deny: Vec<String>,
}

impl Profile {
    pub fn new(
        name: impl Into<String>,
        auto_approve: Vec<String>,
        always_deny: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            auto_approve: auto_approve.iter().map(|p| normalize_ws(p)).collect(),
            always_deny: always_deny.iter().map(|p| normalize_ws(p)).collect(),
        }
    }

    /// The built-in profile used when a submit request names none: common
    /// read-only inspection commands are allowed, a handful of
    /// irreversible ones are always denied, everything else goes to
    /// review.
    pub fn builtin_default() -> Self {
        Profile::new(
            "default",
            vec![
                "ls".to_string(),
                "cat".to_string(),
                "head".to_string(),
                "tail".to_string(),
                "wc".to_string(),
                "pwd".to_string(),
                "echo".to_string(),
                "df -h".to_string(),
                "uname".to_string(),
                "which".to_string(),
            ],
            vec![
                "rm -rf /".to_string(),
                "dd if=/dev/zero".to_string(),
                "mkfs".to_string(),
                "shutdown".to_string(),
                "reboot".to_string(),
            ],
        )
    }

    pub fn from_json(name: &str, raw: &str) -> Result<Self> {
        let parsed: ProfileFile = serde_json::from_str(raw)
            .map_err(|e| DrydockErr::InvalidInput(format!("malformed profile {name:?}: {e}")))?;
        Ok(Profile::new(name, parsed.auto_approve, parsed.always_deny))
    }

    /// Load a named profile: built-ins first, then `<home>/profiles/<name>.json`.
    pub fn load(ctx: &AppContext, name: &str) -> Result<Self> {
        if name == "default" {
            return Ok(Profile::builtin_default());
        }
        let path = ctx.profiles_dir().join(format!("{name}.json"));
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DrydockErr::NotFound(format!("profile {name:?}"))
            } else {
                DrydockErr::Io(e)
            }
        })?;
        Profile::from_json(name, &raw)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classify one candidate invocation. `always_deny` wins over
    /// `auto_approve`; neither matching means review. The env delta rides
    /// along for parity with the capture record but does not participate
    /// in matching — leading `VAR=value` words are already stripped by
    /// normalisation.
    pub fn classify(
        &self,
        argv: &[String],
        _env_delta: &BTreeMap<String, String>,
    ) -> Classification {
        let candidate = normalize_candidate(argv);
        if self
            .always_deny
            .iter()
            .any(|p| pattern_matches(p, &candidate))
        {
            return Classification::AutoDeny;
        }
        if self
            .auto_approve
            .iter()
            .any(|p| pattern_matches(p, &candidate))
        {
            return Classification::AutoAllow;
        }
        Classification::NeedsReview
    }
}

/// Names of every loadable profile: built-ins plus the `profiles/`
/// directory contents.
pub fn list_profiles(ctx: &AppContext) -> Result<Vec<String>> {
    let mut names = vec!["default".to_string()];
    match std::fs::read_dir(ctx.profiles_dir()) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(stem) = name.strip_suffix(".json") {
                    if !stem.is_empty() && stem != "default" {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    names.sort();
    Ok(names)
}

/// Normalise a candidate argv for matching:
/// 1. drop leading `VAR=value` words,
/// 2. strip the directory from what is then `argv[0]`,
/// 3. join with single spaces, no shell quoting.
pub fn normalize_candidate(argv: &[String]) -> String {
    let mut words = argv
        .iter()
        .skip_while(|arg| is_env_assignment(arg))
        .map(String::as_str);

    let mut out = String::new();
    if let Some(head) = words.next() {
        out.push_str(head.rsplit('/').next().unwrap_or(head));
    }
    for word in words {
        out.push(' ');
        out.push_str(word);
    }
    out
}

fn is_env_assignment(arg: &str) -> bool {
    match arg.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .enumerate()
                    .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
        }
        None => false,
    }
}

/// Byte-exact prefix at a word boundary: the pattern matches iff the
/// candidate equals it or continues with a space.
fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    candidate == pattern
        || candidate
            .strip_prefix(pattern)
            .is_some_and(|rest| rest.starts_with(' '))
}

fn normalize_ws(pattern: &str) -> String {
    pattern.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn vec_str(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalisation_strips_env_prefixes_and_directories() {
        assert_eq!(
            "ls -l /tmp",
            normalize_candidate(&vec_str(&["/usr/bin/ls", "-l", "/tmp"]))
        );
        assert_eq!(
            "make install",
            normalize_candidate(&vec_str(&["CC=clang", "V=1", "make", "install"]))
        );
        // Only argv[0] loses its directory.
        assert_eq!(
            "cp /a/b /c/d",
            normalize_candidate(&vec_str(&["/bin/cp", "/a/b", "/c/d"]))
        );
        // A bare word containing '=' past the head is not an assignment.
        assert_eq!(
            "env FOO=bar",
            normalize_candidate(&vec_str(&["env", "FOO=bar"]))
        );
    }

    #[test]
    fn matching_stops_at_word_boundaries() {
        let profile = Profile::new("t", vec!["ls".to_string()], vec![]);
        let env = btreemap! {};
        assert_eq!(
            Classification::AutoAllow,
            profile.classify(&vec_str(&["ls"]), &env)
        );
        assert_eq!(
            Classification::AutoAllow,
            profile.classify(&vec_str(&["ls", "-l"]), &env)
        );
        // `ls` must not match `lsblk`.
        assert_eq!(
            Classification::NeedsReview,
            profile.classify(&vec_str(&["lsblk"]), &env)
        );
    }

    #[test]
    fn deny_wins_over_allow() {
        let profile = Profile::new(
            "t",
            vec!["rm".to_string()],
            vec!["rm -rf /".to_string()],
        );
        let env = btreemap! {};
        assert_eq!(
            Classification::AutoDeny,
            profile.classify(&vec_str(&["rm", "-rf", "/"]), &env)
        );
        assert_eq!(
            Classification::AutoAllow,
            profile.classify(&vec_str(&["rm", "stale.log"]), &env)
        );
    }

    #[test]
    fn evasions_normalise_away() {
        let profile = Profile::new("t", vec![], vec!["rm -rf /".to_string()]);
        let env = btreemap! {};
        for argv in [
            vec_str(&["rm", "-rf", "/"]),
            vec_str(&["/bin/rm", "-rf", "/"]),
            vec_str(&["LANG=C", "/usr/bin/rm", "-rf", "/"]),
        ] {
            assert_eq!(Classification::AutoDeny, profile.classify(&argv, &env));
        }
    }

    #[test]
    fn unmatched_commands_need_review() {
        let profile = Profile::builtin_default();
        let env = btreemap! {};
        assert_eq!(
            Classification::NeedsReview,
            profile.classify(&vec_str(&["curl", "http://example.com"]), &env)
        );
    }

    #[test]
    fn profile_json_ignores_unknown_keys_and_normalises_whitespace() {
        let profile = Profile::from_json(
            "custom",
            r#"{ "auto_approve": ["  df   -h "], "always_deny": [], "comment": "ignored" }"#,
        )
        .expect("parse");
        let env = btreemap! {};
        assert_eq!(
            Classification::AutoAllow,
            profile.classify(&vec_str(&["df", "-h"]), &env)
        );
    }

    #[test]
    fn multi_word_patterns_match_prefix_commands() {
        let profile = Profile::new("t", vec!["cat /etc/".to_string()], vec![]);
        let env = btreemap! {};
        // Pattern ends mid-word, so only a space after it can follow.
        assert_eq!(
            Classification::NeedsReview,
            profile.classify(&vec_str(&["cat", "/etc/passwd"]), &env)
        );
        assert_eq!(
            Classification::AutoAllow,
            profile.classify(&vec_str(&["cat", "/etc/", "extra"]), &env)
        );
    }
}
