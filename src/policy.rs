//! Write-path policy (§4.B)
//!
//! Every mutating operation (clone, mkdir, chmod, chown, chflags, mknod,
//! ln-s, rm, rmdir, touch, remove, clean, mount points) must touch a path
//! that matches `writepath`, a regex allowlist compiled once per run.

use crate::error::{Error, Result};
use regex::Regex;
use std::path::Path;

/// Compiled write-path allowlist.
pub struct WritePolicy {
    allow: Regex,
}

impl WritePolicy {
    /// Compile `writepath` once. A malformed regex is a configuration error.
    pub fn compile(writepath: &str) -> Result<Self> {
        let allow = Regex::new(writepath).map_err(|e| Error::BadRegex {
            pattern: writepath.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { allow })
    }

    /// Check a path about to be mutated. Fails with a policy error *before*
    /// any syscall is issued, per §4.B.
    pub fn check(&self, path: &Path) -> Result<()> {
        let text = path.to_string_lossy();
        if self.allow.is_match(&text) {
            Ok(())
        } else {
            Err(Error::Policy(path.to_path_buf()))
        }
    }
}

/// The default username/groupname regex (§3): restricts jail identities to
/// POSIX-portable-filename-style tokens.
pub const DEFAULT_USERNAME_REGEX: &str = "^[a-z_][a-z0-9_-]*$";

/// Validate a jail account name against a configurable regex.
pub fn validate_name(name: &str, pattern: &str) -> Result<()> {
    let re = Regex::new(pattern).map_err(|e| Error::BadRegex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn allows_matching_path() {
        let policy = WritePolicy::compile(r"^/var/jails/").unwrap();
        assert!(policy.check(&PathBuf::from("/var/jails/alice/home")).is_ok());
    }

    #[test]
    fn rejects_path_outside_writepath() {
        let policy = WritePolicy::compile(r"^/var/jails/").unwrap();
        let err = policy.check(&PathBuf::from("/etc/hack")).unwrap_err();
        assert!(err.is_policy());
    }

    #[test]
    fn bad_regex_is_configuration_error() {
        let err = WritePolicy::compile(r"(unterminated").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn username_regex_rejects_path_traversal() {
        assert!(validate_name("alice", DEFAULT_USERNAME_REGEX).is_ok());
        assert!(validate_name("../etc", DEFAULT_USERNAME_REGEX).is_err());
        assert!(validate_name("Alice", DEFAULT_USERNAME_REGEX).is_err());
    }
}
