//! Executor (§4.I)
//!
//! The terminal step of a `--execute` run: chroot, chdir, umask, drop
//! privilege, sanitize the environment, then replace the process image.
//! Nothing here returns on success — the calling process is gone. A failure
//! partway through is fatal and reported to the *original* stderr, since by
//! the time `execvp` fails the descriptor table, chroot, and uid/gid are
//! already whatever the previous steps left them as.

use crate::error::{Error, Result};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, chroot, execvp, setgid, setgroups, setuid, Gid, Uid};
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Default umask applied inside the jail when the caller doesn't override it.
pub const DEFAULT_UMASK: u32 = 0o037;

/// Environment variables carried over from the invoking process verbatim
/// (§4.I step 5, §6 "Environment consumed at Executor time").
pub const INHERITED_ENV: &[&str] = &["JAILBASE", "PWD", "USER", "HOME", "PATH", "LANG"];

/// Everything the Executor needs to replace the calling process (§4.I).
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub jailmount: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    /// `name=value` pairs given before the program on the command line.
    pub env: Vec<(String, String)>,
    pub chdir: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub umask: Option<u32>,
}

/// Build the sanitized environment (§4.I step 5): the fixed inherited names
/// sourced from the *invoking* process, plus every `name=value` pair given
/// before the program. Pure function so it's testable without touching the
/// real environment.
pub fn sanitized_env(
    current_env: &[(String, String)],
    extra: &[(String, String)],
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = INHERITED_ENV
        .iter()
        .filter_map(|name| {
            current_env
                .iter()
                .find(|(k, _)| k == name)
                .map(|(k, v)| (k.clone(), v.clone()))
        })
        .collect();
    for (k, v) in extra {
        if let Some(existing) = out.iter_mut().find(|(ek, _)| ek == k) {
            existing.1 = v.clone();
        } else {
            out.push((k.clone(), v.clone()));
        }
    }
    out
}

/// Run the Executor. On success this never returns — the process image is
/// replaced. On failure the error is the caller's to report before exiting,
/// per §4.I step 6 ("reported to the original stderr before exit").
pub fn run(spec: &ExecSpec) -> Result<()> {
    chroot(&spec.jailmount).map_err(|e| Error::Chroot {
        path: spec.jailmount.clone(),
        message: e.to_string(),
    })?;

    let target_dir = spec.chdir.as_deref().unwrap_or("/");
    chdir(Path::new(target_dir)).map_err(|e| Error::Chroot {
        path: PathBuf::from(target_dir),
        message: e.to_string(),
    })?;

    umask(Mode::from_bits_truncate(spec.umask.unwrap_or(DEFAULT_UMASK)));

    // gid, then supplementary groups, then uid (§4.I step 4): once uid is
    // dropped the process can no longer change gid, so order matters and
    // there is no way back to privileged once this sequence completes.
    let gid = Gid::from_raw(spec.gid);
    let uid = Uid::from_raw(spec.uid);
    setgid(gid).map_err(|e| Error::PrivilegeDrop(format!("setgid({}): {e}", spec.gid)))?;
    setgroups(&[gid]).map_err(|e| Error::PrivilegeDrop(format!("setgroups: {e}")))?;
    setuid(uid).map_err(|e| Error::PrivilegeDrop(format!("setuid({}): {e}", spec.uid)))?;

    let current_env: Vec<(String, String)> = std::env::vars().collect();
    let final_env = sanitized_env(&current_env, &spec.env);
    for (key, _) in &current_env {
        // SAFETY: single-threaded at this point in the Executor handoff.
        unsafe { std::env::remove_var(key) };
    }
    for (key, value) in &final_env {
        unsafe { std::env::set_var(key, value) };
    }

    let program = CString::new(spec.program.clone()).map_err(Error::CString)?;
    let mut argv = vec![program.clone()];
    for arg in &spec.args {
        argv.push(CString::new(arg.clone()).map_err(Error::CString)?);
    }

    let err = execvp(program.as_c_str(), &argv).unwrap_err();
    Err(Error::Exec {
        program: spec.program.clone(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_env_keeps_only_inherited_names() {
        let current = vec![
            ("JAILBASE".to_string(), "/var/jails".to_string()),
            ("PWD".to_string(), "/home/alice".to_string()),
            ("USER".to_string(), "alice".to_string()),
            ("HOME".to_string(), "/home/alice".to_string()),
            ("PATH".to_string(), "/bin:/usr/bin".to_string()),
            ("LANG".to_string(), "C".to_string()),
            ("SSH_AUTH_SOCK".to_string(), "/tmp/agent.sock".to_string()),
            ("SECRET_TOKEN".to_string(), "hunter2".to_string()),
        ];
        let env = sanitized_env(&current, &[]);
        assert_eq!(env.len(), 6);
        assert!(!env.iter().any(|(k, _)| k == "SSH_AUTH_SOCK"));
        assert!(!env.iter().any(|(k, _)| k == "SECRET_TOKEN"));
    }

    #[test]
    fn sanitized_env_adds_and_overrides_with_explicit_pairs() {
        let current = vec![("PATH".to_string(), "/bin".to_string())];
        let extra = vec![
            ("PATH".to_string(), "/custom/bin".to_string()),
            ("DEBUG".to_string(), "1".to_string()),
        ];
        let env = sanitized_env(&current, &extra);
        assert_eq!(
            env.iter().find(|(k, _)| k == "PATH").map(|(_, v)| v.as_str()),
            Some("/custom/bin")
        );
        assert!(env.iter().any(|(k, v)| k == "DEBUG" && v == "1"));
    }

    // `run` replaces the calling process on success, so it can't be called
    // directly from the test harness's own process — fork first, same as
    // the teacher's jexec test does for its own process-replacing syscall.
    #[test]
    #[ignore] // Requires root to chroot and drop privilege
    fn run_chroots_and_execs_true_in_forked_child() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};

        let dir = tempfile::tempdir().unwrap();
        std::fs::copy("/bin/true", dir.path().join("true")).unwrap();

        let spec = ExecSpec {
            jailmount: dir.path().to_path_buf(),
            program: "/true".to_string(),
            args: vec![],
            env: vec![],
            chdir: None,
            uid: 0,
            gid: 0,
            umask: None,
        };

        match unsafe { fork() }.expect("fork failed") {
            ForkResult::Child => {
                // Only returns on failure; a successful exec never reaches this line.
                let _ = run(&spec);
                std::process::exit(1);
            }
            ForkResult::Parent { child } => match waitpid(child, None).expect("waitpid failed") {
                WaitStatus::Exited(_, code) => assert_eq!(code, 0),
                other => panic!("unexpected wait status: {other:?}"),
            },
        }
    }
}
