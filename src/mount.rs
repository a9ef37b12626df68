//! Mount controller (§4.F)
//!
//! Bind-mounts `jailhome` onto `jailmount`, then overlays any registered
//! bind directives with derived options. Unmounting walks the host mount
//! table rather than trusting in-process bookkeeping, since "state is the
//! filesystem" (§6) and a later run may need to clean up after a crashed one.

use crate::error::{Error, Result};
use crate::policy::WritePolicy;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::io::BufRead;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A single registered bind directive: `(srcpath, bindopts, path)` (§4.F).
/// `bindopts` of `None` is the `auto` sentinel.
#[derive(Debug, Clone)]
pub struct BindDirective {
    pub srcpath: PathBuf,
    pub bindopts: Option<Vec<String>>,
    pub path: String,
}

/// Options derived for a bind, always comma-joined in the order computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedOptions {
    pub tokens: Vec<String>,
}

impl DerivedOptions {
    pub fn contains(&self, opt: &str) -> bool {
        self.tokens.iter().any(|t| t == opt)
    }

    pub fn joined(&self) -> String {
        self.tokens.join(",")
    }
}

/// Derive bind options per §4.F:
/// - explicit options are honored as given, with `nosuid` always added and
///   `noexec` added unless `exec` is present;
/// - `auto`/absent derives `exec,ro` for a path under `$JAILHOME`, else `rw`
///   if the host process can write the source, else `ro`; then the same
///   `nosuid`/`noexec` rule applies.
pub fn derive_options(
    srcpath: &Path,
    jailhome: &Path,
    explicit: Option<&[String]>,
) -> DerivedOptions {
    let mut tokens: Vec<String> = match explicit {
        Some(opts) => opts.to_vec(),
        None => {
            if srcpath.starts_with(jailhome) {
                vec!["exec".to_string(), "ro".to_string()]
            } else if is_host_writable(srcpath) {
                vec!["rw".to_string()]
            } else {
                vec!["ro".to_string()]
            }
        }
    };

    if !tokens.iter().any(|t| t == "exec") {
        tokens.push("noexec".to_string());
    }
    tokens.push("nosuid".to_string());

    DerivedOptions { tokens }
}

fn is_host_writable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o222 != 0)
        .unwrap_or(false)
}

fn flags_from_options(opts: &DerivedOptions) -> MsFlags {
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_NOSUID;
    if opts.contains("ro") {
        flags |= MsFlags::MS_RDONLY;
    }
    if opts.contains("noexec") {
        flags |= MsFlags::MS_NOEXEC;
    }
    flags
}

/// `mount` (§4.F): bind `jailhome` onto `jailmount` with `nosuid`, then apply
/// every registered bind directive whose `srcpath` exists. Idempotent: a
/// target already live with equivalent options is left alone rather than
/// re-bound (§4.F, §4.K — `--mount` against an already-Mounted jail is a
/// no-op transition, not an error).
pub fn mount_jail(
    jailhome: &Path,
    jailmount: &Path,
    binds: &[BindDirective],
    policy: &WritePolicy,
) -> Result<()> {
    policy.check(jailmount)?;
    if !is_already_mounted(jailmount, &["nosuid".to_string()])? {
        bind(jailhome, jailmount, MsFlags::MS_BIND | MsFlags::MS_NOSUID)?;
    }

    for bind_dir in binds {
        if !bind_dir.srcpath.exists() {
            continue; // optional binds are skipped silently (§4.F)
        }
        let mount_point = jailhome.join(&bind_dir.path);
        policy.check(&mount_point)?;
        if !mount_point.exists() {
            fs::create_dir_all(&mount_point).map_err(|e| Error::Filesystem {
                path: mount_point.clone(),
                source: e,
            })?;
            fs::set_permissions(&mount_point, fs::Permissions::from_mode(0o750)).map_err(|e| {
                Error::Filesystem {
                    path: mount_point.clone(),
                    source: e,
                }
            })?;
        }

        let target = jailmount.join(&bind_dir.path);
        let opts = derive_options(&bind_dir.srcpath, jailhome, bind_dir.bindopts.as_deref());
        if is_already_mounted(&target, &opts.tokens)? {
            continue; // never re-mount a mount already live with equivalent options
        }
        let flags = flags_from_options(&opts);
        bind(&bind_dir.srcpath, &target, flags)?;
    }
    Ok(())
}

fn bind(src: &Path, target: &Path, flags: MsFlags) -> Result<()> {
    mount(Some(src), target, None::<&str>, MsFlags::MS_BIND, None::<&str>).map_err(|e| {
        Error::Mount {
            path: target.to_path_buf(),
            message: e.to_string(),
        }
    })?;
    if flags != MsFlags::MS_BIND {
        mount(
            Some(src),
            target,
            None::<&str>,
            flags | MsFlags::MS_REMOUNT,
            None::<&str>,
        )
        .map_err(|e| Error::Mount {
            path: target.to_path_buf(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

/// One entry read from `/proc/self/mountinfo`.
struct MountEntry {
    mount_point: PathBuf,
    /// Per-mount options (mountinfo field 6), e.g. `["rw", "nosuid", "noexec"]`.
    options: Vec<String>,
}

fn read_mount_table() -> Result<Vec<MountEntry>> {
    let file = fs::File::open("/proc/self/mountinfo").map_err(Error::Io)?;
    let reader = std::io::BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(Error::Io)?;
        // mountinfo format: ID parent-ID major:minor root mount-point options ...
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let (Some(mount_point), Some(options)) = (fields.get(4), fields.get(5)) {
            entries.push(MountEntry {
                mount_point: PathBuf::from(*mount_point),
                options: options.split(',').map(str::to_string).collect(),
            });
        }
    }
    Ok(entries)
}

/// A target is "already mounted with equivalent options" when it appears in
/// the host mount table and its live `ro`/`rw` and `exec`/`noexec` settings
/// match what we'd derive — `nosuid` is carried on every bind (§4.F) so it
/// isn't part of the comparison.
fn is_already_mounted(target: &Path, wanted: &[String]) -> Result<bool> {
    let entries = read_mount_table()?;
    let Some(entry) = entries.iter().find(|e| e.mount_point == target) else {
        return Ok(false);
    };
    let live_ro = entry.options.iter().any(|o| o == "ro");
    let want_ro = wanted.iter().any(|o| o == "ro");
    let live_noexec = entry.options.iter().any(|o| o == "noexec");
    let want_noexec = wanted.iter().any(|o| o == "noexec");
    Ok(live_ro == want_ro && live_noexec == want_noexec)
}

/// `umount` (§4.F): enumerate every active mount at or beneath `jailmount`,
/// sort by path length descending, and unmount each. Finishes Unmounted even
/// if an individual unmount reports "not mounted".
pub fn umount_jail(jailmount: &Path, lazy: bool, policy: &WritePolicy) -> Result<()> {
    policy.check(jailmount)?;
    let mut entries: Vec<PathBuf> = read_mount_table()?
        .into_iter()
        .map(|e| e.mount_point)
        .filter(|p| p == jailmount || p.starts_with(jailmount))
        .collect();
    entries.sort_by_key(|p| std::cmp::Reverse(p.as_os_str().len()));

    for path in entries {
        let flags = if lazy {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        match umount2(&path, flags) {
            Ok(()) => {}
            Err(nix::errno::Errno::EINVAL) => {} // "not mounted" — ignore, per §4.F
            Err(e) => {
                return Err(Error::Unmount {
                    path,
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_options_for_jailhome_path_is_exec_ro() {
        let jailhome = PathBuf::from("/var/jails/alice/home");
        let src = jailhome.join("usr/lib");
        let opts = derive_options(&src, &jailhome, None);
        assert!(opts.contains("exec"));
        assert!(opts.contains("ro"));
        assert!(opts.contains("nosuid"));
        assert!(!opts.contains("noexec"));
    }

    #[test]
    fn every_derived_set_carries_nosuid() {
        let jailhome = PathBuf::from("/var/jails/alice/home");
        let opts = derive_options(Path::new("/usr"), &jailhome, Some(&["ro".to_string()]));
        assert!(opts.contains("nosuid"));
        assert!(opts.contains("noexec"));
    }

    #[test]
    fn explicit_exec_suppresses_noexec() {
        let jailhome = PathBuf::from("/var/jails/alice/home");
        let opts = derive_options(
            Path::new("/usr"),
            &jailhome,
            Some(&["rw".to_string(), "exec".to_string()]),
        );
        assert!(!opts.contains("noexec"));
        assert!(opts.contains("nosuid"));
    }

    #[test]
    fn auto_rw_for_writable_non_jailhome_path() {
        let dir = tempfile::tempdir().unwrap();
        let jailhome = PathBuf::from("/var/jails/alice/home");
        let opts = derive_options(dir.path(), &jailhome, None);
        assert!(opts.contains("rw"));
    }

    #[test]
    #[ignore] // Requires root to bind-mount
    fn mount_jail_binds_jailhome_then_umount_removes_it() {
        let jailhome = tempfile::tempdir().unwrap();
        let jailmount = tempfile::tempdir().unwrap();
        let policy = WritePolicy::compile(".*").unwrap();

        mount_jail(jailhome.path(), jailmount.path(), &[], &policy).unwrap();
        assert!(is_already_mounted(jailmount.path(), &["nosuid".to_string()]).unwrap());

        umount_jail(jailmount.path(), false, &policy).unwrap();
        let entries = read_mount_table().unwrap();
        assert!(!entries.iter().any(|e| e.mount_point == jailmount.path()));
    }

    #[test]
    #[ignore] // Requires root to bind-mount
    fn umount_jail_walks_nested_binds_longest_path_first() {
        let jailhome = tempfile::tempdir().unwrap();
        let jailmount = tempfile::tempdir().unwrap();
        let policy = WritePolicy::compile(".*").unwrap();
        let nested_src = tempfile::tempdir().unwrap();

        let nested_rel = "opt/data";
        fs::create_dir_all(jailhome.path().join(nested_rel)).unwrap();
        let binds = vec![BindDirective {
            srcpath: nested_src.path().to_path_buf(),
            bindopts: Some(vec!["ro".to_string()]),
            path: nested_rel.to_string(),
        }];

        mount_jail(jailhome.path(), jailmount.path(), &binds, &policy).unwrap();
        let nested_target = jailmount.path().join(nested_rel);
        assert!(is_already_mounted(&nested_target, &["ro".to_string(), "noexec".to_string()]).unwrap());

        umount_jail(jailmount.path(), false, &policy).unwrap();
        let entries = read_mount_table().unwrap();
        assert!(!entries.iter().any(|e| e.mount_point.starts_with(jailmount.path())));
    }
}
