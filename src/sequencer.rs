//! Command sequencer (§4.H)
//!
//! The spine of the engine: runs the queued [`Step`]s in input order,
//! expanding templated arguments through the property namespace immediately
//! before each step runs (§8 property 10), enforcing the write-path policy
//! on every destination, and honoring `--try`/`--test`/`--verbose`.

use crate::addengine;
use crate::defaults;
use crate::error::{Error, Result};
use crate::executor::{self, ExecSpec};
use crate::fileops::{self, FileFlags};
use crate::lifecycle::JailLifecycle;
use crate::mount::{self, BindDirective};
use crate::policy::WritePolicy;
use crate::properties::{names, Properties};
use crate::resolver::Resolver;
use crate::step::Step;
use std::path::{Path, PathBuf};

/// Flags that shape how the sequencer runs, independent of the step list
/// itself (§6 "options").
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub verbose: bool,
    pub test: bool,
}

/// Runs an ordered step list against one jail (§4.H, §9 "no ambient state":
/// a `Sequencer` is a self-contained value, not a singleton).
pub struct Sequencer {
    props: Properties,
    policy: WritePolicy,
    resolver: Resolver,
    lifecycle: JailLifecycle,
    binds: Vec<BindDirective>,
    dns_libs: Vec<PathBuf>,
    options: RunOptions,
    pending_try: bool,
}

impl Sequencer {
    pub fn new(
        props: Properties,
        policy: WritePolicy,
        resolver: Resolver,
        dns_libs: Vec<PathBuf>,
        options: RunOptions,
    ) -> Result<Self> {
        let jailpriv = PathBuf::from(props.require(names::JAILPRIV)?);
        let jailmount = PathBuf::from(props.require(names::JAILMOUNT)?);
        let lifecycle = JailLifecycle::probe(&jailpriv, &jailmount);
        Ok(Self {
            props,
            policy,
            resolver,
            lifecycle,
            binds: Vec::new(),
            dns_libs,
            options,
            pending_try: false,
        })
    }

    pub fn properties(&self) -> &Properties {
        &self.props
    }

    /// Run every queued step in order. Returns `Ok(true)` on an executed
    /// `--execute` handoff that would have succeeded under `--test` (so the
    /// caller knows not to expect a process replacement), `Ok(false)` for a
    /// normal completion, and never returns on a *real* `--execute` success
    /// since the process image is gone by then.
    pub fn run(&mut self, steps: &[Step]) -> Result<()> {
        for step in steps {
            if matches!(step, Step::Try) {
                self.pending_try = true;
                continue;
            }

            let outcome = self.run_one(step);
            let was_try = std::mem::replace(&mut self.pending_try, false);

            if let Err(e) = outcome {
                if was_try {
                    eprintln!("[{}] suppressed by --try: {e}", step.tag());
                    continue;
                }
                if self.options.test {
                    println!("# {e}");
                    continue;
                }
                return Err(Error::Step {
                    step: step.tag().to_string(),
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }

    fn expand(&self, template: &str) -> Result<String> {
        self.props.expand(template)
    }

    fn path(&self, template: &str) -> Result<PathBuf> {
        Ok(PathBuf::from(self.expand(template)?))
    }

    fn announce(&self, line: &str) {
        if self.options.verbose || self.options.test {
            println!("{line}");
        }
    }

    fn jailhome(&self) -> Result<PathBuf> {
        self.path(&format!("{{{}}}", names::JAILHOME))
    }

    fn run_one(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Mkdir { dst, mode, owner } => {
                let dst = self.path(dst)?;
                self.announce(&format!("mkdir -m {mode:o} {}", dst.display()));
                let owner = match owner {
                    Some((u, g)) => Some((self.resolve_uid(u)?, self.resolve_gid(g)?)),
                    None => None,
                };
                if !self.options.test {
                    fileops::mkdir(&dst, *mode, owner, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::Mknod { dst, is_char, major, minor, mode } => {
                let dst = self.path(dst)?;
                self.announce(&format!(
                    "mknod {} {} {major} {minor:?}",
                    dst.display(),
                    if *is_char { "c" } else { "b" }
                ));
                if !self.options.test {
                    fileops::mknod(&dst, *is_char, *major, *minor, *mode, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::LnS { target, link } => {
                let target = self.path(target)?;
                let link = self.path(link)?;
                self.announce(&format!("ln -s {} {}", target.display(), link.display()));
                if !self.options.test {
                    fileops::ln_s(&target, &link, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::Chmod { path, mode } => {
                let path = self.path(path)?;
                self.announce(&format!("chmod {mode:o} {}", path.display()));
                if !self.options.test {
                    fileops::chmod(&path, *mode, &self.policy)?;
                }
                Ok(())
            }
            Step::Chown { path, uid, gid } => {
                let target = self.path(path)?;
                let uid_n = self.resolve_uid(uid)?;
                let gid_n = self.resolve_gid(gid)?;
                self.announce(&format!("chown {uid_n}:{gid_n} {}", target.display()));
                if !self.options.test {
                    fileops::chown(&target, uid_n, gid_n, &self.policy)?;
                }
                Ok(())
            }
            Step::Chflags { path, flags } => {
                let path = self.path(path)?;
                self.announce(&format!("chflags {flags:#x} {}", path.display()));
                if !self.options.test {
                    fileops::chflags(&path, FileFlags::from_bits_truncate(*flags), &self.policy)?;
                }
                Ok(())
            }
            Step::Touch { path, stamp } => {
                let target = self.path(path)?;
                self.announce(&format!("touch {}", target.display()));
                if !self.options.test {
                    fileops::touch(&target, stamp.as_deref(), &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::Rm { path } => {
                let path = self.path(path)?;
                self.announce(&format!("rm {}", path.display()));
                if !self.options.test {
                    fileops::rm(&path, &self.policy)?;
                }
                Ok(())
            }
            Step::Rmdir { path } => {
                let path = self.path(path)?;
                self.announce(&format!("rmdir {}", path.display()));
                if !self.options.test {
                    fileops::rmdir(&path, &self.policy)?;
                }
                Ok(())
            }
            Step::Clone { src, dst } => {
                let src = self.path(src)?;
                let dst = self.path(dst)?;
                self.announce(&format!("cp -p {} {}", src.display(), dst.display()));
                if !self.options.test {
                    fileops::clone(&src, &dst, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::CloneRecurse { src, dst, quick } => {
                let src = self.path(src)?;
                let dst = self.path(dst)?;
                self.announce(&format!("cp -rp {} {}", src.display(), dst.display()));
                if !self.options.test {
                    fileops::clone_recurse(&src, &dst, *quick, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::CloneFrom { src, dst, files } => {
                let src = self.path(src)?;
                let dst = self.path(dst)?;
                self.announce(&format!(
                    "cp -p {}/{{{}}} {}",
                    src.display(),
                    files.join(","),
                    dst.display()
                ));
                if !self.options.test {
                    fileops::clone_from(&src, &dst, files, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::Add { paths } => {
                let jailhome = self.jailhome()?;
                let mut expanded = Vec::with_capacity(paths.len());
                for p in paths {
                    expanded.push(self.path(p)?);
                }
                self.announce(&format!(
                    "add {}",
                    expanded.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" ")
                ));
                if !self.options.test {
                    addengine::add(&jailhome, &expanded, &self.resolver, &self.dns_libs, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::AddFrom { srcdir, files } => {
                let jailhome = self.jailhome()?;
                let srcdir = self.path(srcdir)?;
                self.announce(&format!("add-from {} {}", srcdir.display(), files.join(" ")));
                if !self.options.test {
                    addengine::add_from(&jailhome, &srcdir, files, &self.resolver, &self.dns_libs, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::AddRecurse { paths, quick } => {
                let jailhome = self.jailhome()?;
                let mut expanded = Vec::with_capacity(paths.len());
                for p in paths {
                    expanded.push(self.path(p)?);
                }
                self.announce(&format!(
                    "add-recurse {}",
                    expanded.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" ")
                ));
                if !self.options.test {
                    addengine::add_recurse(&jailhome, &expanded, *quick, &self.resolver, &self.dns_libs, &self.policy)?;
                }
                self.lifecycle.populate();
                Ok(())
            }
            Step::Bind { srcpath, bindopts, path } => {
                let srcpath = self.path(srcpath)?;
                self.announce(&format!(
                    "bind {} {} {path}",
                    srcpath.display(),
                    bindopts.as_ref().map(|o| o.join(",")).unwrap_or_else(|| "auto".to_string())
                ));
                self.binds.push(BindDirective {
                    srcpath,
                    bindopts: bindopts.clone(),
                    path: path.clone(),
                });
                Ok(())
            }
            Step::Mount => self.mount_action(),
            Step::Umount { lazy } => {
                let jailmount = self.path(&format!("{{{}}}", names::JAILMOUNT))?;
                self.announce(&format!("umount{} {}", if *lazy { " -l" } else { "" }, jailmount.display()));
                if !self.options.test {
                    mount::umount_jail(&jailmount, *lazy, &self.policy)?;
                }
                self.lifecycle.umount();
                Ok(())
            }
            Step::Passwd => self.passwd_action(),
            Step::Etc => self.etc_action(),
            Step::Dev => self.dev_action(),
            Step::Tmp => self.tmp_action(),
            Step::Defaults => self.defaults_action(),
            Step::Clean => {
                let jailpriv = self.path(&format!("{{{}}}", names::JAILPRIV))?;
                self.policy.check(&jailpriv)?;
                self.announce(&format!("rm -rf {}/*", jailpriv.display()));
                if !self.options.test {
                    for entry in std::fs::read_dir(&jailpriv).map_err(Error::Io)? {
                        let entry = entry.map_err(Error::Io)?;
                        remove_scoped(&entry.path(), &jailpriv, &self.policy)?;
                    }
                }
                Ok(())
            }
            Step::Remove => {
                let jailpriv = self.path(&format!("{{{}}}", names::JAILPRIV))?;
                self.policy.check(&jailpriv)?;
                self.announce(&format!("rm -rf {}", jailpriv.display()));
                if !self.options.test && jailpriv.exists() {
                    std::fs::remove_dir_all(&jailpriv).map_err(|e| Error::Filesystem {
                        path: jailpriv.clone(),
                        source: e,
                    })?;
                }
                self.lifecycle.remove();
                Ok(())
            }
            Step::Print { template } => {
                println!("{}", self.expand(template)?);
                Ok(())
            }
            Step::Execute { program, args, env, chdir, umask } => {
                self.passwd_action()?;
                self.mount_action()?;
                let jailmount = self.path(&format!("{{{}}}", names::JAILMOUNT))?;
                let uid: u32 = self.expand(&format!("{{{}}}", names::UID))?.parse().unwrap_or(0);
                let gid: u32 = self.expand(&format!("{{{}}}", names::GID))?.parse().unwrap_or(0);
                let mut expanded_env = Vec::with_capacity(env.len());
                for (k, v) in env {
                    expanded_env.push((k.clone(), self.expand(v)?));
                }
                self.announce(&format!(
                    "exec chroot {} {} {}",
                    jailmount.display(),
                    program,
                    args.join(" ")
                ));
                if self.options.test {
                    return Ok(());
                }
                let spec = ExecSpec {
                    jailmount,
                    program: program.clone(),
                    args: args.clone(),
                    env: expanded_env,
                    chdir: chdir.clone(),
                    uid,
                    gid,
                    umask: *umask,
                };
                executor::run(&spec)?;
                unreachable!("executor::run only returns on failure");
            }
            Step::Try => unreachable!("consumed in run()"),
        }
    }

    /// Resolve a `chown`/`mkdir`-owner user token to a numeric uid. Jail
    /// accounts "need not resolve to existing system accounts at build time"
    /// (§3): a token naming this jail's own `{user}` reuses the already
    /// resolved `{uid}` property, and any other name that isn't a real host
    /// account falls back the same way `main.rs`'s `resolve_identity` does,
    /// rather than hard-failing the step over an account that's only ever
    /// meant to exist inside `/etc/passwd` once `--passwd` runs.
    fn resolve_uid(&self, token: &str) -> Result<u32> {
        if let Ok(n) = token.parse::<u32>() {
            return Ok(n);
        }
        if Some(token) == self.props.get(names::USER) {
            if let Some(uid) = self.props.get(names::UID) {
                if let Ok(n) = uid.parse::<u32>() {
                    return Ok(n);
                }
            }
        }
        Ok(nix::unistd::User::from_name(token)
            .ok()
            .flatten()
            .map(|u| u.uid.as_raw())
            .unwrap_or(1000))
    }

    fn resolve_gid(&self, token: &str) -> Result<u32> {
        if let Ok(n) = token.parse::<u32>() {
            return Ok(n);
        }
        if Some(token) == self.props.get(names::GROUP) {
            if let Some(gid) = self.props.get(names::GID) {
                if let Ok(n) = gid.parse::<u32>() {
                    return Ok(n);
                }
            }
        }
        Ok(nix::unistd::Group::from_name(token)
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
            .unwrap_or(1000))
    }

    fn mount_action(&mut self) -> Result<()> {
        let jailhome = self.jailhome()?;
        let jailmount = self.path(&format!("{{{}}}", names::JAILMOUNT))?;
        self.announce(&format!("mount --bind {} {}", jailhome.display(), jailmount.display()));
        if !self.options.test {
            mount::mount_jail(&jailhome, &jailmount, &self.binds, &self.policy)?;
        }
        self.lifecycle.mount();
        Ok(())
    }

    fn passwd_action(&mut self) -> Result<()> {
        let jailhome = self.jailhome()?;
        let user = self.expand(&format!("{{{}}}", names::USER))?;
        let group = self.expand(&format!("{{{}}}", names::GROUP))?;
        let uid = self.expand(&format!("{{{}}}", names::UID))?;
        let gid = self.expand(&format!("{{{}}}", names::GID))?;
        let userhome = self.expand(&format!("{{{}}}", names::USERHOME))?;
        self.announce(&format!("passwd: add {user}:{uid} {group}:{gid}"));
        if self.options.test {
            return Ok(());
        }
        self.policy.check(&jailhome.join("etc/passwd"))?;
        self.policy.check(&jailhome.join("etc/group"))?;
        append_line(
            &jailhome.join("etc/passwd"),
            &format!("{user}:*:{uid}:{gid}::{userhome}:/bin/sh\n"),
        )?;
        append_line(&jailhome.join("etc/group"), &format!("{group}:*:{gid}:\n"))?;
        self.lifecycle.populate();
        Ok(())
    }

    fn etc_action(&mut self) -> Result<()> {
        let jailhome = self.jailhome()?;
        let dst = jailhome.join("etc");
        self.announce(&format!("mkdir -m 0755 {}", dst.display()));
        if !self.options.test {
            fileops::mkdir(&dst, 0o755, None, &self.policy)?;
        }
        self.lifecycle.populate();
        Ok(())
    }

    fn dev_action(&mut self) -> Result<()> {
        let jaildev = self.path(&format!("{{{}}}", names::JAILDEV))?;
        self.announce(&format!("mkdir -m 0755 {}", jaildev.display()));
        if !self.options.test {
            fileops::mkdir(&jaildev, 0o755, None, &self.policy)?;
            fileops::populate_dev(&jaildev, defaults::DEV_NODES, &self.policy)?;
        }
        self.lifecycle.populate();
        Ok(())
    }

    fn tmp_action(&mut self) -> Result<()> {
        let jailtmp = self.path(&format!("{{{}}}", names::JAILTMP))?;
        self.announce(&format!("mkdir -m 1777 {}", jailtmp.display()));
        if !self.options.test {
            fileops::mkdir(&jailtmp, 0o1777, None, &self.policy)?;
        }
        self.lifecycle.populate();
        Ok(())
    }

    /// `--defaults` (§4.G): prepend/append the curated build sequence. Its
    /// sub-steps are invoked directly rather than re-entering `run_one` with
    /// synthesized `Step`s, since the spec treats the defaults sequence as
    /// data rendered through `{defaults_text}`, not additional control flow.
    fn defaults_action(&mut self) -> Result<()> {
        self.etc_action()?;
        self.dev_action()?;
        self.tmp_action()?;
        let jailhome = self.jailhome()?;
        for file in defaults::ETC_FILES {
            let dst = jailhome.join(file.trim_start_matches('/'));
            self.announce(&format!("cp -p {file} {}", dst.display()));
            if !self.options.test && Path::new(file).exists() {
                fileops::clone(Path::new(file), &dst, &self.policy)?;
            }
        }
        self.passwd_action()?;
        self.lifecycle.populate();
        Ok(())
    }
}

/// Recursively remove `path`, refusing anything that has drifted outside
/// `scope` (`--clean`'s "scoped strictly beneath jailpriv" invariant, §3).
fn remove_scoped(path: &Path, scope: &Path, policy: &WritePolicy) -> Result<()> {
    if !path.starts_with(scope) {
        return Err(Error::Policy(path.to_path_buf()));
    }
    policy.check(path)?;
    let meta = std::fs::symlink_metadata(path).map_err(|e| Error::Filesystem {
        path: path.to_path_buf(),
        source: e,
    })?;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path).map_err(|e| Error::Filesystem {
            path: path.to_path_buf(),
            source: e,
        })? {
            let entry = entry.map_err(|e| Error::Filesystem {
                path: path.to_path_buf(),
                source: e,
            })?;
            remove_scoped(&entry.path(), scope, policy)?;
        }
        std::fs::remove_dir(path).map_err(|e| Error::Filesystem {
            path: path.to_path_buf(),
            source: e,
        })
    } else {
        std::fs::remove_file(path).map_err(|e| Error::Filesystem {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    use std::io::Write;
    if let Some(existing) = std::fs::read_to_string(path).ok()
        && existing.lines().any(|l| l == line.trim_end())
    {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Filesystem { path: path.to_path_buf(), source: e })?;
    file.write_all(line.as_bytes()).map_err(|e| Error::Filesystem {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Collaborator;
    use tempfile::tempdir;

    fn setup(jailbase: &Path) -> Sequencer {
        let mut props = Properties::new();
        props.set(names::USER, "alice");
        props.set(names::GROUP, "alice");
        props.set(names::UID, "1000");
        props.set(names::GID, "1000");
        props.set(names::JAILBASE, jailbase.to_string_lossy().into_owned());
        props.set(names::JAILPRIV, jailbase.join("alice").to_string_lossy().into_owned());
        props.set(names::JAILHOME, jailbase.join("alice/home").to_string_lossy().into_owned());
        props.set(names::JAILMOUNT, jailbase.join("alice/mnt").to_string_lossy().into_owned());
        props.set(names::JAILDEV, jailbase.join("alice/home/dev").to_string_lossy().into_owned());
        props.set(names::JAILTMP, jailbase.join("alice/home/tmp").to_string_lossy().into_owned());
        props.set(names::USERHOME, "/home/alice");
        let policy = WritePolicy::compile(&format!("^{}", jailbase.to_string_lossy())).unwrap();
        let ldconfig = Collaborator::compile("true", r"(\S+)").unwrap();
        let ldlist = Collaborator::compile("true", r"(\S+)").unwrap();
        let resolver = Resolver::new(ldconfig, ldlist);
        Sequencer::new(props, policy, resolver, vec![], RunOptions::default()).unwrap()
    }

    #[test]
    fn mkdir_step_creates_directory_under_jailhome() {
        let dir = tempdir().unwrap();
        let mut seq = setup(dir.path());
        seq.run(&[Step::Mkdir {
            dst: "{jailhome}/var/empty".to_string(),
            mode: 0o755,
            owner: None,
        }])
        .unwrap();
        assert!(dir.path().join("alice/home/var/empty").is_dir());
    }

    #[test]
    fn print_step_expands_property() {
        let dir = tempdir().unwrap();
        let mut seq = setup(dir.path());
        seq.run(&[Step::Print { template: "{jailhome}".to_string() }]).unwrap();
    }

    #[test]
    fn policy_violation_aborts_without_try() {
        let dir = tempdir().unwrap();
        let mut seq = setup(dir.path());
        let err = seq
            .run(&[Step::Mkdir { dst: "/etc/hack".to_string(), mode: 0o755, owner: None }])
            .unwrap_err();
        assert!(err.is_policy());
    }

    #[test]
    fn try_suppresses_only_the_next_step_failure() {
        let dir = tempdir().unwrap();
        let mut seq = setup(dir.path());
        // First failing step is suppressed by --try; the second (also
        // failing, but without a preceding --try) must abort the run.
        let result = seq.run(&[
            Step::Try,
            Step::Mkdir { dst: "/etc/hack".to_string(), mode: 0o755, owner: None },
            Step::Mkdir { dst: "/etc/hack2".to_string(), mode: 0o755, owner: None },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_mode_leaves_filesystem_untouched() {
        let dir = tempdir().unwrap();
        let mut seq = setup(dir.path());
        seq = Sequencer { options: RunOptions { verbose: false, test: true }, ..seq };
        seq.run(&[Step::Mkdir {
            dst: "{jailhome}/var/empty".to_string(),
            mode: 0o755,
            owner: None,
        }])
        .unwrap();
        assert!(!dir.path().join("alice/home/var/empty").exists());
    }
}
