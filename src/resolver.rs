//! Dependency resolver (§4.D)
//!
//! Locates the dynamic loader via a configurable `(command, regex)` pair and
//! enumerates the shared-object closure of an ELF file via a second such
//! pair. Both external commands (`ldconfig`, `ld.so --list`) are treated as
//! string-producing collaborators (§1): the resolver never parses ELF itself
//! beyond sniffing the magic bytes.

use crate::error::{Error, Result};
use crate::properties::Properties;
use regex::Regex;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// A `(command template, regex)` collaborator, configured once per run.
#[derive(Debug, Clone)]
pub struct Collaborator {
    pub command_template: String,
    pub regex: Regex,
}

impl Collaborator {
    pub fn compile(command_template: &str, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| Error::BadRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            command_template: command_template.to_string(),
            regex,
        })
    }
}

/// Resolves the shared-object closure of ELF executables.
pub struct Resolver {
    ldconfig: Collaborator,
    ldlist: Collaborator,
    loader: RefCell<Option<PathBuf>>,
}

impl Resolver {
    pub fn new(ldconfig: Collaborator, ldlist: Collaborator) -> Self {
        Self {
            ldconfig,
            ldlist,
            loader: RefCell::new(None),
        }
    }

    /// A path "needs resolution" if it's a regular file whose content starts
    /// with the ELF magic (§4.D).
    pub fn needs_resolution(path: &Path) -> bool {
        let Ok(mut file) = std::fs::File::open(path) else {
            return false;
        };
        let mut buf = [0u8; 4];
        matches!(file.read_exact(&mut buf), Ok(())) && &buf == ELF_MAGIC
    }

    /// Run `ldconfig-cmd`, scan its output line by line with `ldconfig-rx`;
    /// the first capture yielding an absolute, existing, executable path is
    /// the dynamic loader. Cached for the run.
    pub fn dynamic_loader(&self) -> Result<PathBuf> {
        if let Some(cached) = self.loader.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let output = run_shell(&self.ldconfig.command_template)?;
        for line in output.lines() {
            let Some(caps) = self.ldconfig.regex.captures(line) else {
                continue;
            };
            let Some(candidate) = caps.get(1).or_else(|| caps.get(0)) else {
                continue;
            };
            let path = PathBuf::from(candidate.as_str());
            if path.is_absolute() && is_executable(&path) {
                *self.loader.borrow_mut() = Some(path.clone());
                return Ok(path);
            }
        }
        Err(Error::LoaderNotFound(self.ldconfig.command_template.clone()))
    }

    /// Enumerate the dependency closure of `path`: substitutes `{ldlinux_so}`
    /// and `{path}` into `ldlist-cmd`, runs it, and collects every
    /// regex-matched absolute path that exists on disk. The loader itself is
    /// always included (§4.D: "the loader itself is added as a dependency of
    /// every resolved binary").
    pub fn dependencies(&self, path: &Path) -> Result<BTreeSet<PathBuf>> {
        let ldlinux_so = self.dynamic_loader()?;
        let mut props = Properties::new();
        props.set("ldlinux_so", ldlinux_so.to_string_lossy().into_owned());
        props.set("path", path.to_string_lossy().into_owned());
        let command = props
            .expand(&self.ldlist.command_template)
            .map_err(|_| Error::DependencyCommand(self.ldlist.command_template.clone()))?;

        let output = run_shell(&command)?;
        let mut deps = BTreeSet::new();
        for line in output.lines() {
            for caps in self.ldlist.regex.captures_iter(line) {
                let Some(candidate) = caps.get(1).or_else(|| caps.get(0)) else {
                    continue;
                };
                let candidate_path = PathBuf::from(candidate.as_str());
                if candidate_path.is_absolute() && candidate_path.exists() {
                    deps.insert(candidate_path);
                }
            }
        }
        if deps.is_empty() {
            // Warning only (§7): a binary that should have dependencies but
            // got none back from the ldlist collaborator isn't a hard error —
            // it's still added with just the loader.
            eprintln!("{}", Error::NoDependenciesFound(path.to_path_buf()));
        }
        deps.insert(ldlinux_so);
        Ok(deps)
    }

    /// Resolve `path` plus, if `dns` is set, the host's DNS resolution
    /// libraries (dlopened at runtime by NSS, so never discoverable from a
    /// static dependency listing — §4.D).
    pub fn resolve(&self, path: &Path, dns_libs: &[PathBuf]) -> Result<BTreeSet<PathBuf>> {
        let mut deps = if Self::needs_resolution(path) {
            self.dependencies(path)?
        } else {
            BTreeSet::new()
        };
        deps.extend(dns_libs.iter().filter(|p| p.exists()).cloned());
        Ok(deps)
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn run_shell(command: &str) -> Result<String> {
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| Error::DependencyCommand(format!("{command}: {e}")))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_resolution_checks_elf_magic() {
        let dir = tempfile::tempdir().unwrap();
        let elf = dir.path().join("elf");
        std::fs::write(&elf, b"\x7fELF\x02\x01\x01").unwrap();
        let text = dir.path().join("text");
        std::fs::write(&text, b"#!/bin/sh\necho hi\n").unwrap();

        assert!(Resolver::needs_resolution(&elf));
        assert!(!Resolver::needs_resolution(&text));
    }

    #[test]
    fn dynamic_loader_parses_stubbed_command_output() {
        // Stub the "ldconfig" collaborator with a shell command whose output
        // mimics `ldconfig -p`, and point the resolver at a fake loader file
        // that exists and is executable, per §4.D.
        let dir = tempfile::tempdir().unwrap();
        let loader = dir.path().join("ld-linux-x86-64.so.2");
        std::fs::write(&loader, b"\x7fELF").unwrap();
        std::fs::set_permissions(&loader, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ldconfig = Collaborator::compile(
            &format!("echo 'ld-linux-x86-64.so.2 (libc6,x86-64) => {}'", loader.display()),
            r"=> (\S+)",
        )
        .unwrap();
        let ldlist = Collaborator::compile("true", r"(\S+)").unwrap();
        let resolver = Resolver::new(ldconfig, ldlist);

        assert_eq!(resolver.dynamic_loader().unwrap(), loader);
    }

    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn dependencies_includes_loader_and_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let loader = dir.path().join("ld.so");
        std::fs::write(&loader, b"\x7fELF").unwrap();
        std::fs::set_permissions(&loader, std::fs::Permissions::from_mode(0o755)).unwrap();
        let libc = dir.path().join("libc.so.6");
        std::fs::write(&libc, b"lib").unwrap();

        let ldconfig =
            Collaborator::compile(&format!("echo '{}'", loader.display()), r"(\S+)").unwrap();
        let ldlist = Collaborator::compile(
            &format!("echo '{} => {}'", libc.display(), libc.display()),
            r"=> (\S+)",
        )
        .unwrap();
        let resolver = Resolver::new(ldconfig, ldlist);

        let deps = resolver.dependencies(Path::new("/bin/true")).unwrap();
        assert!(deps.contains(&loader));
        assert!(deps.contains(&libc));
    }
}
