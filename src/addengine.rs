//! Add engine (§4.E)
//!
//! Composes clone (§4.C) and dependency resolution (§4.D); introduces no new
//! mutation primitive of its own.

use crate::error::Result;
use crate::fileops::{self, FileKind};
use crate::policy::WritePolicy;
use crate::resolver::Resolver;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Mirror an absolute host path beneath `jailhome`.
fn mirrored(jailhome: &Path, host_path: &Path) -> PathBuf {
    let relative = host_path.strip_prefix("/").unwrap_or(host_path);
    jailhome.join(relative)
}

/// True when `dst` already holds the same absolute target with matching size
/// and mtime as `src` — the add engine's "already present" skip condition
/// (§4.E).
fn already_present(src: &Path, dst: &Path) -> bool {
    let (Ok(src_meta), Ok(dst_meta)) = (fs::metadata(src), fs::metadata(dst)) else {
        return false;
    };
    src_meta.len() == dst_meta.len() && src_meta.mtime() == dst_meta.mtime()
}

/// `add(paths…)` (§4.E): clone each path into the jail, then, for ELF-like
/// files, add every dependency the resolver reports.
pub fn add(
    jailhome: &Path,
    paths: &[PathBuf],
    resolver: &Resolver,
    dns_libs: &[PathBuf],
    policy: &WritePolicy,
) -> Result<Vec<PathBuf>> {
    let mut added = Vec::new();
    for path in paths {
        add_one(jailhome, path, resolver, dns_libs, policy, &mut added)?;
    }
    Ok(added)
}

fn add_one(
    jailhome: &Path,
    path: &Path,
    resolver: &Resolver,
    dns_libs: &[PathBuf],
    policy: &WritePolicy,
    added: &mut Vec<PathBuf>,
) -> Result<()> {
    let dst = mirrored(jailhome, path);
    if already_present(path, &dst) {
        return Ok(());
    }
    fileops::clone(path, &dst, policy)?;
    added.push(dst.clone());

    if Resolver::needs_resolution(path) {
        let deps = resolver.resolve(path, dns_libs)?;
        for dep in deps {
            let dep_dst = mirrored(jailhome, &dep);
            if already_present(&dep, &dep_dst) {
                continue;
            }
            fileops::clone(&dep, &dep_dst, policy)?;
            added.push(dep_dst);
        }
    }
    Ok(())
}

/// `add-from(srcdir, files…)` (§4.E): like add, but relative names are
/// resolved against `srcdir`, and the destination mirrors only the relative
/// portion.
pub fn add_from(
    jailhome: &Path,
    srcdir: &Path,
    files: &[String],
    resolver: &Resolver,
    dns_libs: &[PathBuf],
    policy: &WritePolicy,
) -> Result<Vec<PathBuf>> {
    let mut added = Vec::new();
    for name in files {
        let src = srcdir.join(name);
        let dst = jailhome.join(name);
        if already_present(&src, &dst) {
            continue;
        }
        fileops::clone(&src, &dst, policy)?;
        added.push(dst.clone());

        if Resolver::needs_resolution(&src) {
            let deps = resolver.resolve(&src, dns_libs)?;
            for dep in deps {
                let dep_dst = mirrored(jailhome, &dep);
                if already_present(&dep, &dep_dst) {
                    continue;
                }
                fileops::clone(&dep, &dep_dst, policy)?;
                added.push(dep_dst);
            }
        }
    }
    Ok(added)
}

/// `add-recurse(paths…, quick?)` (§4.E): add, then for directories recurse
/// into entries other than `.`/`..`.
pub fn add_recurse(
    jailhome: &Path,
    paths: &[PathBuf],
    quick: bool,
    resolver: &Resolver,
    dns_libs: &[PathBuf],
    policy: &WritePolicy,
) -> Result<Vec<PathBuf>> {
    let mut added = Vec::new();
    for path in paths {
        add_recurse_one(jailhome, path, quick, resolver, dns_libs, policy, &mut added)?;
    }
    Ok(added)
}

fn add_recurse_one(
    jailhome: &Path,
    path: &Path,
    quick: bool,
    resolver: &Resolver,
    dns_libs: &[PathBuf],
    policy: &WritePolicy,
    added: &mut Vec<PathBuf>,
) -> Result<()> {
    add_one(jailhome, path, resolver, dns_libs, policy, added)?;

    let record = fileops::measure(path)?;
    if record.kind != FileKind::Directory {
        return Ok(());
    }
    let dst = mirrored(jailhome, path);
    if quick && already_present(path, &dst) {
        return Ok(());
    }
    for entry in fs::read_dir(path).map_err(|e| crate::error::Error::Filesystem {
        path: path.to_path_buf(),
        source: e,
    })? {
        let entry = entry.map_err(|e| crate::error::Error::Filesystem {
            path: path.to_path_buf(),
            source: e,
        })?;
        add_recurse_one(
            jailhome,
            &entry.path(),
            quick,
            resolver,
            dns_libs,
            policy,
            added,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Collaborator;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn no_op_resolver() -> Resolver {
        let ldconfig = Collaborator::compile("true", r"(\S+)").unwrap();
        let ldlist = Collaborator::compile("true", r"(\S+)").unwrap();
        Resolver::new(ldconfig, ldlist)
    }

    #[test]
    fn add_mirrors_plain_file_under_jailhome() {
        let dir = tempdir().unwrap();
        let jailhome = dir.path().join("home");
        fs::create_dir_all(&jailhome).unwrap();
        let src = dir.path().join("payload.txt");
        fs::write(&src, b"data").unwrap();

        let policy = WritePolicy::compile(".*").unwrap();
        let resolver = no_op_resolver();
        let added = add(&jailhome, &[src.clone()], &resolver, &[], &policy).unwrap();

        let expected = jailhome.join(src.strip_prefix("/").unwrap_or(&src));
        assert!(added.contains(&expected));
        assert_eq!(fs::read(&expected).unwrap(), b"data");
    }

    #[test]
    fn add_skips_already_present_dependency() {
        let dir = tempdir().unwrap();
        let jailhome = dir.path().join("home");
        fs::create_dir_all(&jailhome).unwrap();
        let src = dir.path().join("payload.bin");
        fs::write(&src, b"\x7fELFjunk").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

        let policy = WritePolicy::compile(".*").unwrap();
        let resolver = no_op_resolver();
        // First add populates the mirror.
        add(&jailhome, &[src.clone()], &resolver, &[], &policy).unwrap();
        // Second add of the identical source should report nothing new.
        let added_again = add(&jailhome, &[src.clone()], &resolver, &[], &policy).unwrap();
        assert!(added_again.is_empty());
    }
}
