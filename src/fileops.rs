//! File operations (§4.C)
//!
//! Primitive clone/chmod/chown/chflags/mknod/ln-s/mkdir/rm/rmdir/touch used
//! by every higher-level step. Each function enforces the write-path policy
//! on its destination before issuing any syscall.

use crate::error::{Error, Result};
use crate::policy::WritePolicy;
use bitflags::bitflags;
use nix::fcntl::AtFlags;
use nix::sys::stat::{self, FchmodatFlags, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, fchownat, Gid, Uid};
use std::fs;
use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

bitflags! {
    /// Best-effort, platform-dependent file flags (§4.C). On Linux these map
    /// to the subset of `chattr`-style flags exposed through `FS_IOC_SETFLAGS`;
    /// unsupported filesystems simply ignore the ioctl (the operation stays
    /// best-effort, matching the spec's own "platform-dependent" wording).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        const IMMUTABLE = 0x0000_0010;
        const APPEND_ONLY = 0x0000_0020;
        const NODUMP = 0x0000_0040;
    }
}

const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;
const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;

/// File type as measured from a source path, `lstat`-style (symlinks are not followed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
}

impl FileKind {
    fn of(meta: &fs::Metadata) -> Option<Self> {
        let ft = meta.file_type();
        if ft.is_file() {
            Some(FileKind::Regular)
        } else if ft.is_dir() {
            Some(FileKind::Directory)
        } else if ft.is_symlink() {
            Some(FileKind::Symlink)
        } else if ft.is_char_device() {
            Some(FileKind::CharDevice)
        } else if ft.is_block_device() {
            Some(FileKind::BlockDevice)
        } else {
            None
        }
    }
}

/// The attributes read from a source path and projected onto a destination (§3).
#[derive(Debug, Clone)]
pub struct CloneRecord {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub rdev: Option<u64>,
    pub symlink_target: Option<PathBuf>,
}

/// Measure a source path (`lstat`, not `stat`: symlinks are preserved, not followed).
pub fn measure(path: &Path) -> Result<CloneRecord> {
    let meta = fs::symlink_metadata(path).map_err(|_| Error::SourceNotFound(path.to_path_buf()))?;
    let kind = FileKind::of(&meta).ok_or_else(|| Error::TypeMismatch {
        path: path.to_path_buf(),
    })?;
    let symlink_target = if kind == FileKind::Symlink {
        Some(fs::read_link(path).map_err(|e| Error::Filesystem {
            path: path.to_path_buf(),
            source: e,
        })?)
    } else {
        None
    };
    let rdev = matches!(kind, FileKind::CharDevice | FileKind::BlockDevice).then(|| meta.rdev());
    Ok(CloneRecord {
        kind,
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        mtime: meta.mtime(),
        rdev,
        symlink_target,
    })
}

fn fs_err(path: &Path, e: std::io::Error) -> Error {
    Error::Filesystem {
        path: path.to_path_buf(),
        source: e,
    }
}

/// Ensure every ancestor of `dst` exists, cloning metadata from the matching
/// ancestor of `src` where that ancestor doesn't exist yet under `dst`.
fn ensure_parents(src: &Path, dst: &Path, policy: &WritePolicy) -> Result<()> {
    let Some(parent) = dst.parent() else {
        return Ok(());
    };
    if parent.exists() {
        return Ok(());
    }
    let Some(src_parent) = src.parent() else {
        return Ok(());
    };
    ensure_parents(src_parent, parent, policy)?;
    policy.check(parent)?;
    if let Ok(src_meta) = fs::symlink_metadata(src_parent) {
        fs::create_dir_all(parent).map_err(|e| fs_err(parent, e))?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(src_meta.mode() & 0o7777));
    } else {
        fs::create_dir_all(parent).map_err(|e| fs_err(parent, e))?;
    }
    Ok(())
}

/// `clone(src, dst)` (§4.C): faithful byte-for-byte / attribute-for-attribute copy.
pub fn clone(src: &Path, dst: &Path, policy: &WritePolicy) -> Result<()> {
    policy.check(dst)?;
    let record = measure(src)?;
    ensure_parents(src, dst, policy)?;

    if let Ok(existing) = fs::symlink_metadata(dst) {
        let existing_kind = FileKind::of(&existing).ok_or_else(|| Error::TypeMismatch {
            path: dst.to_path_buf(),
        })?;
        if existing_kind != record.kind {
            return Err(Error::TypeMismatch {
                path: dst.to_path_buf(),
            });
        }
    }

    match record.kind {
        FileKind::Regular => {
            fs::copy(src, dst).map_err(|e| fs_err(dst, e))?;
        }
        FileKind::Directory => {
            if !dst.exists() {
                fs::create_dir(dst).map_err(|e| fs_err(dst, e))?;
            }
        }
        FileKind::Symlink => {
            let target = record.symlink_target.clone().unwrap();
            match fs::read_link(dst) {
                Ok(existing_target) if existing_target == target => {}
                Ok(existing_target) => {
                    return Err(Error::SymlinkMismatch {
                        link: dst.to_path_buf(),
                        target: existing_target,
                    })
                }
                Err(_) => symlink(&target, dst).map_err(|e| fs_err(dst, e))?,
            }
        }
        FileKind::CharDevice | FileKind::BlockDevice => {
            let rdev = record.rdev.unwrap();
            if !dst.exists() {
                let sflag = if record.kind == FileKind::CharDevice {
                    SFlag::S_IFCHR
                } else {
                    SFlag::S_IFBLK
                };
                let mode = Mode::from_bits_truncate(record.mode);
                stat::mknod(dst, sflag, mode, rdev).map_err(|e| Error::Filesystem {
                    path: dst.to_path_buf(),
                    source: std::io::Error::from(e),
                })?;
            } else {
                let existing = fs::symlink_metadata(dst).map_err(|e| fs_err(dst, e))?;
                if existing.rdev() != rdev {
                    return Err(Error::DeviceMismatch {
                        path: dst.to_path_buf(),
                    });
                }
            }
        }
    }

    apply_attributes(dst, &record)?;
    Ok(())
}

/// Apply permission bits, ownership, and mtime from a measured `CloneRecord`.
/// Called after creation so `clone` stays idempotent on re-run (§8, property 3).
fn apply_attributes(dst: &Path, record: &CloneRecord) -> Result<()> {
    if record.kind != FileKind::Symlink {
        fs::set_permissions(dst, fs::Permissions::from_mode(record.mode)).map_err(|e| fs_err(dst, e))?;
    }

    fchownat(
        None,
        dst,
        Some(Uid::from_raw(record.uid)),
        Some(Gid::from_raw(record.gid)),
        AtFlags::AT_SYMLINK_NOFOLLOW,
    )
    .map_err(|e| Error::Filesystem {
        path: dst.to_path_buf(),
        source: std::io::Error::from(e),
    })?;

    if record.kind != FileKind::Symlink {
        let spec = TimeSpec::new(record.mtime, 0);
        let omit = TimeSpec::new(0, libc::UTIME_OMIT as i64);
        stat::utimensat(None, dst, &omit, &spec, UtimensatFlags::NoFollowSymlink).map_err(|e| {
            Error::Filesystem {
                path: dst.to_path_buf(),
                source: std::io::Error::from(e),
            }
        })?;
    }
    Ok(())
}

/// `clone-recurse(src, dst, quick?)` (§4.C)
pub fn clone_recurse(src: &Path, dst: &Path, quick: bool, policy: &WritePolicy) -> Result<()> {
    clone(src, dst, policy)?;
    let meta = fs::symlink_metadata(src).map_err(|e| fs_err(src, e))?;
    let is_dir = meta.is_dir() || (meta.file_type().is_symlink() && src.is_dir());
    if !is_dir {
        return Ok(());
    }

    if quick
        && let (Ok(src_meta), Ok(dst_meta)) = (fs::metadata(src), fs::metadata(dst))
        && src_meta.len() == dst_meta.len()
        && src_meta.mtime() == dst_meta.mtime()
    {
        return Ok(());
    }

    for entry in fs::read_dir(src).map_err(|e| fs_err(src, e))? {
        let entry = entry.map_err(|e| fs_err(src, e))?;
        let name = entry.file_name();
        clone_recurse(&src.join(&name), &dst.join(&name), quick, policy)?;
    }
    Ok(())
}

/// `clone-from(src, dst, [files…])` (§4.C)
pub fn clone_from(src: &Path, dst: &Path, files: &[String], policy: &WritePolicy) -> Result<()> {
    for name in files {
        clone(&src.join(name), &dst.join(name), policy)?;
    }
    Ok(())
}

/// `mkdir(dst, mode=0750, owner?)` (§4.C)
pub fn mkdir(dst: &Path, mode: u32, owner: Option<(u32, u32)>, policy: &WritePolicy) -> Result<()> {
    policy.check(dst)?;
    if !dst.exists() {
        fs::create_dir_all(dst).map_err(|e| fs_err(dst, e))?;
    } else if !dst.is_dir() {
        return Err(Error::TypeMismatch {
            path: dst.to_path_buf(),
        });
    }
    fs::set_permissions(dst, fs::Permissions::from_mode(mode)).map_err(|e| fs_err(dst, e))?;
    if let Some((uid, gid)) = owner {
        chown(dst, uid, gid, policy)?;
    }
    Ok(())
}

/// `mknod(dst, c|b, major, minor?)` (§4.C). If `minor` is omitted, `major` is
/// treated as an already-packed device number.
pub fn mknod(
    dst: &Path,
    is_char: bool,
    major: u64,
    minor: Option<u64>,
    mode: u32,
    policy: &WritePolicy,
) -> Result<()> {
    policy.check(dst)?;
    let rdev = match minor {
        Some(minor) => stat::makedev(major, minor),
        None => major,
    };
    if dst.exists() {
        let existing = fs::symlink_metadata(dst).map_err(|e| fs_err(dst, e))?;
        let kind = FileKind::of(&existing).ok_or_else(|| Error::TypeMismatch {
            path: dst.to_path_buf(),
        })?;
        let expect = if is_char {
            FileKind::CharDevice
        } else {
            FileKind::BlockDevice
        };
        if kind != expect || existing.rdev() != rdev {
            return Err(Error::DeviceMismatch {
                path: dst.to_path_buf(),
            });
        }
        return Ok(());
    }
    let sflag = if is_char { SFlag::S_IFCHR } else { SFlag::S_IFBLK };
    stat::mknod(dst, sflag, Mode::from_bits_truncate(mode), rdev).map_err(|e| Error::Filesystem {
        path: dst.to_path_buf(),
        source: std::io::Error::from(e),
    })
}

/// A device node to create under `{jaildev}` (§4.G): name relative to the
/// dev directory, canonical major/minor, and the mode to create it with.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpec {
    pub name: &'static str,
    pub major: u64,
    pub minor: u64,
    pub mode: u32,
}

/// Populate `jaildev` with the curated device nodes (§4.G), skipping any
/// that already exist with matching major/minor.
pub fn populate_dev(jaildev: &Path, nodes: &[DeviceSpec], policy: &WritePolicy) -> Result<()> {
    for spec in nodes {
        let dst = jaildev.join(spec.name);
        mknod(&dst, true, spec.major, Some(spec.minor), spec.mode, policy)?;
    }
    Ok(())
}

/// `ln-s(target, link)` (§4.C)
pub fn ln_s(target: &Path, link: &Path, policy: &WritePolicy) -> Result<()> {
    policy.check(link)?;
    match fs::read_link(link) {
        Ok(existing) if existing == target => Ok(()),
        Ok(existing) => Err(Error::SymlinkMismatch {
            link: link.to_path_buf(),
            target: existing,
        }),
        Err(_) => symlink(target, link).map_err(|e| fs_err(link, e)),
    }
}

/// `chmod(path, mode)` (§4.C)
pub fn chmod(path: &Path, mode: u32, policy: &WritePolicy) -> Result<()> {
    policy.check(path)?;
    stat::fchmodat(None, path, Mode::from_bits_truncate(mode), FchmodatFlags::FollowSymlink).map_err(|e| {
        Error::Filesystem {
            path: path.to_path_buf(),
            source: std::io::Error::from(e),
        }
    })
}

/// `chown(path, uid, gid)` (§4.C)
pub fn chown(path: &Path, uid: u32, gid: u32, policy: &WritePolicy) -> Result<()> {
    policy.check(path)?;
    unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
        Error::Filesystem {
            path: path.to_path_buf(),
            source: std::io::Error::from(e),
        }
    })
}

/// `chflags(path, flags)` (§4.C) — best-effort; a filesystem that rejects the
/// ioctl (e.g. tmpfs, or a non-ext filesystem) is not a hard failure.
pub fn chflags(path: &Path, flags: FileFlags, policy: &WritePolicy) -> Result<()> {
    policy.check(path)?;
    use std::os::fd::AsRawFd;
    let file = fs::File::open(path).map_err(|e| fs_err(path, e))?;
    let bits = flags.bits();
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_SETFLAGS, &bits as *const u32) };
    if ret != 0 {
        // best-effort: platform/filesystem does not support file flags.
    }
    Ok(())
}

/// Read back best-effort file flags, mainly useful for tests.
pub fn getflags(path: &Path) -> Result<FileFlags> {
    use std::os::fd::AsRawFd;
    let file = fs::File::open(path).map_err(|e| fs_err(path, e))?;
    let mut bits: u32 = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_GETFLAGS, &mut bits as *mut u32) };
    if ret != 0 {
        return Ok(FileFlags::empty());
    }
    Ok(FileFlags::from_bits_truncate(bits))
}

/// `touch(path, stamp?)` (§4.C). `stamp` is `%Y%m%d%H%M.%S`; omitted means now.
pub fn touch(path: &Path, stamp: Option<&str>, policy: &WritePolicy) -> Result<()> {
    policy.check(path)?;
    if !path.exists() {
        fs::File::create(path).map_err(|e| fs_err(path, e))?;
    }
    let secs = match stamp {
        Some(s) => parse_touch_stamp(s)?,
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
    };
    let spec = TimeSpec::new(secs, 0);
    stat::utimensat(None, path, &spec, &spec, UtimensatFlags::FollowSymlink).map_err(|e| {
        Error::Filesystem {
            path: path.to_path_buf(),
            source: std::io::Error::from(e),
        }
    })
}

/// Parse a `%Y%m%d%H%M.%S` stamp into seconds since the epoch without pulling
/// in a datetime crate — the format is fixed-width and entirely numeric.
fn parse_touch_stamp(stamp: &str) -> Result<i64> {
    let (date_part, sec_part) = stamp.split_once('.').unwrap_or((stamp, "0"));
    if date_part.len() != 12 {
        return Err(Error::Config(format!("invalid touch stamp '{stamp}'")));
    }
    let field = |range: std::ops::Range<usize>| -> Result<i64> {
        date_part[range]
            .parse::<i64>()
            .map_err(|_| Error::Config(format!("invalid touch stamp '{stamp}'")))
    };
    let year = field(0..4)?;
    let month = field(4..6)?;
    let day = field(6..8)?;
    let hour = field(8..10)?;
    let minute = field(10..12)?;
    let second: i64 = sec_part
        .parse()
        .map_err(|_| Error::Config(format!("invalid touch stamp '{stamp}'")))?;

    Ok(days_from_civil(year, month, day) * 86_400 + hour * 3600 + minute * 60 + second)
}

/// Howard Hinnant's civil-from-days algorithm, run in reverse; avoids a
/// chrono dependency for a single fixed-format timestamp.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// `rm(path)` (§4.C)
pub fn rm(path: &Path, policy: &WritePolicy) -> Result<()> {
    policy.check(path)?;
    fs::remove_file(path).map_err(|e| fs_err(path, e))
}

/// `rmdir(path)` (§4.C) — requires the directory to be empty.
pub fn rmdir(path: &Path, policy: &WritePolicy) -> Result<()> {
    policy.check(path)?;
    fs::remove_dir(path).map_err(|e| fs_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink as unix_symlink;
    use tempfile::tempdir;

    fn permissive_policy() -> WritePolicy {
        WritePolicy::compile(".*").unwrap()
    }

    #[test]
    fn clone_regular_file_preserves_content_and_mode() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"hello jail").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();

        let policy = permissive_policy();
        clone(&src, &dst, &policy).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"hello jail");
        assert_eq!(fs::metadata(&dst).unwrap().mode() & 0o7777, 0o640);
    }

    #[test]
    fn clone_is_idempotent() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"abc").unwrap();

        let policy = permissive_policy();
        clone(&src, &dst, &policy).unwrap();
        let first = fs::metadata(&dst).unwrap();
        clone(&src, &dst, &policy).unwrap();
        let second = fs::metadata(&dst).unwrap();

        assert_eq!(first.mode(), second.mode());
        assert_eq!(fs::read(&dst).unwrap(), b"abc");
    }

    #[test]
    fn clone_symlink_preserves_target_without_following() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.txt");
        fs::write(&target, b"x").unwrap();
        let src_link = dir.path().join("link");
        unix_symlink(&target, &src_link).unwrap();
        let dst_link = dir.path().join("dst_link");

        let policy = permissive_policy();
        clone(&src_link, &dst_link, &policy).unwrap();

        assert!(fs::symlink_metadata(&dst_link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&dst_link).unwrap(), target);
    }

    #[test]
    fn clone_recurse_mirrors_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("srcdir");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        fs::write(src.join("sub/b.txt"), b"b").unwrap();
        let dst = dir.path().join("dstdir");

        let policy = permissive_policy();
        clone_recurse(&src, &dst, false, &policy).unwrap();

        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(dst.join("sub/b.txt")).unwrap(), b"b");
    }

    #[test]
    fn mkdir_is_idempotent_on_existing_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("empty");
        let policy = permissive_policy();
        mkdir(&target, 0o755, None, &policy).unwrap();
        mkdir(&target, 0o700, None, &policy).unwrap();
        assert_eq!(fs::metadata(&target).unwrap().mode() & 0o7777, 0o700);
    }

    #[test]
    fn ln_s_is_idempotent_when_target_matches() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.txt");
        fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link");
        let policy = permissive_policy();
        ln_s(&target, &link, &policy).unwrap();
        ln_s(&target, &link, &policy).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), target);
    }

    #[test]
    fn rmdir_fails_on_nonempty_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("full");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("f"), b"x").unwrap();
        let policy = permissive_policy();
        assert!(rmdir(&target, &policy).is_err());
    }

    #[test]
    fn touch_stamp_parses_known_date() {
        // 2024-01-02 03:04:05 UTC
        let secs = parse_touch_stamp("202401020304.05").unwrap();
        assert_eq!(secs, 1_704_164_645);
    }

    #[test]
    fn writes_outside_policy_are_rejected() {
        let dir = tempdir().unwrap();
        let policy = WritePolicy::compile(r"^/nowhere/").unwrap();
        let err = mkdir(&dir.path().join("x"), 0o750, None, &policy).unwrap_err();
        assert!(err.is_policy());
        assert!(!dir.path().join("x").exists());
    }
}
