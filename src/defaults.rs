//! Built-in defaults (§9 Open Question (a))
//!
//! The curated `/etc` file list and `/dev` node list ship as Rust data
//! rather than being read from a template directory on the host, so a
//! freshly built jail is reproducible across hosts that may not agree on
//! what their own `/etc`/`/dev` look like.

use crate::fileops::DeviceSpec;

/// Host-relative `/etc` files worth mirroring into every jail by default.
/// Anything not on this list is left out unless named explicitly via `add`.
pub const ETC_FILES: &[&str] = &[
    "/etc/passwd",
    "/etc/group",
    "/etc/nsswitch.conf",
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/localtime",
    "/etc/ssl/certs/ca-certificates.crt",
];

/// Device nodes created under `{jaildev}` by `populate` (§4.C), with their
/// canonical major/minor numbers on Linux.
pub const DEV_NODES: &[DeviceSpec] = &[
    DeviceSpec { name: "null", major: 1, minor: 3, mode: 0o666 },
    DeviceSpec { name: "zero", major: 1, minor: 5, mode: 0o666 },
    DeviceSpec { name: "full", major: 1, minor: 7, mode: 0o666 },
    DeviceSpec { name: "random", major: 1, minor: 8, mode: 0o666 },
    DeviceSpec { name: "urandom", major: 1, minor: 9, mode: 0o666 },
    DeviceSpec { name: "tty", major: 5, minor: 0, mode: 0o666 },
];

/// Shared objects NSS dlopens at runtime to resolve hostnames, never visible
/// to a static dependency scan (§4.D). Resolved at config-load time against
/// whatever the host's actual library directory layout is; these are the
/// canonical basenames to search for.
pub const DNS_LIBRARY_NAMES: &[&str] = &[
    "libnss_dns.so.2",
    "libnss_files.so.2",
    "libresolv.so.2",
];

/// Render the curated `/etc` list as the `{etc_text}` property value: one
/// path per line, for inclusion in generated documentation or `--test`
/// transcripts.
pub fn etc_text() -> String {
    ETC_FILES.join("\n")
}

/// Render the built-in defaults as the `{defaults_text}` property value.
pub fn defaults_text() -> String {
    let mut lines = vec!["# /etc files".to_string()];
    lines.extend(ETC_FILES.iter().map(|s| s.to_string()));
    lines.push(String::new());
    lines.push("# /dev nodes".to_string());
    lines.extend(
        DEV_NODES
            .iter()
            .map(|d| format!("{} {}:{} {:o}", d.name, d.major, d.minor, d.mode)),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etc_text_lists_every_curated_file() {
        let text = etc_text();
        for path in ETC_FILES {
            assert!(text.contains(path));
        }
    }

    #[test]
    fn defaults_text_includes_dev_nodes() {
        let text = defaults_text();
        assert!(text.contains("null 1:3"));
        assert!(text.contains("urandom 1:9"));
    }
}
