//! jailcraft - chroot jail builder and executor
//!
//! Wires the front-end parser (`cli`) to the configuration loader
//! (`config`), assembles the property namespace and collaborators a jail
//! run needs, and hands the resulting step list to the `sequencer`.

mod addengine;
mod cli;
mod config;
mod defaults;
mod error;
mod executor;
mod fileops;
mod lifecycle;
mod mount;
mod policy;
mod properties;
mod resolver;
mod sequencer;
mod step;

use cli::{Overrides, ParseOutcome};
use config::Config;
use error::Result;
use policy::{validate_name, WritePolicy};
use properties::{names, Properties};
use resolver::{Collaborator, Resolver};
use sequencer::Sequencer;
use std::path::{Path, PathBuf};

/// Library directories searched for the DNS resolution libraries `--dns`
/// asks to be added alongside every `add`/`add-recurse` (§4.D, §4.G).
const LIB_SEARCH_DIRS: &[&str] = &[
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib64",
    "/usr/lib64",
    "/lib",
    "/usr/lib",
];

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("jail: {e}");
            std::process::exit(1);
        }
    }
}

fn run(args: &[String]) -> Result<i32> {
    let invocation = match cli::parse(args) {
        Ok(ParseOutcome::Help) => {
            print!("{}", cli::USAGE);
            return Ok(0);
        }
        Ok(ParseOutcome::Invocation(inv)) => inv,
        Err(e) => {
            eprintln!("jail: {e}");
            eprintln!();
            eprint!("{}", cli::USAGE);
            return Ok(2);
        }
    };

    let config = Config::load(invocation.overrides.config.as_deref())?;
    let username_regex = invocation
        .overrides
        .username_regex
        .clone()
        .unwrap_or_else(|| config.username_regex.clone());
    validate_name(&invocation.user, &username_regex)?;
    validate_name(&invocation.group, &username_regex)?;

    let props = build_properties(&invocation.user, &invocation.group, &config, &invocation.overrides)?;
    let writepath = invocation
        .overrides
        .writepath
        .clone()
        .unwrap_or_else(|| config.writepath.clone());
    let policy = WritePolicy::compile(&writepath)?;
    let resolver = build_resolver(&config, &invocation.overrides)?;
    let dns_libs = if invocation.overrides.dns { locate_dns_libs() } else { Vec::new() };

    let mut sequencer = Sequencer::new(props, policy, resolver, dns_libs, invocation.run_options)?;
    sequencer.run(&invocation.steps)?;
    Ok(0)
}

/// Populate the canonical property namespace (§3) from the jail identity,
/// layered configuration, and CLI overrides.
fn build_properties(
    user: &str,
    group: &str,
    config: &Config,
    overrides: &Overrides,
) -> Result<Properties> {
    let jailbase = overrides.jailbase.clone().unwrap_or_else(|| config.jailbase.clone());
    let jailpriv = format!("{jailbase}/{user}");
    let jailhome = format!("{jailpriv}/home");
    let jailmount = format!("{jailpriv}/mnt");
    let jaildev = format!("{jailhome}/dev");
    let jailtmp = format!("{jailhome}/tmp");
    let userhome = format!("/home/{user}");
    let writepath = overrides.writepath.clone().unwrap_or_else(|| config.writepath.clone());
    let (uid, gid) = resolve_identity(user, group);

    let mut props = Properties::new();
    props.set(names::USER, user);
    props.set(names::GROUP, group);
    props.set(names::UID, uid.to_string());
    props.set(names::GID, gid.to_string());
    props.set(names::JAILBASE, jailbase);
    props.set(names::JAILPRIV, jailpriv);
    props.set(names::JAILHOME, jailhome);
    props.set(names::JAILMOUNT, jailmount);
    props.set(names::JAILDEV, jaildev);
    props.set(names::JAILTMP, jailtmp);
    props.set(names::USERHOME, userhome);
    props.set(names::WRITEPATH, writepath);
    props.set(names::DEFAULTS_TEXT, defaults::defaults_text());
    props.set(names::ETC_TEXT, defaults::etc_text());
    Ok(props)
}

/// `uid`/`gid` are looked up on the host when the name resolves there, and
/// fall back to 1000 for a jail account that doesn't exist yet (§3: a
/// jail's accounts are usually new, host-local ones created purely for this
/// jail's `passwd`/`group` files).
fn resolve_identity(user: &str, group: &str) -> (u32, u32) {
    let uid = match nix::unistd::User::from_name(user) {
        Ok(Some(u)) => u.uid.as_raw(),
        _ => 1000,
    };
    let gid = match nix::unistd::Group::from_name(group) {
        Ok(Some(g)) => g.gid.as_raw(),
        _ => 1000,
    };
    (uid, gid)
}

fn build_resolver(config: &Config, overrides: &Overrides) -> Result<Resolver> {
    let ldconfig_cmd = overrides.ldconfig_cmd.clone().unwrap_or_else(|| config.ldconfig_cmd.clone());
    let ldconfig_rx = overrides.ldconfig_rx.clone().unwrap_or_else(|| config.ldconfig_rx.clone());
    let ldlist_cmd = overrides.ldlist_cmd.clone().unwrap_or_else(|| config.ldlist_cmd.clone());
    let ldlist_rx = overrides.ldlist_rx.clone().unwrap_or_else(|| config.ldlist_rx.clone());
    let ldconfig = Collaborator::compile(&ldconfig_cmd, &ldconfig_rx)?;
    let ldlist = Collaborator::compile(&ldlist_cmd, &ldlist_rx)?;
    Ok(Resolver::new(ldconfig, ldlist))
}

/// Resolve the curated DNS library basenames (§4.D, §4.G) against the
/// host's actual library directory layout. Best-effort: a name with no
/// match on this host is silently skipped rather than treated as an error,
/// since not every host resolves names the same way.
fn locate_dns_libs() -> Vec<PathBuf> {
    let mut found = Vec::new();
    for name in defaults::DNS_LIBRARY_NAMES {
        for dir in LIB_SEARCH_DIRS {
            let candidate = Path::new(dir).join(name);
            if candidate.exists() {
                found.push(candidate);
                break;
            }
        }
    }
    found
}
