//! Front-end (§4.L, non-normative)
//!
//! A small argv walker: turns `jail [options] user[:group] [commands…]`
//! into a username/group pair, a set of option overrides, and an ordered
//! [`Step`] list. The spec treats this layer as an external collaborator
//! ("described only as the interface it feeds the sequencer") — there's no
//! subcommand framework here because the step flags take anywhere from
//! zero to a variable number of positional arguments, which doesn't map
//! cleanly onto a derive-macro CLI. Help rendering is likewise out of scope;
//! `--help` prints a short usage line and exits.

use crate::sequencer::RunOptions;
use crate::step::Step;
use std::path::PathBuf;

pub const USAGE: &str = "usage: jail [options] user[:group] [commands...]

options:
  --config <path>           tool-wide TOML settings file (default probes /etc/jail.toml)
  --jailbase <path>         root of all jails on this host
  --writepath <regex>       allowlist for mutable host paths
  --username-regex <regex>  allowlist for jail account names
  --ldconfig-cmd <cmd>      loader-discovery command template
  --ldconfig-rx <regex>     loader-discovery output pattern
  --ldlist-cmd <cmd>        dependency-listing command template ({ldlinux_so}, {path})
  --ldlist-rx <regex>       dependency-listing output pattern
  --dns                     inject DNS resolution libraries into every add
  -t, --test                print shell-equivalents instead of executing
  -v, --verbose             print shell-equivalents before executing
  -h, --help                show this message

commands (enqueued in the order given):
  --mkdir <dst> <mode> [owner]
  --mknod <dst> c|b <major> <minor|-> <mode>
  --ln-s <target> <link>
  --chmod <path> <mode>
  --chown <path> <uid> <gid>
  --chflags <path> <flags>
  --touch <path> [stamp]
  --rm <path>
  --rmdir <path>
  --clone <src> <dst>
  --quick --clone-recurse <src> <dst>
  --clone-from <srcdir> <dst> <file1,file2,...>
  --add <path...>
  --add-from <srcdir> <file1,file2,...>
  --quick --add-recurse <path...>
  --bind <srcpath> <bindopts|auto> [path]
  --mount
  --umount [lazy]
  --passwd
  --etc
  --dev
  --tmp
  -d, --defaults
  --clean
  --remove
  --print <template>
  --try
  --execute|-- [--chdir <dir>] [--umask <mode>] [NAME=VALUE...] <program> [args...]
";

/// Option overrides collected from the command line (priority 3 of §4.J,
/// layered over the config file and built-in defaults).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub jailbase: Option<String>,
    pub writepath: Option<String>,
    pub username_regex: Option<String>,
    pub ldconfig_cmd: Option<String>,
    pub ldconfig_rx: Option<String>,
    pub ldlist_cmd: Option<String>,
    pub ldlist_rx: Option<String>,
    pub dns: bool,
}

/// The fully parsed invocation: jail identity, run flags, option overrides,
/// and the step list to execute.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub user: String,
    pub group: String,
    pub overrides: Overrides,
    pub run_options: RunOptions,
    pub steps: Vec<Step>,
}

#[derive(Debug)]
pub enum ParseOutcome {
    Help,
    Invocation(Invocation),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("missing jail user argument")]
    MissingUser,
    #[error("unknown flag '{0}'")]
    UnknownFlag(String),
    #[error("flag '{flag}' expects {expected} argument(s)")]
    MissingArgs { flag: String, expected: usize },
    #[error("invalid value '{value}' for '{flag}'")]
    InvalidValue { flag: String, value: String },
}

/// Parse a full argv (excluding argv[0]).
pub fn parse(args: &[String]) -> Result<ParseOutcome, ParseError> {
    let mut overrides = Overrides::default();
    let mut run_options = RunOptions::default();
    let mut user_group: Option<(String, String)> = None;
    let mut steps = Vec::new();
    let mut pending_quick = false;

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        match arg.as_str() {
            "-h" | "--help" => return Ok(ParseOutcome::Help),
            "-t" | "--test" => {
                run_options.test = true;
                i += 1;
            }
            "-v" | "--verbose" => {
                run_options.verbose = true;
                i += 1;
            }
            "--dns" => {
                overrides.dns = true;
                i += 1;
            }
            "--quick" => {
                pending_quick = true;
                i += 1;
            }
            "--config" => {
                i += 1;
                overrides.config = Some(PathBuf::from(take(args, &mut i, arg)?));
            }
            "--jailbase" => {
                i += 1;
                overrides.jailbase = Some(take(args, &mut i, arg)?);
            }
            "--writepath" => {
                i += 1;
                overrides.writepath = Some(take(args, &mut i, arg)?);
            }
            "--username-regex" => {
                i += 1;
                overrides.username_regex = Some(take(args, &mut i, arg)?);
            }
            "--ldconfig-cmd" => {
                i += 1;
                overrides.ldconfig_cmd = Some(take(args, &mut i, arg)?);
            }
            "--ldconfig-rx" => {
                i += 1;
                overrides.ldconfig_rx = Some(take(args, &mut i, arg)?);
            }
            "--ldlist-cmd" => {
                i += 1;
                overrides.ldlist_cmd = Some(take(args, &mut i, arg)?);
            }
            "--ldlist-rx" => {
                i += 1;
                overrides.ldlist_rx = Some(take(args, &mut i, arg)?);
            }
            "-d" | "--defaults" => {
                steps.push(Step::Defaults);
                i += 1;
            }
            "--mkdir" => {
                i += 1;
                let dst = take(args, &mut i, arg)?;
                let mode = parse_mode(&take(args, &mut i, "--mkdir")?, "--mkdir")?;
                let owner = peek_owner(args, &mut i);
                steps.push(Step::Mkdir { dst, mode, owner });
            }
            "--mknod" => {
                i += 1;
                let dst = take(args, &mut i, arg)?;
                let kind = take(args, &mut i, "--mknod")?;
                let is_char = match kind.as_str() {
                    "c" => true,
                    "b" => false,
                    _ => {
                        return Err(ParseError::InvalidValue { flag: "--mknod".into(), value: kind })
                    }
                };
                let major = parse_u64(&take(args, &mut i, "--mknod")?, "--mknod")?;
                let minor_tok = take(args, &mut i, "--mknod")?;
                let minor = if minor_tok == "-" { None } else { Some(parse_u64(&minor_tok, "--mknod")?) };
                let mode = parse_mode(&take(args, &mut i, "--mknod")?, "--mknod")?;
                steps.push(Step::Mknod { dst, is_char, major, minor, mode });
            }
            "--ln-s" => {
                i += 1;
                let target = take(args, &mut i, arg)?;
                let link = take(args, &mut i, "--ln-s")?;
                steps.push(Step::LnS { target, link });
            }
            "--chmod" => {
                i += 1;
                let path = take(args, &mut i, arg)?;
                let mode = parse_mode(&take(args, &mut i, "--chmod")?, "--chmod")?;
                steps.push(Step::Chmod { path, mode });
            }
            "--chown" => {
                i += 1;
                let path = take(args, &mut i, arg)?;
                let uid = take(args, &mut i, "--chown")?;
                let gid = take(args, &mut i, "--chown")?;
                steps.push(Step::Chown { path, uid, gid });
            }
            "--chflags" => {
                i += 1;
                let path = take(args, &mut i, arg)?;
                let flags = parse_u64(&take(args, &mut i, "--chflags")?, "--chflags")? as u32;
                steps.push(Step::Chflags { path, flags });
            }
            "--touch" => {
                i += 1;
                let path = take(args, &mut i, arg)?;
                let stamp = peek_non_flag(args, &mut i);
                steps.push(Step::Touch { path, stamp });
            }
            "--rm" => {
                i += 1;
                let path = take(args, &mut i, arg)?;
                steps.push(Step::Rm { path });
            }
            "--rmdir" => {
                i += 1;
                let path = take(args, &mut i, arg)?;
                steps.push(Step::Rmdir { path });
            }
            "--clone" => {
                i += 1;
                let src = take(args, &mut i, arg)?;
                let dst = take(args, &mut i, "--clone")?;
                steps.push(Step::Clone { src, dst });
            }
            "--clone-recurse" => {
                i += 1;
                let src = take(args, &mut i, arg)?;
                let dst = take(args, &mut i, "--clone-recurse")?;
                steps.push(Step::CloneRecurse { src, dst, quick: std::mem::take(&mut pending_quick) });
            }
            "--clone-from" => {
                i += 1;
                let src = take(args, &mut i, arg)?;
                let dst = take(args, &mut i, "--clone-from")?;
                let files = take(args, &mut i, "--clone-from")?
                    .split(',')
                    .map(str::to_string)
                    .collect();
                steps.push(Step::CloneFrom { src, dst, files });
            }
            "--add" => {
                i += 1;
                let paths = take_rest_positional(args, &mut i);
                steps.push(Step::Add { paths });
            }
            "--add-from" => {
                i += 1;
                let srcdir = take(args, &mut i, arg)?;
                let files = take(args, &mut i, "--add-from")?
                    .split(',')
                    .map(str::to_string)
                    .collect();
                steps.push(Step::AddFrom { srcdir, files });
            }
            "--add-recurse" => {
                i += 1;
                let paths = take_rest_positional(args, &mut i);
                steps.push(Step::AddRecurse { paths, quick: std::mem::take(&mut pending_quick) });
            }
            "--bind" => {
                i += 1;
                let srcpath = take(args, &mut i, arg)?;
                let second = take(args, &mut i, "--bind")?;
                let maybe_path = peek_non_flag(args, &mut i);
                let (bindopts, path) = match maybe_path {
                    Some(explicit_path) => (parse_bindopts(&second), explicit_path),
                    None => (parse_bindopts(&second), srcpath.trim_start_matches('/').to_string()),
                };
                steps.push(Step::Bind { srcpath, bindopts, path });
            }
            "--mount" => {
                steps.push(Step::Mount);
                i += 1;
            }
            "--umount" => {
                i += 1;
                let lazy = peek_non_flag(args, &mut i).map(|t| t == "lazy").unwrap_or(false);
                steps.push(Step::Umount { lazy });
            }
            "--passwd" => {
                steps.push(Step::Passwd);
                i += 1;
            }
            "--etc" => {
                steps.push(Step::Etc);
                i += 1;
            }
            "--dev" => {
                steps.push(Step::Dev);
                i += 1;
            }
            "--tmp" => {
                steps.push(Step::Tmp);
                i += 1;
            }
            "--clean" => {
                steps.push(Step::Clean);
                i += 1;
            }
            "--remove" => {
                steps.push(Step::Remove);
                i += 1;
            }
            "--print" => {
                i += 1;
                let template = take(args, &mut i, arg)?;
                steps.push(Step::Print { template });
            }
            "--try" => {
                steps.push(Step::Try);
                i += 1;
            }
            "--execute" | "--" => {
                i += 1;
                steps.push(parse_execute(args, &mut i)?);
            }
            _ if user_group.is_none() && !arg.starts_with('-') => {
                user_group = Some(split_user_group(arg));
                i += 1;
            }
            _ => return Err(ParseError::UnknownFlag(arg.clone())),
        }
    }

    let (user, group) = user_group.ok_or(ParseError::MissingUser)?;
    Ok(ParseOutcome::Invocation(Invocation {
        user,
        group,
        overrides,
        run_options,
        steps,
    }))
}

fn split_user_group(token: &str) -> (String, String) {
    match token.split_once(':') {
        Some((u, g)) => (u.to_string(), g.to_string()),
        None => (token.to_string(), token.to_string()),
    }
}

/// Read the value `i` currently points at and advance past it. Callers are
/// responsible for having already advanced `i` past the flag token itself;
/// consecutive calls read consecutive positional values for the same flag.
fn take(args: &[String], i: &mut usize, flag: &str) -> Result<String, ParseError> {
    let value = args
        .get(*i)
        .cloned()
        .ok_or_else(|| ParseError::MissingArgs { flag: flag.to_string(), expected: 1 })?;
    *i += 1;
    Ok(value)
}

/// Consume a trailing `user:group`-shaped owner token if present, without
/// swallowing the next flag.
fn peek_owner(args: &[String], i: &mut usize) -> Option<(String, String)> {
    let tok = args.get(*i)?;
    if tok.starts_with('-') || !tok.contains(':') {
        return None;
    }
    *i += 1;
    let (u, g) = tok.split_once(':').unwrap();
    Some((u.to_string(), g.to_string()))
}

fn peek_non_flag(args: &[String], i: &mut usize) -> Option<String> {
    let tok = args.get(*i)?;
    if tok.starts_with('-') {
        return None;
    }
    *i += 1;
    Some(tok.clone())
}

/// Consume positional tokens up to (not including) the next `--flag`.
fn take_rest_positional(args: &[String], i: &mut usize) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(tok) = args.get(*i) {
        if tok.starts_with("--") {
            break;
        }
        out.push(tok.clone());
        *i += 1;
    }
    out
}

fn parse_mode(token: &str, flag: &str) -> Result<u32, ParseError> {
    u32::from_str_radix(token, 8).map_err(|_| ParseError::InvalidValue {
        flag: flag.to_string(),
        value: token.to_string(),
    })
}

fn parse_u64(token: &str, flag: &str) -> Result<u64, ParseError> {
    token.parse::<u64>().map_err(|_| ParseError::InvalidValue {
        flag: flag.to_string(),
        value: token.to_string(),
    })
}

fn parse_bindopts(token: &str) -> Option<Vec<String>> {
    if token == "auto" {
        None
    } else {
        Some(token.split(',').map(str::to_string).collect())
    }
}

fn parse_execute(args: &[String], i: &mut usize) -> Result<Step, ParseError> {
    let mut chdir = None;
    let mut umask = None;
    let mut env = Vec::new();

    loop {
        match args.get(*i).map(String::as_str) {
            Some("--chdir") => {
                *i += 1;
                chdir = Some(take(args, i, "--chdir")?);
            }
            Some("--umask") => {
                *i += 1;
                umask = Some(parse_mode(&take(args, i, "--umask")?, "--umask")?);
            }
            Some(tok) if tok.contains('=') && !tok.starts_with('-') => {
                let (k, v) = tok.split_once('=').unwrap();
                env.push((k.to_string(), v.to_string()));
                *i += 1;
            }
            _ => break,
        }
    }

    let program = args
        .get(*i)
        .cloned()
        .ok_or_else(|| ParseError::MissingArgs { flag: "--execute".to_string(), expected: 1 })?;
    *i += 1;
    let rest_args = args[*i..].to_vec();
    *i = args.len();

    Ok(Step::Execute { program, args: rest_args, env, chdir, umask })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(argv: &[&str]) -> Invocation {
        let args: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        match parse(&args).unwrap() {
            ParseOutcome::Invocation(inv) => inv,
            ParseOutcome::Help => panic!("expected invocation"),
        }
    }

    #[test]
    fn parses_user_and_group() {
        let inv = parse_ok(&["alice:staff", "--mount"]);
        assert_eq!(inv.user, "alice");
        assert_eq!(inv.group, "staff");
        assert!(matches!(inv.steps.as_slice(), [Step::Mount]));
    }

    #[test]
    fn bare_user_defaults_group_to_same_name() {
        let inv = parse_ok(&["alice", "--mount"]);
        assert_eq!(inv.group, "alice");
    }

    #[test]
    fn mkdir_with_octal_mode_and_owner() {
        let inv = parse_ok(&["alice", "--mkdir", "/var/empty", "0755", "alice:alice"]);
        match &inv.steps[0] {
            Step::Mkdir { dst, mode, owner } => {
                assert_eq!(dst, "/var/empty");
                assert_eq!(*mode, 0o755);
                assert_eq!(owner.as_ref().unwrap().0, "alice");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn add_consumes_multiple_paths_until_next_flag() {
        let inv = parse_ok(&["alice", "--add", "/bin/ls", "/bin/true", "--mount"]);
        assert_eq!(inv.steps.len(), 2);
        match &inv.steps[0] {
            Step::Add { paths } => assert_eq!(paths.len(), 2),
            other => panic!("unexpected step: {other:?}"),
        }
        assert!(matches!(inv.steps[1], Step::Mount));
    }

    #[test]
    fn quick_flag_applies_to_following_recurse_step() {
        let inv = parse_ok(&["alice", "--quick", "--clone-recurse", "/usr/lib", "/usr/lib"]);
        match &inv.steps[0] {
            Step::CloneRecurse { quick, .. } => assert!(*quick),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn execute_collects_env_pairs_and_trailing_args() {
        let inv = parse_ok(&["alice", "--execute", "FOO=bar", "./run", "one", "two"]);
        match &inv.steps[0] {
            Step::Execute { program, args, env, .. } => {
                assert_eq!(program, "./run");
                assert_eq!(args, &vec!["one".to_string(), "two".to_string()]);
                assert_eq!(env, &vec![("FOO".to_string(), "bar".to_string())]);
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn double_dash_is_a_synonym_for_execute() {
        let inv = parse_ok(&["alice", "--", "./run"]);
        assert!(matches!(inv.steps[0], Step::Execute { .. }));
    }

    #[test]
    fn missing_user_is_an_error() {
        let args: Vec<String> = vec!["--mount".to_string()];
        assert!(matches!(parse(&args), Err(ParseError::MissingUser)));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let args: Vec<String> = vec!["alice".to_string(), "--nope".to_string()];
        assert!(matches!(parse(&args), Err(ParseError::UnknownFlag(_))));
    }

    #[test]
    fn help_flag_short_circuits() {
        let args: Vec<String> = vec!["-h".to_string()];
        assert!(matches!(parse(&args), Ok(ParseOutcome::Help)));
    }

    #[test]
    fn bind_with_two_args_mirrors_srcpath_for_mount_point() {
        let inv = parse_ok(&["alice", "--bind", "/run/shm", "rw"]);
        match &inv.steps[0] {
            Step::Bind { srcpath, bindopts, path } => {
                assert_eq!(srcpath, "/run/shm");
                assert_eq!(bindopts.as_ref().unwrap(), &vec!["rw".to_string()]);
                assert_eq!(path, "run/shm");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }
}
