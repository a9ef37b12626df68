//! Step verbs (§9 design note: "tagged union rather than method dispatch")
//!
//! Each verb carries a typed, still-templated payload — the property
//! namespace hasn't run over the strings yet, since §4.H expands arguments
//! at the moment a step runs, not when it's queued.

/// One imperative unit enqueued by the front-end (§2, §9).
#[derive(Debug, Clone)]
pub enum Step {
    Mkdir {
        dst: String,
        mode: u32,
        owner: Option<(String, String)>,
    },
    Mknod {
        dst: String,
        is_char: bool,
        major: u64,
        minor: Option<u64>,
        mode: u32,
    },
    LnS {
        target: String,
        link: String,
    },
    Chmod {
        path: String,
        mode: u32,
    },
    Chown {
        path: String,
        uid: String,
        gid: String,
    },
    Chflags {
        path: String,
        flags: u32,
    },
    Touch {
        path: String,
        stamp: Option<String>,
    },
    Rm {
        path: String,
    },
    Rmdir {
        path: String,
    },
    Clone {
        src: String,
        dst: String,
    },
    CloneRecurse {
        src: String,
        dst: String,
        quick: bool,
    },
    CloneFrom {
        src: String,
        dst: String,
        files: Vec<String>,
    },
    Add {
        paths: Vec<String>,
    },
    AddFrom {
        srcdir: String,
        files: Vec<String>,
    },
    AddRecurse {
        paths: Vec<String>,
        quick: bool,
    },
    Bind {
        srcpath: String,
        bindopts: Option<Vec<String>>,
        path: String,
    },
    Mount,
    Umount {
        lazy: bool,
    },
    Passwd,
    Etc,
    Dev,
    Tmp,
    Defaults,
    Clean,
    Remove,
    Print {
        template: String,
    },
    Execute {
        program: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        chdir: Option<String>,
        umask: Option<u32>,
    },
    /// `--try` applies only to the step immediately following it (§4.H, §8
    /// property 9); the sequencer consumes this marker and sets a one-shot
    /// flag rather than threading it through every other variant.
    Try,
}

impl Step {
    /// Name used for `[name] …` log prefixes (§7 "Logging idiom") and for
    /// `--test` transcript tagging.
    pub fn tag(&self) -> &'static str {
        match self {
            Step::Mkdir { .. } => "mkdir",
            Step::Mknod { .. } => "mknod",
            Step::LnS { .. } => "ln-s",
            Step::Chmod { .. } => "chmod",
            Step::Chown { .. } => "chown",
            Step::Chflags { .. } => "chflags",
            Step::Touch { .. } => "touch",
            Step::Rm { .. } => "rm",
            Step::Rmdir { .. } => "rmdir",
            Step::Clone { .. } => "clone",
            Step::CloneRecurse { .. } => "clone-recurse",
            Step::CloneFrom { .. } => "clone-from",
            Step::Add { .. } => "add",
            Step::AddFrom { .. } => "add-from",
            Step::AddRecurse { .. } => "add-recurse",
            Step::Bind { .. } => "bind",
            Step::Mount => "mount",
            Step::Umount { .. } => "umount",
            Step::Passwd => "passwd",
            Step::Etc => "etc",
            Step::Dev => "dev",
            Step::Tmp => "tmp",
            Step::Defaults => "defaults",
            Step::Clean => "clean",
            Step::Remove => "remove",
            Step::Print { .. } => "print",
            Step::Execute { .. } => "execute",
            Step::Try => "try",
        }
    }
}
