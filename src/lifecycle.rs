//! Jail lifecycle state (§4.K)
//!
//! A small explicit state machine, `Unbuilt -> Populated -> Mounted`, built
//! with the same `state_machine!` macro the rest of this codebase uses for
//! event-driven lifecycles. It is advisory bookkeeping for a single run: a
//! fresh process reconstructs its starting state by probing `jailpriv` and
//! the host mount table (§4.K, §6 "state is the filesystem") rather than
//! reading anything persisted.

use std::path::Path;

use state_machines::state_machine;

state_machine! {
    name: JailLifecycleMachine,
    dynamic: true,
    initial: Unbuilt,
    states: [Unbuilt, Populated, Mounted],
    events {
        populate {
            transition: { from: [Unbuilt, Populated], to: Populated }
        }
        mount {
            transition: { from: [Populated, Mounted], to: Mounted }
        }
        umount {
            transition: { from: [Mounted, Populated], to: Populated }
        }
        remove {
            transition: { from: [Unbuilt, Populated, Mounted], to: Unbuilt }
        }
    }
}

/// Coarse lifecycle stage as reported to callers, independent of the
/// macro-generated state-name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unbuilt,
    Populated,
    Mounted,
}

impl Stage {
    fn from_str(s: &str) -> Self {
        match s {
            "Populated" => Stage::Populated,
            "Mounted" => Stage::Mounted,
            _ => Stage::Unbuilt,
        }
    }
}

/// Wraps the generated dynamic machine with the probing and no-op-on-repeat
/// behavior §4.K requires (`--mount` against an already-Mounted jail is a
/// no-op, not an error; likewise `--umount`).
pub struct JailLifecycle {
    machine: DynamicJailLifecycleMachine<()>,
}

impl JailLifecycle {
    /// Probe `jailpriv` and the host mount table to reconstruct the stage a
    /// previous run (or a hand-built jail) left behind, then drive the
    /// machine to match.
    pub fn probe(jailpriv: &Path, jailmount: &Path) -> Self {
        let stage = probe_stage(jailpriv, jailmount);
        let mut machine = JailLifecycleMachine::new(()).into_dynamic();
        match stage {
            Stage::Unbuilt => {}
            Stage::Populated => {
                let _ = machine.handle(JailLifecycleMachineEvent::Populate);
            }
            Stage::Mounted => {
                let _ = machine.handle(JailLifecycleMachineEvent::Populate);
                let _ = machine.handle(JailLifecycleMachineEvent::Mount);
            }
        }
        Self { machine }
    }

    pub fn stage(&self) -> Stage {
        Stage::from_str(self.machine.current_state())
    }

    /// Any mutating step (mkdir, clone, add, …) marks the jail Populated.
    pub fn populate(&mut self) {
        if self.stage() == Stage::Unbuilt {
            let _ = self.machine.handle(JailLifecycleMachineEvent::Populate);
        }
    }

    /// `--mount`: no-op if already Mounted.
    pub fn mount(&mut self) {
        if self.stage() != Stage::Mounted {
            self.populate();
            let _ = self.machine.handle(JailLifecycleMachineEvent::Mount);
        }
    }

    /// `--umount`: no-op if already at or below Populated.
    pub fn umount(&mut self) {
        if self.stage() == Stage::Mounted {
            let _ = self.machine.handle(JailLifecycleMachineEvent::Umount);
        }
    }

    /// `--remove`: always returns to Unbuilt.
    pub fn remove(&mut self) {
        let _ = self.machine.handle(JailLifecycleMachineEvent::Remove);
    }
}

/// Re-derive a lifecycle stage from disk: Unbuilt if `jailpriv` doesn't
/// exist or is empty, Mounted if `jailmount` appears live in
/// `/proc/self/mountinfo`, else Populated.
fn probe_stage(jailpriv: &Path, jailmount: &Path) -> Stage {
    let populated = std::fs::read_dir(jailpriv)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if !populated {
        return Stage::Unbuilt;
    }
    if is_mounted(jailmount) {
        Stage::Mounted
    } else {
        Stage::Populated
    }
}

fn is_mounted(jailmount: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|mp| Path::new(mp) == jailmount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn probe_reports_unbuilt_for_missing_jailpriv() {
        let dir = tempdir().unwrap();
        let jailpriv = dir.path().join("nope");
        let lifecycle = JailLifecycle::probe(&jailpriv, Path::new("/nonexistent-mount"));
        assert_eq!(lifecycle.stage(), Stage::Unbuilt);
    }

    #[test]
    fn probe_reports_populated_for_nonempty_jailpriv() {
        let dir = tempdir().unwrap();
        let jailpriv = dir.path().join("home");
        std::fs::create_dir_all(&jailpriv).unwrap();
        std::fs::write(jailpriv.join("marker"), b"x").unwrap();
        let lifecycle = JailLifecycle::probe(&jailpriv, Path::new("/nonexistent-mount"));
        assert_eq!(lifecycle.stage(), Stage::Populated);
    }

    #[test]
    fn mount_against_already_mounted_is_a_no_op() {
        let dir = tempdir().unwrap();
        let jailpriv = dir.path().join("home");
        std::fs::create_dir_all(&jailpriv).unwrap();
        let mut lifecycle = JailLifecycle::probe(&jailpriv, Path::new("/nonexistent-mount"));
        lifecycle.mount();
        assert_eq!(lifecycle.stage(), Stage::Mounted);
        lifecycle.mount();
        assert_eq!(lifecycle.stage(), Stage::Mounted);
    }

    #[test]
    fn remove_returns_to_unbuilt_from_any_stage() {
        let dir = tempdir().unwrap();
        let jailpriv = dir.path().join("home");
        std::fs::create_dir_all(&jailpriv).unwrap();
        let mut lifecycle = JailLifecycle::probe(&jailpriv, Path::new("/nonexistent-mount"));
        lifecycle.mount();
        lifecycle.remove();
        assert_eq!(lifecycle.stage(), Stage::Unbuilt);
    }
}
