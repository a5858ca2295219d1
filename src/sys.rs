//! Privilege detection for commands run with sudo.

use nix::unistd::{geteuid, Uid, User};
use std::path::PathBuf;

/// The user who invoked sudo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SudoContext {
    pub uid: u32,
    /// Home directory of `uid`, `None` when it has no passwd entry.
    pub home: Option<PathBuf>,
}

/// Detect a process running as root through sudo.
///
/// Returns `None` when the effective uid is not 0 or when `SUDO_UID` is
/// not set or not a number.
pub fn detect_sudo_context() -> Option<SudoContext> {
    if !geteuid().is_root() {
        return None;
    }
    let uid = parse_sudo_uid(std::env::var("SUDO_UID").ok().as_deref())?;
    let home = User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.dir);
    Some(SudoContext { uid, home })
}

fn parse_sudo_uid(value: Option<&str>) -> Option<u32> {
    value?.trim().parse().ok()
}

/// The `sudo` prefix running a command as `uid`.
pub fn sudo_prefix(uid: u32) -> [String; 3] {
    ["sudo".to_string(), "--user".to_string(), format!("#{}", uid)]
}
