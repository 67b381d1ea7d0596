//! Running programs as another OS user.
//!
//! The drop happens in the forked child right before `exec`, so everything
//! here that runs there must stay async-signal-safe: no allocation, no locks.

use std::path::PathBuf;

use crate::error::RunError;

/// Identity a program is started under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpec {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl UserSpec {
    /// Environment a login for this user would see.
    pub fn login_env(&self) -> Vec<(String, String)> {
        vec![
            ("USER".to_string(), self.name.clone()),
            ("LOGNAME".to_string(), self.name.clone()),
            ("HOME".to_string(), self.home.display().to_string()),
            ("SHELL".to_string(), self.shell.display().to_string()),
            (
                "XDG_RUNTIME_DIR".to_string(),
                format!("/run/user/{}", self.uid),
            ),
        ]
    }
}

#[cfg(unix)]
mod imp {
    use std::ffi::CString;
    use std::io;

    use nix::unistd::{Gid, Uid, User};

    use super::UserSpec;
    use crate::error::RunError;

    pub fn resolve_user(name: &str) -> Result<UserSpec, RunError> {
        let user = User::from_name(name)?.ok_or_else(|| RunError::UnknownUser(name.to_string()))?;
        let groups = supplementary_groups(&user.name, user.gid);
        Ok(UserSpec {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            groups,
            home: user.dir,
            shell: user.shell,
        })
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn supplementary_groups(name: &str, gid: Gid) -> Vec<u32> {
        let Ok(cname) = CString::new(name) else {
            return vec![gid.as_raw()];
        };
        match nix::unistd::getgrouplist(&cname, gid) {
            Ok(groups) => groups.into_iter().map(Gid::as_raw).collect(),
            Err(e) => {
                tracing::debug!(user = name, error = %e, "getgrouplist failed");
                vec![gid.as_raw()]
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn supplementary_groups(name: &str, gid: Gid) -> Vec<u32> {
        let _ = CString::new(name);
        vec![gid.as_raw()]
    }

    pub fn is_current(user: &UserSpec) -> bool {
        Uid::current().as_raw() == user.uid
    }

    /// Start a new session (and process group) for the child. With a PTY on
    /// stdin, make it the controlling terminal.
    pub fn enter_new_session(controlling_tty: bool) -> io::Result<()> {
        // SAFETY: setsid has no preconditions and is async-signal-safe.
        if unsafe { libc::setsid() } == -1 {
            return Err(io::Error::last_os_error());
        }
        if controlling_tty {
            // SAFETY: fd 0 is the PTY slave installed by Command before pre_exec.
            if unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) } == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Pre-computed credentials applied in the child.
    #[derive(Debug, Clone)]
    pub struct PrivilegeDrop {
        uid: libc::uid_t,
        gid: libc::gid_t,
        groups: Vec<libc::gid_t>,
    }

    impl PrivilegeDrop {
        pub fn new(user: &UserSpec) -> Self {
            Self {
                uid: user.uid as libc::uid_t,
                gid: user.gid as libc::gid_t,
                groups: user.groups.iter().map(|g| *g as libc::gid_t).collect(),
            }
        }

        /// Supplementary groups, then gid, then uid. Changing uid first would
        /// remove the permission to change the others.
        pub fn apply(&self) -> io::Result<()> {
            // SAFETY: the pointer and length describe `self.groups`, which
            // outlives the call.
            if unsafe { libc::setgroups(self.groups.len() as _, self.groups.as_ptr()) } == -1 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: plain syscalls without memory arguments.
            if unsafe { libc::setgid(self.gid) } == -1 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: as above.
            if unsafe { libc::setuid(self.uid) } == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;

    use super::UserSpec;
    use crate::error::RunError;

    pub fn resolve_user(_name: &str) -> Result<UserSpec, RunError> {
        Err(RunError::Unsupported("running as another user"))
    }

    pub fn is_current(_user: &UserSpec) -> bool {
        true
    }

    pub fn enter_new_session(_controlling_tty: bool) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process sessions are not supported on this platform",
        ))
    }

    #[derive(Debug, Clone)]
    pub struct PrivilegeDrop;

    impl PrivilegeDrop {
        pub fn new(_user: &UserSpec) -> Self {
            Self
        }

        pub fn apply(&self) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "privilege drop is not supported on this platform",
            ))
        }
    }
}

pub use imp::{PrivilegeDrop, enter_new_session, is_current};

/// Look up `name`; `Ok(None)` when it is the user the daemon already runs as.
pub fn resolve_target_user(name: &str) -> Result<Option<UserSpec>, RunError> {
    let user = imp::resolve_user(name)?;
    if is_current(&user) {
        Ok(None)
    } else {
        Ok(Some(user))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_is_reported() {
        let err = resolve_target_user("runlink-no-such-user-xyz").unwrap_err();
        assert!(matches!(err, RunError::UnknownUser(_)));
    }

    #[test]
    fn current_user_needs_no_switch() {
        let me = nix::unistd::User::from_uid(nix::unistd::Uid::current())
            .unwrap()
            .expect("current user has a passwd entry");
        assert_eq!(resolve_target_user(&me.name).unwrap(), None);
    }

    #[test]
    fn login_env_names_the_user() {
        let user = UserSpec {
            name: "pi".to_string(),
            uid: 1000,
            gid: 1000,
            groups: vec![1000, 44],
            home: PathBuf::from("/home/pi"),
            shell: PathBuf::from("/bin/bash"),
        };
        let env = user.login_env();
        assert!(env.contains(&("USER".to_string(), "pi".to_string())));
        assert!(env.contains(&("HOME".to_string(), "/home/pi".to_string())));
        assert!(env.contains(&("XDG_RUNTIME_DIR".to_string(), "/run/user/1000".to_string())));
    }
}
