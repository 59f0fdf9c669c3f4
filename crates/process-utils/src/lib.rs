//! Child process helpers shared across the workspace.
//!
//! Spawning goes through [`tokio_command`] so every child gets the same platform flags, and
//! supervised children are torn down with [`kill_and_reap`].

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The child is killed if its handle is dropped, so an abandoned future never leaks a process.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Outcome of [`kill_and_reap`].
#[cfg(feature = "tokio")]
#[derive(Debug)]
pub enum Reaped {
    /// The child had already exited before the kill was attempted.
    AlreadyExited(std::process::ExitStatus),
    /// The child was killed and reaped.
    Killed(Option<std::process::ExitStatus>),
    /// The child did not exit within the deadline after the kill signal.
    TimedOut,
}

/// Forcefully terminate a child process and wait (bounded) for it to be reaped.
///
/// Errors from the kill itself are returned; a child that does not go away within
/// `deadline` yields [`Reaped::TimedOut`] instead of blocking the caller.
#[cfg(feature = "tokio")]
pub async fn kill_and_reap(
    child: &mut tokio::process::Child,
    deadline: std::time::Duration,
) -> std::io::Result<Reaped> {
    if let Some(status) = child.try_wait()? {
        return Ok(Reaped::AlreadyExited(status));
    }

    child.start_kill()?;

    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => Ok(Reaped::Killed(Some(status))),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Reaped::TimedOut),
    }
}
