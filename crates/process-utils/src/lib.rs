//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;
use std::io;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
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
/// `kill_on_drop` is enabled so a dropped handle never leaks a running tool.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Outcome of a graceful termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateRequest {
    /// A termination signal was delivered; the process may still be shutting down.
    Signalled,
    /// The process had already exited (no pid left to signal).
    AlreadyExited,
    /// Graceful signalling is not available on this platform; callers must kill.
    Unsupported,
}

/// Ask a process to shut down gracefully.
///
/// On unix this sends `SIGTERM` so tools like streamlink and ffmpeg can flush
/// and finalize their output. Other platforms have no equivalent and report
/// [`TerminateRequest::Unsupported`].
pub fn request_terminate(pid: Option<u32>) -> io::Result<TerminateRequest> {
    let Some(pid) = pid else {
        return Ok(TerminateRequest::AlreadyExited);
    };

    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill(2) has no memory-safety preconditions; an invalid pid
        // yields ESRCH which is mapped below.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            return Ok(TerminateRequest::Signalled);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(TerminateRequest::AlreadyExited);
        }
        Err(err)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(TerminateRequest::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_without_pid_reports_exited() {
        assert_eq!(
            request_terminate(None).unwrap(),
            TerminateRequest::AlreadyExited
        );
    }

    #[cfg(all(unix, feature = "tokio"))]
    #[tokio::test]
    async fn terminate_signals_running_child() {
        let mut child = tokio_command("sleep").arg("30").spawn().unwrap();
        let outcome = request_terminate(child.id()).unwrap();
        assert_eq!(outcome, TerminateRequest::Signalled);

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
