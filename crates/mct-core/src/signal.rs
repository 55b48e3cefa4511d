//! Signal delivery to the supervised renderer

use thiserror::Error;

/// Signal delivery error
#[derive(Debug, Error)]
pub enum SignalError {
    /// kill(2) failed (typically ESRCH: the process already exited)
    #[error("failed to signal pid {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Signals are not available on this platform
    #[error("process signals are not supported on this platform")]
    Unsupported,
}

/// Send SIGHUP (the renderer's reload signal) to `pid`.
pub fn send_hangup(pid: u32) -> Result<(), SignalError> {
    #[cfg(unix)]
    {
        kill(pid, libc::SIGHUP)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(SignalError::Unsupported)
    }
}

/// Send SIGTERM to `pid`.
pub fn send_terminate(pid: u32) -> Result<(), SignalError> {
    #[cfg(unix)]
    {
        kill(pid, libc::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(SignalError::Unsupported)
    }
}

#[cfg(unix)]
fn kill(pid: u32, signal: libc::c_int) -> Result<(), SignalError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| SignalError::Kill {
        pid,
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    // pid 0 / -1 would address a process group or every process
    if raw <= 0 {
        return Err(SignalError::Kill {
            pid,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        });
    }

    // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
    let result = unsafe { libc::kill(raw, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(SignalError::Kill {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}
