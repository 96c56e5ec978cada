// Jackson Coxson
// Single-instance bookkeeping and driving an already-running daemon

use std::{fs, io::Write, os::unix::fs::OpenOptionsExt, path::Path};

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tracing::debug;

use crate::GandalfError;

/// Where the running daemon records its process id.
pub const PID_FILE: &str = "/var/run/gandalf.pid";

/// Records the current process id, create-or-truncate, mode 0666.
pub fn write_pid_file(path: &Path) -> Result<(), GandalfError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
        .map_err(|e| GandalfError::PidFileDenied(format!("{}: {e}", path.display())))?;
    file.write_all(std::process::id().to_string().as_bytes())
        .map_err(|e| GandalfError::PidFileDenied(format!("{}: {e}", path.display())))?;
    Ok(())
}

/// Reads the recorded process id back. Anything other than a single
/// ASCII decimal means no daemon is known.
pub fn read_pid_file(path: &Path) -> Result<Pid, GandalfError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| GandalfError::NoRunningDaemon(format!("{}: {e}", path.display())))?;
    let pid: i32 = contents.trim().parse().map_err(|_| {
        GandalfError::NoRunningDaemon(format!(
            "{} holds `{}`, not a pid",
            path.display(),
            contents.trim()
        ))
    })?;
    Ok(Pid::from_raw(pid))
}

/// True when the recorded process still exists.
pub fn pid_is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// Asks a running daemon to reload its mapping in place.
pub fn reload_running_daemon(path: &Path) -> Result<(), GandalfError> {
    signal_running_daemon(path, Signal::SIGUSR1)
}

/// Asks a running daemon to shut down gracefully.
pub fn shutdown_running_daemon(path: &Path) -> Result<(), GandalfError> {
    signal_running_daemon(path, Signal::SIGUSR2)
}

fn signal_running_daemon(path: &Path, signal: Signal) -> Result<(), GandalfError> {
    let pid = read_pid_file(path)?;
    match kill(pid, signal) {
        Ok(()) => {
            debug!("sent {signal:?} to pid {pid}");
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) => Err(GandalfError::NoRunningDaemon(format!(
            "pid {pid} from {} is gone",
            path.display()
        ))),
        Err(e) => Err(GandalfError::SignalFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gandalf-pid-{name}-{}", std::process::id()))
    }

    #[test]
    fn pid_file_round_trips() {
        let path = temp_path("roundtrip");
        write_pid_file(&path).unwrap();
        let pid = read_pid_file(&path).unwrap();
        assert_eq!(pid.as_raw(), std::process::id() as i32);
        assert!(pid_is_alive(pid));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn garbage_pid_file_reads_as_no_daemon() {
        let path = temp_path("garbage");
        std::fs::write(&path, "not a pid").unwrap();
        match read_pid_file(&path) {
            Err(GandalfError::NoRunningDaemon(_)) => {}
            other => panic!("expected no running daemon, got {other:?}"),
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_pid_file_reads_as_no_daemon() {
        let path = temp_path("missing");
        assert!(matches!(
            read_pid_file(&path),
            Err(GandalfError::NoRunningDaemon(_))
        ));
    }
}
