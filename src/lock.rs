//! Single-instance lock files and peer discovery.
//!
//! A lock file holds the decimal pid of its owner. Exclusive creation is the
//! acquisition primitive; a lock whose pid is no longer alive is stale and
//! may be reclaimed by the next starter.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".autogitpull.lock";
pub const PROCESS_NAME: &str = "autogitpull";

/// Atomically create `path` and write our pid into it. Fails when the file
/// already exists.
pub fn acquire_lock_file(path: &Path) -> bool {
    let Ok(mut f) = OpenOptions::new().write(true).create_new(true).open(path) else {
        return false;
    };
    let _ = writeln!(f, "{}", std::process::id());
    true
}

pub fn release_lock_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

pub fn read_lock_pid(path: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

/// Signal-0 liveness probe. Permission errors count as alive.
#[cfg(unix)]
pub fn process_running(pid: u64) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(e) => e != Errno::ESRCH,
    }
}

#[cfg(not(unix))]
pub fn process_running(_pid: u64) -> bool {
    false
}

#[cfg(unix)]
pub fn terminate_process(pid: u64) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
pub fn terminate_process(_pid: u64) -> bool {
    false
}

/// RAII lock: acquired on construction, removed on drop (including unwind).
pub struct LockGuard {
    path: PathBuf,
    pub locked: bool,
}

impl LockGuard {
    pub fn new(path: PathBuf) -> Self {
        let locked = acquire_lock_file(&path);
        LockGuard { path, locked }
    }

    /// Retry acquisition after the caller cleared a stale file.
    pub fn reacquire(&mut self) {
        self.locked = acquire_lock_file(&self.path);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.locked {
            release_lock_file(&self.path);
        }
    }
}

/// Enumerate peer instances: lock files in temp subdirectories, status
/// sockets whose peers answer, and processes named like us.
pub fn find_running_instances() -> Vec<(String, u64)> {
    let mut out = Vec::new();
    let tmp = std::env::temp_dir();
    if let Ok(entries) = std::fs::read_dir(&tmp) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let lock = path.join(LOCK_FILE_NAME);
                if let Some(pid) = read_lock_pid(&lock) {
                    if process_running(pid) {
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        out.push((name, pid));
                    }
                }
            }
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            if path.extension().and_then(|e| e.to_str()) == Some("sock") {
                if let Some(pid) = socket_peer_pid(&path) {
                    let name = path
                        .file_stem()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    out.push((name, pid));
                }
            }
        }
    }
    out.extend(scan_process_table());
    out
}

#[cfg(target_os = "linux")]
fn socket_peer_pid(path: &Path) -> Option<u64> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    use std::os::unix::net::UnixStream;
    let stream = UnixStream::connect(path).ok()?;
    let creds = getsockopt(&stream, PeerCredentials).ok()?;
    Some(creds.pid() as u64)
}

#[cfg(target_os = "macos")]
fn socket_peer_pid(path: &Path) -> Option<u64> {
    use nix::libc;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    // SOL_LOCAL/LOCAL_PEERPID from sys/un.h: xnu's counterpart to
    // SO_PEERCRED, yielding the connected peer's pid.
    const SOL_LOCAL: libc::c_int = 0;
    const LOCAL_PEERPID: libc::c_int = 0x002;
    let stream = UnixStream::connect(path).ok()?;
    let mut pid: libc::pid_t = 0;
    let mut len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            SOL_LOCAL,
            LOCAL_PEERPID,
            &mut pid as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    (ret == 0 && pid > 0).then_some(pid as u64)
}

#[cfg(target_os = "linux")]
fn scan_process_table() -> Vec<(String, u64)> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let arg0 = cmdline.split(|b| *b == 0).next().unwrap_or(&[]);
        let arg0 = String::from_utf8_lossy(arg0);
        if Path::new(arg0.as_ref())
            .file_name()
            .map(|n| n == PROCESS_NAME)
            .unwrap_or(false)
        {
            out.push((PROCESS_NAME.to_string(), pid));
        }
    }
    out
}

#[cfg(target_os = "macos")]
fn scan_process_table() -> Vec<(String, u64)> {
    use nix::libc;
    let mut out = Vec::new();
    let count = unsafe { libc::proc_listallpids(std::ptr::null_mut(), 0) };
    if count <= 0 {
        return out;
    }
    // Leave headroom for processes spawned between the two calls.
    let mut pids = vec![0 as libc::pid_t; count as usize * 2];
    let bytes = (pids.len() * std::mem::size_of::<libc::pid_t>()) as libc::c_int;
    let count =
        unsafe { libc::proc_listallpids(pids.as_mut_ptr() as *mut libc::c_void, bytes) };
    if count <= 0 {
        return out;
    }
    for &pid in pids.iter().take(count as usize) {
        if pid <= 0 {
            continue;
        }
        if macos_proc_name_matches(pid) || macos_argv0_matches(pid) {
            out.push((PROCESS_NAME.to_string(), pid as u64));
        }
    }
    out
}

#[cfg(target_os = "macos")]
fn macos_proc_name_matches(pid: nix::libc::pid_t) -> bool {
    use nix::libc;
    let mut buf = [0u8; 256];
    let n = unsafe {
        libc::proc_name(pid, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as u32)
    };
    if n <= 0 {
        return false;
    }
    std::str::from_utf8(&buf[..n as usize])
        .map(|name| name == PROCESS_NAME)
        .unwrap_or(false)
}

/// argv[0] check through `KERN_PROCARGS2`: the buffer holds argc, the exec
/// path, NUL padding, then the argument strings.
#[cfg(target_os = "macos")]
fn macos_argv0_matches(pid: nix::libc::pid_t) -> bool {
    use nix::libc;
    let mut mib = [libc::CTL_KERN, libc::KERN_PROCARGS2, pid as libc::c_int];
    let mut size: libc::size_t = 0;
    let ret = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            3,
            std::ptr::null_mut(),
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if ret != 0 || size < std::mem::size_of::<libc::c_int>() {
        return false;
    }
    let mut buf = vec![0u8; size];
    let ret = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            3,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if ret != 0 || size < std::mem::size_of::<libc::c_int>() {
        return false;
    }
    let argc = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if argc <= 0 {
        return false;
    }
    let rest = &buf[std::mem::size_of::<libc::c_int>()..size];
    let mut parts = rest.splitn(2, |b| *b == 0);
    let _exec_path = parts.next();
    let Some(mut after) = parts.next() else {
        return false;
    };
    while let Some((0, tail)) = after.split_first() {
        after = tail;
    }
    let argv0 = after.split(|b| *b == 0).next().unwrap_or(&[]);
    let argv0 = String::from_utf8_lossy(argv0);
    argv0.as_ref() == PROCESS_NAME
        || Path::new(argv0.as_ref())
            .file_name()
            .map(|n| n == PROCESS_NAME)
            .unwrap_or(false)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn scan_process_table() -> Vec<(String, u64)> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_our_pid_and_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = tmp.path().join(LOCK_FILE_NAME);
        assert!(acquire_lock_file(&lock));
        assert_eq!(read_lock_pid(&lock), Some(std::process::id() as u64));
        assert!(!acquire_lock_file(&lock));
        release_lock_file(&lock);
        assert!(!lock.exists());
    }

    #[test]
    fn guard_releases_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = tmp.path().join(LOCK_FILE_NAME);
        {
            let guard = LockGuard::new(lock.clone());
            assert!(guard.locked);
            assert!(lock.exists());
        }
        assert!(!lock.exists());
    }

    #[test]
    fn repeated_acquire_and_drop_leaves_no_residue() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = tmp.path().join(LOCK_FILE_NAME);
        for _ in 0..10 {
            let guard = LockGuard::new(lock.clone());
            assert!(guard.locked);
        }
        assert!(!lock.exists());
    }

    #[test]
    fn failed_guard_does_not_remove_foreign_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = tmp.path().join(LOCK_FILE_NAME);
        std::fs::write(&lock, "12345\n").unwrap();
        {
            let guard = LockGuard::new(lock.clone());
            assert!(!guard.locked);
        }
        assert!(lock.exists());
        assert_eq!(read_lock_pid(&lock), Some(12345));
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_running_and_absurd_pid_is_not() {
        assert!(process_running(std::process::id() as u64));
        assert!(!process_running(u64::MAX));
        // Way beyond pid_max on any reasonable system.
        assert!(!process_running(0x7fff_fff0));
    }

    #[test]
    fn malformed_lock_file_yields_no_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = tmp.path().join(LOCK_FILE_NAME);
        std::fs::write(&lock, "not-a-pid\n").unwrap();
        assert_eq!(read_lock_pid(&lock), None);
        assert_eq!(read_lock_pid(&tmp.path().join("missing")), None);
    }
}
