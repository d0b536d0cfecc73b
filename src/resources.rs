//! Process resource probes: CPU percent, memory, thread count, cumulative
//! network and disk IO, and CPU affinity.
//!
//! Every probe caches its last value and only touches the OS once per poll
//! interval, which makes them safe to call from the inner loop of a rate
//! limiter. Probes are advisory: on any failure (or on platforms without a
//! backend) they return zero or the last good value instead of an error.
//!
//! Backends: Linux reads `/proc`; macOS reads libproc (`proc_pidinfo`,
//! `proc_pid_rusage`), `getrusage`, and `getifaddrs`. Elsewhere the probes
//! degrade to zero. Affinity binding exists on Linux only; other kernels
//! offer no process-wide affinity call, so `set_cpu_affinity` reports
//! failure there.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(any(target_os = "linux", target_os = "macos"))]
use nix::libc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetUsage {
    pub down_bytes: u64,
    pub up_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug)]
struct CpuState {
    prev_cpu_us: u64,
    prev_time: Instant,
    last_percent: f64,
}

#[derive(Debug)]
struct Cached {
    value: u64,
    at: Option<Instant>,
}

#[derive(Debug)]
pub struct Probes {
    cpu_poll: Duration,
    mem_poll: Duration,
    thread_poll: Duration,
    cpu: Mutex<CpuState>,
    mem: Mutex<Cached>,
    threads: Mutex<Cached>,
    net_base: Mutex<Option<(u64, u64)>>,
    disk_base: Mutex<Option<(u64, u64)>>,
    tmp_dir_base: Mutex<u64>,
}

impl Default for Probes {
    fn default() -> Self {
        Probes::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }
}

impl Probes {
    pub fn new(cpu_poll: Duration, mem_poll: Duration, thread_poll: Duration) -> Self {
        Probes {
            cpu_poll: cpu_poll.max(Duration::from_secs(1)),
            mem_poll: mem_poll.max(Duration::from_secs(1)),
            thread_poll: thread_poll.max(Duration::from_secs(1)),
            cpu: Mutex::new(CpuState {
                prev_cpu_us: read_cpu_micros(),
                prev_time: Instant::now(),
                last_percent: 0.0,
            }),
            mem: Mutex::new(Cached { value: 0, at: None }),
            threads: Mutex::new(Cached { value: 0, at: None }),
            net_base: Mutex::new(None),
            disk_base: Mutex::new(None),
            tmp_dir_base: Mutex::new(0),
        }
    }

    /// Process CPU usage since the previous poll, as a percentage of one
    /// core's wall time. Between polls the cached value is returned.
    pub fn cpu_percent(&self) -> f64 {
        let mut st = self.cpu.lock().unwrap();
        let now = Instant::now();
        if now.duration_since(st.prev_time) < self.cpu_poll {
            return st.last_percent;
        }
        let cpu_us = read_cpu_micros();
        let delta_us = cpu_us.saturating_sub(st.prev_cpu_us);
        let delta_wall = now.duration_since(st.prev_time).as_secs_f64();
        st.prev_cpu_us = cpu_us;
        st.prev_time = now;
        if delta_wall <= 0.0 {
            return st.last_percent;
        }
        st.last_percent = 100.0 * (delta_us as f64 / 1e6) / delta_wall;
        st.last_percent
    }

    /// Resident set size in megabytes.
    pub fn memory_mb(&self) -> u64 {
        let mut st = self.mem.lock().unwrap();
        let now = Instant::now();
        if let Some(at) = st.at {
            if now.duration_since(at) < self.mem_poll {
                return st.value;
            }
        }
        st.at = Some(now);
        st.value = resident_memory_mb();
        st.value
    }

    /// Virtual memory size in kilobytes. Read directly; it backs a debug
    /// display only.
    pub fn virtual_memory_kb(&self) -> u64 {
        virtual_memory_kb_raw()
    }

    pub fn thread_count(&self) -> u64 {
        let mut st = self.threads.lock().unwrap();
        let now = Instant::now();
        if let Some(at) = st.at {
            if now.duration_since(at) < self.thread_poll {
                return st.value;
            }
        }
        st.at = Some(now);
        st.value = thread_count_raw().max(1);
        st.value
    }

    /// Record the current network counters as the baseline.
    pub fn init_network_usage(&self) {
        *self.net_base.lock().unwrap() = Some(read_net_bytes());
    }

    /// Bytes transferred since [`Probes::init_network_usage`]; zero if no
    /// baseline was taken.
    pub fn network_usage(&self) -> NetUsage {
        let base = self.net_base.lock().unwrap();
        let Some((base_down, base_up)) = *base else {
            return NetUsage::default();
        };
        let (down, up) = read_net_bytes();
        NetUsage {
            down_bytes: down.saturating_sub(base_down),
            up_bytes: up.saturating_sub(base_up),
        }
    }

    /// Record the current disk IO counters (and the temp-dir size used as a
    /// fallback when the OS offers no per-process counters).
    pub fn init_disk_usage(&self) {
        *self.disk_base.lock().unwrap() = read_io_bytes();
        *self.tmp_dir_base.lock().unwrap() = directory_size(std::env::temp_dir());
    }

    pub fn disk_usage(&self) -> DiskUsage {
        let base = self.disk_base.lock().unwrap();
        match (*base, read_io_bytes()) {
            (Some((base_r, base_w)), Some((r, w))) => DiskUsage {
                read_bytes: r.saturating_sub(base_r),
                write_bytes: w.saturating_sub(base_w),
            },
            _ => {
                // No per-process counters: approximate write volume by the
                // growth of the process temp directory.
                let grown = directory_size(std::env::temp_dir())
                    .saturating_sub(*self.tmp_dir_base.lock().unwrap());
                DiskUsage {
                    read_bytes: 0,
                    write_bytes: grown,
                }
            }
        }
    }
}

fn directory_size(dir: PathBuf) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

// ─── Linux backend (/proc) ──────────────────────────────────────────────────

#[cfg(target_os = "linux")]
fn read_proc_jiffies() -> u64 {
    let Ok(stat) = std::fs::read_to_string("/proc/self/stat") else {
        return 0;
    };
    // utime and stime are fields 14 and 15; the comm field may contain
    // spaces, so split after the closing paren.
    let Some(after) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
        return 0;
    };
    let fields: Vec<&str> = after.split_whitespace().collect();
    let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);
    utime + stime
}

#[cfg(target_os = "linux")]
fn read_cpu_micros() -> u64 {
    (read_proc_jiffies() as f64 * 1_000_000.0 / clock_ticks_per_sec()) as u64
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_sec() -> f64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as f64
    } else {
        100.0
    }
}

#[cfg(target_os = "linux")]
fn page_size_kb() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64 / 1024
    } else {
        4
    }
}

#[cfg(target_os = "linux")]
fn read_status_value_kb(key: &str) -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            return rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
    }
    0
}

#[cfg(target_os = "linux")]
fn resident_memory_mb() -> u64 {
    read_status_value_kb("VmRSS:") / 1024
}

#[cfg(target_os = "linux")]
fn virtual_memory_kb_raw() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    statm
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|pages| pages * page_size_kb())
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn thread_count_raw() -> u64 {
    let count = std::fs::read_dir("/proc/self/task")
        .map(|entries| entries.count() as u64)
        .unwrap_or(0);
    if count > 0 {
        count
    } else {
        read_status_value_kb("Threads:")
    }
}

#[cfg(target_os = "linux")]
fn read_net_bytes() -> (u64, u64) {
    let Ok(dev) = std::fs::read_to_string("/proc/self/net/dev") else {
        return (0, 0);
    };
    let mut rx_total = 0u64;
    let mut tx_total = 0u64;
    for line in dev.lines().skip(2) {
        let Some((_iface, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        rx_total += fields.first().and_then(|v| v.parse().ok()).unwrap_or(0);
        tx_total += fields.get(8).and_then(|v| v.parse().ok()).unwrap_or(0);
    }
    (rx_total, tx_total)
}

#[cfg(target_os = "linux")]
fn read_io_bytes() -> Option<(u64, u64)> {
    let io = std::fs::read_to_string("/proc/self/io").ok()?;
    let mut read_b = 0u64;
    let mut write_b = 0u64;
    for line in io.lines() {
        if let Some(v) = line.strip_prefix("read_bytes:") {
            read_b = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("write_bytes:") {
            write_b = v.trim().parse().unwrap_or(0);
        }
    }
    Some((read_b, write_b))
}

// ─── macOS backend (libproc, getrusage, getifaddrs) ─────────────────────────

/// One `proc_pidinfo` task snapshot covers resident size, virtual size, and
/// thread count.
#[cfg(target_os = "macos")]
fn proc_task_info() -> Option<libc::proc_taskinfo> {
    let mut info: libc::proc_taskinfo = unsafe { std::mem::zeroed() };
    let size = std::mem::size_of::<libc::proc_taskinfo>() as libc::c_int;
    let ret = unsafe {
        libc::proc_pidinfo(
            std::process::id() as libc::c_int,
            libc::PROC_PIDTASKINFO,
            0,
            &mut info as *mut _ as *mut libc::c_void,
            size,
        )
    };
    (ret == size).then_some(info)
}

#[cfg(target_os = "macos")]
fn read_cpu_micros() -> u64 {
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) } != 0 {
        return 0;
    }
    let user = ru.ru_utime.tv_sec as u64 * 1_000_000 + ru.ru_utime.tv_usec as u64;
    let system = ru.ru_stime.tv_sec as u64 * 1_000_000 + ru.ru_stime.tv_usec as u64;
    user + system
}

#[cfg(target_os = "macos")]
fn resident_memory_mb() -> u64 {
    proc_task_info()
        .map(|info| info.pti_resident_size / (1024 * 1024))
        .unwrap_or(0)
}

#[cfg(target_os = "macos")]
fn virtual_memory_kb_raw() -> u64 {
    proc_task_info()
        .map(|info| info.pti_virtual_size / 1024)
        .unwrap_or(0)
}

#[cfg(target_os = "macos")]
fn thread_count_raw() -> u64 {
    proc_task_info()
        .map(|info| info.pti_threadnum.max(0) as u64)
        .unwrap_or(0)
}

#[cfg(target_os = "macos")]
fn read_net_bytes() -> (u64, u64) {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return (0, 0);
    }
    let mut rx_total = 0u64;
    let mut tx_total = 0u64;
    let mut cursor = ifap;
    while !cursor.is_null() {
        let ifa = unsafe { &*cursor };
        if !ifa.ifa_data.is_null() {
            let data = unsafe { &*(ifa.ifa_data as *const libc::if_data) };
            rx_total += data.ifi_ibytes as u64;
            tx_total += data.ifi_obytes as u64;
        }
        cursor = ifa.ifa_next;
    }
    unsafe { libc::freeifaddrs(ifap) };
    (rx_total, tx_total)
}

#[cfg(target_os = "macos")]
fn read_io_bytes() -> Option<(u64, u64)> {
    let mut info: libc::rusage_info_v2 = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::proc_pid_rusage(
            std::process::id() as libc::c_int,
            libc::RUSAGE_INFO_V2,
            &mut info as *mut _ as *mut _,
        )
    };
    (ret == 0).then_some((info.ri_diskio_bytesread, info.ri_diskio_byteswritten))
}

// ─── other platforms: degraded stubs ────────────────────────────────────────

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_cpu_micros() -> u64 {
    0
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn resident_memory_mb() -> u64 {
    0
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn virtual_memory_kb_raw() -> u64 {
    0
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn thread_count_raw() -> u64 {
    0
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_net_bytes() -> (u64, u64) {
    (0, 0)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_io_bytes() -> Option<(u64, u64)> {
    None
}

// ─── affinity ───────────────────────────────────────────────────────────────

/// Pin the process to the cores set in `mask`. Only Linux exposes a
/// process-wide affinity call; elsewhere this reports failure.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(mask: u64) -> bool {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;
    if mask == 0 {
        return false;
    }
    let mut set = CpuSet::new();
    for core in 0..64 {
        if mask & (1 << core) != 0 && set.set(core).is_err() {
            return false;
        }
    }
    sched_setaffinity(Pid::from_raw(0), &set).is_ok()
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_mask: u64) -> bool {
    false
}

/// Current affinity as a comma-separated core list, e.g. `0,1,4`.
#[cfg(target_os = "linux")]
pub fn cpu_affinity_description() -> String {
    use nix::sched::{sched_getaffinity, CpuSet};
    use nix::unistd::Pid;
    let Ok(set) = sched_getaffinity(Pid::from_raw(0)) else {
        return String::new();
    };
    let mut cores = Vec::new();
    for core in 0..CpuSet::count() {
        if set.is_set(core).unwrap_or(false) {
            cores.push(core.to_string());
        }
    }
    cores.join(",")
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_affinity_description() -> String {
    String::new()
}
