use sysinfo::{Pid, System};

/// Resident set size of this process in bytes, if the platform reports it.
pub fn current_rss_bytes() -> Option<u64> {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system.process(pid).map(|p| p.memory())
}
