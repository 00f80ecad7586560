//! Process liveness checks used to reap records of apps that died without
//! unregistering.

use sysinfo::{Pid, ProcessRefreshKind, System};

use crate::registry::AppRecord;

/// Start times may be reported with one-second granularity and drift slightly
/// between reads.
const START_TIME_TOLERANCE_SECS: u64 = 2;

pub fn is_pid_alive(pid: u32) -> bool {
    // Zero and anything past i32::MAX would address a process group.
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM still means the process exists.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn get_process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.start_time())
}

/// Whether the process behind `record` is still the one that registered.
pub fn record_is_live(record: &AppRecord) -> bool {
    if !is_pid_alive(record.pid) {
        return false;
    }
    match (record.proc_started, get_process_start_time(record.pid)) {
        (Some(expected), Some(actual)) => expected.abs_diff(actual) <= START_TIME_TOLERANCE_SECS,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_protocol::ParticipantId;

    #[test]
    fn own_process_is_alive() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn pids_past_i32_range_are_never_alive() {
        assert!(!is_pid_alive(u32::MAX));
        assert!(!is_pid_alive(i32::MAX as u32 + 1));
    }

    #[test]
    fn recycled_pid_is_not_live() {
        let pid = std::process::id();
        let mut record = AppRecord::new(ParticipantId(5), pid, "t", "/t");
        record.proc_started = get_process_start_time(pid);
        assert!(record_is_live(&record));

        record.proc_started = record.proc_started.map(|started| started.saturating_sub(3600));
        assert!(!record_is_live(&record));
    }
}
