//! Realtime priority helper (§4.10, SUPPLEMENT).
//!
//! Grounded on `pinos/client/rtkit.c`'s `pinos_rtkit_make_realtime`, which
//! is documented as "mostly equivalent to `sched_setparam(thread, SCHED_RR,
//! { .sched_priority = priority })`" once a RealtimeKit grant is in hand.
//! This port skips the D-Bus grant entirely (Non-goal) and calls
//! `sched_setscheduler` directly; on a system without `CAP_SYS_NICE` this
//! fails and the caller is expected to proceed unprivileged.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RtError {
    #[error("sched_setscheduler failed")]
    SchedSetScheduler(#[source] io::Error),
}

/// Requests `SCHED_RR` at `priority` for `pid` (0 = calling thread, matching
/// the source's `thread == 0` convention). Logs `WARN` and returns `Err` on
/// failure; callers are expected to continue unprivileged rather than treat
/// this as fatal.
pub fn request_realtime(pid: libc::pid_t, priority: i32) -> Result<(), RtError> {
    let param = libc::sched_param { sched_priority: priority };
    // SAFETY: `param` is a valid sched_param for the duration of the call.
    let rc = unsafe { libc::sched_setscheduler(pid, libc::SCHED_RR, &param) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        tracing::warn!(pid, priority, error = %err, "failed to acquire realtime scheduling, continuing unprivileged");
        return Err(RtError::SchedSetScheduler(err));
    }
    tracing::debug!(pid, priority, "acquired SCHED_RR");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_realtime_without_privilege_fails_without_panicking() {
        // Most CI/sandbox environments lack CAP_SYS_NICE; this only checks
        // that failure is reported rather than panicking or crashing.
        let _ = request_realtime(0, 1);
    }
}
