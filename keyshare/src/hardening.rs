//! Process hardening for commands that handle passwords or key material.
//!
//! Best effort and non-fatal: failures are logged and the command continues.

/// Disable core dumps and lock memory pages in RAM.
///
/// Call before any password is read or any credential is loaded.
pub fn harden_process() {
    set_not_dumpable();
    lock_memory();
}

fn set_not_dumpable() {
    // SAFETY: PR_SET_DUMPABLE takes plain integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0: core dumps disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

fn lock_memory() {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("mlockall: memory pages locked");
    } else {
        // Usually EPERM or ENOMEM without CAP_IPC_LOCK.
        let err = std::io::Error::last_os_error();
        tracing::debug!("mlockall failed (non-fatal): {err}");
    }
}
