//! Immediate process exit.
//!
//! `build/exit` and transport-close teardown must not run destructors: the
//! JSON-RPC writer may be mid-frame on another thread, and joining reader
//! threads blocked on stdin would hang forever.

/// Exit the process immediately without unwinding or running destructors.
pub fn exit_now(code: i32) -> ! {
    #[cfg(unix)]
    unsafe {
        libc::_exit(code);
    }

    #[cfg(not(unix))]
    std::process::exit(code);
}
