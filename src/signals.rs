//! Asynchronous signal blocking around the store lock.
//!
//! A handler that runs while this thread holds the header lock and touches
//! the store would deadlock, and a signal that kills the process would leave
//! the lock held. While a `SignalBlock` is alive every signal except the
//! synchronous fault signals is blocked for the calling thread.

#[cfg(unix)]
mod imp {
    use log::warn;

    /// Faults raised by the thread's own instructions; blocking them is
    /// undefined behavior, so they stay deliverable.
    const FAULTS: [libc::c_int; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGFPE, libc::SIGILL];

    pub struct SignalBlock {
        previous: Option<libc::sigset_t>,
    }

    impl SignalBlock {
        pub fn new(enabled: bool) -> Self {
            if !enabled {
                return SignalBlock { previous: None };
            }
            unsafe {
                let mut set: libc::sigset_t = std::mem::zeroed();
                let mut previous: libc::sigset_t = std::mem::zeroed();
                libc::sigfillset(&mut set);
                for sig in FAULTS {
                    libc::sigdelset(&mut set, sig);
                }
                let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
                if rc != 0 {
                    warn!("pthread_sigmask failed: {}", std::io::Error::from_raw_os_error(rc));
                    return SignalBlock { previous: None };
                }
                SignalBlock {
                    previous: Some(previous),
                }
            }
        }

        pub fn is_active(&self) -> bool {
            self.previous.is_some()
        }
    }

    impl Drop for SignalBlock {
        fn drop(&mut self) {
            if let Some(previous) = &self.previous {
                unsafe {
                    libc::pthread_sigmask(libc::SIG_SETMASK, previous, std::ptr::null_mut());
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub struct SignalBlock;

    impl SignalBlock {
        pub fn new(_enabled: bool) -> Self {
            SignalBlock
        }

        pub fn is_active(&self) -> bool {
            false
        }
    }
}

pub use imp::SignalBlock;
