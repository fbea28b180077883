//! Auto-reset events that work across processes.
//!
//! A signal is a single `u32` at the start of a small shared section:
//! `0` unset, `1` set. Waiters sleep on it with `futex(2)`; a successful wait
//! consumes the set state, so exactly one wait returns per raise.

use std::{
    ptr,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use crate::{error::Result, registry::Section};

#[derive(Clone, Debug)]
pub struct Signal {
    section: Section,
}

impl Signal {
    pub const LEN: usize = 64;

    pub fn new(section: Section) -> Result<Self> {
        section.require_len(std::mem::size_of::<AtomicU32>())?;
        Ok(Self { section })
    }

    pub fn name(&self) -> &str {
        self.section.name()
    }

    fn word(&self) -> &AtomicU32 {
        // The section is at least 4 bytes and page aligned.
        unsafe { self.section.view(0) }
    }

    pub fn raise(&self) {
        let word = self.word();
        word.store(1, Ordering::Release);
        futex_wake(word);
    }

    /// Peek without consuming.
    pub fn is_set(&self) -> bool {
        self.word().load(Ordering::Acquire) == 1
    }

    /// Consume a pending raise without blocking.
    pub fn try_take(&self) -> bool {
        self.word().swap(0, Ordering::AcqRel) == 1
    }

    pub fn wait(&self) {
        while !self.try_take() {
            futex_wait(self.word(), None);
        }
    }

    /// Returns `false` if the timeout elapsed before a raise. A timeout too
    /// large to represent waits like [`Signal::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        loop {
            if self.try_take() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            futex_wait(self.word(), Some(deadline - now));
        }
    }
}

// Spurious returns (EAGAIN, EINTR, ETIMEDOUT) are fine: callers re-check the
// word in a loop.
fn futex_wait(word: &AtomicU32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |ts| ts as *const libc::timespec);
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            0u32,
            ts_ptr,
            ptr::null::<u32>(),
            0u32,
        );
    }
}

fn futex_wake(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{
        names::Namespace,
        registry::{MemoryRegistry, Registry, ShmRegistry},
    };

    #[test]
    fn raise_is_consumed_by_one_wait() {
        let registry = MemoryRegistry::new();
        let signal = registry.create_signal("S").unwrap();
        signal.raise();
        assert!(signal.is_set());
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        assert!(!signal.try_take());
    }

    #[test]
    fn wait_times_out_when_nobody_raises() {
        let registry = MemoryRegistry::new();
        let signal = registry.create_signal("S").unwrap();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn unbounded_timeout_waits_for_the_raise() {
        let registry = MemoryRegistry::new();
        let waiter = registry.create_signal("S").unwrap();
        let raiser = registry.open_signal("S").unwrap();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::MAX));
        thread::sleep(Duration::from_millis(20));
        raiser.raise();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn raise_through_another_mapping_wakes_waiter() {
        let dir = std::env::temp_dir().join(format!("bgi-signal-{}", Namespace::unique()));
        let registry = ShmRegistry::new(Namespace::unique(), &dir);
        let waiter = registry.create_signal("S").unwrap();
        let raiser = registry.open_signal("S").unwrap();

        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        raiser.raise();
        assert!(handle.join().unwrap());
        registry.unlink("S");
    }

    #[test]
    fn undersized_section_is_rejected() {
        let registry = MemoryRegistry::new();
        let section = registry.create_section("tiny", 2).unwrap();
        assert!(Signal::new(section).is_err());
    }
}
