//! Cross-process mutex
//!
//! One named mutex per instance guards every segment of that instance.
//! Acquisition is bounded; timing out returns `LockTimeout` rather than
//! proceeding without the lock.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;
use std::time::Duration;
use tracing::warn;

/// The single cross-process mutex of an instance, backed by a named
/// semaphore with an initial count of one.
pub struct InstanceMutex {
    sem: *mut libc::sem_t,
    name: String,
}

unsafe impl Send for InstanceMutex {}
unsafe impl Sync for InstanceMutex {}

impl InstanceMutex {
    /// Open the instance mutex, creating it if this is the first
    /// process to attach.
    pub fn open(instance_name: &str) -> Result<Self> {
        let name = mutex_name(instance_name);
        let posix = CString::new(name.clone())
            .map_err(|_| Error::Config(format!("mutex name contains NUL: {}", name)))?;

        let sem = unsafe {
            libc::sem_open(
                posix.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(InstanceMutex { sem, name })
    }

    /// Acquire with a bounded wait. On timeout the event is logged and
    /// `LockTimeout` is returned; the guard is never granted without
    /// the lock.
    pub fn acquire(&self, timeout: Duration) -> Result<MutexGuard<'_>> {
        let deadline = absolute_deadline(timeout)?;

        loop {
            let rc = unsafe { libc::sem_timedwait(self.sem, &deadline) };
            if rc == 0 {
                return Ok(MutexGuard { owner: self });
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => {
                    warn!(
                        mutex = %self.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "lock acquisition timed out"
                    );
                    return Err(Error::LockTimeout(timeout));
                }
                _ => return Err(Error::Io(err)),
            }
        }
    }

    /// Remove the named semaphore from the system namespace
    pub fn unlink(&self) {
        if let Ok(posix) = CString::new(self.name.clone()) {
            unsafe {
                libc::sem_unlink(posix.as_ptr());
            }
        }
    }
}

impl Drop for InstanceMutex {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// Holds the instance mutex; released on drop on every exit path.
pub struct MutexGuard<'a> {
    owner: &'a InstanceMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::sem_post(self.owner.sem);
        }
    }
}

fn mutex_name(instance_name: &str) -> String {
    let sanitized: String = instance_name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '-' } else { c })
        .collect();
    format!("/{}.lock", sanitized)
}

fn absolute_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }

    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unique_name;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_acquire_and_release() {
        let name = unique_name("mutex");
        let mutex = InstanceMutex::open(&name).unwrap();

        {
            let _guard = mutex.acquire(Duration::from_millis(200)).unwrap();
        }
        // Released on drop, so a second acquisition succeeds.
        let _guard = mutex.acquire(Duration::from_millis(200)).unwrap();

        mutex.unlink();
    }

    #[test]
    fn test_timeout_while_held() {
        let name = unique_name("mutex-timeout");
        let mutex = InstanceMutex::open(&name).unwrap();

        let guard = mutex.acquire(Duration::from_millis(200)).unwrap();

        let started = Instant::now();
        let result = mutex.acquire(Duration::from_millis(100));
        assert!(matches!(result, Err(Error::LockTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(90));

        drop(guard);
        mutex.unlink();
    }

    #[test]
    fn test_blocked_thread_sees_release() {
        let name = unique_name("mutex-handoff");
        let mutex = InstanceMutex::open(&name).unwrap();
        let guard = mutex.acquire(Duration::from_millis(200)).unwrap();

        let (tx, rx) = mpsc::channel();
        let other = InstanceMutex::open(&name).unwrap();
        let waiter = thread::spawn(move || {
            let guard = other.acquire(Duration::from_millis(2000)).unwrap();
            tx.send(()).unwrap();
            drop(guard);
        });

        // The waiter cannot get through while we hold the lock.
        assert!(rx
            .recv_timeout(Duration::from_millis(100))
            .is_err());

        drop(guard);
        rx.recv_timeout(Duration::from_millis(2000)).unwrap();
        waiter.join().unwrap();

        mutex.unlink();
    }
}
