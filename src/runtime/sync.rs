//! Counting semaphore built on a mutex and condition variable.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Counting semaphore.
///
/// `release` adds permits and wakes waiters; `acquire` blocks until a permit
/// is available and takes it.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    // The guarded value is a plain counter, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut permits = self.lock();
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Take a permit if one is available.
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        *self.lock() += 1;
        self.available.notify_one();
    }

    pub fn release_many(&self, n: usize) {
        *self.lock() += n;
        self.available.notify_all();
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_acquire() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        sem.release();
        waiter.join().unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_release_many_wakes_all() {
        let sem = Arc::new(Semaphore::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.acquire())
            })
            .collect();

        sem.release_many(3);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(sem.available(), 0);
    }
}
