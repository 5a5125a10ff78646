use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::Semaphore;

/// Long-term lock protecting data held across disk I/O.
///
/// Contending tasks sleep on the semaphore instead of spinning. Not
/// reentrant; the guard hands out the data.
pub struct SleepLock<T> {
    lk: Semaphore,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the binary semaphore.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

pub struct SleepLockGuard<'s, T> {
    lock: &'s SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            lk: Semaphore::new(name, 1),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.lk.down();
        SleepLockGuard { lock: self }
    }

    /// Exclusive access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the semaphore permit is held for the guard's lifetime.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; the guard is unique while the permit is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lk.up();
    }
}
