use std::sync::{Condvar, Mutex};

/// Counting semaphore tracking outstanding work for a queue worker.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        *count += 1;
        self.cond.notify_one();
    }

    // Blocks until the count is positive, then takes one unit
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        while *count == 0 {
            count = self.cond.wait(count).expect("semaphore poisoned");
        }
        *count -= 1;
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().expect("semaphore poisoned");
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn value(&self) -> usize {
        *self.count.lock().expect("semaphore poisoned")
    }
}
