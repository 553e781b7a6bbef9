use std::sync::Mutex;

/// Bounded free list of reusable objects, typically message buffers.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    cap: usize,
}

impl<T> Pool<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    pub fn take(&self) -> Option<T> {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
    }

    pub fn take_or_else(&self, make: impl FnOnce() -> T) -> T {
        self.take().unwrap_or_else(make)
    }

    /// Returns `item` to the pool; it is dropped if the pool is full.
    pub fn put(&self, item: T) {
        let mut free = self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if free.len() < self.cap {
            free.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
