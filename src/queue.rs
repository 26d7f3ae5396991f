use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// A thread-safe queue with blocking read access and an optional capacity
/// bound.
///
/// Typically used to hand packets from connection reader threads to the
/// application thread. Any number of producers and consumers may operate on
/// the queue concurrently; FIFO order is preserved except for the explicit
/// [`push_front`](Self::push_front) escape used for priority re-injection.
///
/// A queue built with [`bounded`](Self::bounded) blocks producers once the
/// bound is reached, so a stalled consumer exerts backpressure instead of
/// growing the queue without limit.
pub struct BlockingQueue<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    space: Condvar,
    capacity: usize,
}

impl<T> BlockingQueue<T> {
    /// An unbounded queue: pushes never block.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// A bounded queue: [`push`](Self::push) and [`push_many`](Self::push_many)
    /// block while `capacity` elements are already queued.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(capacity.max(1))
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            space: Condvar::new(),
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Push a new element to the back of the queue, blocking while the queue
    /// is at capacity.
    pub fn push(&self, element: T) {
        let mut queue = self.lock();
        while queue.len() >= self.capacity {
            queue = match self.space.wait(queue) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        queue.push_back(element);
        drop(queue);
        self.available.notify_one();
    }

    /// Push a batch of elements to the back of the queue, blocking whenever
    /// the queue is at capacity.
    pub fn push_many(&self, elements: Vec<T>) {
        if elements.is_empty() {
            return;
        }
        let mut queue = self.lock();
        for element in elements {
            while queue.len() >= self.capacity {
                queue = match self.space.wait(queue) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            queue.push_back(element);
        }
        drop(queue);
        self.available.notify_all();
    }

    /// Push an element to the front of the queue, ahead of everything already
    /// queued. Used to re-deliver an unconsumed element with priority; the
    /// capacity bound does not apply, so a consumer re-injecting can never
    /// deadlock against blocked producers.
    pub fn push_front(&self, element: T) {
        self.lock().push_front(element);
        self.available.notify_one();
    }

    /// Retrieve and pop the front element, blocking until one is available.
    pub fn pop(&self) -> T {
        let mut queue = self.lock();
        loop {
            // Emptiness is re-checked under the lock after every wakeup, so a
            // signal consumed by another consumer is never a lost element.
            if let Some(element) = queue.pop_front() {
                drop(queue);
                self.space.notify_one();
                return element;
            }
            queue = match self.available.wait(queue) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Retrieve and pop the front element, blocking for at most `timeout`
    /// measured from call entry. Returns `None` on timeout.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if let Some(element) = queue.pop_front() {
                drop(queue);
                self.space.notify_one();
                return Some(element);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            queue = match self.available.wait_timeout(queue, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Pop the front element if one is immediately available.
    pub fn try_pop(&self) -> Option<T> {
        let element = self.lock().pop_front();
        if element.is_some() {
            self.space.notify_one();
        }
        element
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone> BlockingQueue<T> {
    /// The front element without removing it, `None` if the queue is empty.
    pub fn front(&self) -> Option<T> {
        self.lock().front().cloned()
    }

    /// The back element without removing it, `None` if the queue is empty.
    pub fn back(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
