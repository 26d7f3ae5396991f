use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::warn;

use super::{Connection, ConnectionRef, ProbeResult};
use crate::{constants::WATCH_INTERVAL, queue::BlockingQueue};

/// Readiness kind reported by [`ConnectionSet::select`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The connection has data available to read.
    Data,
    /// The connection was closed by the peer.
    Closed,
    /// The connection's transport reported an error.
    Error,
}

/// One ready connection returned from [`ConnectionSet::select`].
pub struct SelectResult {
    pub connection: ConnectionRef,
    pub readiness: Readiness,
}

enum SetEvent {
    Ready { key: u64, readiness: Readiness },
    Wake,
}

/// Multiplexes readiness across many connections.
///
/// The set holds only non-owning references; each registered connection gets
/// a watcher thread that blocks on a read probe and posts readiness events
/// into an internal queue. `select` is level-triggered: a connection that was
/// reported ready but not drained is reported again on the next call.
pub struct ConnectionSet {
    entries: Mutex<Vec<Entry>>,
    events: Arc<BlockingQueue<SetEvent>>,
    next_key: Mutex<u64>,
    shut_down: AtomicBool,
}

struct Entry {
    key: u64,
    connection: Weak<dyn Connection>,
    gate: Arc<WatchGate>,
    check: Box<dyn super::ReadProbe>,
    watcher: Option<JoinHandle<()>>,
}

/// Arms and stops one watcher thread.
struct WatchGate {
    state: Mutex<GateState>,
    signal: Condvar,
}

struct GateState {
    armed: bool,
    stopped: bool,
}

impl WatchGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                armed: true,
                stopped: false,
            }),
            signal: Condvar::new(),
        }
    }

    fn rearm(&self) {
        let mut state = self.lock();
        state.armed = true;
        drop(state);
        self.signal.notify_one();
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        drop(state);
        self.signal.notify_one();
    }

    /// Blocks until armed. Returns false once stopped.
    fn wait_armed(&self) -> bool {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return false;
            }
            if state.armed {
                state.armed = false;
                return true;
            }
            state = match self.signal.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            events: Arc::new(BlockingQueue::new()),
            next_key: Mutex::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a connection for readiness monitoring. The set keeps only a
    /// weak reference; ownership stays with the node.
    pub fn add(&self, connection: &ConnectionRef) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("add() on a shut-down ConnectionSet, ignoring");
            return;
        }
        let (probe, check) = match (connection.probe(), connection.probe()) {
            (Ok(probe), Ok(check)) => (probe, check),
            _ => {
                warn!(
                    "could not probe connection to {}, not monitoring it",
                    connection.peer()
                );
                return;
            }
        };

        let key = {
            let mut next = match self.next_key.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let key = *next;
            *next += 1;
            key
        };

        let gate = Arc::new(WatchGate::new());
        let events = Arc::clone(&self.events);
        let watcher_gate = Arc::clone(&gate);
        let watcher = thread::spawn(move || {
            watch_loop(key, probe, watcher_gate, events);
        });

        self.lock_entries().push(Entry {
            key,
            connection: Arc::downgrade(connection),
            gate,
            check,
            watcher: Some(watcher),
        });
    }

    /// Unregister a connection. Its watcher thread winds down within one
    /// probe interval.
    pub fn remove(&self, connection: &ConnectionRef) {
        let mut entries = self.lock_entries();
        entries.retain_mut(|entry| {
            let matches = entry
                .connection
                .upgrade()
                .map(|live| Arc::ptr_eq(&live, connection))
                .unwrap_or(false);
            if matches {
                entry.stop();
            }
            !matches
        });
    }

    /// Block until at least one registered connection is ready, the set is
    /// woken, or `timeout` elapses. Returns the ready connections; an empty
    /// vector means timeout or manual wake.
    pub fn select(&self, timeout: Duration) -> Vec<SelectResult> {
        // Rearm watchers whose readiness was consumed by the previous call;
        // an undrained connection re-probes readable immediately, which makes
        // the set level-triggered.
        {
            let mut entries = self.lock_entries();
            entries.retain(|entry| {
                if entry.connection.strong_count() == 0 {
                    entry.gate.stop();
                    return false;
                }
                true
            });
            for entry in entries.iter() {
                entry.gate.rearm();
            }
        }

        let mut results = Vec::new();
        let Some(first) = self.events.pop_timeout(timeout) else {
            return results;
        };
        let mut pending = vec![first];
        while let Some(more) = self.events.try_pop() {
            pending.push(more);
        }

        let entries = self.lock_entries();
        let mut reported = Vec::new();
        for event in pending {
            match event {
                SetEvent::Wake => {}
                SetEvent::Ready { key, readiness } => {
                    if reported.contains(&key) {
                        continue;
                    }
                    let Some(entry) = entries.iter().find(|entry| entry.key == key) else {
                        continue; // removed between post and pop
                    };
                    let Some(connection) = entry.connection.upgrade() else {
                        continue;
                    };
                    // A Data event may be stale: the watcher can repost while
                    // the previous report was being drained. Re-validate.
                    if readiness == Readiness::Data
                        && entry.check.wait_readable(Duration::from_millis(1)) == ProbeResult::Idle
                    {
                        continue;
                    }
                    reported.push(key);
                    results.push(SelectResult {
                        connection,
                        readiness,
                    });
                }
            }
        }
        results
    }

    /// Interrupt a blocked [`select`](Self::select) from another thread.
    pub fn wake(&self) {
        self.events.push_front(SetEvent::Wake);
    }

    /// Stop all watcher threads and unblock any blocked `select`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut entries = self.lock_entries();
        for entry in entries.iter_mut() {
            entry.stop();
        }
        for entry in entries.iter_mut() {
            if let Some(watcher) = entry.watcher.take() {
                let _ = watcher.join();
            }
        }
        entries.clear();
        drop(entries);
        self.wake();
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Entry {
    fn stop(&self) {
        self.gate.stop();
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch_loop(
    key: u64,
    probe: Box<dyn super::ReadProbe>,
    gate: Arc<WatchGate>,
    events: Arc<BlockingQueue<SetEvent>>,
) {
    while gate.wait_armed() {
        let readiness = loop {
            match probe.wait_readable(WATCH_INTERVAL) {
                ProbeResult::Data => break Readiness::Data,
                ProbeResult::Closed => break Readiness::Closed,
                ProbeResult::Error => break Readiness::Error,
                ProbeResult::Idle => {
                    if gate.is_stopped() {
                        return;
                    }
                }
            }
        };
        let terminal = readiness != Readiness::Data;
        events.push(SetEvent::Ready { key, readiness });
        if terminal {
            return;
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::connection::PipeConnection;

    fn pipe_refs() -> (ConnectionRef, ConnectionRef) {
        let (a, b) = PipeConnection::pair().unwrap();
        (Arc::new(a) as ConnectionRef, Arc::new(b) as ConnectionRef)
    }

    #[test]
    fn select_times_out_with_no_data() {
        let set = ConnectionSet::new();
        let (a, _b) = pipe_refs();
        set.add(&a);

        let ready = set.select(Duration::from_millis(50));
        assert!(ready.is_empty());
    }

    #[test]
    fn select_reports_data_until_drained() {
        let set = ConnectionSet::new();
        let (a, b) = pipe_refs();
        set.add(&a);

        b.write(b"z").unwrap();

        let ready = set.select(Duration::from_secs(2));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].readiness, Readiness::Data);
        assert!(Arc::ptr_eq(&ready[0].connection, &a));

        // Not drained yet: the connection is reported ready again.
        let ready = set.select(Duration::from_secs(2));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].readiness, Readiness::Data);

        let mut buffer = [0u8; 1];
        ready[0].connection.read(&mut buffer).unwrap();
        let ready = set.select(Duration::from_millis(50));
        assert!(ready.is_empty());
    }

    #[test]
    fn select_reports_peer_close() {
        let set = ConnectionSet::new();
        let (a, b) = pipe_refs();
        set.add(&a);

        b.close();

        let ready = set.select(Duration::from_secs(2));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].readiness, Readiness::Closed);
    }

    #[test]
    fn wake_interrupts_blocked_select() {
        let set = Arc::new(ConnectionSet::new());
        let (a, _b) = pipe_refs();
        set.add(&a);

        let waker = {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                set.wake();
            })
        };

        let start = std::time::Instant::now();
        let ready = set.select(Duration::from_secs(10));
        assert!(ready.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    #[test]
    fn removed_connection_is_not_reported() {
        let set = ConnectionSet::new();
        let (a, b) = pipe_refs();
        set.add(&a);
        set.remove(&a);

        b.write(b"z").unwrap();
        let ready = set.select(Duration::from_millis(100));
        assert!(ready.is_empty());
    }
}
