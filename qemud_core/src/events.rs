//! Event Subsystem (spec §4.7, component C8): a FIFO of lifecycle events
//! plus timer-driven dispatch to per-connection callbacks. Grounded on the
//! teacher's `write_metrics_event` timer-on-epoll pattern in
//! `vmm/src/lib.rs`, generalized from one fixed periodic action to an
//! arbitrary registered callback set.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDetail {
    None,
    Added,
    Booted,
    Shutdown,
    Failed,
    Saved,
    Migrated,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub vm_uuid: String,
    pub vm_name: String,
    /// -1 for a VM that is SHUTOFF at the time the event fired.
    pub vm_id: i64,
    pub kind: EventKind,
    pub detail: EventDetail,
}

pub type CallbackId = u64;

struct CallbackEntry {
    id: CallbackId,
    /// `Some(uuid)` restricts delivery to that VM; `None` means all VMs.
    filter: Option<String>,
    func: Box<dyn Fn(&Event) + Send + Sync>,
    pending_removal: AtomicBool,
}

/// The FIFO plus registered callbacks. Mutation is always under this
/// struct's own locks, never the driver lock (spec §4.7: "mutation under
/// the registry lock" refers to the *driver* queuing events while it
/// already holds that lock for an unrelated reason; the queue's own
/// locking here is independent and private).
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    callbacks: Mutex<Vec<Arc<CallbackEntry>>>,
    next_id: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            queue: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Pushes `event`; returns `true` if the queue was empty beforehand,
    /// i.e. the caller should arm its 0ms dispatch timer.
    pub fn push(&self, event: Event) -> bool {
        let mut q = self.queue.lock().unwrap();
        let was_empty = q.is_empty();
        q.push_back(event);
        was_empty
    }

    pub fn register<F>(&self, filter: Option<String>, func: F) -> CallbackId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(CallbackEntry {
            id,
            filter,
            func: Box::new(func),
            pending_removal: AtomicBool::new(false),
        });
        self.callbacks.lock().unwrap().push(entry);
        id
    }

    /// Deregistration during dispatch only marks the entry; it is actually
    /// removed once `dispatch` finishes flushing (spec §4.7).
    pub fn deregister(&self, id: CallbackId) {
        let cbs = self.callbacks.lock().unwrap();
        if let Some(entry) = cbs.iter().find(|c| c.id == id) {
            entry.pending_removal.store(true, Ordering::SeqCst);
        }
    }

    /// Drains the queue and delivers each event to every still-registered,
    /// filter-matching callback, releasing the callback lock across each
    /// invocation so a callback may re-enter (register, deregister, or
    /// push another event).
    pub fn dispatch(&self) {
        let events: Vec<Event> = {
            let mut q = self.queue.lock().unwrap();
            q.drain(..).collect()
        };
        for event in &events {
            let targets: Vec<Arc<CallbackEntry>> = {
                let cbs = self.callbacks.lock().unwrap();
                cbs.iter()
                    .filter(|c| !c.pending_removal.load(Ordering::SeqCst))
                    .filter(|c| c.filter.as_deref().map_or(true, |f| f == event.vm_uuid))
                    .cloned()
                    .collect()
            };
            for cb in targets {
                (cb.func)(event);
            }
        }
        self.callbacks
            .lock()
            .unwrap()
            .retain(|c| !c.pending_removal.load(Ordering::SeqCst));
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(uuid: &str, kind: EventKind, detail: EventDetail) -> Event {
        Event {
            vm_uuid: uuid.to_string(),
            vm_name: "alpha".to_string(),
            vm_id: 1,
            kind,
            detail,
        }
    }

    #[test]
    fn test_push_reports_empty_to_nonempty_transition() {
        let q = EventQueue::new();
        assert!(q.push(event("u1", EventKind::Defined, EventDetail::Added)));
        assert!(!q.push(event("u1", EventKind::Started, EventDetail::Booted)));
    }

    #[test]
    fn test_dispatch_delivers_in_order_to_matching_callback() {
        let q = EventQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        q.register(Some("u1".to_string()), move |e: &Event| {
            seen_clone.lock().unwrap().push(e.kind);
        });
        q.push(event("u1", EventKind::Defined, EventDetail::Added));
        q.push(event("u2", EventKind::Defined, EventDetail::Added));
        q.push(event("u1", EventKind::Started, EventDetail::Booted));
        q.dispatch();
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Defined, EventKind::Started]);
    }

    #[test]
    fn test_deregister_during_dispatch_takes_effect_after_flush() {
        let q = Arc::new(EventQueue::new());
        let count = Arc::new(AtomicUsize::new(0));
        let id_cell: Arc<Mutex<u64>> = Arc::new(Mutex::new(0));

        let q_clone = q.clone();
        let count_clone = count.clone();
        let id_cell_clone = id_cell.clone();
        let id = q.register(None, move |_e: &Event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            let id = *id_cell_clone.lock().unwrap();
            if id != 0 {
                q_clone.deregister(id);
            }
        });
        *id_cell.lock().unwrap() = id;

        q.push(event("u1", EventKind::Defined, EventDetail::Added));
        q.push(event("u1", EventKind::Started, EventDetail::Booted));
        q.dispatch();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        q.push(event("u1", EventKind::Stopped, EventDetail::Shutdown));
        q.dispatch();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
