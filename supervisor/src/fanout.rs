//! Per-instance handler sets for output chunks and lifecycle events.
//!
//! Handlers live in an arena of slots addressed by index. A delivery copies
//! the occupied slots out under the arena lock, releases it, and then calls
//! each handler through that slot's gate. `unsubscribe` clears the slot's
//! active flag and then passes through the gate, so once it returns the
//! handler can no longer be running or be called again. A handler that
//! unsubscribes itself skips the gate wait because its own delivery already
//! holds it.

use std::cell::RefCell;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::warn;

type Handler<T> = Box<dyn Fn(&T) + Send + Sync + 'static>;

thread_local! {
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct Slot<T> {
    handler: Handler<T>,
    active: AtomicBool,
    gate: StdMutex<()>,
}

impl<T> Slot<T> {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }

    fn deliver(self: &Arc<Self>, label: &'static str, item: &T) {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let _delivering = DeliveringMarker::enter(self.key());
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.handler)(item))) {
            warn!(
                fanout = label,
                panic = panic_message(panic.as_ref()),
                "subscriber panicked; continuing delivery"
            );
        }
    }
}

struct DeliveringMarker {
    key: usize,
}

impl DeliveringMarker {
    fn enter(key: usize) -> Self {
        DELIVERING.with(|keys| keys.borrow_mut().push(key));
        Self { key }
    }

    fn is_delivering(key: usize) -> bool {
        DELIVERING.with(|keys| keys.borrow().contains(&key))
    }
}

impl Drop for DeliveringMarker {
    fn drop(&mut self) {
        DELIVERING.with(|keys| {
            let mut keys = keys.borrow_mut();
            if let Some(pos) = keys.iter().rposition(|key| *key == self.key) {
                keys.remove(pos);
            }
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic>"
    }
}

struct Arena<T> {
    slots: Vec<Option<Arc<Slot<T>>>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    fn insert(&mut self, slot: Arc<Slot<T>>) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, index: usize, slot: &Arc<Slot<T>>) {
        let Some(entry) = self.slots.get_mut(index) else {
            return;
        };
        if entry.as_ref().is_some_and(|current| Arc::ptr_eq(current, slot)) {
            *entry = None;
            self.free.push(index);
        }
    }

    fn occupied(&self) -> Vec<Arc<Slot<T>>> {
        self.slots.iter().flatten().cloned().collect()
    }
}

pub(crate) struct Fanout<T> {
    label: &'static str,
    arena: Arc<StdMutex<Arena<T>>>,
}

impl<T: 'static> Fanout<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            arena: Arc::new(StdMutex::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let slot = Arc::new(Slot {
            handler: Box::new(handler),
            active: AtomicBool::new(true),
            gate: StdMutex::new(()),
        });
        let index = self.lock().insert(Arc::clone(&slot));
        Subscription {
            detach: Arc::new(SlotRef {
                arena: Arc::downgrade(&self.arena),
                slot: Arc::downgrade(&slot),
                index,
            }),
        }
    }

    /// Calls every handler registered at the moment of the call.
    pub fn deliver(&self, item: &T) {
        let slots = self.lock().occupied();
        for slot in slots {
            slot.deliver(self.label, item);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().slots.iter().flatten().count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Arena<T>> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for Fanout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fanout").field("label", &self.label).finish()
    }
}

trait Detach: Send + Sync {
    fn detach(&self);
}

struct SlotRef<T> {
    arena: Weak<StdMutex<Arena<T>>>,
    slot: Weak<Slot<T>>,
    index: usize,
}

impl<T: 'static> Detach for SlotRef<T> {
    fn detach(&self) {
        let Some(slot) = self.slot.upgrade() else {
            return;
        };
        slot.active.store(false, Ordering::SeqCst);
        if let Some(arena) = self.arena.upgrade() {
            arena
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.index, &slot);
        }
        if DeliveringMarker::is_delivering(slot.key()) {
            return;
        }
        // Wait out a delivery that passed the active check before we flipped it.
        drop(slot.gate.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Handle returned by `subscribe`. Calling [`Subscription::unsubscribe`]
/// removes exactly the handler it was created for; dropping it leaves the
/// handler registered.
#[derive(Clone)]
pub struct Subscription {
    detach: Arc<dyn Detach>,
}

impl Subscription {
    /// Idempotent. After it returns the handler receives nothing further.
    pub fn unsubscribe(&self) {
        self.detach.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
