//! Three-slot exchange between the render thread and the scope reader.
//!
//! The writer fills its private slot and swaps it with the shared middle slot;
//! the reader swaps the middle slot into its own view when it is fresh. Neither
//! side waits and a read never observes a half-written slot.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

// State byte: [fresh:1][unused:1][back:2][middle:2][front:2]
const FRONT_SHIFT: u8 = 0;
const MIDDLE_SHIFT: u8 = 2;
const BACK_SHIFT: u8 = 4;
const SLOT_MASK: u8 = 0b11;
const FRESH: u8 = 0x80;
const INITIAL: u8 = (2 << BACK_SHIFT) | (1 << MIDDLE_SHIFT);

struct Slots<T> {
    slots: [UnsafeCell<T>; 3],
    state: AtomicU8,
}

// Each slot is owned by exactly one role at a time through `state`.
unsafe impl<T: Send> Send for Slots<T> {}
unsafe impl<T: Send> Sync for Slots<T> {}

fn slot(state: u8, shift: u8) -> u8 {
    (state >> shift) & SLOT_MASK
}

impl<T> Slots<T> {
    fn swap(&self, next: impl Fn(u8) -> Option<u8>) {
        let mut current = self.state.load(Ordering::Acquire);
        while let Some(new_state) = next(current) {
            match self.state.compare_exchange_weak(
                current,
                new_state,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn index(&self, shift: u8) -> usize {
        slot(self.state.load(Ordering::Acquire), shift) as usize
    }
}

/// Producer half, owned by the render thread.
pub struct SnapshotWriter<T> {
    shared: Arc<Slots<T>>,
}

impl<T> SnapshotWriter<T> {
    /// Private slot for in-place updates. Contents are whatever was last
    /// handed back by the reader, not necessarily the latest publish.
    pub fn back_mut(&mut self) -> &mut T {
        let index = self.shared.index(BACK_SHIFT);
        // Only the writer touches the back slot, and `&mut self` keeps it unique.
        unsafe { &mut *self.shared.slots[index].get() }
    }

    /// Makes the back slot visible to the reader.
    pub fn publish(&mut self) {
        self.shared.swap(|state| {
            Some(
                (slot(state, MIDDLE_SHIFT) << BACK_SHIFT)
                    | (slot(state, BACK_SHIFT) << MIDDLE_SHIFT)
                    | (slot(state, FRONT_SHIFT) << FRONT_SHIFT)
                    | FRESH,
            )
        });
    }
}

/// Consumer half.
pub struct SnapshotReader<T> {
    shared: Arc<Slots<T>>,
}

impl<T> SnapshotReader<T> {
    /// Runs `f` on the newest published value.
    pub fn with<R>(&mut self, f: impl FnOnce(&T) -> R) -> R {
        self.shared.swap(|state| {
            (state & FRESH != 0).then(|| {
                (slot(state, BACK_SHIFT) << BACK_SHIFT)
                    | (slot(state, FRONT_SHIFT) << MIDDLE_SHIFT)
                    | (slot(state, MIDDLE_SHIFT) << FRONT_SHIFT)
            })
        });
        let index = self.shared.index(FRONT_SHIFT);
        // Only the reader touches the front slot, and `&mut self` keeps it unique.
        unsafe { f(&*self.shared.slots[index].get()) }
    }
}

/// Creates a writer/reader pair with every slot set to `initial`.
pub fn snapshot_channel<T: Clone>(initial: T) -> (SnapshotWriter<T>, SnapshotReader<T>) {
    let shared = Arc::new(Slots {
        slots: [
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial),
        ],
        state: AtomicU8::new(INITIAL),
    });
    (
        SnapshotWriter {
            shared: Arc::clone(&shared),
        },
        SnapshotReader { shared },
    )
}
