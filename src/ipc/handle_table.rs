//! Handle Table - per-process handle to object translation
//!
//! A handle packs a slot index and a linear id:
//!
//! ```text
//!  31 30 29            15 14             0
//! +-----+----------------+----------------+
//! | 0 0 |   linear id    |     index      |
//! +-----+----------------+----------------+
//! ```
//!
//! Free slots form a singly linked free list threaded through the entries, so
//! allocation and release are O(1). Every allocation draws the next value of
//! a per-table linear id counter (1..=0x7FFF, wrapping) and stamps it into
//! the slot. A freed slot forgets its id, so a stale handle never matches,
//! and a reused slot carries a fresh id.
//!
//! Two pseudo-handles name the calling thread and process and never touch
//! the table.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::trace;

use crate::kern::kernel::Kernel;
use crate::kern::lock::InterruptSpinLock;
use crate::kern::object::{KernelObject, ObjectType};
use crate::result::{KernelError, KernelResult};

/// Process-relative object handle
pub type Handle = u32;

pub const INVALID_HANDLE: Handle = 0;

/// Pseudo-handle for the calling thread
pub const PSEUDO_CURRENT_THREAD: Handle = 0xFFFF_8000;

/// Pseudo-handle for the calling process
pub const PSEUDO_CURRENT_PROCESS: Handle = 0xFFFF_8001;

const INDEX_BITS: u32 = 15;
const LINEAR_ID_BITS: u32 = 15;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const LINEAR_ID_MASK: u32 = (1 << LINEAR_ID_BITS) - 1;
const RESERVED_SHIFT: u32 = INDEX_BITS + LINEAR_ID_BITS;

const MIN_LINEAR_ID: u16 = 1;
const MAX_LINEAR_ID: u16 = 0x7FFF;

#[inline]
pub const fn encode_handle(index: u16, linear_id: u16) -> Handle {
    (index as u32 & INDEX_MASK) | ((linear_id as u32 & LINEAR_ID_MASK) << INDEX_BITS)
}

/// Split a handle into (index, linear id, reserved bits)
#[inline]
pub const fn decode_handle(handle: Handle) -> (u16, u16, u32) {
    (
        (handle & INDEX_MASK) as u16,
        ((handle >> INDEX_BITS) & LINEAR_ID_MASK) as u16,
        handle >> RESERVED_SHIFT,
    )
}

#[inline]
pub const fn is_pseudo_handle(handle: Handle) -> bool {
    handle == PSEUDO_CURRENT_THREAD || handle == PSEUDO_CURRENT_PROCESS
}

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug)]
enum Entry {
    Free {
        next: Option<u16>,
    },
    /// `object` is `None` while the slot is reserved but not registered
    Used {
        linear_id: u16,
        object: Option<KernelObject>,
    },
}

#[derive(Debug)]
struct TableState {
    entries: Vec<Entry>,
    free_head: Option<u16>,
    next_linear_id: u16,
    count: usize,
    max_count: usize,
}

impl TableState {
    fn new(size: usize) -> Self {
        let entries = (0..size)
            .map(|index| Entry::Free {
                next: if index + 1 < size {
                    Some(index as u16 + 1)
                } else {
                    None
                },
            })
            .collect();
        Self {
            entries,
            free_head: if size > 0 { Some(0) } else { None },
            next_linear_id: MIN_LINEAR_ID,
            count: 0,
            max_count: 0,
        }
    }

    fn allocate_linear_id(&mut self) -> u16 {
        let id = self.next_linear_id;
        self.next_linear_id = if id >= MAX_LINEAR_ID {
            MIN_LINEAR_ID
        } else {
            id + 1
        };
        id
    }

    fn allocate(&mut self, object: Option<KernelObject>) -> KernelResult<Handle> {
        let Some(index) = self.free_head else {
            return Err(KernelError::OutOfHandles);
        };
        let next = match self.entries[index as usize] {
            Entry::Free { next } => next,
            Entry::Used { .. } => panic!("handle table free list points at used slot {}", index),
        };
        self.free_head = next;
        let linear_id = self.allocate_linear_id();
        self.entries[index as usize] = Entry::Used { linear_id, object };
        self.count += 1;
        self.max_count = self.max_count.max(self.count);
        Ok(encode_handle(index, linear_id))
    }

    fn free(&mut self, index: u16) -> Option<KernelObject> {
        let entry = core::mem::replace(
            &mut self.entries[index as usize],
            Entry::Free {
                next: self.free_head,
            },
        );
        self.free_head = Some(index);
        self.count -= 1;
        match entry {
            Entry::Used { object, .. } => object,
            Entry::Free { .. } => panic!("freeing free handle slot {}", index),
        }
    }

    /// Slot index of a live or reserved handle
    fn lookup(&self, handle: Handle) -> Option<u16> {
        let (index, linear_id, reserved) = decode_handle(handle);
        if reserved != 0 || linear_id == 0 {
            return None;
        }
        match self.entries.get(index as usize)? {
            Entry::Used { linear_id: id, .. } if *id == linear_id => Some(index),
            _ => None,
        }
    }

    fn object(&self, handle: Handle) -> Option<&KernelObject> {
        let index = self.lookup(handle)?;
        match &self.entries[index as usize] {
            Entry::Used { object, .. } => object.as_ref(),
            Entry::Free { .. } => None,
        }
    }
}

// ============================================================================
// Handle Table
// ============================================================================

pub struct HandleTable {
    kernel: Arc<Kernel>,
    size: usize,
    state: InterruptSpinLock<TableState>,
}

impl HandleTable {
    pub fn new(kernel: &Arc<Kernel>, size: usize) -> Self {
        let size = size.clamp(1, 1 << INDEX_BITS);
        Self {
            kernel: kernel.clone(),
            size,
            state: InterruptSpinLock::new(TableState::new(size)),
        }
    }

    fn lock(&self) -> crate::kern::lock::InterruptSpinLockGuard<'_, TableState> {
        self.state.lock(&**self.kernel.platform())
    }

    pub fn table_size(&self) -> usize {
        self.size
    }

    /// Live and reserved handles
    pub fn count(&self) -> usize {
        self.lock().count
    }

    /// High-water mark of `count`
    pub fn max_count(&self) -> usize {
        self.lock().max_count
    }

    /// Store `object` in a free slot and return its handle
    pub fn add(&self, object: KernelObject) -> KernelResult<Handle> {
        let handle = self.lock().allocate(Some(object))?;
        trace!("handle {:#x} added", handle);
        Ok(handle)
    }

    /// Claim a slot without an object; fill it with [`register`](Self::register)
    pub fn reserve(&self) -> KernelResult<Handle> {
        self.lock().allocate(None)
    }

    /// Place `object` in a reserved slot
    pub fn register(&self, handle: Handle, object: KernelObject) {
        let mut state = self.lock();
        let index = match state.lookup(handle) {
            Some(index) => index,
            None => panic!("registering unreserved handle {:#x}", handle),
        };
        match &mut state.entries[index as usize] {
            Entry::Used { object: slot @ None, .. } => *slot = Some(object),
            _ => panic!("registering handle {:#x} twice", handle),
        }
    }

    /// Give back a reserved slot that was never registered
    pub fn unreserve(&self, handle: Handle) {
        let mut state = self.lock();
        if let Some(index) = state.lookup(handle) {
            if matches!(state.entries[index as usize], Entry::Used { object: None, .. }) {
                state.free(index);
            }
        }
    }

    /// Close a handle. Returns false for pseudo-handles and unknown values.
    pub fn remove(&self, handle: Handle) -> bool {
        if is_pseudo_handle(handle) {
            return false;
        }
        let object = {
            let mut state = self.lock();
            let Some(index) = state.lookup(handle) else {
                return false;
            };
            if matches!(state.entries[index as usize], Entry::Used { object: None, .. }) {
                return false;
            }
            state.free(index)
        };
        trace!("handle {:#x} closed", handle);
        // The reference is released outside the table lock
        drop(object);
        true
    }

    /// Object behind `handle`, resolving pseudo-handles for the caller
    pub fn get_object(&self, handle: Handle) -> KernelResult<KernelObject> {
        match handle {
            PSEUDO_CURRENT_THREAD => self
                .kernel
                .current_thread()
                .map(KernelObject::Thread)
                .ok_or(KernelError::InvalidHandle),
            PSEUDO_CURRENT_PROCESS => self
                .kernel
                .current_process()
                .map(KernelObject::Process)
                .ok_or(KernelError::InvalidHandle),
            _ => self
                .lock()
                .object(handle)
                .cloned()
                .ok_or(KernelError::InvalidHandle),
        }
    }

    /// Typed lookup; a handle to another object type is invalid
    pub fn get<T: ObjectType>(&self, handle: Handle) -> KernelResult<Arc<T>> {
        self.get_object(handle)?
            .downcast::<T>()
            .ok_or(KernelError::InvalidHandle)
    }

    /// Live object in slot `index`, with its handle
    pub fn get_object_by_index(&self, index: usize) -> Option<(Handle, KernelObject)> {
        let state = self.lock();
        match state.entries.get(index)? {
            Entry::Used {
                linear_id,
                object: Some(object),
            } => Some((encode_handle(index as u16, *linear_id), object.clone())),
            _ => None,
        }
    }

    /// Close every handle
    pub fn finalize(&self) {
        let objects: Vec<KernelObject> = {
            let mut state = self.lock();
            let size = state.entries.len();
            let mut objects = Vec::new();
            for index in 0..size {
                if matches!(state.entries[index], Entry::Used { .. }) {
                    if let Some(object) = state.free(index as u16) {
                        objects.push(object);
                    }
                }
            }
            objects
        };
        drop(objects);
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        self.finalize();
    }
}
