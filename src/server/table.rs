use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Stable handle to a live entry of a [`ConnTable`].
///
/// A handle packs into the 64-bit work request ID of every request posted
/// for its connection, so completions find their connection without
/// carrying addresses. Handles of removed entries never resolve again.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Conn#{}v{}", self.index, self.generation))
    }
}

impl ConnHandle {
    /// Work request ID for requests posted on behalf of this connection.
    #[inline]
    pub fn wr_id(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub fn from_wr_id(wr_id: u64) -> Self {
        Self {
            index: wr_id as u32,
            generation: (wr_id >> 32) as u32,
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    fn reserve(&mut self) -> ConnHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                // Generation 0 is never handed out, so a zeroed ID is invalid.
                self.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        ConnHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn retire(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.value = None;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(index);
    }

    fn slot(&self, handle: ConnHandle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }
}

/// Generational arena of live connections.
///
/// The event thread inserts and removes entries while the completion
/// poller looks them up; entries are shared out as `Arc`s so a lookup never
/// holds the table lock.
pub struct ConnTable<T> {
    arena: Mutex<Arena<T>>,
}

impl<T> Default for ConnTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnTable<T> {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                len: 0,
            }),
        }
    }

    /// Insert the entry built by `f`, which receives the handle the entry
    /// will live under. The handle resolves only after `f` succeeds.
    pub fn insert_with<E>(
        &self,
        f: impl FnOnce(ConnHandle) -> Result<T, E>,
    ) -> Result<(ConnHandle, Arc<T>), E> {
        let handle = self.arena.lock().reserve();
        match f(handle) {
            Ok(value) => {
                let value = Arc::new(value);
                let mut arena = self.arena.lock();
                arena.slots[handle.index as usize].value = Some(value.clone());
                arena.len += 1;
                Ok((handle, value))
            }
            Err(e) => {
                self.arena.lock().retire(handle.index);
                Err(e)
            }
        }
    }

    pub fn get(&self, handle: ConnHandle) -> Option<Arc<T>> {
        self.arena.lock().slot(handle)?.value.clone()
    }

    /// Remove an entry. Its handle stops resolving immediately.
    pub fn remove(&self, handle: ConnHandle) -> Option<Arc<T>> {
        let mut arena = self.arena.lock();
        let value = arena.slot(handle)?.value.clone()?;
        arena.retire(handle.index);
        arena.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.arena.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handles() {
        let table = ConnTable::new();
        let (a, _) = table.insert_with(|_| Ok::<_, ()>("a")).unwrap();
        let (b, _) = table.insert_with(|_| Ok::<_, ()>("b")).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(*table.get(a).unwrap(), "a");

        assert_eq!(*table.remove(a).unwrap(), "a");
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());

        // The slot is reused under a new generation.
        let (c, _) = table.insert_with(|_| Ok::<_, ()>("c")).unwrap();
        assert_ne!(a, c);
        assert!(table.get(a).is_none());
        assert_eq!(*table.get(c).unwrap(), "c");
        assert_eq!(*table.get(b).unwrap(), "b");
    }

    #[test]
    fn test_failed_insert() {
        let table = ConnTable::<u32>::new();
        let mut seen = None;
        let err = table.insert_with(|h| {
            seen = Some(h);
            Err("no memory")
        });
        assert_eq!(err.unwrap_err(), "no memory");
        assert!(table.is_empty());
        assert!(table.get(seen.unwrap()).is_none());
    }

    #[test]
    fn test_wr_id_packing() {
        let table = ConnTable::new();
        let (h, _) = table.insert_with(|h| Ok::<_, ()>(h.wr_id())).unwrap();
        assert_ne!(h.wr_id(), 0);
        let back = ConnHandle::from_wr_id(h.wr_id());
        assert_eq!(back, h);
        assert_eq!(*table.get(back).unwrap(), h.wr_id());
        assert!(table.get(ConnHandle::from_wr_id(0)).is_none());
    }
}
