use crate::native::StmtHandle;

/// Stable reference to a statement owned by a connection. A key goes stale
/// when its statement is dropped or the connection disconnects; stale keys
/// never resolve again, even if the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StmtKey {
    index: u32,
    generation: u32,
}

impl StmtKey {
    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug)]
enum SlotState {
    Vacant,
    /// Registered; `None` until (or unless) the native prepare succeeds.
    Occupied(Option<StmtHandle>),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: SlotState,
}

/// Statements of one connection, addressed by generation-checked keys.
#[derive(Debug, Default)]
pub struct StatementArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl StatementArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a statement with no native handle yet.
    pub fn insert(&mut self) -> StmtKey {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = SlotState::Occupied(None);
            return StmtKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            state: SlotState::Occupied(None),
        });
        StmtKey {
            index,
            generation: 0,
        }
    }

    fn slot(&self, key: StmtKey) -> Option<&Slot> {
        self.slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation)
    }

    pub fn contains(&self, key: StmtKey) -> bool {
        matches!(self.slot(key), Some(Slot { state: SlotState::Occupied(_), .. }))
    }

    /// `None` for a stale key; `Some(None)` for a registered statement
    /// without a native handle.
    pub fn get(&self, key: StmtKey) -> Option<Option<StmtHandle>> {
        match self.slot(key)?.state {
            SlotState::Occupied(handle) => Some(handle),
            SlotState::Vacant => None,
        }
    }

    pub fn set_handle(&mut self, key: StmtKey, handle: Option<StmtHandle>) -> bool {
        match self.slots.get_mut(key.index as usize) {
            Some(slot) if slot.generation == key.generation => match &mut slot.state {
                SlotState::Occupied(h) => {
                    *h = handle;
                    true
                }
                SlotState::Vacant => false,
            },
            _ => false,
        }
    }

    /// Unregisters the statement, returning its native handle slot, or
    /// `None` when the key was already stale.
    pub fn remove(&mut self, key: StmtKey) -> Option<Option<StmtHandle>> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let SlotState::Occupied(handle) = std::mem::replace(&mut slot.state, SlotState::Vacant)
        else {
            return None;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        Some(handle)
    }

    /// Unregisters every statement, returning the native handles to free.
    pub fn drain(&mut self) -> Vec<StmtHandle> {
        let mut handles = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let SlotState::Occupied(handle) =
                std::mem::replace(&mut slot.state, SlotState::Vacant)
            {
                handles.extend(handle);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live = 0;
        handles
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
