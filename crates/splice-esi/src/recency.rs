use crate::cache::FragmentEntry;

/// Index of the sentinel slot anchoring the circular list.
const SENTINEL: u32 = 0;

/// One resident fragment: its cache key and payload.
pub(crate) struct Occupant {
    pub key: String,
    pub entry: FragmentEntry,
}

struct Slot {
    prev: u32,
    next: u32,
    occupant: Option<Occupant>,
}

/// Fixed-capacity recency list over cached fragments.
///
/// Occupants live in a slab of `u32`-indexed slots threaded through a
/// circular doubly-linked list anchored at a sentinel, so splicing a slot
/// in or out never branches on head/tail edge cases: the sentinel's `next`
/// is the most recently used fragment and its `prev` the eviction
/// candidate.
///
/// The cache never deletes arbitrary entries, so the only way out of the
/// list is [`evict_oldest`](Self::evict_oldest); overwrites update the
/// occupant in place and [`touch`](Self::touch) it back to the front.
pub(crate) struct RecencyList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl RecencyList {
    /// A list with room for `capacity` fragments (plus the sentinel).
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity + 1);
        for _ in 0..=capacity {
            slots.push(Slot {
                prev: SENTINEL,
                next: SENTINEL,
                occupant: None,
            });
        }
        Self {
            slots,
            // Slot 0 is the sentinel; hand out low indices first.
            free: (1..=capacity as u32).rev().collect(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Admit a fragment at the most-recent end. Returns its slot index, or
    /// `None` when every slot is occupied — evict first, then retry.
    pub(crate) fn admit(&mut self, key: String, entry: FragmentEntry) -> Option<u32> {
        let index = self.free.pop()?;
        self.slots[index as usize].occupant = Some(Occupant { key, entry });
        self.link_front(index);
        self.len += 1;
        Some(index)
    }

    /// Record a use: splice the slot out of wherever it sits and relink it
    /// at the front. Touching the front slot is a harmless round trip.
    pub(crate) fn touch(&mut self, index: u32) {
        self.unlink(index);
        self.link_front(index);
    }

    /// Drop the least recently used fragment, reclaiming its slot, and
    /// hand back the occupant so the caller can unindex it.
    pub(crate) fn evict_oldest(&mut self) -> Option<Occupant> {
        let index = self.slots[SENTINEL as usize].prev;
        if index == SENTINEL {
            return None;
        }
        self.unlink(index);
        self.free.push(index);
        self.len -= 1;
        self.slots[index as usize].occupant.take()
    }

    pub(crate) fn occupant(&self, index: u32) -> Option<&Occupant> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.occupant.as_ref())
    }

    pub(crate) fn occupant_mut(&mut self, index: u32) -> Option<&mut Occupant> {
        self.slots
            .get_mut(index as usize)
            .and_then(|slot| slot.occupant.as_mut())
    }

    /// Walk occupants from most to least recently used.
    pub(crate) fn iter(&self) -> Residents<'_> {
        Residents {
            list: self,
            cursor: self.slots[SENTINEL as usize].next,
        }
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.prev, slot.next)
        };
        self.slots[prev as usize].next = next;
        self.slots[next as usize].prev = prev;
    }

    fn link_front(&mut self, index: u32) {
        let first = self.slots[SENTINEL as usize].next;
        {
            let slot = &mut self.slots[index as usize];
            slot.prev = SENTINEL;
            slot.next = first;
        }
        self.slots[first as usize].prev = index;
        self.slots[SENTINEL as usize].next = index;
    }
}

pub(crate) struct Residents<'a> {
    list: &'a RecencyList,
    cursor: u32,
}

impl<'a> Iterator for Residents<'a> {
    type Item = &'a Occupant;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == SENTINEL {
            return None;
        }
        let slot = &self.list.slots[self.cursor as usize];
        self.cursor = slot.next;
        slot.occupant.as_ref()
    }
}
