//! The wheel proper: 64 slots per level, level-k slots are 64^k ms wide.
//!
//! Slot positions are relative to the owning [`Timer`]'s start basis and
//! are never rebased: the basis only advances in whole child-span units
//! (the root's rotation granularity). Within a span, successive polls fire
//! a growing prefix of the wheel, which is idempotent because fired slots
//! are left empty. This keeps firing exact to one millisecond at every
//! level without cascaded re-insertion.
//!
//! [`Timer`]: super::Timer

use super::{MAX_LEVEL, SLOT_COUNT, SLOT_SHIFT, TimerEntry};
use smallvec::SmallVec;

/// Total span of a wheel rooted at `level`: 64^(level+1) ms.
pub(crate) fn span_ms(level: u8) -> u64 {
    1u64 << (SLOT_SHIFT * (level as u32 + 1))
}

/// Width of one slot at `level`: 64^level ms.
fn child_span_ms(level: u8) -> u64 {
    1u64 << (SLOT_SHIFT * level as u32)
}

#[derive(Debug)]
enum Slot {
    Vacant,
    /// Levels above zero hold one child wheel per occupied slot.
    Child(Box<Wheel>),
    /// Level zero holds the entries themselves.
    Leaf(Vec<TimerEntry>),
}

impl Slot {
    fn is_vacant(&self) -> bool {
        matches!(self, Slot::Vacant)
    }
}

#[derive(Debug)]
pub(super) struct Wheel {
    level: u8,
    /// Bit i set iff slot i is occupied; `trailing_zeros` finds the
    /// earliest pending slot.
    bitmap: u64,
    slots: Box<[Slot; SLOT_COUNT as usize]>,
}

impl Wheel {
    pub(super) fn new(level: u8) -> Self {
        debug_assert!(level <= MAX_LEVEL);
        let slots: Vec<Slot> = (0..SLOT_COUNT).map(|_| Slot::Vacant).collect();
        let slots: Box<[Slot]> = slots.into_boxed_slice();
        Self {
            level,
            bitmap: 0,
            slots: unsafe { Box::from_raw(Box::into_raw(slots).cast()) },
        }
    }

    /// Promotes `child` to slot 0 of a new wheel one level up.
    pub(super) fn wrap(child: Wheel) -> Self {
        debug_assert!(child.level < MAX_LEVEL);
        let mut wheel = Wheel::new(child.level + 1);
        wheel.bitmap = if child.is_empty() { 0 } else { 1 };
        wheel.slots[0] = Slot::Child(Box::new(child));
        wheel
    }

    pub(super) fn level(&self) -> u8 {
        self.level
    }

    pub(super) fn span_ms(&self) -> u64 {
        span_ms(self.level)
    }

    fn child_shift(&self) -> u32 {
        SLOT_SHIFT * self.level as u32
    }

    pub(super) fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    /// Inserts an entry at `interval` ms from the basis. The caller has
    /// checked `interval < self.span_ms()`.
    pub(super) fn add(&mut self, entry: TimerEntry, interval: u64) {
        let idx = (interval >> self.child_shift()) as usize;
        debug_assert!(idx < SLOT_COUNT as usize);

        if self.level == 0 {
            match &mut self.slots[idx] {
                Slot::Leaf(entries) => entries.push(entry),
                slot @ Slot::Vacant => *slot = Slot::Leaf(vec![entry]),
                Slot::Child(_) => unreachable!("level zero holds leaves"),
            }
        } else {
            let child_interval = interval & (child_span_ms(self.level) - 1);
            match &mut self.slots[idx] {
                Slot::Child(child) => child.add(entry, child_interval),
                slot @ Slot::Vacant => {
                    let mut child = Wheel::new(self.level - 1);
                    child.add(entry, child_interval);
                    *slot = Slot::Child(Box::new(child));
                }
                Slot::Leaf(_) => unreachable!("leaves only at level zero"),
            }
        }

        self.bitmap |= 1 << idx;
    }

    /// Unlinks the entry with `id` inserted at `interval`. Returns whether
    /// it was found.
    pub(super) fn remove(&mut self, id: u64, interval: u64) -> bool {
        let idx = (interval >> self.child_shift()) as usize;
        if idx >= SLOT_COUNT as usize || self.slots[idx].is_vacant() {
            return false;
        }

        let found = match &mut self.slots[idx] {
            Slot::Leaf(entries) => match entries.iter().position(|e| e.id == id) {
                Some(pos) => {
                    entries.swap_remove(pos);
                    true
                }
                None => false,
            },
            Slot::Child(child) => {
                let child_interval = interval & (child_span_ms(self.level) - 1);
                child.remove(id, child_interval)
            }
            Slot::Vacant => false,
        };

        let emptied = match &self.slots[idx] {
            Slot::Leaf(entries) => entries.is_empty(),
            Slot::Child(child) => child.is_empty(),
            Slot::Vacant => true,
        };
        if emptied {
            self.slots[idx] = Slot::Vacant;
            self.bitmap &= !(1 << idx);
        }

        found
    }

    /// Fires every entry in the prefix `[0, elapsed)` ms. Idempotent: fired
    /// slots are emptied, so re-firing a longer prefix later only picks up
    /// what newly expired.
    pub(super) fn fire(&mut self, elapsed: u64, out: &mut SmallVec<[TimerEntry; 8]>) {
        if self.bitmap == 0 || elapsed == 0 {
            return;
        }

        let full = (elapsed >> self.child_shift()).min(SLOT_COUNT);
        for idx in 0..full as usize {
            if self.bitmap & (1 << idx) == 0 {
                continue;
            }
            match std::mem::replace(&mut self.slots[idx], Slot::Vacant) {
                Slot::Leaf(entries) => out.extend(entries),
                Slot::Child(mut child) => {
                    child.fire(child.span_ms(), out);
                }
                Slot::Vacant => {}
            }
            self.bitmap &= !(1 << idx);
        }

        // The slot at `full` is only partially crossed; its child fires the
        // sub-span prefix recursively. Level zero has nothing partial: one
        // slot is one millisecond.
        if self.level > 0 && full < SLOT_COUNT {
            let partial = elapsed & (child_span_ms(self.level) - 1);
            let idx = full as usize;
            if partial > 0
                && self.bitmap & (1 << idx) != 0
                && let Slot::Child(child) = &mut self.slots[idx]
            {
                child.fire(partial, out);
                if child.is_empty() {
                    self.slots[idx] = Slot::Vacant;
                    self.bitmap &= !(1 << idx);
                }
            }
        }
    }

    /// Rotates out the whole slots covered by `elapsed` and reports how
    /// many milliseconds were actually consumed; the timer advances its
    /// basis by exactly that amount.
    pub(super) fn rotate_elapsed(&mut self, elapsed: u64) -> u64 {
        let full = (elapsed >> self.child_shift()).min(SLOT_COUNT);
        if full == 0 {
            return 0;
        }

        let n = full as usize;
        if n >= SLOT_COUNT as usize {
            debug_assert_eq!(self.bitmap, 0, "rotating out live slots");
            for slot in self.slots.iter_mut() {
                *slot = Slot::Vacant;
            }
            self.bitmap = 0;
        } else {
            self.bitmap >>= n;
            for i in 0..SLOT_COUNT as usize - n {
                self.slots[i] = std::mem::replace(&mut self.slots[i + n], Slot::Vacant);
            }
            for i in SLOT_COUNT as usize - n..SLOT_COUNT as usize {
                self.slots[i] = Slot::Vacant;
            }
        }

        full << self.child_shift()
    }

    /// Offset in ms from the basis to the earliest pending entry.
    pub(super) fn next_deadline_offset(&self) -> Option<u64> {
        if self.bitmap == 0 {
            return None;
        }
        let first = self.bitmap.trailing_zeros() as u64;
        let base = first << self.child_shift();

        match &self.slots[first as usize] {
            Slot::Leaf(_) => Some(base),
            Slot::Child(child) => Some(base + child.next_deadline_offset().unwrap_or(0)),
            Slot::Vacant => unreachable!("bitmap marked a vacant slot"),
        }
    }

    /// Unwraps the root into its slot-0 child when every other slot is
    /// empty. Errors back with `self` when the wheel cannot shrink.
    pub(super) fn try_unwrap(self) -> Result<Wheel, Wheel> {
        if self.level == 0 || self.bitmap & !1 != 0 {
            return Err(self);
        }

        let mut this = self;
        match std::mem::replace(&mut this.slots[0], Slot::Vacant) {
            Slot::Child(child) => Ok(*child),
            // Slot 0 is empty too; hand back an empty wheel one level down.
            Slot::Vacant => Ok(Wheel::new(this.level - 1)),
            Slot::Leaf(_) => unreachable!("leaves only at level zero"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::TimerKind;
    use super::*;

    fn entry(id: u64) -> TimerEntry {
        TimerEntry {
            id,
            kind: TimerKind::IoTimeout(id as usize),
        }
    }

    #[test]
    fn test_level_zero_prefix_fire_is_idempotent() {
        let mut wheel = Wheel::new(0);
        wheel.add(entry(1), 5);
        wheel.add(entry(2), 20);

        let mut out = SmallVec::new();
        wheel.fire(10, &mut out);
        assert_eq!(out.len(), 1);

        // Re-firing the same prefix picks up nothing new.
        wheel.fire(10, &mut out);
        assert_eq!(out.len(), 1);

        wheel.fire(21, &mut out);
        assert_eq!(out.len(), 2);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_rotate_consumes_whole_slots_only() {
        let mut wheel = Wheel::new(1);
        wheel.add(entry(1), 100);

        // 70 ms covers one whole 64 ms slot.
        let mut out = SmallVec::new();
        wheel.fire(70, &mut out);
        assert!(out.is_empty());
        assert_eq!(wheel.rotate_elapsed(70), 64);

        // The entry moved down one slot: now 36 ms out.
        assert_eq!(wheel.next_deadline_offset(), Some(100 - 64));
    }

    #[test]
    fn test_wrap_and_unwrap() {
        let mut wheel = Wheel::new(0);
        wheel.add(entry(1), 3);

        let wrapped = Wheel::wrap(wheel);
        assert_eq!(wrapped.level(), 1);
        assert_eq!(wrapped.next_deadline_offset(), Some(3));

        let unwrapped = wrapped.try_unwrap().unwrap();
        assert_eq!(unwrapped.level(), 0);
        assert_eq!(unwrapped.next_deadline_offset(), Some(3));
    }

    #[test]
    fn test_unwrap_refused_with_upper_slots_occupied() {
        let mut wheel = Wheel::new(1);
        wheel.add(entry(1), 2000);
        assert!(wheel.try_unwrap().is_err());
    }
}
