use core::ops::RangeInclusive;

use bitfield_struct::bitfield;

use crate::{CHILD_SIZE, TREE_SIZE, atomic::Packed};

/// Below this a tree counts as (almost) full.
pub(crate) const TREE_LOWER_LIM: usize = TREE_SIZE / 16;
/// Above this a tree counts as (almost) free.
pub(crate) const TREE_UPPER_LIM: usize = TREE_SIZE - 8 * CHILD_SIZE;

/// Free counter of a group of children.
///
/// While a core holds the tree as its reservation, the free frames are
/// counted in the core's local data and the counter here only collects
/// frames freed by other cores.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub(crate) struct Tree {
  /// Free frames (0..=TREE_SIZE).
  #[bits(15)]
  pub free: u16,
  /// Reserved by a core.
  pub reserved: bool,
}

impl Packed for Tree {
  type Raw = u16;
}

/// Fragmentation class of a tree, used to order the search for new reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
  /// Less than `TREE_LOWER_LIM` free frames, or reserved.
  Full,
  /// Partially used trees are preferred to keep free trees intact.
  Partial,
  /// More than `TREE_UPPER_LIM` free frames.
  Free,
}

impl Band {
  /// Free frames a tree of this band can have.
  pub const fn range(self) -> RangeInclusive<usize> {
    match self {
      Band::Full => 0..=TREE_LOWER_LIM - 1,
      Band::Partial => TREE_LOWER_LIM..=TREE_UPPER_LIM,
      Band::Free => TREE_UPPER_LIM + 1..=TREE_SIZE,
    }
  }
}

impl Tree {
  pub const fn of(free: usize, reserved: bool) -> Self {
    Self::new().with_free(free as u16).with_reserved(reserved)
  }

  /// Takes the tree if it is unreserved and its counter lies in `range`.
  /// The counter is moved to the caller.
  pub fn reserve(self, range: &RangeInclusive<usize>) -> Option<Self> {
    (!self.reserved() && range.contains(&(self.free() as usize))).then(|| Self::of(0, true))
  }

  /// Returns `free` frames and releases the reservation.
  pub fn writeback(self, free: usize) -> Option<Self> {
    let free = self.free() as usize + free;
    (self.reserved() && free <= TREE_SIZE).then(|| Self::of(free, false))
  }

  pub fn inc(self, free: usize) -> Option<Self> {
    let free = self.free() as usize + free;
    (free <= TREE_SIZE).then(|| self.with_free(free as u16))
  }

  #[allow(dead_code)]
  pub fn dec(self, free: usize) -> Option<Self> {
    (self.free() as usize >= free).then(|| self.with_free((self.free() as usize - free) as u16))
  }

  /// Moves the whole counter to the caller, the tree stays (or becomes) reserved.
  pub fn steal_counter(self) -> Option<Self> {
    Some(Self::of(0, true))
  }

  pub fn band(self) -> Band {
    let free = self.free() as usize;
    if self.reserved() || free < TREE_LOWER_LIM {
      Band::Full
    } else if free <= TREE_UPPER_LIM {
      Band::Partial
    } else {
      Band::Free
    }
  }
}
