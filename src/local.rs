use bitfield_struct::bitfield;

use crate::{
  Error, Result, TREE_SIZE,
  atomic::{Atom, Packed, spin_until},
  tree_from_row,
};

/// Consecutive frees into the same tree that make it a candidate for reservation.
pub(crate) const LAST_FREES: usize = 4;

/// Reservation of one core.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub(crate) struct Reserved {
  /// Free frames of the reserved tree owned by this core.
  #[bits(15)]
  frames: u64,
  /// Row where the next search starts, also identifies the tree.
  #[bits(47)]
  row: u64,
  /// A tree is reserved.
  pub present: bool,
  /// A thread is searching for a new tree.
  pub reserving: bool,
}

const _: () = assert!(TREE_SIZE < 1 << 15);

impl Packed for Reserved {
  type Raw = u64;
}

impl Reserved {
  pub const fn of(free: usize, start_row: usize) -> Self {
    Self::new().with_frames(free as u64).with_row(start_row as u64).with_present(true)
  }

  pub const fn free(self) -> usize {
    self.frames() as usize
  }

  pub const fn start_row(self) -> usize {
    self.row() as usize
  }

  pub const fn tree(self) -> usize {
    tree_from_row(self.start_row())
  }

  fn dec(self, free: usize) -> Option<Self> {
    (self.present() && self.free() >= free).then(|| self.with_frames((self.free() - free) as u64))
  }

  fn inc(self, tree: usize, free: usize) -> Option<Self> {
    let sum = self.free() + free;
    (self.present() && self.tree() == tree && sum <= TREE_SIZE).then(|| self.with_frames(sum as u64))
  }

  fn set_start(self, row: usize) -> Option<Self> {
    (self.present() && self.tree() == tree_from_row(row)).then(|| self.with_row(row as u64))
  }
}

/// Recent frees of one core.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
struct LastFree {
  /// Consecutive frees into `tree`, saturating at `LAST_FREES`.
  #[bits(3)]
  counter: u8,
  #[bits(61)]
  tree: u64,
}

const _: () = assert!(LAST_FREES < 1 << 3);

impl Packed for LastFree {
  type Raw = u64;
}

/// Core local data, aligned to avoid false sharing between cores.
#[repr(align(64))]
pub(crate) struct Local {
  reserved: Atom<Reserved>,
  last_free: Atom<LastFree>,
}

impl Default for Local {
  fn default() -> Self {
    Self {
      reserved: Atom::new(Reserved::new()),
      last_free: Atom::new(LastFree::new()),
    }
  }
}

impl Local {
  pub fn load(&self) -> Reserved {
    self.reserved.load()
  }

  /// Takes `free` frames from the reservation, returns the previous state on success.
  pub fn dec(&self, free: usize) -> Result<Option<Reserved>> {
    self.reserved.update(|r| r.dec(free))
  }

  /// Returns `free` frames if `tree` is the reserved one.
  pub fn inc(&self, tree: usize, free: usize) -> Result<bool> {
    Ok(self.reserved.update(|r| r.inc(tree, free))?.is_some())
  }

  /// Moves the search start, ignored if the reservation changed meanwhile.
  pub fn set_start(&self, row: usize) -> Result<()> {
    self.reserved.update(|r| r.set_start(row))?;
    Ok(())
  }

  /// Claims the right to search for a new reservation.
  pub fn mark_reserving(&self) -> Result<bool> {
    Ok(self.reserved.update(|r| (!r.reserving()).then(|| r.with_reserving(true)))?.is_some())
  }

  pub fn unmark_reserving(&self) -> Result<()> {
    self.reserved.update(|r| Some(r.with_reserving(false)))?;
    Ok(())
  }

  /// Replaces the reservation and clears the reserving flag.
  ///
  /// Fails with [`Error::Retry`] if the flag does not match `expect_reserving`.
  pub fn swap(&self, new: Reserved, expect_reserving: bool) -> Result<Reserved> {
    let new = new.with_reserving(false);
    self
      .reserved
      .fetch_update(|r| (r.reserving() == expect_reserving).then_some(new))?
      .map_err(|_| Error::Retry)
  }

  /// Removes the reservation unless another thread is currently reserving.
  pub fn steal(&self) -> Result<Reserved> {
    self.swap(Reserved::new(), false)
  }

  /// Waits until a concurrent reservation finished.
  pub fn wait_reserving(&self) -> bool {
    spin_until(|| !self.reserved.load().reserving())
  }

  /// Records a free into `tree`.
  ///
  /// Returns true if this core freed into the same tree more than `LAST_FREES` times in a row.
  pub fn free_inc(&self, tree: usize) -> Result<bool> {
    let mut trigger = false;
    self.last_free.update(|last| {
      trigger = false;
      if last.tree() != tree as u64 {
        Some(LastFree::new().with_tree(tree as u64).with_counter(1))
      } else if (last.counter() as usize) < LAST_FREES {
        Some(last.with_counter(last.counter() + 1))
      } else {
        trigger = true;
        None
      }
    })?;
    Ok(trigger)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::row_from_tree;

  #[test]
  fn counter() {
    let local = Local::default();
    assert_eq!(local.dec(1), Ok(None));
    assert_eq!(local.inc(0, 1), Ok(false));

    let row = row_from_tree(2) + 5;
    assert_eq!(local.swap(Reserved::of(10, row), false), Ok(Reserved::new()));
    assert_eq!(local.load().tree(), 2);
    assert_eq!(local.dec(4), Ok(Some(Reserved::of(10, row))));
    assert_eq!(local.dec(7), Ok(None));
    assert_eq!(local.inc(1, 4), Ok(false));
    assert_eq!(local.inc(2, 4), Ok(true));
    assert_eq!(local.load().free(), 10);

    local.set_start(row + 1).unwrap();
    assert_eq!(local.load().start_row(), row + 1);
    local.set_start(row_from_tree(3)).unwrap();
    assert_eq!(local.load().start_row(), row + 1);
  }

  #[test]
  fn reserving() {
    let local = Local::default();
    assert_eq!(local.mark_reserving(), Ok(true));
    assert_eq!(local.mark_reserving(), Ok(false));
    assert_eq!(local.steal(), Err(Error::Retry));

    let old = local.swap(Reserved::of(3, 0), true).unwrap();
    assert!(old.reserving() && !old.present());
    assert!(!local.load().reserving());
    assert!(local.wait_reserving());
    assert_eq!(local.swap(Reserved::of(3, 0), true), Err(Error::Retry));

    assert_eq!(local.steal(), Ok(Reserved::of(3, 0)));
    assert!(!local.load().present());

    assert_eq!(local.mark_reserving(), Ok(true));
    local.unmark_reserving().unwrap();
    assert_eq!(local.load(), Reserved::new());
  }

  #[test]
  fn last_frees() {
    let local = Local::default();
    for _ in 0..LAST_FREES {
      assert_eq!(local.free_inc(3), Ok(false));
    }
    assert_eq!(local.free_inc(3), Ok(true));
    assert_eq!(local.free_inc(3), Ok(true));
    assert_eq!(local.free_inc(4), Ok(false));
    assert_eq!(local.free_inc(3), Ok(false));
  }
}
