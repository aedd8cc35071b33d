use crate::{
  ATOMIC_ORDER, ATOMIC_SIZE, CHILD_SIZE, Error, Result, alternating,
  atomic::{Atom, Packed},
  frames_of,
  platform::Zeroed,
  row_from_frame,
};

/// Number of atomic words in one bitfield.
pub(crate) const ROWS: usize = CHILD_SIZE / ATOMIC_SIZE;

impl Packed for u64 {
  type Raw = u64;
}

/// One bit per frame of a child, set bits are allocated.
#[repr(align(64))]
pub(crate) struct Bitfield {
  rows: [Atom<u64>; ROWS],
}

const _: () = assert!(size_of::<Bitfield>() == 64);

unsafe impl Zeroed for Bitfield {}

impl Default for Bitfield {
  fn default() -> Self {
    Self { rows: core::array::from_fn(|_| Atom::new(0)) }
  }
}

/// Finds the first aligned run of `2^order` zero bits in `v`.
///
/// Returns the updated word with the run set and the position of the run.
/// See <https://graphics.stanford.edu/~seander/bithacks.html#ZeroInWord>
fn first_zeros_aligned(v: u64, order: usize) -> Option<(u64, usize)> {
  const fn zero_block(v: u64, mask: u64, shift: u32) -> u32 {
    ((((v.wrapping_sub(mask)) & !v) >> shift) & mask).trailing_zeros()
  }

  let pos: u32 = match order {
    0 => (!v).trailing_zeros(),
    1 => (!((v | (v >> 1)) | 0xaaaa_aaaa_aaaa_aaaa)).trailing_zeros(),
    2 => zero_block(v, 0x1111_1111_1111_1111, 3),
    3 => zero_block(v, 0x0101_0101_0101_0101, 7),
    4 => zero_block(v, 0x0001_0001_0001_0001, 15),
    5 if v as u32 == 0 => 0,
    5 if v >> 32 == 0 => 32,
    6 if v == 0 => 0,
    _ => return None,
  };

  let pos = pos as usize;
  if pos >= ATOMIC_SIZE {
    return None;
  }
  let run = u64::MAX >> (ATOMIC_SIZE - frames_of(order));
  Some((v | (run << pos), pos))
}

impl Bitfield {
  /// Marks the first `free` frames as free and all others as allocated.
  ///
  /// Not thread safe, only used during initialization.
  pub fn reset(&self, free: usize) {
    debug_assert!(free <= CHILD_SIZE);
    for (i, row) in self.rows.iter().enumerate() {
      let start = i * ATOMIC_SIZE;
      let value = if free >= start + ATOMIC_SIZE {
        0
      } else if free > start {
        u64::MAX << (free - start)
      } else {
        u64::MAX
      };
      row.store(value);
    }
  }

  /// Allocates the first free, aligned run of `2^order` frames.
  ///
  /// The search starts at the row of `start_frame` and wraps around.
  /// Returns the index of the first frame of the run inside this bitfield.
  ///
  /// Runs of more than one row are claimed row by row and released again if
  /// a later row is taken, which is not atomic as a whole.
  pub fn set_next(&self, start_frame: usize, order: usize) -> Result<usize> {
    debug_assert!(frames_of(order) < CHILD_SIZE);
    let row = row_from_frame(start_frame) % ROWS;

    if order <= ATOMIC_ORDER {
      for i in alternating(row, ROWS) {
        let mut pos = 0;
        let stored = self.rows[i].update(|v| {
          let (new, p) = first_zeros_aligned(v, order)?;
          pos = p;
          Some(new)
        })?;
        if stored.is_some() {
          return Ok(i * ATOMIC_SIZE + pos);
        }
      }
      return Err(Error::Memory);
    }

    let entries = frames_of(order) / ATOMIC_SIZE;
    'slots: for slot in alternating(row / entries, ROWS / entries) {
      let rows = &self.rows[slot * entries..(slot + 1) * entries];
      for (i, entry) in rows.iter().enumerate() {
        if entry.compare_exchange(0, u64::MAX).is_err() {
          Self::revert(&rows[..i], u64::MAX, 0)?;
          continue 'slots;
        }
      }
      return Ok(slot * entries * ATOMIC_SIZE);
    }
    Err(Error::Memory)
  }

  /// Flips the run of `2^order` frames starting at `index`.
  ///
  /// If `expect_set` all bits have to be set before (free), otherwise they
  /// have to be clear (allocate). Fails with [`Error::Address`] and leaves the
  /// field unchanged if any bit has the wrong value.
  pub fn toggle(&self, index: usize, order: usize, expect_set: bool) -> Result<()> {
    debug_assert!(index < CHILD_SIZE && index % frames_of(order) == 0);
    let row = index / ATOMIC_SIZE;
    let bit = index % ATOMIC_SIZE;

    if order > ATOMIC_ORDER {
      let entries = frames_of(order) / ATOMIC_SIZE;
      let (old, new) = if expect_set { (u64::MAX, 0) } else { (0, u64::MAX) };
      let rows = &self.rows[row..row + entries];
      for (i, entry) in rows.iter().enumerate() {
        if entry.compare_exchange(old, new).is_err() {
          Self::revert(&rows[..i], new, old)?;
          return Err(Error::Address);
        }
      }
      return Ok(());
    }

    let mask = (u64::MAX >> (ATOMIC_SIZE - frames_of(order))) << bit;
    let toggled = self.rows[row].update(|v| {
      let matches = if expect_set { v & mask == mask } else { v & mask == 0 };
      matches.then_some(v ^ mask)
    })?;
    toggled.map(|_| ()).ok_or(Error::Address)
  }

  /// Undoes a partial multi-row update.
  fn revert(rows: &[Atom<u64>], from: u64, to: u64) -> Result<()> {
    for entry in rows {
      if entry.compare_exchange(from, to).is_err() {
        log::warn!("bitfield rollback failed");
        return Err(Error::Corruption);
      }
    }
    Ok(())
  }

  /// Number of allocated frames.
  pub fn count_ones(&self) -> usize {
    self.rows.iter().map(|r| r.load().count_ones() as usize).sum()
  }

  /// Whether all frames of the run of `2^order` frames at `index` are free.
  pub fn is_free(&self, index: usize, order: usize) -> bool {
    debug_assert!(index < CHILD_SIZE);
    let row = index / ATOMIC_SIZE;
    if order > ATOMIC_ORDER {
      let entries = frames_of(order) / ATOMIC_SIZE;
      return self.rows[row..row + entries].iter().all(|r| r.load() == 0);
    }
    let mask = (u64::MAX >> (ATOMIC_SIZE - frames_of(order))) << (index % ATOMIC_SIZE);
    self.rows[row].load() & mask == 0
  }

  /// Marks all frames as allocated, used when a huge frame is split.
  pub fn fill(&self) {
    for row in &self.rows {
      row.store(u64::MAX);
    }
  }

  #[cfg(test)]
  pub fn snapshot(&self) -> [u64; ROWS] {
    core::array::from_fn(|i| self.rows[i].load())
  }
}

#[cfg(test)]
mod test {
  use std::sync::Arc;
  use std::thread;

  use super::*;

  #[test]
  fn zeros_aligned() {
    assert_eq!(first_zeros_aligned(0, 0), Some((1, 0)));
    assert_eq!(first_zeros_aligned(0b1011, 0), Some((0b1111, 2)));
    assert_eq!(first_zeros_aligned(u64::MAX, 0), None);

    assert_eq!(first_zeros_aligned(0b0110, 1), Some((0b11_0110, 4)));
    assert_eq!(first_zeros_aligned(0b1000_0001, 2), Some((0b1111_1000_0001, 8)));
    assert_eq!(first_zeros_aligned(0xff01, 3), Some((0xff_ff01, 16)));
    assert_eq!(first_zeros_aligned(0x0000_0001_0000_0001, 4), Some((0x0000_0001_ffff_0001, 16)));
    assert_eq!(first_zeros_aligned(0xffff_ffff, 5), Some((u64::MAX, 32)));
    assert_eq!(first_zeros_aligned(1 << 40, 5), Some(((1 << 40) | 0xffff_ffff, 0)));
    assert_eq!(first_zeros_aligned(1 << 63, 5), Some(((1 << 63) | 0xffff_ffff, 0)));
    assert_eq!(first_zeros_aligned(1, 6), None);
    assert_eq!(first_zeros_aligned(0, 6), Some((u64::MAX, 0)));

    // Unaligned holes are skipped
    assert_eq!(first_zeros_aligned(0b1001, 1), Some((0b11_1001, 4)));
    assert_eq!(first_zeros_aligned(0x0ff0, 3), Some((0xff_0ff0, 16)));
  }

  #[test]
  fn zeros_aligned_exhaustive_small() {
    // Compare against a naive scan for every 16 bit pattern in the low half
    for v in 0..=u16::MAX as u64 {
      let v = v | 0xffff_ffff_ffff_0000;
      for order in 0..=4 {
        let n = frames_of(order);
        let naive = (0..ATOMIC_SIZE)
          .step_by(n)
          .find(|&p| (v >> p) & (u64::MAX >> (64 - n)) == 0);
        assert_eq!(first_zeros_aligned(v, order).map(|(_, p)| p), naive, "v={v:x} order={order}");
      }
    }
  }

  #[test]
  fn set_and_toggle() {
    let field = Bitfield::default();
    assert_eq!(field.set_next(0, 0), Ok(0));
    assert_eq!(field.set_next(0, 0), Ok(1));
    assert_eq!(field.set_next(0, 1), Ok(2));
    assert_eq!(field.count_ones(), 4);
    assert!(!field.is_free(1, 0));
    assert!(field.is_free(4, 2));

    assert_eq!(field.toggle(1, 0, true), Ok(()));
    assert!(field.is_free(1, 0));
    assert_eq!(field.toggle(1, 0, true), Err(Error::Address));
    assert_eq!(field.set_next(0, 0), Ok(1));

    // Start hint selects the row
    assert_eq!(field.set_next(3 * ATOMIC_SIZE + 5, 3), Ok(3 * ATOMIC_SIZE));
    assert_eq!(field.count_ones(), 4 + 8);
  }

  #[test]
  fn multi_row() {
    let field = Bitfield::default();
    assert_eq!(field.set_next(0, 8), Ok(0));
    // Slots are searched around the start: 0, 3, 1, 2
    assert_eq!(field.set_next(0, 7), Ok(6 * ATOMIC_SIZE));
    assert_eq!(field.set_next(0, 7), Ok(4 * ATOMIC_SIZE));
    assert_eq!(field.set_next(0, 7), Err(Error::Memory));
    assert_eq!(field.set_next(0, 0), Err(Error::Memory));
    assert_eq!(field.count_ones(), CHILD_SIZE);

    assert_eq!(field.toggle(0, 8, true), Ok(()));
    assert!(field.is_free(0, 8));
    assert_eq!(field.toggle(0, 8, true), Err(Error::Address));

    // A failed multi-row toggle leaves the field unchanged
    assert_eq!(field.set_next(ATOMIC_SIZE, 0), Ok(ATOMIC_SIZE));
    assert_eq!(field.toggle(0, 7, false), Err(Error::Address));
    assert_eq!(field.snapshot()[..2], [0, 1]);
  }

  #[test]
  fn partial_claim_is_undone() {
    let field = Bitfield::default();
    // Row 1 is partially used, so the slot 0..2 cannot be claimed
    assert_eq!(field.set_next(ATOMIC_SIZE, 0), Ok(ATOMIC_SIZE));
    assert_eq!(field.set_next(0, 7), Ok(6 * ATOMIC_SIZE));
    let rows = field.snapshot();
    assert_eq!(rows[0], 0);
    assert_eq!(rows[1], 1);
  }

  #[test]
  fn fill() {
    let field = Bitfield::default();
    field.reset(100);
    field.fill();
    assert_eq!(field.count_ones(), CHILD_SIZE);
    assert!(!field.is_free(0, 0));
  }

  #[test]
  fn reset() {
    let field = Bitfield::default();
    field.reset(100);
    assert_eq!(field.count_ones(), CHILD_SIZE - 100);
    assert!(field.is_free(99, 0));
    assert!(!field.is_free(100, 0));
    field.reset(CHILD_SIZE);
    assert_eq!(field.count_ones(), 0);
    field.reset(0);
    assert_eq!(field.count_ones(), CHILD_SIZE);
  }

  #[test]
  fn parallel_set() {
    const THREADS: usize = 4;
    let field = Arc::new(Bitfield::default());
    let handles: Vec<_> = (0..THREADS)
      .map(|t| {
        let field = field.clone();
        thread::spawn(move || {
          (0..CHILD_SIZE / THREADS)
            .map(|_| field.set_next(t * 128, 0).unwrap())
            .collect::<Vec<_>>()
        })
      })
      .collect();
    let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), CHILD_SIZE);
    assert_eq!(field.set_next(0, 0), Err(Error::Memory));
  }
}
