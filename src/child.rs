use bitfield_struct::bitfield;

use crate::{
  CHILD_SIZE, Result, TREE_CHILDREN,
  atomic::{Atom, Packed},
  frames_of,
  platform::Zeroed,
};

/// Free counter of one bitfield.
///
/// A huge child is allocated as a whole, its bitfield content is meaningless.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub(crate) struct Child {
  /// Free frames (0..=CHILD_SIZE).
  #[bits(10)]
  pub free: u16,
  /// Allocated as one huge frame.
  pub huge: bool,
  /// A huge frame that is being turned into base frames.
  pub splitting: bool,
  #[bits(4)]
  __: u8,
}

const _: () = assert!(CHILD_SIZE < 1 << 10);

impl Child {
  pub const fn of(free: usize, huge: bool) -> Self {
    Self::new().with_free(free as u16).with_huge(huge)
  }

  /// Entirely free and not huge.
  pub const fn is_empty(self) -> bool {
    !self.huge() && self.free() as usize == CHILD_SIZE
  }

  pub fn inc(self, order: usize) -> Option<Self> {
    let free = self.free() as usize + frames_of(order);
    (!self.huge() && free <= CHILD_SIZE).then(|| self.with_free(free as u16))
  }

  pub fn dec(self, order: usize) -> Option<Self> {
    let n = frames_of(order);
    (!self.huge() && self.free() as usize >= n).then(|| self.with_free((self.free() as usize - n) as u16))
  }

  /// Allocates the whole child as a huge frame.
  pub fn take_huge(self) -> Option<Self> {
    self.is_empty().then(|| Self::of(0, true))
  }

  /// Frees a huge frame.
  pub fn clear_huge(self) -> Option<Self> {
    (self == Self::of(0, true)).then(|| Self::of(CHILD_SIZE, false))
  }

  /// Claims the split of a huge frame, only one thread can win.
  pub fn start_split(self) -> Option<Self> {
    (self == Self::of(0, true)).then(|| self.with_splitting(true))
  }
}

/// Two adjacent children updated with a single CAS.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub(crate) struct ChildPair {
  #[bits(16)]
  pub first: Child,
  #[bits(16)]
  pub second: Child,
}

impl Packed for ChildPair {
  type Raw = u32;
}

impl ChildPair {
  pub const fn of(child: Child) -> Self {
    Self::new().with_first(child).with_second(child)
  }

  pub const fn get(self, i: usize) -> Child {
    if i % 2 == 0 { self.first() } else { self.second() }
  }

  pub const fn with(self, i: usize, child: Child) -> Self {
    if i % 2 == 0 { self.with_first(child) } else { self.with_second(child) }
  }

  /// Allocates both children as one frame of `MAX_ORDER`.
  pub fn set_max(self) -> Option<Self> {
    (self.first().is_empty() && self.second().is_empty()).then(|| Self::of(Child::of(0, true)))
  }

  /// Frees a frame of `MAX_ORDER`.
  pub fn clear_max(self) -> Option<Self> {
    (self == Self::of(Child::of(0, true))).then(|| Self::of(Child::of(CHILD_SIZE, false)))
  }
}

/// Children of one tree, packed into a single cache line.
#[repr(align(64))]
pub(crate) struct Children {
  pairs: [Atom<ChildPair>; TREE_CHILDREN / 2],
}

const _: () = assert!(size_of::<Children>() == 64);

unsafe impl Zeroed for Children {}

impl Default for Children {
  fn default() -> Self {
    Self { pairs: core::array::from_fn(|_| Atom::new(ChildPair::new())) }
  }
}

impl Children {
  pub fn load(&self, i: usize) -> Child {
    self.pairs[i / 2].load().get(i)
  }

  /// Overwrites a child, not thread safe.
  pub fn store(&self, i: usize, child: Child) {
    let pair = &self.pairs[i / 2];
    pair.store(pair.load().with(i, child));
  }

  /// Updates a child, keeping its neighbour in the same word untouched.
  pub fn update<F: FnMut(Child) -> Option<Child>>(&self, i: usize, mut f: F) -> Result<Option<Child>> {
    let old = self.pairs[i / 2].update(|pair| Some(pair.with(i, f(pair.get(i))?)))?;
    Ok(old.map(|pair| pair.get(i)))
  }

  /// Replaces the child `i` if it equals `old`.
  pub fn compare_exchange(&self, i: usize, old: Child, new: Child) -> Result<bool> {
    Ok(self.update(i, |c| (c == old).then_some(new))?.is_some())
  }

  /// The pair containing the children `2 * p` and `2 * p + 1`.
  pub fn pair(&self, p: usize) -> &Atom<ChildPair> {
    &self.pairs[p]
  }

  pub fn iter(&self) -> impl Iterator<Item = Child> + '_ {
    self.pairs.iter().flat_map(|p| {
      let p = p.load();
      [p.first(), p.second()]
    })
  }
}
