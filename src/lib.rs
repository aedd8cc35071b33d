//! Lock-free physical frame allocator for many cores.
//!
//! The managed range is split into three levels:
//! - [`Bitfield`](bitfield::Bitfield)s track every base frame with one bit,
//! - a [`Child`](child::Child) counts the free frames of one bitfield and may
//!   represent the whole bitfield as a single huge frame,
//! - a [`Tree`](tree::Tree) counts the free frames of [`TREE_CHILDREN`]
//!   children and can be reserved by one core at a time.
//!
//! Every core caches its reservation in a [`Local`](local::Local), so most
//! allocations only touch core-private state. All shared state is a single
//! word updated with compare-and-swap, there are no locks.

mod atomic;
mod bitfield;
mod child;
mod local;
mod lower;
mod platform;
mod tree;
mod upper;

pub use platform::current_core;
pub use tree::Band;
pub use upper::Allocator;

// =============================================================================
// Constants
// =============================================================================

pub const FRAME_BITS: usize = 12;
/// Size of a base frame in bytes.
pub const FRAME_SIZE: usize = 1 << FRAME_BITS;

/// Order of a huge frame, which is exactly one child.
pub const HUGE_ORDER: usize = 9;
/// Largest order, a pair of adjacent huge frames.
pub const MAX_ORDER: usize = HUGE_ORDER + 1;

const ATOMIC_ORDER: usize = 6;
/// Bits in one atomic bitfield word.
const ATOMIC_SIZE: usize = 1 << ATOMIC_ORDER;

const CHILD_ORDER: usize = HUGE_ORDER;
/// Frames per child (and per bitfield).
pub const CHILD_SIZE: usize = 1 << CHILD_ORDER;

const TREE_CHILDREN_ORDER: usize = 5;
/// Children per tree.
pub const TREE_CHILDREN: usize = 1 << TREE_CHILDREN_ORDER;
const TREE_ORDER: usize = CHILD_ORDER + TREE_CHILDREN_ORDER;
/// Frames per tree.
pub const TREE_SIZE: usize = 1 << TREE_ORDER;

/// Smallest range that can be managed.
pub const MIN_PAGES: usize = 1 << MAX_ORDER;
/// 64 bit addresses, minus the offset inside the frame.
pub const MAX_PAGES: usize = 1 << (64 - FRAME_BITS);

/// Retries of a whole allocation step before giving up.
const RETRIES: usize = 8;

const _: () = assert!(CHILD_SIZE == 8 * ATOMIC_SIZE);
const _: () = assert!(TREE_CHILDREN % 2 == 0);
const _: () = assert!(TREE_SIZE < 1 << 15);
const _: () = assert!(MIN_PAGES <= TREE_SIZE);

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
  /// No free run of the requested order was found.
  #[error("not enough memory")]
  Memory,
  /// An atomic operation lost a race, the operation can be repeated.
  #[error("atomic operation failed, retry")]
  Retry,
  /// The frame is out of range, misaligned or not allocated.
  #[error("invalid address")]
  Address,
  /// Invalid parameters or missing persistent state.
  #[error("initialization failed")]
  Initialization,
  /// An internal invariant was violated.
  #[error("corrupted allocator state")]
  Corruption,
}

impl Error {
  /// Negative return code of this error, as used by C style hosts.
  pub const fn code(self) -> i64 {
    match self {
      Error::Memory => -1,
      Error::Retry => -2,
      Error::Address => -3,
      Error::Initialization => -4,
      Error::Corruption => -5,
    }
  }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Where the allocator keeps its metadata.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
  /// Metadata lives in freshly mapped, volatile memory.
  Volatile = 0,
  /// Metadata is carved from the end of the managed range and overwritten.
  Overwrite = 1,
  /// Like `Overwrite`, but the existing metadata is recovered.
  Recover = 2,
}

// =============================================================================
// Frame conversions
// =============================================================================

#[inline(always)]
const fn tree_from_frame(frame: usize) -> usize {
  frame >> TREE_ORDER
}

#[inline(always)]
const fn frame_from_tree(tree: usize) -> usize {
  tree << TREE_ORDER
}

#[inline(always)]
const fn child_from_frame(frame: usize) -> usize {
  frame >> CHILD_ORDER
}

#[inline(always)]
const fn frame_from_child(child: usize) -> usize {
  child << CHILD_ORDER
}

#[inline(always)]
const fn row_from_frame(frame: usize) -> usize {
  frame >> ATOMIC_ORDER
}

#[inline(always)]
const fn frame_from_row(row: usize) -> usize {
  row << ATOMIC_ORDER
}

#[inline(always)]
const fn tree_from_row(row: usize) -> usize {
  tree_from_frame(frame_from_row(row))
}

#[inline(always)]
const fn row_from_tree(tree: usize) -> usize {
  row_from_frame(frame_from_tree(tree))
}

// =============================================================================
// Utils
// =============================================================================

/// Indices of `0..len`, starting at `center` and alternating around it:
/// `center, center - 1, center + 1, center - 2, ...` (wrapping).
fn alternating(center: usize, len: usize) -> impl Iterator<Item = usize> {
  debug_assert!(len > 0 && center < len);
  (1..=len).map(move |i| {
    let toggle = if i & 1 == 1 { (i / 2) as isize } else { -((i / 2) as isize) };
    (center as isize + toggle).rem_euclid(len as isize) as usize
  })
}

/// Like [`alternating`], but restricted to the aligned block of `len` entries containing `idx`.
fn alternating_in_block(idx: usize, len: usize) -> impl Iterator<Item = usize> {
  let base = idx - idx % len;
  alternating(idx % len, len).map(move |i| base + i)
}

/// Number of frames of the given order.
#[inline(always)]
const fn frames_of(order: usize) -> usize {
  1 << order
}
