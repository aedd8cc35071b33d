use core::{
  fmt,
  ops::RangeInclusive,
  sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{
  ATOMIC_SIZE, Error, FRAME_SIZE, Init, MAX_ORDER, MAX_PAGES, MIN_PAGES, RETRIES, Result, TREE_CHILDREN, TREE_SIZE,
  alternating,
  atomic::{Atom, must},
  child_from_frame, frame_from_row, frame_from_tree, frames_of,
  local::{Local, Reserved},
  lower::Lower,
  platform::{Metadata, Zeroed},
  row_from_frame, row_from_tree, tree_from_frame,
  tree::{Band, Tree},
};

/// Marks initialized persistent metadata.
const MAGIC: u64 = 0xC0FFEE;

/// Persistent state, stored in the last frame of the managed range.
#[repr(align(64))]
struct Meta {
  magic: AtomicU64,
  crashed: AtomicBool,
}

const _: () = assert!(size_of::<Meta>() <= FRAME_SIZE);

unsafe impl Zeroed for Meta {}

/// Lock-free frame allocator for many cores.
///
/// Frames are identified by their frame number (address / [`FRAME_SIZE`]).
/// Every operation takes the calling `core`, which selects the per-core
/// reservation. Cores beyond the configured number share reservations.
pub struct Allocator {
  /// First managed frame.
  offset: usize,
  meta: Option<Metadata<Meta>>,
  lower: Lower,
  trees: Box<[Atom<Tree>]>,
  local: Box<[Local]>,
}

impl Allocator {
  /// Creates an allocator for `frames` frames starting at `offset`, with volatile metadata.
  pub fn new(cores: usize, offset: usize, frames: usize, free_all: bool) -> Result<Self> {
    // Volatile metadata does not touch the managed memory
    unsafe { Self::init(cores, offset, frames, Init::Volatile, free_all) }
  }

  /// Creates an allocator for `frames` frames starting at `offset`.
  ///
  /// With [`Init::Overwrite`] or [`Init::Recover`] the metadata is stored in
  /// (and recovered from) the end of the managed range, which reduces the
  /// number of usable [`frames`](Allocator::frames).
  ///
  /// # Safety
  /// For the persistent modes the range has to be mapped at
  /// `offset * FRAME_SIZE`, and nothing but this allocator may use it.
  pub unsafe fn init(cores: usize, offset: usize, frames: usize, init: Init, free_all: bool) -> Result<Self> {
    if cores == 0 {
      log::warn!("invalid number of cores: {cores}");
      return Err(Error::Initialization);
    }
    if !(MIN_PAGES..=MAX_PAGES).contains(&frames) {
      log::warn!("invalid size: {frames} frames");
      return Err(Error::Initialization);
    }
    if offset % frames_of(MAX_ORDER) != 0 {
      log::warn!("invalid alignment: {offset:#x}");
      return Err(Error::Initialization);
    }

    let (meta, lower) = if init == Init::Volatile {
      (None, Lower::new(frames)?)
    } else {
      let frames = frames - 1;
      let meta = (offset + frames) * FRAME_SIZE;
      let meta = unsafe { Metadata::borrowed(meta as *mut Meta, 1)? };
      (Some(meta), unsafe { Lower::persistent(offset, frames)? })
    };

    match (&meta, init) {
      (Some(meta), Init::Recover) => {
        let meta = &meta[0];
        if meta.magic.load(Ordering::Acquire) != MAGIC {
          log::warn!("no persistent allocator found");
          return Err(Error::Initialization);
        }
        if meta.crashed.load(Ordering::Acquire) {
          log::debug!("recover after crash");
          lower.recover();
        }
      }
      _ => lower.clear(free_all),
    }

    let trees: Box<[Atom<Tree>]> = (0..lower.trees())
      .map(|t| Atom::new(Tree::of(lower.tree_free(t), false)))
      .collect();
    let local = (0..cores.min(trees.len())).map(|_| Local::default()).collect();

    if let Some(meta) = &meta {
      meta[0].magic.store(MAGIC, Ordering::Release);
      meta[0].crashed.store(true, Ordering::Release);
    }

    log::debug!(
      "init {} frames at {offset:#x}, {} trees, {} cores",
      lower.frames(),
      trees.len(),
      cores.min(trees.len())
    );
    Ok(Self { offset, meta, lower, trees, local })
  }

  fn local(&self, core: usize) -> &Local {
    &self.local[core % self.local.len()]
  }

  // =============================================================================
  // Allocation
  // =============================================================================

  /// Allocates `2^order` contiguous frames, aligned to their size.
  pub fn get(&self, core: usize, order: usize) -> Result<usize> {
    if order > MAX_ORDER {
      return Err(Error::Memory);
    }
    let local = self.local(core);

    for _ in 0..RETRIES {
      match self.get_inner(core, local, order) {
        Ok(frame) => return Ok(self.offset + frame),
        Err(Error::Retry) => continue,
        Err(Error::Memory) => break,
        Err(e) => return Err(e),
      }
    }
    log::warn!("out of memory: core={core} order={order} free={}", self.free_frames());
    Err(Error::Memory)
  }

  fn get_inner(&self, core: usize, local: &Local, order: usize) -> Result<usize> {
    match self.get_local(local, order) {
      Err(Error::Memory) => {}
      res => return res,
    }

    if self.sync_with_global(local, order)? {
      match self.get_local(local, order) {
        Err(Error::Memory) => {}
        res => return res,
      }
    }

    if local.mark_reserving()? {
      let res = self.reserve_and_get(core, local, order);
      if res.is_err() {
        local.unmark_reserving()?;
      }
      res
    } else {
      // Another thread of this core searches a new tree
      if !local.wait_reserving() {
        return Err(Error::Retry);
      }
      match self.get_local(local, order) {
        Err(Error::Memory) => Err(Error::Retry),
        res => res,
      }
    }
  }

  /// Allocates from the reserved tree.
  fn get_local(&self, local: &Local, order: usize) -> Result<usize> {
    let Some(old) = local.dec(frames_of(order))? else {
      return Err(Error::Memory);
    };

    match self.lower.get(frame_from_row(old.start_row()), order) {
      Ok(frame) => {
        let row = row_from_frame(frame);
        if row != old.start_row() && frames_of(order) < ATOMIC_SIZE {
          // Only a hint for the next search
          let _ = local.set_start(row);
        }
        Ok(frame)
      }
      Err(e) => {
        self.inc_tree_counter(local, old.tree(), frames_of(order))?;
        Err(e)
      }
    }
  }

  /// Moves the frames other cores freed into the reserved tree to the local counter.
  ///
  /// Returns true if the local counter now covers the request.
  fn sync_with_global(&self, local: &Local, order: usize) -> Result<bool> {
    let old = local.load();
    if !old.present() || old.free() >= frames_of(order) {
      return Ok(false);
    }

    let tree = old.tree();
    let Ok(stolen) = self.trees[tree].fetch_update(Tree::steal_counter)? else {
      return Ok(false);
    };
    let free = stolen.free() as usize;

    if local.inc(tree, free)? {
      return Ok(local.load().free() >= frames_of(order));
    }

    // The reservation changed meanwhile, put the counter back
    if stolen.reserved() {
      must(self.trees[tree].update(|t| t.inc(free)), "tree counter restore")?;
    } else {
      must(self.trees[tree].update(|t| t.writeback(free)), "tree writeback")?;
    }
    Ok(false)
  }

  /// Searches and reserves a new tree, then allocates from it.
  ///
  /// The caller holds the reserving flag of `local`.
  fn reserve_and_get(&self, core: usize, local: &Local, order: usize) -> Result<usize> {
    let cores = self.local.len();
    let old = local.load();
    let start = if old.present() {
      old.tree()
    } else {
      self.trees.len() / cores * (core % cores)
    };
    let any = frames_of(order)..=TREE_SIZE;

    // Nearby trees first, to keep the allocations of a core together
    let vicinity = (self.trees.len() / cores / 4).clamp(1, TREE_CHILDREN);
    for idx in alternating(start, self.trees.len()).take(vicinity) {
      if let Some(frame) = self.reserve_and_get_tree(local, idx, order, &any)? {
        return Ok(frame);
      }
    }

    // Prefer partially used trees to keep the free ones intact
    for band in [Band::Partial, Band::Free] {
      for idx in alternating(start, self.trees.len()) {
        if let Some(frame) = self.reserve_and_get_tree(local, idx, order, &band.range())? {
          return Ok(frame);
        }
      }
    }

    log::debug!("core {core} drains all other cores");
    self.drain_others(core)?;

    for idx in alternating(start, self.trees.len()) {
      if let Some(frame) = self.reserve_and_get_tree(local, idx, order, &any)? {
        return Ok(frame);
      }
    }
    Err(Error::Memory)
  }

  /// Reserves the tree `idx` if its counter lies in `range` and allocates from it.
  fn reserve_and_get_tree(
    &self,
    local: &Local,
    idx: usize,
    order: usize,
    range: &RangeInclusive<usize>,
  ) -> Result<Option<usize>> {
    let tree = &self.trees[idx];
    let Some(old) = tree.update(|t| t.reserve(range))? else {
      return Ok(None);
    };
    let free = old.free() as usize;
    debug_assert!(free >= frames_of(order));

    let frame = match self.lower.get(frame_from_tree(idx), order) {
      Ok(frame) => frame,
      Err(e) => {
        must(tree.update(|t| t.writeback(free)), "tree writeback")?;
        return if e == Error::Memory { Ok(None) } else { Err(e) };
      }
    };

    let new = Reserved::of(free - frames_of(order), row_from_frame(frame));
    match local.swap(new, true) {
      Ok(prev) => {
        log::debug!("reserved tree {idx}");
        self.writeback_reserved(prev)?;
        Ok(Some(frame))
      }
      Err(e) => {
        self.lower.put(frame, order)?;
        must(tree.update(|t| t.writeback(free)), "tree writeback")?;
        Err(e)
      }
    }
  }

  /// Returns the counter of a former reservation to its tree.
  fn writeback_reserved(&self, old: Reserved) -> Result<()> {
    if old.present() {
      must(
        self.trees[old.tree()].update(|t| t.writeback(old.free())),
        "reservation writeback",
      )?;
    }
    Ok(())
  }

  /// Gives the reservation of `core` back to the global trees.
  ///
  /// Does nothing if the core is currently searching a new reservation.
  pub fn drain(&self, core: usize) -> Result<()> {
    match self.local(core).steal() {
      Ok(old) => self.writeback_reserved(old),
      Err(Error::Retry) => Ok(()),
      Err(e) => Err(e),
    }
  }

  fn drain_others(&self, core: usize) -> Result<()> {
    let core = core % self.local.len();
    for other in (0..self.local.len()).filter(|&c| c != core) {
      self.drain(other)?;
    }
    Ok(())
  }

  // =============================================================================
  // Free
  // =============================================================================

  /// Frees the `2^order` frames starting at `frame`.
  pub fn put(&self, core: usize, frame: usize, order: usize) -> Result<()> {
    if order > MAX_ORDER || frame < self.offset {
      return Err(Error::Address);
    }
    let frame = frame - self.offset;
    self.lower.put(frame, order)?;

    let tree = tree_from_frame(frame);
    let local = self.local(core);
    if self.inc_tree_counter(local, tree, frames_of(order))? {
      return Ok(());
    }

    // Frequent frees into the same tree are likely followed by allocations there
    if local.free_inc(tree).unwrap_or(false) {
      // Losing the race for the reservation is fine
      if let Err(Error::Corruption) = self.reserve_on_free(local, tree) {
        return Err(Error::Corruption);
      }
    }
    Ok(())
  }

  /// Returns freed frames to the reservation or to the global tree.
  ///
  /// Returns true if the frames went to the reservation of `local`.
  fn inc_tree_counter(&self, local: &Local, tree: usize, free: usize) -> Result<bool> {
    if local.inc(tree, free).map_err(|_| Error::Corruption)? {
      return Ok(true);
    }
    must(self.trees[tree].update(|t| t.inc(free)), "tree counter increment")?;
    Ok(false)
  }

  /// Reserves the tree `idx` after repeated frees into it.
  fn reserve_on_free(&self, local: &Local, idx: usize) -> Result<()> {
    if !local.mark_reserving()? {
      return Ok(());
    }

    let tree = &self.trees[idx];
    let reserved = match tree.update(|t| t.reserve(&Band::Partial.range())) {
      Ok(Some(old)) => old,
      res => {
        local.unmark_reserving()?;
        return res.map(|_| ());
      }
    };

    let free = reserved.free() as usize;
    match local.swap(Reserved::of(free, row_from_tree(idx)), true) {
      Ok(prev) => {
        log::debug!("reserved tree {idx} on free");
        self.writeback_reserved(prev)
      }
      Err(e) => {
        must(tree.update(|t| t.writeback(free)), "tree writeback")?;
        local.unmark_reserving()?;
        Err(e)
      }
    }
  }

  // =============================================================================
  // Statistics
  // =============================================================================

  /// Number of managed frames.
  pub fn frames(&self) -> usize {
    self.lower.frames()
  }

  /// Number of reservation slots, `min(cores, trees)`.
  pub fn cores(&self) -> usize {
    self.local.len()
  }

  pub fn trees(&self) -> usize {
    self.trees.len()
  }

  /// Number of free frames.
  ///
  /// Not a consistent snapshot while other threads allocate or free.
  pub fn free_frames(&self) -> usize {
    let trees: usize = self.trees.iter().map(|t| t.load().free() as usize).sum();
    let local: usize = self.local.iter().map(|l| l.load()).filter(|r| r.present()).map(|r| r.free()).sum();
    trees + local
  }

  /// Number of huge frames, including partially allocated ones.
  pub fn huge_frames(&self) -> usize {
    self.lower.childs_len()
  }

  /// Number of entirely free huge frames.
  pub fn free_huge_frames(&self) -> usize {
    self.lower.free_huge()
  }

  /// Free frames in the huge frame containing `frame`.
  pub fn free_at_huge(&self, frame: usize) -> usize {
    match frame.checked_sub(self.offset) {
      Some(frame) if frame < self.frames() => self.lower.child(child_from_frame(frame)).free() as usize,
      _ => 0,
    }
  }

  /// Free frames in the tree containing `frame`, including a reservation of it.
  pub fn free_at_tree(&self, frame: usize) -> usize {
    let Some(frame) = frame.checked_sub(self.offset).filter(|&f| f < self.frames()) else {
      return 0;
    };
    let tree = tree_from_frame(frame);
    let local: usize = (self.local.iter().map(|l| l.load()))
      .filter(|r| r.present() && r.tree() == tree)
      .map(|r| r.free())
      .sum();
    self.trees[tree].load().free() as usize + local
  }

  /// Whether the `2^order` frames starting at `frame` are free.
  pub fn is_free(&self, frame: usize, order: usize) -> bool {
    frame >= self.offset && self.lower.is_free(frame - self.offset, order)
  }

  /// Calls `f` with the first frame and the free frames of every huge frame.
  pub fn for_each_huge<F: FnMut(usize, usize)>(&self, mut f: F) {
    self.lower.for_each_child(|frame, free| f(self.offset + frame, free));
  }

  /// Writes a human readable dump of the allocator state.
  pub fn debug<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
    writeln!(w, "Allocator {{")?;
    writeln!(
      w,
      "    frames: {} (free {}), huge: {} (free {})",
      self.frames(),
      self.free_frames(),
      self.huge_frames(),
      self.free_huge_frames()
    )?;

    writeln!(w, "    trees: {} ({} frames each)", self.trees.len(), TREE_SIZE)?;
    abbreviated(w, self.trees.len(), |w, i| {
      let tree = self.trees[i].load();
      writeln!(w, "      {i:>6}: free={:<5} reserved={:<5} {:?}", tree.free(), tree.reserved(), tree.band())
    })?;

    writeln!(w, "    cores: {}", self.local.len())?;
    abbreviated(w, self.local.len(), |w, i| {
      let r = self.local[i].load();
      if r.present() {
        writeln!(w, "      {i:>6}: tree={} free={} reserving={}", r.tree(), r.free(), r.reserving())
      } else {
        writeln!(w, "      {i:>6}: none reserving={}", r.reserving())
      }
    })?;

    writeln!(w, "    children: {}", self.lower.childs_len())?;
    abbreviated(w, self.lower.childs_len(), |w, i| {
      let child = self.lower.child(i);
      writeln!(w, "      {i:>6}: free={:<3} huge={}", child.free(), child.huge())
    })?;
    writeln!(w, "}}")
  }

  /// Prints [`Allocator::debug`] to stdout.
  pub fn debug_print(&self) {
    let mut out = String::new();
    if self.debug(&mut out).is_ok() {
      print!("{out}");
    }
  }
}

/// Writes the first and last entries of long lists only.
fn abbreviated<W: fmt::Write>(
  w: &mut W,
  len: usize,
  mut f: impl FnMut(&mut W, usize) -> fmt::Result,
) -> fmt::Result {
  const EDGE: usize = 10;
  if len <= 2 * EDGE {
    return (0..len).try_for_each(|i| f(w, i));
  }
  (0..EDGE).try_for_each(|i| f(w, i))?;
  writeln!(w, "      ...")?;
  (len - EDGE..len).try_for_each(|i| f(w, i))
}

impl fmt::Debug for Allocator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Allocator")
      .field("frames", &self.frames())
      .field("free", &self.free_frames())
      .field("huge", &self.huge_frames())
      .field("free_huge", &self.free_huge_frames())
      .field("cores", &self.cores())
      .finish()
  }
}

impl Drop for Allocator {
  fn drop(&mut self) {
    if let Some(meta) = &self.meta {
      meta[0].crashed.store(false, Ordering::Release);
    }
  }
}
