use crate::{
  CHILD_SIZE, Error, FRAME_SIZE, HUGE_ORDER, MAX_ORDER, Result, TREE_CHILDREN, alternating,
  alternating_in_block,
  atomic::{must, spin_until},
  bitfield::Bitfield,
  child::{Child, Children},
  child_from_frame, frame_from_child, frames_of,
  platform::Metadata,
};

/// Bitfields and children of the whole managed range.
///
/// Frames are relative to the start of the range.
pub(crate) struct Lower {
  frames: usize,
  childs_len: usize,
  fields: Metadata<Bitfield>,
  /// One group of children per tree.
  children: Metadata<Children>,
}

/// Sizes of the lower metadata for `frames` frames.
const fn layout(frames: usize) -> (usize, usize) {
  let childs_len = frames.div_ceil(CHILD_SIZE);
  (childs_len, childs_len.div_ceil(TREE_CHILDREN))
}

impl Lower {
  /// Creates the metadata for `frames` frames in volatile memory.
  pub fn new(frames: usize) -> Result<Self> {
    let (childs_len, trees) = layout(frames);
    Ok(Self {
      frames,
      childs_len,
      fields: Metadata::map(childs_len)?,
      children: Metadata::map(trees)?,
    })
  }

  /// Places the metadata at the end of the range of `frames` frames starting at `offset`.
  ///
  /// ```text
  /// |     frames     | children | bitfields | (upper metadata) |
  /// ```
  ///
  /// # Safety
  /// The range has to be mapped at `offset * FRAME_SIZE` and be exclusively
  /// used by the allocator.
  pub unsafe fn persistent(offset: usize, frames: usize) -> Result<Self> {
    let (childs_len, trees) = layout(frames);
    let bytes = Metadata::<Children>::size_of(trees) + Metadata::<Bitfield>::size_of(childs_len);
    let pages = bytes.div_ceil(FRAME_SIZE);
    if pages >= frames {
      log::warn!("not enough frames ({frames}) for the persistent metadata");
      return Err(Error::Initialization);
    }

    let frames = frames - pages;
    let (childs_len, trees) = layout(frames);
    let start = (offset + frames) * FRAME_SIZE;
    let fields_start = start + Metadata::<Children>::size_of(trees);
    Ok(Self {
      frames,
      childs_len,
      children: unsafe { Metadata::borrowed(start as *mut Children, trees)? },
      fields: unsafe { Metadata::borrowed(fields_start as *mut Bitfield, childs_len)? },
    })
  }

  pub fn frames(&self) -> usize {
    self.frames
  }

  pub fn childs_len(&self) -> usize {
    self.childs_len
  }

  pub fn trees(&self) -> usize {
    self.children.len()
  }

  pub fn child(&self, i: usize) -> Child {
    self.children[i / TREE_CHILDREN].load(i % TREE_CHILDREN)
  }

  /// Marks all frames as free or allocated, not thread safe.
  pub fn clear(&self, free_all: bool) {
    for i in 0..self.childs_len - 1 {
      self.store(i, Child::of(if free_all { CHILD_SIZE } else { 0 }, !free_all));
      self.fields[i].reset(CHILD_SIZE);
    }

    let last = self.childs_len - 1;
    let rest = match self.frames % CHILD_SIZE {
      0 => CHILD_SIZE,
      rest => rest,
    };
    if free_all {
      self.store(last, Child::of(rest, false));
      self.fields[last].reset(rest);
    } else if rest == CHILD_SIZE {
      self.store(last, Child::of(0, true));
      self.fields[last].reset(CHILD_SIZE);
    } else {
      self.store(last, Child::of(0, false));
      self.fields[last].reset(0);
    }
    self.clear_padding();
  }

  /// Rebuilds the counters from the bitfields after a crash, not thread safe.
  ///
  /// Huge frames cannot be reconstructed from the bitfields and stay allocated.
  pub fn recover(&self) {
    for i in 0..self.childs_len {
      if self.child(i).huge() {
        self.store(i, Child::of(0, true));
        self.fields[i].reset(CHILD_SIZE);
      } else {
        self.store(i, Child::of(CHILD_SIZE - self.fields[i].count_ones(), false));
      }
    }
    self.clear_padding();
  }

  fn store(&self, i: usize, child: Child) {
    self.children[i / TREE_CHILDREN].store(i % TREE_CHILDREN, child);
  }

  /// Children beyond the range are empty and never match a search.
  fn clear_padding(&self) {
    for i in self.childs_len..self.trees() * TREE_CHILDREN {
      self.store(i, Child::new());
    }
  }

  /// Allocates a frame of the given order in the tree of `start`, searching around it.
  pub fn get(&self, start: usize, order: usize) -> Result<usize> {
    debug_assert!(order <= MAX_ORDER && start < self.frames);

    let idx = child_from_frame(start);
    let children = &self.children[idx / TREE_CHILDREN];

    if order == MAX_ORDER {
      let base = idx - idx % TREE_CHILDREN;
      for p in alternating((idx % TREE_CHILDREN) / 2, TREE_CHILDREN / 2) {
        if children.pair(p).update(|pair| pair.set_max())?.is_some() {
          return Ok(frame_from_child(base + 2 * p));
        }
      }
      return Err(Error::Memory);
    }

    for i in alternating_in_block(idx, TREE_CHILDREN) {
      if i >= self.childs_len {
        continue;
      }
      let ci = i % TREE_CHILDREN;

      if order == HUGE_ORDER {
        if children.update(ci, Child::take_huge)?.is_some() {
          return Ok(frame_from_child(i));
        }
        continue;
      }

      if children.update(ci, |c| c.dec(order))?.is_some() {
        match self.fields[i].set_next(start, order) {
          Ok(pos) => return Ok(frame_from_child(i) + pos),
          Err(e) => {
            // Lost a race for the bits, give the counter back
            must(children.update(ci, |c| c.inc(order)), "counter rollback")?;
            if e != Error::Memory {
              return Err(e);
            }
          }
        }
      }
    }
    Err(Error::Memory)
  }

  /// Frees a frame of the given order.
  pub fn put(&self, frame: usize, order: usize) -> Result<()> {
    if !self.is_valid(frame, order) {
      return Err(Error::Address);
    }

    let i = child_from_frame(frame);
    let children = &self.children[i / TREE_CHILDREN];
    let ci = i % TREE_CHILDREN;

    if order == MAX_ORDER {
      let freed = children.pair(ci / 2).update(|pair| pair.clear_max())?;
      return freed.map(|_| ()).ok_or(Error::Address);
    }
    if order == HUGE_ORDER {
      let freed = children.update(ci, Child::clear_huge)?;
      return freed.map(|_| ()).ok_or(Error::Address);
    }

    let field = &self.fields[i];
    if children.load(ci).huge() {
      self.split(i, field)?;
    }

    field.toggle(frame % CHILD_SIZE, order, true)?;
    must(children.update(ci, |c| c.inc(order)), "counter increment")?;
    Ok(())
  }

  /// Turns the huge frame of child `i` into allocated base frames.
  ///
  /// The thread that marks the child as splitting fills the bitfield, all
  /// others wait until the child is no longer huge.
  fn split(&self, i: usize, field: &Bitfield) -> Result<()> {
    let children = &self.children[i / TREE_CHILDREN];
    let ci = i % TREE_CHILDREN;

    if let Some(old) = children.update(ci, Child::start_split)? {
      log::trace!("split huge frame {}", frame_from_child(i));
      field.fill();
      let splitting = old.with_splitting(true);
      if !children.compare_exchange(ci, splitting, Child::of(0, false))? {
        log::warn!("child {i} changed during split");
        return Err(Error::Corruption);
      }
    } else if !spin_until(|| !children.load(ci).huge()) {
      log::warn!("timeout waiting for the split of child {i}");
      return Err(Error::Corruption);
    }
    Ok(())
  }

  /// Whether the run of `2^order` frames at `frame` is aligned and inside the range.
  fn is_valid(&self, frame: usize, order: usize) -> bool {
    order <= MAX_ORDER
      && frame % frames_of(order) == 0
      && frame < self.frames
      && frames_of(order) <= self.frames - frame
  }

  pub fn is_free(&self, frame: usize, order: usize) -> bool {
    if !self.is_valid(frame, order) {
      return false;
    }
    let i = child_from_frame(frame);
    let child = self.child(i);
    match order {
      MAX_ORDER => child.is_empty() && self.child(i + 1).is_empty(),
      HUGE_ORDER => child.is_empty(),
      _ => {
        !child.huge()
          && child.free() as usize >= frames_of(order)
          && self.fields[i].is_free(frame % CHILD_SIZE, order)
      }
    }
  }

  /// Free frames of the children of `tree`.
  pub fn tree_free(&self, tree: usize) -> usize {
    self.children[tree].iter().map(|c| c.free() as usize).sum()
  }

  #[cfg(test)]
  pub fn free_frames(&self) -> usize {
    (0..self.trees()).map(|t| self.tree_free(t)).sum()
  }

  /// Number of entirely free children.
  pub fn free_huge(&self) -> usize {
    (0..self.childs_len).filter(|&i| self.child(i).is_empty()).count()
  }

  /// Calls `f` with the first frame and free frames of every child.
  pub fn for_each_child<F: FnMut(usize, usize)>(&self, mut f: F) {
    for i in 0..self.childs_len {
      f(frame_from_child(i), self.child(i).free() as usize);
    }
  }

  #[cfg(test)]
  pub fn snapshot(&self) -> (Vec<Child>, Vec<[u64; crate::bitfield::ROWS]>) {
    let children = (0..self.trees() * TREE_CHILDREN).map(|i| self.child(i)).collect();
    let fields = self.fields.iter().map(|f| f.snapshot()).collect();
    (children, fields)
  }
}

#[cfg(test)]
mod test {
  use std::sync::{Arc, Barrier};
  use std::thread;

  use super::*;
  use crate::TREE_SIZE;

  fn lower(frames: usize, free_all: bool) -> Lower {
    let lower = Lower::new(frames).unwrap();
    lower.clear(free_all);
    lower
  }

  #[test]
  fn clear() {
    let l = lower(TREE_SIZE + 1000, true);
    assert_eq!(l.childs_len(), TREE_CHILDREN + 2);
    assert_eq!(l.trees(), 2);
    assert_eq!(l.free_frames(), TREE_SIZE + 1000);
    assert_eq!(l.tree_free(1), 1000);
    assert_eq!(l.free_huge(), TREE_CHILDREN + 1);
    assert!(l.is_free(TREE_SIZE + 999, 0));
    assert!(!l.is_free(TREE_SIZE + 1000, 0));
    assert_eq!(l.child(TREE_CHILDREN + 2), Child::new());

    let l = lower(TREE_SIZE + 1000, false);
    assert_eq!(l.free_frames(), 0);
    assert!(l.child(0).huge());
    assert!(!l.child(TREE_CHILDREN + 1).huge());
    assert_eq!(l.get(0, 0), Err(Error::Memory));
  }

  #[test]
  fn get_put() {
    let l = lower(TREE_SIZE, true);
    let before = l.snapshot();

    let mut frames = Vec::new();
    for order in 0..HUGE_ORDER {
      let frame = l.get(0, order).unwrap();
      assert_eq!(frame % frames_of(order), 0);
      assert!(!l.is_free(frame, order));
      frames.push((frame, order));
    }
    let used: usize = (0..HUGE_ORDER).map(frames_of).sum();
    assert_eq!(l.free_frames(), TREE_SIZE - used);

    for &(frame, order) in &frames {
      l.put(frame, order).unwrap();
      assert!(l.is_free(frame, order));
    }
    assert_eq!(l.free_frames(), TREE_SIZE);
    assert!(l.snapshot() == before);
  }

  #[test]
  fn invalid_put() {
    let l = lower(TREE_SIZE, true);
    let frame = l.get(0, 0).unwrap();
    assert_eq!(l.put(frame + 1, 0), Err(Error::Address));
    l.put(frame, 0).unwrap();
    assert_eq!(l.put(frame, 0), Err(Error::Address));
    assert_eq!(l.put(TREE_SIZE, 0), Err(Error::Address));
    assert_eq!(l.put(1, 1), Err(Error::Address));
    assert_eq!(l.put(0, HUGE_ORDER), Err(Error::Address));
    assert_eq!(l.put(0, MAX_ORDER), Err(Error::Address));
    assert_eq!(l.put(0, MAX_ORDER + 1), Err(Error::Address));
    assert_eq!(l.put(usize::MAX, 0), Err(Error::Address));
    assert_eq!(l.put(usize::MAX - 1, 1), Err(Error::Address));
    assert_eq!(l.put(TREE_SIZE - CHILD_SIZE, MAX_ORDER), Err(Error::Address));
    assert!(!l.is_free(usize::MAX, 0));
    assert!(!l.is_free(usize::MAX - 1, 1));
    assert!(!l.is_free(TREE_SIZE, 0));
    assert!(l.is_free(TREE_SIZE - 1, 0));
    assert_eq!(l.free_frames(), TREE_SIZE);
  }

  #[test]
  fn huge_split() {
    let l = lower(CHILD_SIZE, true);
    assert_eq!(l.get(0, HUGE_ORDER), Ok(0));
    assert_eq!(l.get(0, HUGE_ORDER), Err(Error::Memory));
    assert_eq!(l.get(0, 0), Err(Error::Memory));

    // Freeing a single base frame splits the huge frame
    l.put(5, 0).unwrap();
    assert!(!l.child(0).huge());
    assert_eq!(l.free_frames(), 1);
    assert_eq!(l.get(0, HUGE_ORDER), Err(Error::Memory));
    assert_eq!(l.put(5, 0), Err(Error::Address));

    for frame in (0..CHILD_SIZE).filter(|&f| f != 5) {
      l.put(frame, 0).unwrap();
    }
    assert!(l.is_free(0, HUGE_ORDER));
    assert_eq!(l.get(0, HUGE_ORDER), Ok(0));
    l.put(0, HUGE_ORDER).unwrap();
    assert_eq!(l.free_frames(), CHILD_SIZE);
  }

  #[test]
  fn parallel_split() {
    const THREADS: usize = 4;
    let l = Arc::new(lower(2 * CHILD_SIZE, true));

    for _ in 0..200 {
      let huge = l.get(0, HUGE_ORDER).unwrap();
      let barrier = Arc::new(Barrier::new(THREADS));
      let handles: Vec<_> = (0..THREADS)
        .map(|t| {
          let l = l.clone();
          let barrier = barrier.clone();
          thread::spawn(move || {
            barrier.wait();
            // Interleaved, so every thread frees frames of every row
            for frame in (t..CHILD_SIZE).step_by(THREADS) {
              l.put(huge + frame, 0).unwrap();
            }
          })
        })
        .collect();
      for h in handles {
        h.join().unwrap();
      }

      assert!(l.is_free(huge, HUGE_ORDER));
      assert_eq!(l.child(child_from_frame(huge)), Child::of(CHILD_SIZE, false));
      assert_eq!(l.free_frames(), 2 * CHILD_SIZE);
    }
  }

  #[test]
  fn max_order() {
    let l = lower(3 * CHILD_SIZE, true);
    assert_eq!(l.get(0, MAX_ORDER), Ok(0));
    // The third child has no partner
    assert_eq!(l.get(0, MAX_ORDER), Err(Error::Memory));
    assert_eq!(l.get(0, HUGE_ORDER), Ok(2 * CHILD_SIZE));
    assert!(!l.is_free(0, MAX_ORDER));
    assert!(!l.is_free(2 * CHILD_SIZE, HUGE_ORDER));
    l.put(0, MAX_ORDER).unwrap();
    assert!(l.is_free(0, MAX_ORDER));
    assert_eq!(l.put(0, MAX_ORDER), Err(Error::Address));
  }

  #[test]
  fn partial_child() {
    let l = lower(CHILD_SIZE + 100, true);
    assert_eq!(l.get(CHILD_SIZE, HUGE_ORDER), Ok(0));
    assert_eq!(l.get(CHILD_SIZE, HUGE_ORDER), Err(Error::Memory));
    let mut n = 0;
    while l.get(CHILD_SIZE, 0).is_ok() {
      n += 1;
    }
    assert_eq!(n, 100);
  }

  #[test]
  fn recover() {
    let l = lower(2 * CHILD_SIZE, true);
    let a = l.get(0, 3).unwrap();
    let b = l.get(0, HUGE_ORDER).unwrap();
    assert_ne!(child_from_frame(a), child_from_frame(b));

    // Scramble the counters as if they were lost
    l.store(child_from_frame(a), Child::of(7, false));
    l.recover();
    assert_eq!(l.child(child_from_frame(a)), Child::of(CHILD_SIZE - 8, false));
    assert_eq!(l.child(child_from_frame(b)), Child::of(0, true));
    assert_eq!(l.free_frames(), CHILD_SIZE - 8);
    l.put(a, 3).unwrap();
    l.put(b, HUGE_ORDER).unwrap();
    assert_eq!(l.free_frames(), 2 * CHILD_SIZE);
  }

  #[test]
  fn parallel() {
    const THREADS: usize = 4;
    const ALLOCS: usize = TREE_SIZE / THREADS;
    let l = Arc::new(lower(TREE_SIZE, true));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
      .map(|t| {
        let l = l.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          barrier.wait();
          (0..ALLOCS).map(|_| l.get(t * 64, 0).unwrap()).collect::<Vec<_>>()
        })
      })
      .collect();
    let mut frames: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    frames.sort_unstable();
    frames.dedup();
    assert_eq!(frames.len(), TREE_SIZE);
    assert_eq!(l.free_frames(), 0);
  }
}
