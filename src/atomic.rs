//! Packed records behind a single atomic word.
//!
//! Every shared structure of the allocator (children, trees, per-core
//! reservations) is a small bitfield that fits into one integer. [`Atom`]
//! stores such a record in the matching std atomic and updates it with a
//! bounded "load, compute, compare-and-swap" loop.

use core::{
  hint,
  marker::PhantomData,
  sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering},
};

use crate::{Error, Result};

/// Maximum number of CAS attempts of a single update.
pub(crate) const MAX_ATOMIC_RETRY: usize = 1 << 16;

/// Maximum number of pause iterations of a single spin-wait.
pub(crate) const SPIN_RETRIES: usize = 1 << 22;

const LOAD_ORDER: Ordering = Ordering::Acquire;
const UPDATE_ORDER: Ordering = Ordering::AcqRel;
const STORE_ORDER: Ordering = Ordering::Release;

/// Integer that has a std atomic counterpart.
pub(crate) trait Raw: Copy + Eq {
  type Atomic: Send + Sync;

  fn atomic(self) -> Self::Atomic;
  fn load(atomic: &Self::Atomic) -> Self;
  fn store(atomic: &Self::Atomic, value: Self);
  fn compare_exchange(atomic: &Self::Atomic, current: Self, new: Self) -> core::result::Result<Self, Self>;
  fn compare_exchange_weak(atomic: &Self::Atomic, current: Self, new: Self) -> core::result::Result<Self, Self>;
}

macro_rules! raw_impl {
  ($int:ty, $atomic:ty) => {
    impl Raw for $int {
      type Atomic = $atomic;

      #[inline(always)]
      fn atomic(self) -> $atomic {
        <$atomic>::new(self)
      }
      #[inline(always)]
      fn load(atomic: &$atomic) -> Self {
        atomic.load(LOAD_ORDER)
      }
      #[inline(always)]
      fn store(atomic: &$atomic, value: Self) {
        atomic.store(value, STORE_ORDER)
      }
      #[inline(always)]
      fn compare_exchange(atomic: &$atomic, current: Self, new: Self) -> core::result::Result<Self, Self> {
        atomic.compare_exchange(current, new, UPDATE_ORDER, LOAD_ORDER)
      }
      #[inline(always)]
      fn compare_exchange_weak(atomic: &$atomic, current: Self, new: Self) -> core::result::Result<Self, Self> {
        atomic.compare_exchange_weak(current, new, UPDATE_ORDER, LOAD_ORDER)
      }
    }
  };
}

raw_impl!(u16, AtomicU16);
raw_impl!(u32, AtomicU32);
raw_impl!(u64, AtomicU64);

/// Record with an explicit encoding into a raw integer.
pub(crate) trait Packed: Copy + Eq + From<Self::Raw> + Into<Self::Raw> {
  type Raw: Raw;
}

/// Atomic cell holding a [`Packed`] record.
#[repr(transparent)]
pub(crate) struct Atom<T: Packed>(<T::Raw as Raw>::Atomic, PhantomData<T>);

impl<T: Packed> Atom<T> {
  pub fn new(value: T) -> Self {
    Self(value.into().atomic(), PhantomData)
  }

  #[inline]
  pub fn load(&self) -> T {
    T::from(T::Raw::load(&self.0))
  }

  #[inline]
  pub fn store(&self, value: T) {
    T::Raw::store(&self.0, value.into())
  }

  /// Single strong CAS, returns the previous value on success and the current one on failure.
  #[inline]
  pub fn compare_exchange(&self, current: T, new: T) -> core::result::Result<T, T> {
    T::Raw::compare_exchange(&self.0, current.into(), new.into())
      .map(T::from)
      .map_err(T::from)
  }

  /// Applies `f` to the current value and stores its result with CAS, retrying on contention.
  ///
  /// Returns the previous value if the update was stored, or the last observed
  /// value if `f` declined the update (returned `None`).
  /// [`Error::Retry`] is returned if the update kept failing for [`MAX_ATOMIC_RETRY`] attempts.
  #[inline]
  pub fn fetch_update<F: FnMut(T) -> Option<T>>(&self, mut f: F) -> Result<core::result::Result<T, T>> {
    let mut old = T::Raw::load(&self.0);
    for _ in 0..MAX_ATOMIC_RETRY {
      let Some(new) = f(T::from(old)) else {
        return Ok(Err(T::from(old)));
      };
      match T::Raw::compare_exchange_weak(&self.0, old, new.into()) {
        Ok(_) => return Ok(Ok(T::from(old))),
        Err(current) => old = current,
      }
    }
    log::warn!("atomic update exceeded {MAX_ATOMIC_RETRY} attempts");
    Err(Error::Retry)
  }

  /// Like [`Atom::fetch_update`], but only returns the previous value if the update was stored.
  #[inline]
  pub fn update<F: FnMut(T) -> Option<T>>(&self, f: F) -> Result<Option<T>> {
    Ok(self.fetch_update(f)?.ok())
  }
}

/// Unwraps an update that must not fail, anything else means the state is corrupted.
pub(crate) fn must<T>(res: Result<Option<T>>, what: &str) -> Result<T> {
  match res {
    Ok(Some(v)) => Ok(v),
    _ => {
      log::warn!("{what} failed, the allocator state is corrupted");
      Err(Error::Corruption)
    }
  }
}

/// Spins until `done` returns true, giving up after [`SPIN_RETRIES`] iterations.
pub(crate) fn spin_until<F: FnMut() -> bool>(mut done: F) -> bool {
  for _ in 0..SPIN_RETRIES {
    if done() {
      return true;
    }
    hint::spin_loop();
  }
  done()
}
