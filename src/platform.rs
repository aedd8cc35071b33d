use core::{
  mem,
  ops::Deref,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{Error, Result};

// =============================================================================
// Memory
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Types for which the all-zero bit pattern is a valid value.
///
/// # Safety
/// Only implement this for types made of integers and atomics.
pub(crate) unsafe trait Zeroed: Sync {}

/// Slice of metadata entries, either freshly mapped or placed in the managed memory.
pub(crate) struct Metadata<T: Zeroed> {
  ptr: NonNull<T>,
  len: usize,
  /// Mapped by us, unmapped on drop.
  mapped: bool,
}

unsafe impl<T: Zeroed> Send for Metadata<T> {}
unsafe impl<T: Zeroed> Sync for Metadata<T> {}

impl<T: Zeroed> Metadata<T> {
  /// Maps `len` zeroed entries of volatile memory.
  pub fn map(len: usize) -> Result<Self> {
    let size = Self::size_of(len);
    if size == 0 {
      return Ok(Self { ptr: NonNull::dangling(), len, mapped: false });
    }
    let ptr = unsafe { os_mmap(size) };
    match NonNull::new(ptr.cast::<T>()) {
      Some(ptr) => Ok(Self { ptr, len, mapped: true }),
      None => {
        log::warn!("metadata mmap of {size} bytes failed");
        Err(Error::Initialization)
      }
    }
  }

  /// Uses `len` entries starting at `ptr`, which outlive this handle.
  ///
  /// # Safety
  /// `ptr` must be aligned for `T` and valid for reads and writes of `len`
  /// entries while the returned handle is alive. Nobody else may access it
  /// except through the allocator.
  pub unsafe fn borrowed(ptr: *mut T, len: usize) -> Result<Self> {
    if !ptr.is_aligned() {
      return Err(Error::Initialization);
    }
    let ptr = NonNull::new(ptr).ok_or(Error::Initialization)?;
    Ok(Self { ptr, len, mapped: false })
  }

  /// Bytes needed for `len` entries.
  pub const fn size_of(len: usize) -> usize {
    len * mem::size_of::<T>()
  }
}

impl<T: Zeroed> Deref for Metadata<T> {
  type Target = [T];

  fn deref(&self) -> &[T] {
    unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }
}

impl<T: Zeroed> Drop for Metadata<T> {
  fn drop(&mut self) {
    if self.mapped {
      unsafe { os_munmap(self.ptr.as_ptr().cast(), Self::size_of(self.len)) };
    }
  }
}

// =============================================================================
// Cores
// =============================================================================

// Each thread gets a different ID
#[cfg_attr(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"), allow(dead_code))]
fn thread_id() -> usize {
  thread_local! {
    static TID: usize = {
      static CTR: AtomicUsize = AtomicUsize::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}

/// Core the calling thread currently runs on.
///
/// Only a hint for picking a per-core reservation; the allocator stays
/// correct if threads migrate or share the same index.
// Only supported in the latest x86 CPUs. Seems to be the fastest way to access CPU ID
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
pub fn current_core() -> usize {
  let cpu: u64;
  unsafe {
    // nomem - Doesn't read/write memory
    // nostack - Doesn't touch the stack pointer
    // preserves_flags - Doesn't modify CPU flags (EFLAGS/RFLAGS)
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

/// Core the calling thread currently runs on.
///
/// Only a hint for picking a per-core reservation; the allocator stays
/// correct if threads migrate or share the same index.
#[cfg(all(target_os = "linux", not(all(target_arch = "x86_64", feature = "rdpid"))))]
pub fn current_core() -> usize {
  let cpu = unsafe { libc::sched_getcpu() };
  if cpu < 0 { thread_id() } else { cpu as usize }
}

/// Core the calling thread currently runs on.
///
/// Only a hint for picking a per-core reservation; the allocator stays
/// correct if threads migrate or share the same index.
#[cfg(not(target_os = "linux"))]
pub fn current_core() -> usize {
  thread_id() & 7
}

#[cfg(test)]
mod test {
  use core::sync::atomic::AtomicU64;

  use super::*;

  #[repr(align(64))]
  struct Line([AtomicU64; 8]);
  unsafe impl Zeroed for Line {}

  #[test]
  fn mapped_is_zeroed() {
    let meta = Metadata::<Line>::map(100).unwrap();
    assert_eq!(meta.len(), 100);
    assert!(meta.iter().all(|l| l.0.iter().all(|w| w.load(Ordering::Relaxed) == 0)));
    meta[99].0[7].store(5, Ordering::Relaxed);
    assert_eq!(meta[99].0[7].load(Ordering::Relaxed), 5);
    assert_eq!(meta.as_ptr() as usize % 64, 0);
  }

  #[test]
  fn borrowed_alignment() {
    let mut backing = vec![0u64; 32];
    let misaligned = unsafe { backing.as_mut_ptr().cast::<u8>().add(1).cast::<Line>() };
    assert!(unsafe { Metadata::borrowed(misaligned, 1) }.is_err());
    assert!(unsafe { Metadata::<Line>::borrowed(null_mut(), 1) }.is_err());
  }

  #[test]
  fn core_is_stable_enough() {
    // Any value is fine, it only has to be callable from many threads.
    let cores: Vec<usize> = (0..4)
      .map(|_| std::thread::spawn(current_core))
      .map(|h| h.join().unwrap())
      .collect();
    assert_eq!(cores.len(), 4);
  }
}
