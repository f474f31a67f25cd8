//! Scratchpad: keyed regions carved out of one aligned allocation.
//!
//! Primitives reserve regions at configuration time through a
//! `ScratchpadRegistry`; the caller books the registry once per invocation
//! and hands the resulting `Scratchpad` to every worker thread.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

use crate::types::{JitError, JitResult};

/// Region names.
pub type ScratchKey = &'static str;

/// Partial buffers of `CpuReducer` followers.
pub const KEY_REDUCER_SPACE: ScratchKey = "reducer.space";
/// Partial buffers of every `CpuReducer2D` thread.
pub const KEY_REDUCER_SPACE_2D: ScratchKey = "reducer.space_2d";

/// Page alignment requested for reducer regions.
pub const PAGE_ALIGN: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Region {
    offset: usize,
    size: usize,
}

/// Reservations collected before the allocation exists.
#[derive(Debug)]
pub struct ScratchpadRegistry {
    regions: HashMap<ScratchKey, Region>,
    size: usize,
    align: usize,
}

impl ScratchpadRegistry {
    pub fn new() -> Self {
        ScratchpadRegistry {
            regions: HashMap::new(),
            size: 0,
            align: 64,
        }
    }

    /// Reserve `bytes` for `key` at `align` (a power of two).
    pub fn reserve(&mut self, key: ScratchKey, bytes: usize, align: usize) -> JitResult<()> {
        if !align.is_power_of_two() {
            return Err(JitError::Scratchpad(format!("{key}: alignment {align} is not a power of two")));
        }
        if self.regions.contains_key(key) {
            return Err(JitError::Scratchpad(format!("{key} reserved twice")));
        }
        let offset = (self.size + align - 1) & !(align - 1);
        self.regions.insert(key, Region { offset, size: bytes });
        self.size = offset + bytes;
        self.align = self.align.max(align);
        log::trace!("scratchpad: {key} -> {bytes} bytes at {offset}");
        Ok(())
    }

    /// Total bytes the booked allocation will span.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, key: ScratchKey) -> bool {
        self.regions.contains_key(key)
    }

    /// Allocate zeroed storage for every reservation.
    pub fn book(&self) -> JitResult<Scratchpad> {
        let layout = Layout::from_size_align(self.size.max(1), self.align)
            .map_err(|e| JitError::Scratchpad(e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            JitError::Scratchpad(format!("failed to allocate {} bytes", layout.size()))
        })?;
        Ok(Scratchpad {
            ptr,
            layout,
            regions: self.regions.clone(),
        })
    }
}

impl Default for ScratchpadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One booked allocation.
///
/// Shared by reference between worker threads; which thread writes which
/// bytes is the caller's contract, as with the reducers' `*_nolock` calls.
#[derive(Debug)]
pub struct Scratchpad {
    ptr: NonNull<u8>,
    layout: Layout,
    regions: HashMap<ScratchKey, Region>,
}

unsafe impl Send for Scratchpad {}
unsafe impl Sync for Scratchpad {}

impl Scratchpad {
    /// Base address of `key`'s region.
    pub fn resolve(&self, key: ScratchKey) -> JitResult<*mut u8> {
        let r = self
            .regions
            .get(key)
            .ok_or_else(|| JitError::Scratchpad(format!("{key} was never reserved")))?;
        // SAFETY: every region lies inside the allocation.
        Ok(unsafe { self.ptr.as_ptr().add(r.offset) })
    }

    /// `resolve` typed, checking the region holds at least `len` elements.
    pub fn get<T>(&self, key: ScratchKey, len: usize) -> JitResult<*mut T> {
        let r = self
            .regions
            .get(key)
            .ok_or_else(|| JitError::Scratchpad(format!("{key} was never reserved")))?;
        let need = len * std::mem::size_of::<T>();
        if need > r.size {
            return Err(JitError::Scratchpad(format!(
                "{key}: {need} bytes requested from a {}-byte region",
                r.size
            )));
        }
        Ok(self.resolve(key)?.cast())
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Scratchpad {
    fn drop(&mut self) {
        // SAFETY: allocated in `book` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
