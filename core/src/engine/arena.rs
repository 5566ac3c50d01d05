//! Mapped data region
//!
//! Values are appended to one anonymous memory map. The map is split into
//! regions of a fixed span; an allocation never crosses a region boundary.

use bytes::Buf;
use memmap2::MmapMut;
use std::sync::Arc;

use super::{EngineError, EngineResult, VERSION_STAMP_SIZE};

/// One memory map plus its layout
pub struct MapArena {
	ptr: *mut u8,
	len: usize,
	region_span: u64,
	generation: u64,
	_map: MmapMut,
}

impl MapArena {
	/// Map a fresh zeroed arena of `len` bytes
	pub fn new(len: usize, region_span: u64, generation: u64) -> EngineResult<Self> {
		if len == 0 || region_span == 0 {
			return Err(EngineError::Problem("map size and region span must be non-zero".into()));
		}

		let mut map = MmapMut::map_anon(len)
			.map_err(|e| EngineError::Problem(format!("failed to map {} bytes: {}", len, e)))?;
		let ptr = map.as_mut_ptr();

		Ok(Self {
			ptr,
			len,
			region_span,
			generation,
			_map: map,
		})
	}

	/// Map a larger arena holding a copy of the first `used` bytes of this one
	pub fn grown(&self, len: usize, used: usize) -> EngineResult<Self> {
		let next = MapArena::new(len.max(used), self.region_span, self.generation + 1)?;
		unsafe {
			std::ptr::copy_nonoverlapping(self.ptr, next.ptr, used.min(self.len));
		}
		Ok(next)
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn region_span(&self) -> u64 {
		self.region_span
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Find the start of a `need`-byte allocation at or after `used`,
	/// skipping to the next region when it would straddle a boundary.
	pub fn place(&self, used: usize, need: usize) -> EngineResult<Option<usize>> {
		let span = self.region_span as usize;
		if need > span {
			return Err(EngineError::ValueTooLarge(need));
		}

		let mut start = (used + 7) & !7;
		if start / span != (start + need - 1) / span {
			start = (start / span + 1) * span;
		}

		if start + need > self.len {
			return Ok(None);
		}
		Ok(Some(start))
	}

	/// Write a version stamp followed by the value at `at`.
	///
	/// # Safety
	/// `at .. at + 8 + value.len()` must be inside the arena and must not be
	/// visible to any reader yet.
	pub unsafe fn write_entry(&self, at: usize, version: f64, value: &[u8]) {
		let stamp = version.to_le_bytes();
		unsafe {
			std::ptr::copy_nonoverlapping(stamp.as_ptr(), self.ptr.add(at), VERSION_STAMP_SIZE);
			std::ptr::copy_nonoverlapping(
				value.as_ptr(),
				self.ptr.add(at + VERSION_STAMP_SIZE),
				value.len(),
			);
		}
	}

	/// Borrow `len` bytes at absolute offset `at`.
	///
	/// # Safety
	/// The range must be inside the arena and must hold committed or
	/// transaction-private data that no writer is touching.
	pub unsafe fn bytes(&self, at: usize, len: usize) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr.add(at), len) }
	}

	/// Read the stamp stored just before the value at `value_at`.
	///
	/// # Safety
	/// Same contract as [`MapArena::bytes`].
	pub unsafe fn version_before(&self, value_at: usize) -> f64 {
		let mut stamp = unsafe { self.bytes(value_at - VERSION_STAMP_SIZE, VERSION_STAMP_SIZE) };
		stamp.get_f64_le()
	}
}

unsafe impl Send for MapArena {}
unsafe impl Sync for MapArena {}

/// Raw handle over part of one region of the mapped arena.
///
/// Holding the handle keeps the underlying map alive, even after the engine
/// has remapped to a bigger arena.
#[derive(Clone)]
pub struct MappedRegion {
	arena: Arc<MapArena>,
	region: u32,
	start: u64,
	len: u64,
}

impl MappedRegion {
	pub(crate) fn new(arena: Arc<MapArena>, region: u32, start: u64, len: u64) -> Self {
		Self {
			arena,
			region,
			start,
			len,
		}
	}

	pub fn region(&self) -> u32 {
		self.region
	}

	/// Start offset of the handle inside its region
	pub fn start(&self) -> u64 {
		self.start
	}

	pub fn len(&self) -> u64 {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Generation of the map this handle was cut from
	pub fn map_generation(&self) -> u64 {
		self.arena.generation()
	}

	pub fn contains(&self, offset: u64, len: u64) -> bool {
		offset >= self.start && offset + len <= self.start + self.len
	}

	/// Bytes at `offset` (relative to the region) if they lie inside the handle.
	pub fn slice(&self, offset: u64, len: u64) -> Option<&[u8]> {
		if !self.contains(offset, len) {
			return None;
		}
		let at = self.region as u64 * self.arena.region_span() + offset;
		// Locations handed out by the engine only cover committed values,
		// which are never rewritten.
		Some(unsafe { self.arena.bytes(at as usize, len as usize) })
	}
}

impl std::fmt::Debug for MappedRegion {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MappedRegion")
			.field("region", &self.region)
			.field("start", &self.start)
			.field("len", &self.len)
			.field("generation", &self.arena.generation())
			.finish()
	}
}
