//! Zero-copy windows over the mapped data region

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::engine::{EntryLocation, MappedRegion, StorageEngine};
use crate::error::{StoreError, StoreResult};

/// Window bases are aligned to this boundary
pub const WINDOW_ALIGN: u64 = 0x10000;

/// Table of mapped windows, one per region
pub(crate) struct WindowTracker {
	windows: HashMap<u32, MappedRegion>,
	span: u64,
	generation: Arc<AtomicU64>,
}

impl WindowTracker {
	pub fn new(span: u64) -> Self {
		Self {
			windows: HashMap::new(),
			span,
			generation: Arc::new(AtomicU64::new(0)),
		}
	}

	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::Acquire)
	}

	/// Make every view handed out so far stale.
	pub fn invalidate(&self) {
		self.generation.fetch_add(1, Ordering::AcqRel);
	}

	/// Start of the window currently mapped for `region`
	pub fn window_start(&self, region: u32) -> Option<u64> {
		self.windows.get(&region).map(MappedRegion::start)
	}

	/// A view over the value at `location`, reusing the region's window when
	/// it still covers the value.
	pub fn view(&mut self, engine: &dyn StorageEngine, location: &EntryLocation) -> StoreResult<ValueView> {
		let offset = location.offset;
		let len = location.length as u64;
		let map_generation = engine.map_generation();

		let reusable = self
			.windows
			.get(&location.region)
			.filter(|w| w.map_generation() == map_generation && w.contains(offset, len))
			.cloned();

		let window = match reusable {
			Some(window) => window,
			None => {
				let base = (offset / WINDOW_ALIGN) * WINDOW_ALIGN;
				let end = (base + self.span).max(offset + len);
				if let Some(previous) = self.window_start(location.region) {
					trace!(
						"Moving window of region {} from {:#x} to {:#x}",
						location.region, previous, base
					);
				}
				let window = engine.mapped_region(location.region, base..end)?;
				if !window.contains(offset, len) {
					return Err(StoreError::Transaction(format!(
						"value at {}+{} is outside the mapped window {:?}",
						offset, len, window
					)));
				}
				self.windows.insert(location.region, window.clone());
				window
			}
		};

		Ok(ValueView {
			window,
			offset,
			len,
			generation: self.generation(),
			current: Arc::clone(&self.generation),
		})
	}
}

/// Borrowed view of a stored value.
///
/// The view stays readable until the next commit or remap; after that
/// [`ValueView::bytes`] reports [`StoreError::SnapshotStale`]. Copy the data
/// out with [`ValueView::to_vec`] to keep it longer.
#[derive(Clone)]
pub struct ValueView {
	window: MappedRegion,
	offset: u64,
	len: u64,
	generation: u64,
	current: Arc<AtomicU64>,
}

impl ValueView {
	pub fn len(&self) -> usize {
		self.len as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn is_valid(&self) -> bool {
		self.current.load(Ordering::Acquire) == self.generation
	}

	pub fn bytes(&self) -> StoreResult<&[u8]> {
		if !self.is_valid() {
			return Err(StoreError::SnapshotStale);
		}
		self.window
			.slice(self.offset, self.len)
			.ok_or(StoreError::SnapshotStale)
	}

	pub fn to_vec(&self) -> StoreResult<Vec<u8>> {
		self.bytes().map(<[u8]>::to_vec)
	}
}

impl std::fmt::Debug for ValueView {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ValueView")
			.field("region", &self.window.region())
			.field("offset", &self.offset)
			.field("len", &self.len)
			.field("valid", &self.is_valid())
			.finish()
	}
}
