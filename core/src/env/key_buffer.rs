//! Shared key scratch buffer
//!
//! Keys are serialized into one fixed buffer that is reused for every
//! lookup. After a lookup the buffer header records what the engine
//! reported: size, offset, region and the version stamp.
//!
//! Header layout (little endian):
//!
//! | offset | width | field   |
//! |--------|-------|---------|
//! | 0      | 4     | size    |
//! | 8      | 4     | offset  |
//! | 12     | 4     | region  |
//! | 16     | 8     | version |
//!
//! The key itself starts at [`KEY_OFFSET`].

use bytes::{Buf, BufMut};

use crate::engine::{EntryLocation, MAX_KEY_SIZE, NOT_FOUND_SIZE};
use crate::error::{StoreError, StoreResult};

pub const KEY_BUFFER_SIZE: usize = 2048;
pub const KEY_OFFSET: usize = 32;

const SIZE_AT: usize = 0;
const OFFSET_AT: usize = 8;
const REGION_AT: usize = 12;
const VERSION_AT: usize = 16;

/// Anything that can be written as a store key
pub trait Key {
	fn encoded_len(&self) -> usize;
	/// Write the key into `target`, which is exactly `encoded_len` bytes.
	fn write_to(&self, target: &mut [u8]);
}

impl Key for [u8] {
	fn encoded_len(&self) -> usize {
		self.len()
	}

	fn write_to(&self, target: &mut [u8]) {
		target.copy_from_slice(self);
	}
}

impl Key for Vec<u8> {
	fn encoded_len(&self) -> usize {
		self.len()
	}

	fn write_to(&self, target: &mut [u8]) {
		target.copy_from_slice(self);
	}
}

impl Key for str {
	fn encoded_len(&self) -> usize {
		self.len()
	}

	fn write_to(&self, target: &mut [u8]) {
		target.copy_from_slice(self.as_bytes());
	}
}

impl Key for String {
	fn encoded_len(&self) -> usize {
		self.len()
	}

	fn write_to(&self, target: &mut [u8]) {
		target.copy_from_slice(self.as_bytes());
	}
}

// Integers are big endian so byte order matches numeric order.
impl Key for u32 {
	fn encoded_len(&self) -> usize {
		4
	}

	fn write_to(&self, mut target: &mut [u8]) {
		target.put_u32(*self);
	}
}

impl Key for u64 {
	fn encoded_len(&self) -> usize {
		8
	}

	fn write_to(&self, mut target: &mut [u8]) {
		target.put_u64(*self);
	}
}

impl Key for i64 {
	fn encoded_len(&self) -> usize {
		8
	}

	fn write_to(&self, mut target: &mut [u8]) {
		target.put_u64((*self as u64) ^ (1 << 63));
	}
}

impl<T: Key + ?Sized> Key for &T {
	fn encoded_len(&self) -> usize {
		(**self).encoded_len()
	}

	fn write_to(&self, target: &mut [u8]) {
		(**self).write_to(target)
	}
}

/// Serialize `key` into an owned vector, enforcing the size limit.
pub fn encode_key<K: Key + ?Sized>(key: &K) -> StoreResult<Vec<u8>> {
	let len = key.encoded_len();
	if len > MAX_KEY_SIZE {
		return Err(StoreError::KeyTooLarge {
			size: len,
			max: MAX_KEY_SIZE,
		});
	}
	let mut out = vec![0u8; len];
	key.write_to(&mut out);
	Ok(out)
}

pub struct KeyBuffer {
	buf: Box<[u8; KEY_BUFFER_SIZE]>,
	key_len: usize,
}

impl KeyBuffer {
	pub fn new() -> Self {
		Self {
			buf: Box::new([0u8; KEY_BUFFER_SIZE]),
			key_len: 0,
		}
	}

	/// Serialize `key` into the buffer and return the encoded bytes.
	pub fn encode<K: Key + ?Sized>(&mut self, key: &K) -> StoreResult<&[u8]> {
		let len = key.encoded_len();
		if len > MAX_KEY_SIZE {
			return Err(StoreError::KeyTooLarge {
				size: len,
				max: MAX_KEY_SIZE,
			});
		}
		key.write_to(&mut self.buf[KEY_OFFSET..KEY_OFFSET + len]);
		self.key_len = len;
		Ok(self.key())
	}

	/// The most recently encoded key
	pub fn key(&self) -> &[u8] {
		&self.buf[KEY_OFFSET..KEY_OFFSET + self.key_len]
	}

	/// Record the outcome of a lookup in the header.
	pub fn record(&mut self, location: Option<&EntryLocation>) {
		let header = &mut self.buf[..KEY_OFFSET];
		match location {
			Some(loc) => {
				(&mut header[SIZE_AT..SIZE_AT + 4]).put_u32_le(loc.length);
				(&mut header[OFFSET_AT..OFFSET_AT + 4]).put_u32_le(loc.offset as u32);
				(&mut header[REGION_AT..REGION_AT + 4]).put_u32_le(loc.region);
				(&mut header[VERSION_AT..VERSION_AT + 8]).put_f64_le(loc.version);
			}
			None => {
				(&mut header[SIZE_AT..SIZE_AT + 4]).put_u32_le(NOT_FOUND_SIZE);
			}
		}
	}

	/// Size of the last value looked up, `NOT_FOUND_SIZE` after a miss
	pub fn last_size(&self) -> u32 {
		let mut b = &self.buf[SIZE_AT..SIZE_AT + 4];
		b.get_u32_le()
	}

	pub fn last_offset(&self) -> u32 {
		let mut b = &self.buf[OFFSET_AT..OFFSET_AT + 4];
		b.get_u32_le()
	}

	pub fn last_region(&self) -> u32 {
		let mut b = &self.buf[REGION_AT..REGION_AT + 4];
		b.get_u32_le()
	}

	/// Version stamp of the last value found
	pub fn last_version(&self) -> Option<f64> {
		if self.last_size() == NOT_FOUND_SIZE {
			return None;
		}
		let mut b = &self.buf[VERSION_AT..VERSION_AT + 8];
		Some(b.get_f64_le())
	}

	/// Where the last value found lives, read back from the header
	pub fn last_location(&self) -> Option<EntryLocation> {
		let version = self.last_version()?;
		Some(EntryLocation {
			region: self.last_region(),
			offset: self.last_offset() as u64,
			length: self.last_size(),
			version,
		})
	}
}

impl Default for KeyBuffer {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_encode_keys() {
		let mut buffer = KeyBuffer::new();
		assert_eq!(buffer.encode("abc").unwrap(), b"abc");
		assert_eq!(buffer.encode(&7u32).unwrap(), &[0, 0, 0, 7]);
		assert_eq!(buffer.key(), &[0, 0, 0, 7]);

		let neg = encode_key(&-1i64).unwrap();
		let pos = encode_key(&1i64).unwrap();
		assert!(neg < pos);
	}

	#[test]
	fn test_key_too_large() {
		let mut buffer = KeyBuffer::new();
		let key = vec![1u8; MAX_KEY_SIZE + 1];
		match buffer.encode(&key) {
			Err(StoreError::KeyTooLarge { size, max }) => {
				assert_eq!(size, MAX_KEY_SIZE + 1);
				assert_eq!(max, MAX_KEY_SIZE);
			}
			other => panic!("expected KeyTooLarge, got {:?}", other.map(|k| k.to_vec())),
		}
		assert!(buffer.encode(&vec![1u8; MAX_KEY_SIZE]).is_ok());
	}

	#[test]
	fn test_record_lookup() {
		let mut buffer = KeyBuffer::new();
		buffer.record(Some(&EntryLocation {
			region: 2,
			offset: 40,
			length: 5,
			version: 9.5,
		}));
		assert_eq!(buffer.last_size(), 5);
		assert_eq!(buffer.last_offset(), 40);
		assert_eq!(buffer.last_region(), 2);
		assert_eq!(buffer.last_version(), Some(9.5));
		assert_eq!(buffer.last_location().map(|loc| (loc.region, loc.offset)), Some((2, 40)));

		buffer.record(None);
		assert_eq!(buffer.last_size(), NOT_FOUND_SIZE);
		assert_eq!(buffer.last_version(), None);
		assert!(buffer.last_location().is_none());
	}
}
