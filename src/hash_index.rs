// Copyright 2020-2026 Tracestore Developers.
// This file is part of Tracestore.

// Tracestore is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Tracestore is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Tracestore.  If not, see <http://www.gnu.org/licenses/>.

// Keyed index: a bucket table resolving a 31-bit key hash to the head of
// a backward-linked record chain in the companion key file. Inserts are
// one append plus one slot write; the slot write is the linearisation
// point, so readers see a key either before or after a put, never torn.

use std::path::Path;
use std::sync::Arc;

use crate::bucket::HashBuckets;
use crate::display::hex;
use crate::error::Result;
use crate::flush::{FlushScheduler, Flushable};
use crate::keyfile::{now_sec, KeyFile, Record};

#[derive(Clone, Copy)]
pub struct IndexOptions {
	/// Bucket file size at creation, in megabytes. Ignored for an
	/// existing file.
	pub bucket_mb: u32,
	/// Use the TTL record format (`.k2file`).
	pub ttl: bool,
	/// Chain depth above which lookups log a warning.
	pub warn_depth: usize,
}

impl Default for IndexOptions {
	fn default() -> IndexOptions {
		IndexOptions { bucket_mb: 1, ttl: false, warn_depth: 100 }
	}
}

pub struct HashIndex {
	name: String,
	buckets: Arc<HashBuckets>,
	keys: Arc<KeyFile>,
	warn_depth: usize,
}

pub fn key_hash(key: &[u8]) -> u32 {
	crc32fast::hash(key)
}

impl HashIndex {
	pub fn open(
		dir: &Path,
		name: &str,
		options: IndexOptions,
		scheduler: Option<&FlushScheduler>,
	) -> Result<HashIndex> {
		let hfile = dir.join(format!("{}.hfile", name));
		let kfile = dir.join(format!("{}.{}", name, if options.ttl { "k2file" } else { "kfile" }));
		let buckets = Arc::new(HashBuckets::open(&hfile, options.bucket_mb)?);
		let keys = Arc::new(KeyFile::open(&kfile, options.ttl)?);
		if let Some(scheduler) = scheduler {
			scheduler.register(Arc::downgrade(&keys) as std::sync::Weak<dyn Flushable>);
			scheduler.register(Arc::downgrade(&buckets) as std::sync::Weak<dyn Flushable>);
		}
		Ok(HashIndex { name: name.to_string(), buckets, keys, warn_depth: options.warn_depth })
	}

	pub fn put(&self, key: &[u8], value: &[u8]) -> Result<i64> {
		let hash = key_hash(key);
		let prev = self.buckets.get(hash);
		let pos = self.keys.append(prev, key, value)?;
		self.buckets.put(hash, pos);
		Ok(pos)
	}

	pub fn put_ttl(&self, key: &[u8], value: &[u8], ttl_sec: i64) -> Result<i64> {
		let hash = key_hash(key);
		let prev = self.buckets.get(hash);
		let pos = self.keys.append_ttl(prev, key, value, ttl_sec)?;
		self.buckets.put(hash, pos);
		Ok(pos)
	}

	fn walk_matches<F: FnMut(&Record) -> bool>(&self, key: &[u8], mut f: F) -> Result<()> {
		let head = self.buckets.get(key_hash(key));
		if head == 0 {
			return Ok(());
		}
		let now = now_sec();
		let mut depth = 0usize;
		self.keys.walk_chain(head, |record| {
			depth += 1;
			if record.key == key && record.is_live(now) {
				f(record)
			} else {
				true
			}
		})?;
		if depth > self.warn_depth {
			log::warn!(
				target: "tracestore",
				"{}: chain for key {} is {} records deep (warn at {})",
				self.name,
				hex(key),
				depth,
				self.warn_depth,
			);
		}
		Ok(())
	}

	/// Newest live value for the key.
	pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let mut found = None;
		self.walk_matches(key, |record| {
			found = Some(record.value.clone());
			false
		})?;
		Ok(found)
	}

	/// Every live value for the key, newest first.
	pub fn get_all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
		let mut found = Vec::new();
		self.walk_matches(key, |record| {
			found.push(record.value.clone());
			true
		})?;
		Ok(found)
	}

	pub fn has_key(&self, key: &[u8]) -> Result<bool> {
		let mut found = false;
		self.walk_matches(key, |_| {
			found = true;
			false
		})?;
		Ok(found)
	}

	/// Tombstones every live match. The bucket slot keeps heading the
	/// chain so older records stay reachable.
	pub fn delete(&self, key: &[u8]) -> Result<usize> {
		let mut positions = Vec::new();
		self.walk_matches(key, |record| {
			positions.push(record.pos);
			true
		})?;
		for &pos in &positions {
			self.keys.set_deleted(pos, true)?;
		}
		Ok(positions.len())
	}

	/// Sequential scan of every non-deleted record in insertion order.
	/// Expired records are included; `scan_live` is the expiry-aware
	/// variant.
	pub fn scan<F: FnMut(&[u8], &[u8]) -> bool>(&self, mut f: F) -> Result<()> {
		self.keys.scan(|record| {
			if record.deleted {
				true
			} else {
				f(&record.key, &record.value)
			}
		})
	}

	/// Raw record scan, tombstones included.
	pub fn scan_records<F: FnMut(&Record) -> bool>(&self, f: F) -> Result<()> {
		self.keys.scan(f)
	}

	pub fn scan_live<F: FnMut(&[u8], &[u8]) -> bool>(&self, mut f: F) -> Result<()> {
		let now = now_sec();
		self.keys.scan(|record| {
			if record.is_live(now) {
				f(&record.key, &record.value)
			} else {
				true
			}
		})
	}

	/// Replaces the newest live record's value in place when it fits,
	/// appending a fresh record otherwise.
	pub fn update_or_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.update_or_append(key, value, None)
	}

	pub fn update_or_put_ttl(&self, key: &[u8], value: &[u8], ttl_sec: i64) -> Result<()> {
		self.update_or_append(key, value, Some(ttl_sec))
	}

	fn update_or_append(&self, key: &[u8], value: &[u8], ttl_sec: Option<i64>) -> Result<()> {
		let mut live_pos = None;
		self.walk_matches(key, |record| {
			live_pos = Some(record.pos);
			false
		})?;
		if let Some(pos) = live_pos {
			if self.keys.update(pos, value)? {
				if let Some(ttl) = ttl_sec {
					self.keys.set_ttl(pos, ttl)?;
				}
				return Ok(());
			}
		}
		match ttl_sec {
			Some(ttl) => self.put_ttl(key, value, ttl)?,
			None => self.put(key, value)?,
		};
		Ok(())
	}

	/// Returns the newest live value and pushes its expiry out.
	pub fn get_and_refresh_ttl(&self, key: &[u8], ttl_sec: i64) -> Result<Option<Vec<u8>>> {
		let mut found = None;
		self.walk_matches(key, |record| {
			found = Some((record.pos, record.value.clone()));
			false
		})?;
		match found {
			Some((pos, value)) => {
				self.keys.set_ttl(pos, ttl_sec)?;
				Ok(Some(value))
			}
			None => Ok(None),
		}
	}

	/// Occupied bucket slots.
	pub fn count(&self) -> i32 {
		self.buckets.count()
	}

	pub fn bucket_capacity(&self) -> u64 {
		self.buckets.capacity()
	}

	pub fn flush(&self) -> Result<()> {
		self.keys.flush()?;
		self.buckets.flush()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::testutil::TempDir;

	fn index(dir: &TempDir) -> HashIndex {
		HashIndex::open(dir.root(), "test", Default::default(), None).unwrap()
	}

	#[test]
	fn put_get_has_key() {
		let dir = TempDir::new("hidx-basic");
		let idx = index(&dir);
		for i in 0..100u32 {
			idx.put(&i.to_be_bytes(), format!("value-{}", i).as_bytes()).unwrap();
		}
		for i in 0..100u32 {
			let key = i.to_be_bytes();
			assert_eq!(idx.get(&key).unwrap().unwrap(), format!("value-{}", i).as_bytes());
			assert!(idx.has_key(&key).unwrap());
		}
		assert!(!idx.has_key(&1000u32.to_be_bytes()).unwrap());
		assert!(idx.get(&1000u32.to_be_bytes()).unwrap().is_none());
	}

	#[test]
	fn re_put_shadows_and_get_all_orders() {
		let dir = TempDir::new("hidx-reput");
		let idx = index(&dir);
		idx.put(b"k", b"v1").unwrap();
		idx.put(b"k", b"v2").unwrap();
		assert_eq!(idx.get(b"k").unwrap().unwrap(), b"v2");
		assert_eq!(idx.get_all(b"k").unwrap(), vec![b"v2".to_vec(), b"v1".to_vec()]);
	}

	#[test]
	fn delete_then_re_put_re_exposes() {
		let dir = TempDir::new("hidx-delete");
		let idx = index(&dir);
		idx.put(b"k", b"v1").unwrap();
		idx.put(b"k", b"v2").unwrap();
		assert_eq!(idx.delete(b"k").unwrap(), 2);
		assert!(idx.get(b"k").unwrap().is_none());
		assert!(!idx.has_key(b"k").unwrap());

		idx.put(b"k", b"v3").unwrap();
		assert_eq!(idx.get(b"k").unwrap().unwrap(), b"v3");
		assert_eq!(idx.get_all(b"k").unwrap(), vec![b"v3".to_vec()]);
	}

	#[test]
	fn empty_value_is_empty_not_none() {
		let dir = TempDir::new("hidx-empty");
		let idx = index(&dir);
		idx.put(b"k", &[]).unwrap();
		assert_eq!(idx.get(b"k").unwrap().unwrap(), Vec::<u8>::new());
	}

	#[test]
	fn persistence_across_reopen() {
		let dir = TempDir::new("hidx-reopen");
		{
			let idx = index(&dir);
			for i in 0..50u32 {
				idx.put(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
			}
			idx.delete(&7u32.to_be_bytes()).unwrap();
			idx.flush().unwrap();
		}
		let idx = index(&dir);
		for i in 0..50u32 {
			let got = idx.get(&i.to_be_bytes()).unwrap();
			if i == 7 {
				assert!(got.is_none());
			} else {
				assert_eq!(got.unwrap(), i.to_le_bytes());
			}
		}
	}

	#[test]
	fn ttl_visibility_window() {
		let dir = TempDir::new("hidx-ttl");
		let options = IndexOptions { ttl: true, ..Default::default() };
		let idx = HashIndex::open(dir.root(), "ttl", options, None).unwrap();

		idx.put_ttl(b"short", b"v", 0).unwrap();
		idx.put_ttl(b"long", b"v", 3600).unwrap();
		idx.put_ttl(b"forever", b"v", -1).unwrap();

		assert!(idx.get(b"short").unwrap().is_none());
		assert_eq!(idx.get(b"long").unwrap().unwrap(), b"v");
		assert_eq!(idx.get(b"forever").unwrap().unwrap(), b"v");

		// scan sees expired records, scan_live does not.
		let mut scanned = 0;
		idx.scan(|_, _| {
			scanned += 1;
			true
		})
		.unwrap();
		assert_eq!(scanned, 3);
		let mut live = 0;
		idx.scan_live(|_, _| {
			live += 1;
			true
		})
		.unwrap();
		assert_eq!(live, 2);

		assert_eq!(idx.get_and_refresh_ttl(b"long", 7200).unwrap().unwrap(), b"v");

		// A TTL-aware re-put keeps a single record when the value fits.
		idx.update_or_put_ttl(b"long", b"w", 60).unwrap();
		assert_eq!(idx.get_all(b"long").unwrap(), vec![b"w".to_vec()]);
	}

	#[test]
	fn update_or_put_fits_and_falls_back() {
		let dir = TempDir::new("hidx-update");
		let idx = index(&dir);
		idx.put(b"k", b"0123456789").unwrap();
		idx.update_or_put(b"k", b"abcdefghij").unwrap();
		assert_eq!(idx.get_all(b"k").unwrap().len(), 1, "in-place when it fits exactly");
		assert_eq!(idx.get(b"k").unwrap().unwrap(), b"abcdefghij");

		idx.update_or_put(b"k", b"a-much-longer-replacement").unwrap();
		assert_eq!(idx.get(b"k").unwrap().unwrap(), b"a-much-longer-replacement");
		assert_eq!(idx.get_all(b"k").unwrap().len(), 2, "append fallback for a longer value");

		idx.update_or_put(b"k", b"tiny").unwrap();
		assert_eq!(idx.get(b"k").unwrap().unwrap(), b"tiny");
		assert_eq!(idx.get_all(b"k").unwrap().len(), 3, "append fallback for a shorter one too");
	}

	#[test]
	fn concurrent_distinct_puts_lose_nothing() {
		let dir = TempDir::new("hidx-concurrent");
		let idx = Arc::new(index(&dir));
		let mut handles = Vec::new();
		for t in 0..4u32 {
			let idx = idx.clone();
			handles.push(std::thread::spawn(move || {
				for i in 0..250u32 {
					let key = (t * 1000 + i).to_be_bytes();
					idx.put(&key, &key).unwrap();
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}
		let mut live = 0;
		for t in 0..4u32 {
			for i in 0..250u32 {
				let key = (t * 1000 + i).to_be_bytes();
				assert_eq!(idx.get(&key).unwrap().unwrap(), key);
				live += 1;
			}
		}
		assert_eq!(live, 1000);
	}
}
