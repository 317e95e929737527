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

// On disk layout of the positional key file.
//
// Offset 0..2: magic 0xCA 0xFE. Records start at offset 2.
//
// Record (v1):
// [DELETED: 1][PREV: Int5][KEYLEN: u16 BE][KEY][VALUE: Blob]
//
// Record (v2, `.k2file`):
// [DELETED: 1][EXPIRE: Int5][PREV: Int5][KEYLEN: u16 BE][KEY][VALUE: Blob]
// EXPIRE - absolute unix seconds; LONG5_MAX means no expiry.
//
// PREV backward-links records sharing a bucket, 0 terminates the chain.
// Every link points strictly below its own position, so chains are
// acyclic by construction. DELETED and EXPIRE are rewritten in place,
// and `update` may swap VALUE for an encoding of exactly the same size;
// PREV, KEY and a record's physical extent are immutable once appended.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::codec::{self, LONG5_MAX};
use crate::datafile::{disable_read_ahead, read_exact_at, write_all_at};
use crate::error::{Error, Result};
use crate::flush::Flushable;

const MAGIC: [u8; 2] = [0xCA, 0xFE];
const APPEND_BUF_SIZE: usize = 16 * 1024;
const PROBE_SIZE: usize = 128;
pub const FIRST_RECORD: i64 = 2;
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

pub fn now_sec() -> i64 {
	match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
		Ok(d) => d.as_secs() as i64,
		Err(_) => 0,
	}
}

#[derive(Debug, Clone)]
pub struct Record {
	pub pos: i64,
	pub deleted: bool,
	/// Absolute expiry in unix seconds; `LONG5_MAX` on v1 records.
	pub expire: i64,
	pub prev: i64,
	pub key: Vec<u8>,
	pub value: Vec<u8>,
	/// Offset just past this record; where a sequential scan continues.
	pub end: i64,
}

impl Record {
	pub fn is_live(&self, now: i64) -> bool {
		!self.deleted && self.expire > now
	}
}

struct Inner {
	file: File,
	append: Vec<u8>,
	file_end: u64,
}

impl Inner {
	fn write_through(&mut self) -> Result<()> {
		if !self.append.is_empty() {
			write_all_at(&self.file, &self.append, self.file_end)?;
			self.file_end += self.append.len() as u64;
			self.append.clear();
		}
		Ok(())
	}
}

/// Append-only record log with positional reads and in-place flag
/// rewrites. One mutex covers the append buffer and the file handle;
/// chain walks hold it for the whole traversal.
pub struct KeyFile {
	path: PathBuf,
	ttl: bool,
	inner: Mutex<Inner>,
	dirty: AtomicBool,
}

impl KeyFile {
	pub fn open(path: &Path, ttl: bool) -> Result<KeyFile> {
		let file = std::fs::OpenOptions::new().create(true).read(true).write(true).open(path)?;
		disable_read_ahead(&file)?;
		let mut file_end = file.metadata()?.len();
		if file_end == 0 {
			write_all_at(&file, &MAGIC, 0)?;
			file_end = MAGIC.len() as u64;
		} else {
			let mut magic = [0u8; 2];
			read_exact_at(&file, &mut magic, 0)?;
			if magic != MAGIC {
				return Err(Error::Corruption(format!("bad magic in {:?}", path)));
			}
		}
		log::debug!(target: "tracestore", "Opened key file {:?}, {} bytes", path, file_end);
		Ok(KeyFile {
			path: path.into(),
			ttl,
			inner: Mutex::new(Inner {
				file,
				append: Vec::with_capacity(APPEND_BUF_SIZE),
				file_end,
			}),
			dirty: AtomicBool::new(false),
		})
	}

	/// Fixed bytes before the key: deleted flag, optional expire, prev,
	/// key length.
	fn head_size(&self) -> usize {
		1 + if self.ttl { 5 } else { 0 } + 5 + 2
	}

	fn expire_of(ttl_sec: i64) -> i64 {
		if ttl_sec < 0 {
			LONG5_MAX
		} else {
			now_sec() + ttl_sec
		}
	}

	fn check_key(key: &[u8]) -> Result<()> {
		if key.is_empty() {
			return Err(Error::InvalidArgument("empty key".into()));
		}
		if key.len() > MAX_KEY_LEN {
			return Err(Error::InvalidArgument(format!("key too long: {}", key.len())));
		}
		Ok(())
	}

	/// Appends a record chained behind `prev` and returns its position.
	/// The position is final even while the record sits in the append
	/// buffer.
	pub fn append(&self, prev: i64, key: &[u8], value: &[u8]) -> Result<i64> {
		self.append_expiring(prev, key, value, LONG5_MAX)
	}

	pub fn append_ttl(&self, prev: i64, key: &[u8], value: &[u8], ttl_sec: i64) -> Result<i64> {
		debug_assert!(self.ttl);
		self.append_expiring(prev, key, value, Self::expire_of(ttl_sec))
	}

	fn append_expiring(&self, prev: i64, key: &[u8], value: &[u8], expire: i64) -> Result<i64> {
		Self::check_key(key)?;
		let mut inner = self.inner.lock();
		let pos = inner.file_end as i64 + inner.append.len() as i64;
		debug_assert!(prev < pos);
		let append = &mut inner.append;
		append.push(0);
		if self.ttl {
			codec::write_int5(append, expire);
		}
		codec::write_int5(append, prev);
		codec::write_short_bytes(append, key);
		codec::write_blob(append, value);
		if inner.append.len() >= APPEND_BUF_SIZE {
			inner.write_through()?;
		}
		self.dirty.store(true, Ordering::Relaxed);
		Ok(pos)
	}

	fn read_record_locked(&self, inner: &mut Inner, pos: i64) -> Result<Record> {
		inner.write_through()?;
		let end = inner.file_end;
		if pos < FIRST_RECORD || pos as u64 >= end {
			return Err(Error::Corruption(format!(
				"record position {} out of bounds in {:?}",
				pos, self.path
			)));
		}
		// One probe read covers the whole record in the common case; the
		// tail is fetched separately only when the value runs past it.
		let avail = std::cmp::min(PROBE_SIZE as u64, end - pos as u64) as usize;
		let mut probe = [0u8; PROBE_SIZE];
		read_exact_at(&inner.file, &mut probe[..avail], pos as u64)?;

		let head = self.head_size();
		if avail < head {
			return Err(Error::Corruption(format!("truncated record header at {}", pos)));
		}
		let mut reader = codec::Reader::new(&probe[..avail]);
		let deleted = reader.read_u8()? != 0;
		let expire = if self.ttl { reader.read_int5()? } else { LONG5_MAX };
		let prev = reader.read_int5()?;
		let key_len = reader.read_u16()? as usize;
		let key_end = head + key_len;

		let prefix_at = pos as u64 + key_end as u64;
		if prefix_at >= end {
			return Err(Error::Corruption(format!("truncated record key at {}", pos)));
		}
		let prefix_avail = std::cmp::min(5, (end - prefix_at) as usize);
		let mut prefix = [0u8; 5];
		if avail >= key_end + prefix_avail {
			prefix[..prefix_avail].copy_from_slice(&probe[key_end..key_end + prefix_avail]);
		} else {
			read_exact_at(&inner.file, &mut prefix[..prefix_avail], prefix_at)?;
		}
		let (extra, value_len) = match prefix[0] {
			255 => {
				if prefix_avail < 3 {
					return Err(Error::Corruption(format!("truncated blob length at {}", pos)));
				}
				(2usize, ((prefix[1] as usize) << 8) | prefix[2] as usize)
			}
			254 => {
				if prefix_avail < 5 {
					return Err(Error::Corruption(format!("truncated blob length at {}", pos)));
				}
				(
					4usize,
					((prefix[1] as usize) << 24)
						| ((prefix[2] as usize) << 16)
						| ((prefix[3] as usize) << 8)
						| prefix[4] as usize,
				)
			}
			l => (0usize, l as usize),
		};
		let value_off = key_end + 1 + extra;
		let total = value_off + value_len;
		if pos as u64 + total as u64 > end {
			return Err(Error::Corruption(format!("truncated record value at {}", pos)));
		}

		let key = if avail >= key_end {
			probe[head..key_end].to_vec()
		} else {
			let mut key = vec![0u8; key_len];
			read_exact_at(&inner.file, &mut key, pos as u64 + head as u64)?;
			key
		};
		let value = if avail >= total {
			probe[value_off..total].to_vec()
		} else {
			let mut value = vec![0u8; value_len];
			read_exact_at(&inner.file, &mut value, pos as u64 + value_off as u64)?;
			value
		};
		Ok(Record { pos, deleted, expire, prev, key, value, end: pos + total as i64 })
	}

	pub fn record_at(&self, pos: i64) -> Result<Record> {
		let mut inner = self.inner.lock();
		self.read_record_locked(&mut inner, pos)
	}

	pub fn prev_pos_at(&self, pos: i64) -> Result<i64> {
		let mut inner = self.inner.lock();
		inner.write_through()?;
		let mut buf = [0u8; 5];
		let at = pos as u64 + 1 + if self.ttl { 5 } else { 0 };
		read_exact_at(&inner.file, &mut buf, at)?;
		Ok(codec::int5_of(&buf))
	}

	pub fn set_deleted(&self, pos: i64, deleted: bool) -> Result<()> {
		let mut inner = self.inner.lock();
		inner.write_through()?;
		write_all_at(&inner.file, &[deleted as u8], pos as u64)?;
		self.dirty.store(true, Ordering::Relaxed);
		Ok(())
	}

	/// Rewrites the expiry in place. Negative `ttl_sec` clears it.
	pub fn set_ttl(&self, pos: i64, ttl_sec: i64) -> Result<()> {
		if !self.ttl {
			return Err(Error::InvalidArgument("not a TTL key file".into()));
		}
		let mut inner = self.inner.lock();
		inner.write_through()?;
		let expire = Self::expire_of(ttl_sec);
		write_all_at(&inner.file, &codec::int5_bytes(expire), pos as u64 + 1)?;
		self.dirty.store(true, Ordering::Relaxed);
		Ok(())
	}

	/// Deleted-or-expired check from a single small read.
	pub fn is_dead(&self, pos: i64) -> Result<bool> {
		let mut inner = self.inner.lock();
		inner.write_through()?;
		if self.ttl {
			let mut buf = [0u8; 6];
			read_exact_at(&inner.file, &mut buf, pos as u64)?;
			Ok(buf[0] != 0 || codec::int5_of(&buf[1..]) <= now_sec())
		} else {
			let mut buf = [0u8; 1];
			read_exact_at(&inner.file, &mut buf, pos as u64)?;
			Ok(buf[0] != 0)
		}
	}

	/// In-place value replacement. The new encoding must occupy exactly
	/// the bytes of the existing one, otherwise false is returned and
	/// the record is left untouched for the caller to append a fresh
	/// one. A record's physical extent never changes; sequential scans
	/// frame records by it.
	pub fn update(&self, pos: i64, value: &[u8]) -> Result<bool> {
		let mut inner = self.inner.lock();
		let record = self.read_record_locked(&mut inner, pos)?;
		let key_end = self.head_size() + record.key.len();
		let old_encoded = (record.end - pos) as usize - key_end;
		if codec::blob_size(value.len()) != old_encoded {
			return Ok(false);
		}
		let mut encoded = Vec::with_capacity(codec::blob_size(value.len()));
		codec::write_blob(&mut encoded, value);
		write_all_at(&inner.file, &encoded, pos as u64 + key_end as u64)?;
		self.dirty.store(true, Ordering::Relaxed);
		Ok(true)
	}

	/// Walks a bucket chain backwards from `head` under one lock
	/// acquisition. The callback returns false to stop. It must not call
	/// back into this file.
	pub fn walk_chain<F: FnMut(&Record) -> bool>(&self, head: i64, mut f: F) -> Result<()> {
		let mut inner = self.inner.lock();
		let mut pos = head;
		while pos > 0 {
			let record = self.read_record_locked(&mut inner, pos)?;
			debug_assert!(record.prev < record.pos);
			let prev = record.prev;
			if !f(&record) {
				break;
			}
			pos = prev;
		}
		Ok(())
	}

	/// Sequential scan from the first record. A truncated tail record is
	/// treated as absent and ends the scan.
	pub fn scan<F: FnMut(&Record) -> bool>(&self, mut f: F) -> Result<()> {
		let mut inner = self.inner.lock();
		inner.write_through()?;
		let mut pos = FIRST_RECORD;
		while (pos as u64) < inner.file_end {
			match self.read_record_locked(&mut inner, pos) {
				Ok(record) => {
					let end = record.end;
					if !f(&record) {
						break;
					}
					pos = end;
				}
				Err(Error::Corruption(e)) => {
					log::warn!(target: "tracestore", "Scan of {:?} stopped: {}", self.path, e);
					break;
				}
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}

	/// Logical length: bytes on disk plus the append buffer.
	pub fn len(&self) -> u64 {
		let inner = self.inner.lock();
		inner.file_end + inner.append.len() as u64
	}
}

impl Drop for KeyFile {
	fn drop(&mut self) {
		if let Err(e) = self.inner.get_mut().write_through() {
			log::warn!(target: "tracestore", "Final flush of {:?} failed: {}", self.path, e);
		}
	}
}

impl Flushable for KeyFile {
	fn name(&self) -> String {
		format!("{:?}", self.path)
	}

	fn is_dirty(&self) -> bool {
		self.dirty.load(Ordering::Relaxed)
	}

	fn flush(&self) -> Result<()> {
		self.dirty.store(false, Ordering::Relaxed);
		self.inner.lock().write_through()
	}

	fn interval(&self) -> std::time::Duration {
		std::time::Duration::from_secs(2)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::testutil::TempDir;

	#[test]
	fn append_and_read_back() {
		let dir = TempDir::new("keyfile-append");
		let keys = KeyFile::open(&dir.path("t.kfile"), false).unwrap();

		let p1 = keys.append(0, b"alpha", b"one").unwrap();
		let p2 = keys.append(p1, b"beta", b"two").unwrap();
		assert_eq!(p1, FIRST_RECORD);
		assert!(p2 > p1);

		let r1 = keys.record_at(p1).unwrap();
		assert_eq!(r1.key, b"alpha");
		assert_eq!(r1.value, b"one");
		assert_eq!(r1.prev, 0);
		assert!(!r1.deleted);
		assert_eq!(r1.expire, LONG5_MAX);

		let r2 = keys.record_at(p2).unwrap();
		assert_eq!(r2.prev, p1);
		assert!(r2.prev < r2.pos);
		assert_eq!(keys.prev_pos_at(p2).unwrap(), p1);
	}

	#[test]
	fn positions_survive_reopen() {
		let dir = TempDir::new("keyfile-reopen");
		let path = dir.path("t.kfile");
		let (p1, p2);
		{
			let keys = KeyFile::open(&path, false).unwrap();
			p1 = keys.append(0, b"k", b"v1").unwrap();
			p2 = keys.append(p1, b"k", b"v2").unwrap();
			keys.flush().unwrap();
		}
		let keys = KeyFile::open(&path, false).unwrap();
		assert_eq!(keys.record_at(p1).unwrap().value, b"v1");
		assert_eq!(keys.record_at(p2).unwrap().value, b"v2");
	}

	#[test]
	fn delete_flag_round_trip() {
		let dir = TempDir::new("keyfile-delete");
		let keys = KeyFile::open(&dir.path("t.kfile"), false).unwrap();
		let pos = keys.append(0, b"k", b"v").unwrap();
		assert!(!keys.is_dead(pos).unwrap());
		keys.set_deleted(pos, true).unwrap();
		assert!(keys.is_dead(pos).unwrap());
		assert!(keys.record_at(pos).unwrap().deleted);
		keys.set_deleted(pos, false).unwrap();
		assert!(!keys.is_dead(pos).unwrap());
	}

	#[test]
	fn ttl_records_expire() {
		let dir = TempDir::new("keyfile-ttl");
		let keys = KeyFile::open(&dir.path("t.k2file"), true).unwrap();
		let live = keys.append_ttl(0, b"k1", b"v", 3600).unwrap();
		let dead = keys.append_ttl(live, b"k2", b"v", 0).unwrap();
		let forever = keys.append_ttl(dead, b"k3", b"v", -1).unwrap();

		assert!(!keys.is_dead(live).unwrap());
		assert!(keys.is_dead(dead).unwrap());
		assert!(!keys.is_dead(forever).unwrap());
		assert_eq!(keys.record_at(forever).unwrap().expire, LONG5_MAX);

		keys.set_ttl(dead, 3600).unwrap();
		assert!(!keys.is_dead(dead).unwrap());
	}

	#[test]
	fn update_replaces_exact_fit_only() {
		let dir = TempDir::new("keyfile-update");
		let keys = KeyFile::open(&dir.path("t.kfile"), false).unwrap();
		let pos = keys.append(0, b"k", b"0123456789").unwrap();
		let tail = keys.append(pos, b"k2", b"tail").unwrap();

		assert!(keys.update(pos, b"abcdefghij").unwrap());
		assert_eq!(keys.record_at(pos).unwrap().value, b"abcdefghij");

		// A shorter encoding would shrink the record's frame; refused.
		assert!(!keys.update(pos, b"short").unwrap());
		assert_eq!(keys.record_at(pos).unwrap().value, b"abcdefghij");

		assert!(!keys.update(pos, b"01234567890").unwrap());
		assert_eq!(keys.record_at(pos).unwrap().value, b"abcdefghij");

		// Neighbours are untouched and a sequential scan still frames
		// every record.
		assert_eq!(keys.record_at(tail).unwrap().value, b"tail");
		let mut seen = Vec::new();
		keys.scan(|r| {
			seen.push(r.value.clone());
			true
		})
		.unwrap();
		assert_eq!(seen, vec![b"abcdefghij".to_vec(), b"tail".to_vec()]);
	}

	#[test]
	fn chain_walk_is_newest_first() {
		let dir = TempDir::new("keyfile-chain");
		let keys = KeyFile::open(&dir.path("t.kfile"), false).unwrap();
		let mut head = 0;
		for i in 0..5u8 {
			head = keys.append(head, b"k", &[i]).unwrap();
		}
		let mut seen = Vec::new();
		keys.walk_chain(head, |r| {
			seen.push(r.value[0]);
			true
		})
		.unwrap();
		assert_eq!(seen, vec![4, 3, 2, 1, 0]);

		seen.clear();
		keys.walk_chain(head, |r| {
			seen.push(r.value[0]);
			seen.len() < 2
		})
		.unwrap();
		assert_eq!(seen, vec![4, 3], "early stop");
	}

	#[test]
	fn scan_is_insertion_order() {
		let dir = TempDir::new("keyfile-scan");
		let keys = KeyFile::open(&dir.path("t.kfile"), false).unwrap();
		for i in 0..10u8 {
			keys.append(0, &[b'k', i], &[i]).unwrap();
		}
		let mut seen = Vec::new();
		keys.scan(|r| {
			seen.push(r.value[0]);
			true
		})
		.unwrap();
		assert_eq!(seen, (0..10).collect::<Vec<u8>>());
	}

	#[test]
	fn large_values_cross_the_probe() {
		let dir = TempDir::new("keyfile-large");
		let keys = KeyFile::open(&dir.path("t.kfile"), false).unwrap();
		let value = crate::testutil::random_value(70_000);
		let pos = keys.append(0, b"big", &value).unwrap();
		let after = keys.append(pos, b"big", b"x").unwrap();

		let r = keys.record_at(pos).unwrap();
		assert_eq!(r.value, value);
		assert_eq!(r.end, after);
	}

	#[test]
	fn bad_magic_is_rejected() {
		let dir = TempDir::new("keyfile-magic");
		let path = dir.path("t.kfile");
		std::fs::write(&path, b"notakeyfile").unwrap();
		assert!(KeyFile::open(&path, false).is_err());
	}

	#[test]
	fn oversized_key_is_invalid() {
		let dir = TempDir::new("keyfile-keylen");
		let keys = KeyFile::open(&dir.path("t.kfile"), false).unwrap();
		assert!(keys.append(0, &[], b"v").is_err());
		assert!(keys.append(0, &vec![0u8; MAX_KEY_LEN + 1], b"v").is_err());
	}
}
