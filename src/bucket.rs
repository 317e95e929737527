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

// Bucket tables (`.hfile`).
//
// [MAGIC: 2][_: 2][COUNT: i32 BE][RESERVED: 1016][SLOT 0: Int5][SLOT 1] ...
//
// A slot holds the head position of a record chain in the companion key
// file, 0 when empty. The whole table is a file-backed memory map; the
// flush scheduler pushes it back periodically.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::codec;
use crate::day::ms_since_local_midnight;
use crate::error::{Error, Result};
use crate::flush::Flushable;

const MAGIC: [u8; 2] = [0xCA, 0xFE];
const COUNT_OFFSET: usize = 4;
const HEADER_SIZE: u64 = 1024;
const SLOT_SIZE: u64 = 5;

/// 24 hours of 500 ms windows; the time table capacity is a format
/// constant.
pub const TIME_SLOTS: u64 = 172_800;
pub const TIME_BUCKET_MS: i64 = 500;

struct BucketFile {
	path: PathBuf,
	map: Mutex<MmapMut>,
	capacity: u64,
	dirty: AtomicBool,
}

impl BucketFile {
	fn open(path: &Path, file_size: u64) -> Result<BucketFile> {
		let file = std::fs::OpenOptions::new().create(true).read(true).write(true).open(path)?;
		let existing = file.metadata()?.len();
		// The on-disk capacity wins; a table is never grown or shrunk on
		// open.
		let file_size = if existing > 0 { existing } else { file_size };
		if file_size < HEADER_SIZE + SLOT_SIZE {
			return Err(Error::InvalidConfiguration(format!(
				"bucket file size {} too small for {:?}",
				file_size, path
			)));
		}
		if existing == 0 {
			file.set_len(file_size)?;
		}
		let mut map = unsafe { MmapMut::map_mut(&file)? };
		if existing == 0 {
			map[0..2].copy_from_slice(&MAGIC);
			map.flush()?;
		} else if map[0..2] != MAGIC {
			return Err(Error::Corruption(format!("bad magic in {:?}", path)));
		}
		let capacity = (file_size - HEADER_SIZE) / SLOT_SIZE;
		log::debug!(target: "tracestore", "Opened bucket table {:?}, {} slots", path, capacity);
		Ok(BucketFile {
			path: path.into(),
			map: Mutex::new(map),
			capacity,
			dirty: AtomicBool::new(false),
		})
	}

	fn slot_at(&self, slot: u64) -> i64 {
		debug_assert!(slot < self.capacity);
		let map = self.map.lock();
		let at = (HEADER_SIZE + slot * SLOT_SIZE) as usize;
		codec::int5_of(&map[at..at + SLOT_SIZE as usize])
	}

	/// Writes a slot; optionally bumps the live count when an empty slot
	/// becomes occupied.
	fn set_slot(&self, slot: u64, pos: i64, count_if_new: bool) {
		debug_assert!(slot < self.capacity);
		let mut map = self.map.lock();
		let at = (HEADER_SIZE + slot * SLOT_SIZE) as usize;
		if count_if_new && pos != 0 {
			let existing = codec::int5_of(&map[at..at + SLOT_SIZE as usize]);
			if existing == 0 {
				let count = read_count(&map) + 1;
				map[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&count.to_be_bytes());
			}
		}
		map[at..at + SLOT_SIZE as usize].copy_from_slice(&codec::int5_bytes(pos));
		self.dirty.store(true, Ordering::Relaxed);
	}

	fn add_count(&self, delta: i32) {
		let mut map = self.map.lock();
		let count = read_count(&map) + delta;
		map[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&count.to_be_bytes());
		self.dirty.store(true, Ordering::Relaxed);
	}

	fn count(&self) -> i32 {
		read_count(&self.map.lock())
	}

	fn flush(&self) -> Result<()> {
		self.dirty.store(false, Ordering::Relaxed);
		Ok(self.map.lock().flush()?)
	}
}

fn read_count(map: &MmapMut) -> i32 {
	let b = &map[COUNT_OFFSET..COUNT_OFFSET + 4];
	((b[0] as i32) << 24) | ((b[1] as i32) << 16) | ((b[2] as i32) << 8) | b[3] as i32
}

/// Hash-keyed bucket table. Capacity is fixed at creation from a
/// configured megabyte size; the offline rehash tool rebuilds at a larger
/// one.
pub struct HashBuckets {
	file: BucketFile,
}

impl HashBuckets {
	pub fn open(path: &Path, mb: u32) -> Result<HashBuckets> {
		let mb = std::cmp::max(mb, 1);
		Ok(HashBuckets { file: BucketFile::open(path, mb as u64 * 1024 * 1024)? })
	}

	fn slot_of(&self, hash: u32) -> u64 {
		(hash & 0x7fff_ffff) as u64 % self.file.capacity
	}

	pub fn get(&self, hash: u32) -> i64 {
		self.file.slot_at(self.slot_of(hash))
	}

	pub fn put(&self, hash: u32, pos: i64) {
		self.file.set_slot(self.slot_of(hash), pos, true);
	}

	pub fn count(&self) -> i32 {
		self.file.count()
	}

	pub fn capacity(&self) -> u64 {
		self.file.capacity
	}
}

impl Flushable for HashBuckets {
	fn name(&self) -> String {
		format!("{:?}", self.file.path)
	}

	fn is_dirty(&self) -> bool {
		self.file.dirty.load(Ordering::Relaxed)
	}

	fn flush(&self) -> Result<()> {
		self.file.flush()
	}

	fn interval(&self) -> std::time::Duration {
		std::time::Duration::from_secs(4)
	}
}

/// Time-keyed bucket table, one slot per 500 ms of the local day. The
/// live count is maintained by the owning index through `add_count`, a
/// slot write never bumps it.
pub struct TimeBuckets {
	file: BucketFile,
}

impl TimeBuckets {
	pub fn open(path: &Path) -> Result<TimeBuckets> {
		Ok(TimeBuckets { file: BucketFile::open(path, HEADER_SIZE + TIME_SLOTS * SLOT_SIZE)? })
	}

	pub fn slot_of(time_ms: i64) -> u64 {
		(ms_since_local_midnight(time_ms) / TIME_BUCKET_MS) as u64 % TIME_SLOTS
	}

	pub fn get(&self, time_ms: i64) -> i64 {
		self.file.slot_at(Self::slot_of(time_ms))
	}

	pub fn put(&self, time_ms: i64, pos: i64) {
		self.file.set_slot(Self::slot_of(time_ms), pos, false);
	}

	pub fn add_count(&self, delta: i32) {
		self.file.add_count(delta);
	}

	pub fn count(&self) -> i32 {
		self.file.count()
	}
}

impl Flushable for TimeBuckets {
	fn name(&self) -> String {
		format!("{:?}", self.file.path)
	}

	fn is_dirty(&self) -> bool {
		self.file.dirty.load(Ordering::Relaxed)
	}

	fn flush(&self) -> Result<()> {
		self.file.flush()
	}

	fn interval(&self) -> std::time::Duration {
		std::time::Duration::from_secs(4)
	}
}
