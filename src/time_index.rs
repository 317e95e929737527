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

// Time-bucketed multi-value index. The bucket table resolves a 500 ms
// window of the local day; the chained records carry the exact 8-byte
// big-endian timestamp as their key, so a window's records are
// re-sorted before they reach the caller. Range reads walk wall-clock
// windows between the bounds, capped at one full table revolution.

use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;

use crate::bucket::{TimeBuckets, TIME_BUCKET_MS, TIME_SLOTS};
use crate::error::{Error, Result};
use crate::flush::{FlushScheduler, Flushable};
use crate::keyfile::KeyFile;

pub struct TimeIndex {
	buckets: Arc<TimeBuckets>,
	keys: Arc<KeyFile>,
}

fn time_key(time_ms: i64) -> [u8; 8] {
	time_ms.to_be_bytes()
}

fn key_time(key: &[u8]) -> i64 {
	match key.try_into() {
		Ok(bytes) => i64::from_be_bytes(bytes),
		Err(_) => 0,
	}
}

fn check_time(time_ms: i64) -> Result<()> {
	if time_ms <= 0 {
		return Err(Error::InvalidArgument(format!("non-positive time {}", time_ms)));
	}
	Ok(())
}

impl TimeIndex {
	pub fn open(dir: &Path, name: &str, scheduler: Option<&FlushScheduler>) -> Result<TimeIndex> {
		let buckets = Arc::new(TimeBuckets::open(&dir.join(format!("{}.hfile", name)))?);
		let keys = Arc::new(KeyFile::open(&dir.join(format!("{}.kfile", name)), false)?);
		if let Some(scheduler) = scheduler {
			scheduler.register(Arc::downgrade(&keys) as std::sync::Weak<dyn Flushable>);
			scheduler.register(Arc::downgrade(&buckets) as std::sync::Weak<dyn Flushable>);
		}
		Ok(TimeIndex { buckets, keys })
	}

	pub fn put(&self, time_ms: i64, value: &[u8]) -> Result<i64> {
		check_time(time_ms)?;
		let prev = self.buckets.get(time_ms);
		let pos = self.keys.append(prev, &time_key(time_ms), value)?;
		self.buckets.put(time_ms, pos);
		self.buckets.add_count(1);
		Ok(pos)
	}

	/// Records of one 500 ms window intersected with `[stime, etime]`,
	/// oldest first.
	fn window(&self, slot_time: i64, stime: i64, etime: i64) -> Result<Vec<(i64, Vec<u8>)>> {
		let head = self.buckets.get(slot_time);
		if head == 0 {
			return Ok(Vec::new());
		}
		let mut records = Vec::new();
		self.keys.walk_chain(head, |record| {
			if !record.deleted {
				let ts = key_time(&record.key);
				if ts >= stime && ts <= etime {
					records.push((ts, record.value.clone()));
				}
			}
			true
		})?;
		records.sort_by_key(|(ts, _)| *ts);
		Ok(records)
	}

	/// Forward range read in non-decreasing time order. Returns false
	/// when the callback stopped the iteration.
	pub fn read<F: FnMut(i64, &[u8]) -> bool>(
		&self,
		stime: i64,
		etime: i64,
		mut f: F,
	) -> Result<bool> {
		check_time(stime)?;
		let mut t = stime - stime % TIME_BUCKET_MS;
		let mut steps = 0;
		while t <= etime && steps < TIME_SLOTS {
			for (ts, value) in self.window(t, stime, etime)? {
				if !f(ts, &value) {
					return Ok(false);
				}
			}
			t += TIME_BUCKET_MS;
			steps += 1;
		}
		Ok(true)
	}

	/// Reverse range read in non-increasing time order.
	pub fn read_from_end<F: FnMut(i64, &[u8]) -> bool>(
		&self,
		stime: i64,
		etime: i64,
		mut f: F,
	) -> Result<bool> {
		check_time(stime)?;
		let mut t = etime - etime % TIME_BUCKET_MS;
		let mut steps = 0;
		while t >= stime - TIME_BUCKET_MS + 1 && steps < TIME_SLOTS {
			let mut window = self.window(t, stime, etime)?;
			window.reverse();
			for (ts, value) in window {
				if !f(ts, &value) {
					return Ok(false);
				}
			}
			t -= TIME_BUCKET_MS;
			steps += 1;
		}
		Ok(true)
	}

	/// Values of the earliest and latest records in range, without
	/// enumerating everything between.
	pub fn range_endpoints(&self, stime: i64, etime: i64) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
		let mut first = None;
		self.read(stime, etime, |_, value| {
			first = Some(value.to_vec());
			false
		})?;
		let first = match first {
			Some(first) => first,
			None => return Ok(None),
		};
		let mut last = None;
		self.read_from_end(stime, etime, |_, value| {
			last = Some(value.to_vec());
			false
		})?;
		Ok(last.map(|last| (first, last)))
	}

	/// Tombstones every live record in the slot's chain and clears the
	/// slot.
	pub fn delete(&self, time_ms: i64) -> Result<usize> {
		check_time(time_ms)?;
		let head = self.buckets.get(time_ms);
		if head == 0 {
			return Ok(0);
		}
		let mut positions = Vec::new();
		self.keys.walk_chain(head, |record| {
			if !record.deleted {
				positions.push(record.pos);
			}
			true
		})?;
		for &pos in &positions {
			self.keys.set_deleted(pos, true)?;
		}
		self.buckets.put(time_ms, 0);
		self.buckets.add_count(-(positions.len() as i32));
		Ok(positions.len())
	}

	pub fn count(&self) -> i32 {
		self.buckets.count()
	}

	pub fn flush(&self) -> Result<()> {
		self.keys.flush()?;
		self.buckets.flush()
	}
}
