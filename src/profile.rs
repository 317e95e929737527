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

// Step-level profiles. An agent may ship several blocks for one txid;
// the txid chain collects them all and a read reassembles them in
// insertion order. Blocks are opaque bytes to this store.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::codec;
use crate::compress;
use crate::datafile::{read_framed_u32, write_framed_u32, DataFile};
use crate::day::{date_of_ms, day_dir, DayMap};
use crate::error::{Error, Result};
use crate::flush::FlushScheduler;
use crate::hash_index::{HashIndex, IndexOptions};
use crate::options::Options;
use crate::queue::BatchSink;

const KIND: &str = "xlog";
const INDEX_MB: u32 = 4;

#[derive(Debug, Clone)]
pub struct ProfileRecord {
	/// Parent transaction end time; routes the block to a day.
	pub time: i64,
	pub txid: i64,
	pub block: Vec<u8>,
}

pub struct ProfileDay {
	data: DataFile,
	index: HashIndex,
}

impl ProfileDay {
	fn flush(&self) -> Result<()> {
		self.data.flush()?;
		self.index.flush()
	}
}

pub struct ProfileStore {
	base: PathBuf,
	days: DayMap<ProfileDay>,
	scheduler: Arc<FlushScheduler>,
	compress: bool,
	warn_depth: usize,
}

impl ProfileStore {
	pub fn new(options: &Options, scheduler: Arc<FlushScheduler>) -> ProfileStore {
		ProfileStore {
			base: options.base_dir.clone(),
			days: DayMap::new(),
			scheduler,
			compress: options.compress_profile,
			warn_depth: options.traversal_warn,
		}
	}

	fn open_day(&self, date: &str) -> Result<ProfileDay> {
		let dir = day_dir(&self.base, date, KIND);
		std::fs::create_dir_all(&dir)?;
		let options = IndexOptions { bucket_mb: INDEX_MB, ttl: false, warn_depth: self.warn_depth };
		Ok(ProfileDay {
			data: DataFile::open(&dir.join("xlog_prof.data"))?,
			index: HashIndex::open(&dir, "xlog_prof", options, Some(&self.scheduler))?,
		})
	}

	fn day_for_read(&self, date: &str) -> Result<Option<Arc<ProfileDay>>> {
		self.days.get_if_present(date, || {
			if day_dir(&self.base, date, KIND).join("xlog_prof.kfile").is_file() {
				self.open_day(date).map(Some)
			} else {
				Ok(None)
			}
		})
	}

	pub fn write(&self, record: &ProfileRecord) -> Result<()> {
		if record.time <= 0 {
			return Err(Error::InvalidArgument(format!("non-positive time {}", record.time)));
		}
		let date = date_of_ms(record.time);
		let day = self.days.get_or_open(&date, || self.open_day(&date))?;
		let body = compress::wrap(record.block.clone(), self.compress)?;
		let offset = write_framed_u32(&day.data, &body)?;
		day.index.put(&record.txid.to_be_bytes(), &codec::int5_bytes(offset as i64))?;
		Ok(())
	}

	/// Blocks for a txid in insertion order. Negative `max` returns them
	/// all, otherwise the first `max` written.
	pub fn read(&self, date: &str, txid: i64, max: i64) -> Result<Vec<Vec<u8>>> {
		let day = match self.day_for_read(date)? {
			Some(day) => day,
			None => return Ok(Vec::new()),
		};
		let mut offsets = day.index.get_all(&txid.to_be_bytes())?;
		offsets.reverse();
		if max >= 0 {
			offsets.truncate(max as usize);
		}
		let mut blocks = Vec::with_capacity(offsets.len());
		for value in offsets {
			let body = read_framed_u32(&day.data, codec::int5_of(&value) as u64)?;
			blocks.push(compress::unwrap(&body)?);
		}
		Ok(blocks)
	}

	pub fn purge_old_days(&self, keep: &HashSet<String>) {
		let purged = self.days.purge(keep);
		if purged > 0 {
			log::info!(target: "tracestore", "profile: closed {} old day containers", purged);
		}
	}

	pub fn flush_all(&self) {
		for day in self.days.values() {
			if let Err(e) = day.flush() {
				log::warn!(target: "tracestore", "profile flush failed: {}", e);
			}
		}
	}

	pub fn close(&self) {
		self.flush_all();
		self.days.clear();
	}
}

impl BatchSink<ProfileRecord> for ProfileStore {
	fn name(&self) -> &'static str {
		"profile"
	}

	fn write(&self, record: ProfileRecord) -> Result<()> {
		ProfileStore::write(self, &record)
	}

	fn end_batch(&self) {
		for day in self.days.values() {
			if day.data.is_dirty() {
				if let Err(e) = day.data.flush() {
					log::warn!(target: "tracestore", "profile data flush failed: {}", e);
				}
			}
		}
	}
}
