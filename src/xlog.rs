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

// Transaction traces. One value append to `xlog.data`, then three index
// entries against the returned offset: end time for range scans, txid
// for point lookup, gxid for distributed-trace grouping. A zero gxid
// writes no gid entry.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::{self, Reader};
use crate::compress;
use crate::datafile::{read_framed_u16, write_framed_u16, DataFile};
use crate::day::{date_of_ms, dates_of_range, day_dir, DayMap};
use crate::error::{Error, Result};
use crate::flush::FlushScheduler;
use crate::hash_index::{HashIndex, IndexOptions};
use crate::options::Options;
use crate::queue::BatchSink;
use crate::time_index::TimeIndex;

const KIND: &str = "xlog";
const PACK_XLOG: u8 = 0x01;
const TID_INDEX_MB: u32 = 8;
const GID_INDEX_MB: u32 = 8;

/// One transaction trace as ingested from an agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XLogRecord {
	/// Transaction end time, unix milliseconds. Routes the record to its
	/// day container.
	pub end_time: i64,
	pub obj_hash: i32,
	pub service_hash: i32,
	pub txid: i64,
	/// Global transaction id; zero when the trace is not distributed.
	pub gxid: i64,
	pub caller_txid: i64,
	pub elapsed: i32,
	pub error_hash: i32,
	pub cpu: i32,
	pub sql_count: i32,
	pub sql_time: i32,
	pub ip: Vec<u8>,
}

impl XLogRecord {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(64);
		out.push(PACK_XLOG);
		codec::write_decimal(&mut out, self.end_time);
		codec::write_decimal(&mut out, self.obj_hash as i64);
		codec::write_decimal(&mut out, self.service_hash as i64);
		codec::write_decimal(&mut out, self.txid);
		codec::write_decimal(&mut out, self.gxid);
		codec::write_decimal(&mut out, self.caller_txid);
		codec::write_decimal(&mut out, self.elapsed as i64);
		codec::write_decimal(&mut out, self.error_hash as i64);
		codec::write_decimal(&mut out, self.cpu as i64);
		codec::write_decimal(&mut out, self.sql_count as i64);
		codec::write_decimal(&mut out, self.sql_time as i64);
		codec::write_blob(&mut out, &self.ip);
		out
	}

	pub fn decode(body: &[u8]) -> Result<XLogRecord> {
		let mut r = Reader::new(body);
		let tag = r.read_u8()?;
		if tag != PACK_XLOG {
			return Err(Error::Corruption(format!("bad xlog pack tag {}", tag)));
		}
		Ok(XLogRecord {
			end_time: r.read_decimal()?,
			obj_hash: r.read_decimal()? as i32,
			service_hash: r.read_decimal()? as i32,
			txid: r.read_decimal()?,
			gxid: r.read_decimal()?,
			caller_txid: r.read_decimal()?,
			elapsed: r.read_decimal()? as i32,
			error_hash: r.read_decimal()? as i32,
			cpu: r.read_decimal()? as i32,
			sql_count: r.read_decimal()? as i32,
			sql_time: r.read_decimal()? as i32,
			ip: r.read_blob()?.to_vec(),
		})
	}
}

pub struct XLogDay {
	data: DataFile,
	tim: TimeIndex,
	tid: HashIndex,
	gid: HashIndex,
}

impl XLogDay {
	fn flush(&self) -> Result<()> {
		self.data.flush()?;
		self.tim.flush()?;
		self.tid.flush()?;
		self.gid.flush()
	}
}

/// Owns the per-day containers for traces and serves both the ingest
/// worker and query handlers, so a reader sees records the moment their
/// bucket slot is written.
pub struct XLogStore {
	base: PathBuf,
	days: DayMap<XLogDay>,
	scheduler: Arc<FlushScheduler>,
	compress: bool,
	warn_depth: usize,
}

impl XLogStore {
	pub fn new(options: &Options, scheduler: Arc<FlushScheduler>) -> XLogStore {
		XLogStore {
			base: options.base_dir.clone(),
			days: DayMap::new(),
			scheduler,
			compress: options.compress_xlog,
			warn_depth: options.traversal_warn,
		}
	}

	fn open_day(&self, date: &str) -> Result<XLogDay> {
		let dir = day_dir(&self.base, date, KIND);
		std::fs::create_dir_all(&dir)?;
		let index_options = |mb| IndexOptions { bucket_mb: mb, ttl: false, warn_depth: self.warn_depth };
		Ok(XLogDay {
			data: DataFile::open(&dir.join("xlog.data"))?,
			tim: TimeIndex::open(&dir, "xlog_tim", Some(&self.scheduler))?,
			tid: HashIndex::open(&dir, "xlog_tid", index_options(TID_INDEX_MB), Some(&self.scheduler))?,
			gid: HashIndex::open(&dir, "xlog_gid", index_options(GID_INDEX_MB), Some(&self.scheduler))?,
		})
	}

	fn day_for_write(&self, date: &str) -> Result<Arc<XLogDay>> {
		self.days.get_or_open(date, || self.open_day(date))
	}

	fn day_for_read(&self, date: &str) -> Result<Option<Arc<XLogDay>>> {
		self.days.get_if_present(date, || {
			if day_dir(&self.base, date, KIND).is_dir() {
				self.open_day(date).map(Some)
			} else {
				Ok(None)
			}
		})
	}

	pub fn write(&self, record: &XLogRecord) -> Result<()> {
		if record.end_time <= 0 {
			return Err(Error::InvalidArgument(format!("non-positive time {}", record.end_time)));
		}
		let date = date_of_ms(record.end_time);
		let day = self.day_for_write(&date)?;
		let body = compress::wrap(record.encode(), self.compress)?;
		let offset = write_framed_u16(&day.data, &body)?;
		let value = codec::int5_bytes(offset as i64);
		day.tim.put(record.end_time, &value)?;
		day.tid.put(&record.txid.to_be_bytes(), &value)?;
		if record.gxid != 0 {
			day.gid.put(&record.gxid.to_be_bytes(), &value)?;
		}
		Ok(())
	}

	fn load(&self, day: &XLogDay, value: &[u8]) -> Result<XLogRecord> {
		let offset = codec::int5_of(value);
		let body = read_framed_u16(&day.data, offset as u64)?;
		XLogRecord::decode(&compress::unwrap(&body)?)
	}

	/// Range read across day containers, oldest first. The callback
	/// returns false to stop.
	pub fn read_by_time<F: FnMut(XLogRecord) -> bool>(
		&self,
		stime: i64,
		etime: i64,
		mut f: F,
	) -> Result<()> {
		for date in dates_of_range(stime, etime) {
			let day = match self.day_for_read(&date)? {
				Some(day) => day,
				None => continue,
			};
			let finished = day.tim.read(stime, etime, |_, value| match self.load(&day, value) {
				Ok(record) => f(record),
				Err(e) => {
					log::warn!(target: "tracestore", "xlog load failed on {}: {}", date, e);
					true
				}
			})?;
			if !finished {
				break;
			}
		}
		Ok(())
	}

	/// Newest-first variant of `read_by_time`.
	pub fn read_by_time_from_end<F: FnMut(XLogRecord) -> bool>(
		&self,
		stime: i64,
		etime: i64,
		mut f: F,
	) -> Result<()> {
		for date in dates_of_range(stime, etime).into_iter().rev() {
			let day = match self.day_for_read(&date)? {
				Some(day) => day,
				None => continue,
			};
			let finished =
				day.tim.read_from_end(stime, etime, |_, value| match self.load(&day, value) {
					Ok(record) => f(record),
					Err(e) => {
						log::warn!(target: "tracestore", "xlog load failed on {}: {}", date, e);
						true
					}
				})?;
			if !finished {
				break;
			}
		}
		Ok(())
	}

	pub fn get_by_txid(&self, date: &str, txid: i64) -> Result<Option<XLogRecord>> {
		let day = match self.day_for_read(date)? {
			Some(day) => day,
			None => return Ok(None),
		};
		match day.tid.get(&txid.to_be_bytes())? {
			Some(value) => Ok(Some(self.load(&day, &value)?)),
			None => Ok(None),
		}
	}

	/// Every trace of a distributed transaction. A zero gxid never
	/// matches anything.
	pub fn read_by_gxid(&self, date: &str, gxid: i64) -> Result<Vec<XLogRecord>> {
		if gxid == 0 {
			return Ok(Vec::new());
		}
		let day = match self.day_for_read(date)? {
			Some(day) => day,
			None => return Ok(Vec::new()),
		};
		let mut records = Vec::new();
		for value in day.gid.get_all(&gxid.to_be_bytes())? {
			records.push(self.load(&day, &value)?);
		}
		Ok(records)
	}

	pub fn purge_old_days(&self, keep: &HashSet<String>) {
		let purged = self.days.purge(keep);
		if purged > 0 {
			log::info!(target: "tracestore", "xlog: closed {} old day containers", purged);
		}
	}

	pub fn flush_all(&self) {
		for day in self.days.values() {
			if let Err(e) = day.flush() {
				log::warn!(target: "tracestore", "xlog flush failed: {}", e);
			}
		}
	}

	pub fn close(&self) {
		self.flush_all();
		self.days.clear();
	}
}

impl BatchSink<XLogRecord> for XLogStore {
	fn name(&self) -> &'static str {
		"xlog"
	}

	fn write(&self, record: XLogRecord) -> Result<()> {
		XLogStore::write(self, &record)
	}

	fn end_batch(&self) {
		for day in self.days.values() {
			if day.data.is_dirty() {
				if let Err(e) = day.data.flush() {
					log::warn!(target: "tracestore", "xlog data flush failed: {}", e);
				}
			}
		}
	}
}
