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

// Alerts raised by the server. Time-indexed only; volumes are tiny next
// to traces but the files follow the same per-day shape.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::{self, Reader};
use crate::datafile::{read_framed_u32, write_framed_u32, DataFile};
use crate::day::{date_of_ms, dates_of_range, day_dir, DayMap};
use crate::error::{Error, Result};
use crate::flush::FlushScheduler;
use crate::options::Options;
use crate::queue::BatchSink;
use crate::time_index::TimeIndex;

const KIND: &str = "alert";
const PACK_ALERT: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertLevel {
	Info,
	Warn,
	Error,
	Fatal,
}

impl AlertLevel {
	fn as_u8(self) -> u8 {
		match self {
			AlertLevel::Info => 0,
			AlertLevel::Warn => 1,
			AlertLevel::Error => 2,
			AlertLevel::Fatal => 3,
		}
	}

	fn from_u8(v: u8) -> Result<AlertLevel> {
		match v {
			0 => Ok(AlertLevel::Info),
			1 => Ok(AlertLevel::Warn),
			2 => Ok(AlertLevel::Error),
			3 => Ok(AlertLevel::Fatal),
			_ => Err(Error::Corruption(format!("bad alert level {}", v))),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
	pub time: i64,
	pub level: AlertLevel,
	pub obj_hash: i32,
	pub title: String,
	pub message: String,
}

impl AlertRecord {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(32 + self.title.len() + self.message.len());
		out.push(PACK_ALERT);
		codec::write_decimal(&mut out, self.time);
		out.push(self.level.as_u8());
		codec::write_decimal(&mut out, self.obj_hash as i64);
		codec::write_text(&mut out, &self.title);
		codec::write_text(&mut out, &self.message);
		out
	}

	pub fn decode(body: &[u8]) -> Result<AlertRecord> {
		let mut r = Reader::new(body);
		let tag = r.read_u8()?;
		if tag != PACK_ALERT {
			return Err(Error::Corruption(format!("bad alert pack tag {}", tag)));
		}
		Ok(AlertRecord {
			time: r.read_decimal()?,
			level: AlertLevel::from_u8(r.read_u8()?)?,
			obj_hash: r.read_decimal()? as i32,
			title: r.read_text()?,
			message: r.read_text()?,
		})
	}
}

pub struct AlertDay {
	data: DataFile,
	tim: TimeIndex,
}

impl AlertDay {
	fn flush(&self) -> Result<()> {
		self.data.flush()?;
		self.tim.flush()
	}
}

pub struct AlertStore {
	base: PathBuf,
	days: DayMap<AlertDay>,
	scheduler: Arc<FlushScheduler>,
}

impl AlertStore {
	pub fn new(options: &Options, scheduler: Arc<FlushScheduler>) -> AlertStore {
		AlertStore { base: options.base_dir.clone(), days: DayMap::new(), scheduler }
	}

	fn open_day(&self, date: &str) -> Result<AlertDay> {
		let dir = day_dir(&self.base, date, KIND);
		std::fs::create_dir_all(&dir)?;
		Ok(AlertDay {
			data: DataFile::open(&dir.join("alert.data"))?,
			tim: TimeIndex::open(&dir, "alert", Some(&self.scheduler))?,
		})
	}

	fn day_for_read(&self, date: &str) -> Result<Option<Arc<AlertDay>>> {
		self.days.get_if_present(date, || {
			if day_dir(&self.base, date, KIND).is_dir() {
				self.open_day(date).map(Some)
			} else {
				Ok(None)
			}
		})
	}

	pub fn write(&self, record: &AlertRecord) -> Result<()> {
		if record.time <= 0 {
			return Err(Error::InvalidArgument(format!("non-positive time {}", record.time)));
		}
		let date = date_of_ms(record.time);
		let day = self.days.get_or_open(&date, || self.open_day(&date))?;
		let offset = write_framed_u32(&day.data, &record.encode())?;
		day.tim.put(record.time, &codec::int5_bytes(offset as i64))?;
		Ok(())
	}

	pub fn read<F: FnMut(AlertRecord) -> bool>(
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
			let finished = day.tim.read(stime, etime, |_, value| {
				let loaded = read_framed_u32(&day.data, codec::int5_of(value) as u64)
					.and_then(|body| crate::compress::unwrap(&body))
					.and_then(|body| AlertRecord::decode(&body));
				match loaded {
					Ok(record) => f(record),
					Err(e) => {
						log::warn!(target: "tracestore", "alert load failed on {}: {}", date, e);
						true
					}
				}
			})?;
			if !finished {
				break;
			}
		}
		Ok(())
	}

	pub fn purge_old_days(&self, keep: &HashSet<String>) {
		let purged = self.days.purge(keep);
		if purged > 0 {
			log::info!(target: "tracestore", "alert: closed {} old day containers", purged);
		}
	}

	pub fn flush_all(&self) {
		for day in self.days.values() {
			if let Err(e) = day.flush() {
				log::warn!(target: "tracestore", "alert flush failed: {}", e);
			}
		}
	}

	pub fn close(&self) {
		self.flush_all();
		self.days.clear();
	}
}

impl BatchSink<AlertRecord> for AlertStore {
	fn name(&self) -> &'static str {
		"alert"
	}

	fn write(&self, record: AlertRecord) -> Result<()> {
		AlertStore::write(self, &record)
	}

	fn end_batch(&self) {
		for day in self.days.values() {
			if day.data.is_dirty() {
				if let Err(e) = day.data.flush() {
					log::warn!(target: "tracestore", "alert data flush failed: {}", e);
				}
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::day::date_start_ms;
	use crate::flush::{FlushScheduler, Shutdown};
	use crate::testutil::TempDir;

	fn alert(time: i64, level: AlertLevel, title: &str) -> AlertRecord {
		AlertRecord {
			time,
			level,
			obj_hash: 55,
			title: title.to_string(),
			message: format!("{} details", title),
		}
	}

	#[test]
	fn pack_round_trip() {
		let a = alert(1_700_000_000_000, AlertLevel::Fatal, "CPU high");
		assert_eq!(AlertRecord::decode(&a.encode()).unwrap(), a);
	}

	#[test]
	fn time_range_read() {
		let dir = TempDir::new("alert-range");
		let scheduler = FlushScheduler::new(Arc::new(Shutdown::new()));
		let store = AlertStore::new(&Options::with_base(dir.root()), scheduler);
		let t = date_start_ms("20260801").unwrap() + 1000;

		store.write(&alert(t, AlertLevel::Warn, "gc pause")).unwrap();
		store.write(&alert(t + 5000, AlertLevel::Error, "thread pool full")).unwrap();
		store.write(&alert(t + 10_000, AlertLevel::Info, "agent reconnected")).unwrap();

		let mut titles = Vec::new();
		store
			.read(t, t + 6000, |a| {
				titles.push(a.title);
				true
			})
			.unwrap();
		assert_eq!(titles, vec!["gc pause".to_string(), "thread pool full".to_string()]);

		let mut first = None;
		store
			.read(t, t + 20_000, |a| {
				first = Some(a.level);
				false
			})
			.unwrap();
		assert_eq!(first, Some(AlertLevel::Warn));
	}
}
