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

// Counters.
//
// Realtime samples are keyed `[objHash: 4][timeSec: 4]` and hold one
// blob per second: `[COUNT: 1]` then per counter a Text name and a
// tagged value. Re-sent seconds replace in place, the index value is a
// fixed-width data offset.
//
// Daily rollups live in a fixed-slot file: per `(objHash, counter
// name)` one block of 288 five-minute slots, 9 bytes each, updated in
// place. The block offset is resolved through a hash index.

use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{self, Reader};
use crate::datafile::{read_framed_u32, write_all_at, write_framed_u32, DataFile};
use crate::day::{date_of_ms, day_dir, ms_since_local_midnight, DayMap};
use crate::error::{Error, Result};
use crate::flush::FlushScheduler;
use crate::hash_index::{key_hash, HashIndex, IndexOptions};
use crate::options::Options;
use crate::queue::BatchSink;

const KIND: &str = "counter";
const REAL_INDEX_MB: u32 = 2;
const DAILY_INDEX_MB: u32 = 1;

pub const DAILY_SLOTS: usize = 288;
const DAILY_SLOT_MS: i64 = 5 * 60 * 1000;
const DAILY_SLOT_SIZE: usize = 9;
const DAILY_BLOCK_SIZE: usize = DAILY_SLOTS * DAILY_SLOT_SIZE;

const VALUE_NONE: u8 = 0;
const VALUE_DECIMAL: u8 = 1;
const VALUE_FLOAT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterValue {
	Decimal(i64),
	Float(f64),
}

impl CounterValue {
	fn encode_into(&self, out: &mut Vec<u8>) {
		match self {
			CounterValue::Decimal(v) => {
				out.push(VALUE_DECIMAL);
				codec::write_decimal(out, *v);
			}
			CounterValue::Float(v) => {
				out.push(VALUE_FLOAT);
				codec::write_f64(out, *v);
			}
		}
	}

	fn decode(r: &mut Reader) -> Result<CounterValue> {
		match r.read_u8()? {
			VALUE_DECIMAL => Ok(CounterValue::Decimal(r.read_decimal()?)),
			VALUE_FLOAT => Ok(CounterValue::Float(r.read_f64()?)),
			tag => Err(Error::Corruption(format!("bad counter value tag {}", tag))),
		}
	}

	fn encode_fixed(&self) -> [u8; DAILY_SLOT_SIZE] {
		let mut slot = [0u8; DAILY_SLOT_SIZE];
		match self {
			CounterValue::Decimal(v) => {
				slot[0] = VALUE_DECIMAL;
				slot[1..].copy_from_slice(&v.to_be_bytes());
			}
			CounterValue::Float(v) => {
				slot[0] = VALUE_FLOAT;
				slot[1..].copy_from_slice(&v.to_bits().to_be_bytes());
			}
		}
		slot
	}

	fn decode_fixed(slot: &[u8]) -> Result<Option<CounterValue>> {
		debug_assert_eq!(slot.len(), DAILY_SLOT_SIZE);
		match slot[0] {
			VALUE_NONE => Ok(None),
			VALUE_DECIMAL => {
				let mut b = [0u8; 8];
				b.copy_from_slice(&slot[1..]);
				Ok(Some(CounterValue::Decimal(i64::from_be_bytes(b))))
			}
			VALUE_FLOAT => {
				let mut b = [0u8; 8];
				b.copy_from_slice(&slot[1..]);
				Ok(Some(CounterValue::Float(f64::from_bits(u64::from_be_bytes(b)))))
			}
			tag => Err(Error::Corruption(format!("bad daily counter tag {}", tag))),
		}
	}
}

/// One second of counters from one object.
#[derive(Debug, Clone)]
pub struct RealCounterRecord {
	pub obj_hash: i32,
	pub time_sec: i64,
	pub counters: Vec<(String, CounterValue)>,
}

fn real_key(obj_hash: i32, time_sec: i64) -> [u8; 8] {
	let mut key = [0u8; 8];
	key[..4].copy_from_slice(&obj_hash.to_be_bytes());
	key[4..].copy_from_slice(&(time_sec as u32).to_be_bytes());
	key
}

fn daily_key(obj_hash: i32, name: &str) -> [u8; 8] {
	let mut key = [0u8; 8];
	key[..4].copy_from_slice(&obj_hash.to_be_bytes());
	key[4..].copy_from_slice(&key_hash(name.as_bytes()).to_be_bytes());
	key
}

fn encode_counters(counters: &[(String, CounterValue)]) -> Result<Vec<u8>> {
	if counters.len() > u8::MAX as usize {
		return Err(Error::InvalidArgument(format!("too many counters: {}", counters.len())));
	}
	let mut out = Vec::with_capacity(16 * counters.len() + 1);
	out.push(counters.len() as u8);
	for (name, value) in counters {
		codec::write_text(&mut out, name);
		value.encode_into(&mut out);
	}
	Ok(out)
}

fn decode_counters(body: &[u8]) -> Result<Vec<(String, CounterValue)>> {
	let mut r = Reader::new(body);
	let count = r.read_u8()? as usize;
	let mut counters = Vec::with_capacity(count);
	for _ in 0..count {
		let name = r.read_text()?;
		counters.push((name, CounterValue::decode(&mut r)?));
	}
	Ok(counters)
}

/// The daily 5-minute rollup file. Blocks are created zeroed and their
/// slots rewritten in place, so this file owns its handle instead of
/// going through the append-only data file.
struct DailyCounters {
	index: HashIndex,
	file: Mutex<(File, u64)>,
}

impl DailyCounters {
	fn open(dir: &std::path::Path, scheduler: &FlushScheduler, warn_depth: usize) -> Result<DailyCounters> {
		let options = IndexOptions { bucket_mb: DAILY_INDEX_MB, ttl: false, warn_depth };
		let index = HashIndex::open(dir, "5m", options, Some(scheduler))?;
		let file =
			std::fs::OpenOptions::new().create(true).read(true).write(true).open(dir.join("5m.data"))?;
		let len = file.metadata()?.len();
		Ok(DailyCounters { index, file: Mutex::new((file, len)) })
	}

	fn block_offset(&self, key: &[u8]) -> Result<u64> {
		if let Some(value) = self.index.get(key)? {
			return Ok(codec::int5_of(&value) as u64);
		}
		let mut file = self.file.lock();
		let offset = file.1;
		write_all_at(&file.0, &[0u8; DAILY_BLOCK_SIZE], offset)?;
		file.1 += DAILY_BLOCK_SIZE as u64;
		drop(file);
		self.index.put(key, &codec::int5_bytes(offset as i64))?;
		Ok(offset)
	}

	fn write(&self, obj_hash: i32, name: &str, time_ms: i64, value: CounterValue) -> Result<()> {
		let slot = (ms_since_local_midnight(time_ms) / DAILY_SLOT_MS) as usize % DAILY_SLOTS;
		let offset = self.block_offset(&daily_key(obj_hash, name))?;
		let file = self.file.lock();
		write_all_at(&file.0, &value.encode_fixed(), offset + (slot * DAILY_SLOT_SIZE) as u64)
	}

	fn read(&self, obj_hash: i32, name: &str) -> Result<Option<Vec<Option<CounterValue>>>> {
		let offset = match self.index.get(&daily_key(obj_hash, name))? {
			Some(value) => codec::int5_of(&value) as u64,
			None => return Ok(None),
		};
		let mut block = [0u8; DAILY_BLOCK_SIZE];
		{
			let file = self.file.lock();
			crate::datafile::read_exact_at(&file.0, &mut block, offset)?;
		}
		let mut slots = Vec::with_capacity(DAILY_SLOTS);
		for i in 0..DAILY_SLOTS {
			slots.push(CounterValue::decode_fixed(&block[i * DAILY_SLOT_SIZE..(i + 1) * DAILY_SLOT_SIZE])?);
		}
		Ok(Some(slots))
	}
}

pub struct CounterDay {
	real_data: DataFile,
	real_index: HashIndex,
	daily: DailyCounters,
}

impl CounterDay {
	fn flush(&self) -> Result<()> {
		self.real_data.flush()?;
		self.real_index.flush()?;
		self.daily.index.flush()
	}
}

pub struct CounterStore {
	base: PathBuf,
	days: DayMap<CounterDay>,
	scheduler: Arc<FlushScheduler>,
	warn_depth: usize,
}

impl CounterStore {
	pub fn new(options: &Options, scheduler: Arc<FlushScheduler>) -> CounterStore {
		CounterStore {
			base: options.base_dir.clone(),
			days: DayMap::new(),
			scheduler,
			warn_depth: options.traversal_warn,
		}
	}

	fn open_day(&self, date: &str) -> Result<CounterDay> {
		let dir = day_dir(&self.base, date, KIND);
		std::fs::create_dir_all(&dir)?;
		let options = IndexOptions { bucket_mb: REAL_INDEX_MB, ttl: false, warn_depth: self.warn_depth };
		Ok(CounterDay {
			real_data: DataFile::open(&dir.join("real.data"))?,
			real_index: HashIndex::open(&dir, "real", options, Some(&self.scheduler))?,
			daily: DailyCounters::open(&dir, &self.scheduler, self.warn_depth)?,
		})
	}

	fn day_for_read(&self, date: &str) -> Result<Option<Arc<CounterDay>>> {
		self.days.get_if_present(date, || {
			if day_dir(&self.base, date, KIND).is_dir() {
				self.open_day(date).map(Some)
			} else {
				Ok(None)
			}
		})
	}

	pub fn write_real(&self, record: &RealCounterRecord) -> Result<()> {
		if record.time_sec <= 0 {
			return Err(Error::InvalidArgument(format!("non-positive time {}", record.time_sec)));
		}
		let date = date_of_ms(record.time_sec * 1000);
		let day = self.days.get_or_open(&date, || self.open_day(&date))?;
		let body = encode_counters(&record.counters)?;
		let offset = write_framed_u32(&day.real_data, &body)?;
		day.real_index.update_or_put(
			&real_key(record.obj_hash, record.time_sec),
			&codec::int5_bytes(offset as i64),
		)
	}

	pub fn read_real(
		&self,
		obj_hash: i32,
		time_sec: i64,
	) -> Result<Option<Vec<(String, CounterValue)>>> {
		let day = match self.day_for_read(&date_of_ms(time_sec * 1000))? {
			Some(day) => day,
			None => return Ok(None),
		};
		match day.real_index.get(&real_key(obj_hash, time_sec))? {
			Some(value) => {
				let body = read_framed_u32(&day.real_data, codec::int5_of(&value) as u64)?;
				Ok(Some(decode_counters(&body)?))
			}
			None => Ok(None),
		}
	}

	/// Per-second samples over `[s_sec, e_sec]`, seconds with no sample
	/// skipped.
	pub fn read_real_range(
		&self,
		obj_hash: i32,
		s_sec: i64,
		e_sec: i64,
	) -> Result<Vec<(i64, Vec<(String, CounterValue)>)>> {
		let mut out = Vec::new();
		let mut sec = s_sec;
		while sec <= e_sec {
			if let Some(counters) = self.read_real(obj_hash, sec)? {
				out.push((sec, counters));
			}
			sec += 1;
		}
		Ok(out)
	}

	pub fn write_daily(
		&self,
		obj_hash: i32,
		name: &str,
		time_ms: i64,
		value: CounterValue,
	) -> Result<()> {
		if time_ms <= 0 {
			return Err(Error::InvalidArgument(format!("non-positive time {}", time_ms)));
		}
		let date = date_of_ms(time_ms);
		let day = self.days.get_or_open(&date, || self.open_day(&date))?;
		day.daily.write(obj_hash, name, time_ms, value)
	}

	/// The full 288-slot day of one counter, `None` when it was never
	/// written.
	pub fn read_daily(
		&self,
		date: &str,
		obj_hash: i32,
		name: &str,
	) -> Result<Option<Vec<Option<CounterValue>>>> {
		match self.day_for_read(date)? {
			Some(day) => day.daily.read(obj_hash, name),
			None => Ok(None),
		}
	}

	pub fn purge_old_days(&self, keep: &HashSet<String>) {
		let purged = self.days.purge(keep);
		if purged > 0 {
			log::info!(target: "tracestore", "counter: closed {} old day containers", purged);
		}
	}

	pub fn flush_all(&self) {
		for day in self.days.values() {
			if let Err(e) = day.flush() {
				log::warn!(target: "tracestore", "counter flush failed: {}", e);
			}
		}
	}

	pub fn close(&self) {
		self.flush_all();
		self.days.clear();
	}
}

impl BatchSink<RealCounterRecord> for CounterStore {
	fn name(&self) -> &'static str {
		"counter"
	}

	fn write(&self, record: RealCounterRecord) -> Result<()> {
		self.write_real(&record)
	}

	fn end_batch(&self) {
		for day in self.days.values() {
			if day.real_data.is_dirty() {
				if let Err(e) = day.real_data.flush() {
					log::warn!(target: "tracestore", "counter data flush failed: {}", e);
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

	fn store(dir: &TempDir) -> CounterStore {
		let scheduler = FlushScheduler::new(Arc::new(Shutdown::new()));
		CounterStore::new(&Options::with_base(dir.root()), scheduler)
	}

	fn sample(obj: i32, sec: i64, tps: i64, users: i64) -> RealCounterRecord {
		RealCounterRecord {
			obj_hash: obj,
			time_sec: sec,
			counters: vec![
				("TPS".to_string(), CounterValue::Decimal(tps)),
				("ActiveUser".to_string(), CounterValue::Decimal(users)),
			],
		}
	}

	#[test]
	fn realtime_write_and_read() {
		let dir = TempDir::new("counter-real");
		let store = store(&dir);
		let base_sec = date_start_ms("20260801").unwrap() / 1000;

		store.write_real(&sample(1, base_sec + 3600, 42, 100)).unwrap();
		let got = store.read_real(1, base_sec + 3600).unwrap().unwrap();
		assert_eq!(got[0], ("TPS".to_string(), CounterValue::Decimal(42)));
		assert_eq!(got[1], ("ActiveUser".to_string(), CounterValue::Decimal(100)));

		assert!(store.read_real(1, base_sec + 3601).unwrap().is_none());
		assert!(store.read_real(2, base_sec + 3600).unwrap().is_none());
	}

	#[test]
	fn resent_second_replaces() {
		let dir = TempDir::new("counter-replace");
		let store = store(&dir);
		let sec = date_start_ms("20260801").unwrap() / 1000 + 100;
		store.write_real(&sample(1, sec, 10, 1)).unwrap();
		store.write_real(&sample(1, sec, 20, 2)).unwrap();
		let got = store.read_real(1, sec).unwrap().unwrap();
		assert_eq!(got[0].1, CounterValue::Decimal(20));
	}

	#[test]
	fn range_read_yields_every_second() {
		let dir = TempDir::new("counter-range");
		let store = store(&dir);
		let base_sec = date_start_ms("20260801").unwrap() / 1000 + 100;
		for sec in base_sec..base_sec + 6 {
			store.write_real(&sample(1, sec, sec - base_sec, 0)).unwrap();
		}
		let range = store.read_real_range(1, base_sec, base_sec + 5).unwrap();
		assert_eq!(range.len(), 6);
		for (i, (sec, counters)) in range.iter().enumerate() {
			assert_eq!(*sec, base_sec + i as i64);
			assert_eq!(counters[0].1, CounterValue::Decimal(i as i64));
		}
	}

	#[test]
	fn float_values_survive() {
		let dir = TempDir::new("counter-float");
		let store = store(&dir);
		let sec = date_start_ms("20260801").unwrap() / 1000 + 100;
		store
			.write_real(&RealCounterRecord {
				obj_hash: 1,
				time_sec: sec,
				counters: vec![("Cpu".to_string(), CounterValue::Float(12.625))],
			})
			.unwrap();
		let got = store.read_real(1, sec).unwrap().unwrap();
		assert_eq!(got[0].1, CounterValue::Float(12.625));
	}

	#[test]
	fn daily_slots_update_in_place() {
		let dir = TempDir::new("counter-daily");
		let store = store(&dir);
		let midnight = date_start_ms("20260801").unwrap();

		store.write_daily(1, "TPS", midnight + 2 * DAILY_SLOT_MS, CounterValue::Decimal(5)).unwrap();
		store.write_daily(1, "TPS", midnight + 7 * DAILY_SLOT_MS, CounterValue::Float(2.5)).unwrap();
		store.write_daily(1, "TPS", midnight + 2 * DAILY_SLOT_MS, CounterValue::Decimal(9)).unwrap();
		store.write_daily(1, "Mem", midnight + 1000, CounterValue::Decimal(77)).unwrap();

		let slots = store.read_daily("20260801", 1, "TPS").unwrap().unwrap();
		assert_eq!(slots.len(), DAILY_SLOTS);
		assert_eq!(slots[2], Some(CounterValue::Decimal(9)), "rewritten slot");
		assert_eq!(slots[7], Some(CounterValue::Float(2.5)));
		assert_eq!(slots[3], None);

		let other = store.read_daily("20260801", 1, "Mem").unwrap().unwrap();
		assert_eq!(other[0], Some(CounterValue::Decimal(77)));

		assert!(store.read_daily("20260801", 2, "TPS").unwrap().is_none());
		assert!(store.read_daily("20260802", 1, "TPS").unwrap().is_none());
	}
}
