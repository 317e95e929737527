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

// Day addressing. Every store shards its files by local calendar day,
// `{base}/{YYYYMMDD}/{kind}/`, and keeps an in-memory map of open day
// containers. The map is bounded by the periodic purge tick, file deletion
// by age is the retention sweeper's job.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Timelike, Utc};
use parking_lot::Mutex;

use crate::error::Result;

/// Reserved directory for permanent (non-dated) data. Retention never
/// touches it.
pub const PERMANENT_DATE: &str = "00000000";

pub const DAY_MS: i64 = 24 * 3600 * 1000;

pub fn now_ms() -> i64 {
	match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
		Ok(d) => d.as_millis() as i64,
		Err(_) => 0,
	}
}

fn local_datetime(ms: i64) -> Option<DateTime<Local>> {
	Utc.timestamp_millis_opt(ms).single().map(|dt| dt.with_timezone(&Local))
}

/// Local-time `YYYYMMDD` of a unix millisecond timestamp.
pub fn date_of_ms(ms: i64) -> String {
	match local_datetime(ms) {
		Some(dt) => dt.format("%Y%m%d").to_string(),
		None => "19700101".to_string(),
	}
}

/// Milliseconds since the local midnight containing `ms`.
pub fn ms_since_local_midnight(ms: i64) -> i64 {
	match local_datetime(ms) {
		Some(dt) => {
			dt.num_seconds_from_midnight() as i64 * 1000 + dt.timestamp_subsec_millis() as i64
		}
		None => 0,
	}
}

/// Unix milliseconds of local midnight opening the given `YYYYMMDD` day,
/// `None` when the string is not a date.
pub fn date_start_ms(date: &str) -> Option<i64> {
	let nd = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
	let ndt = nd.and_hms_opt(0, 0, 0)?;
	let local = Local.from_local_datetime(&ndt);
	local.single().or_else(|| local.earliest()).map(|dt| dt.timestamp_millis())
}

/// The following `YYYYMMDD`, `None` when the input is not a date.
pub fn next_date(date: &str) -> Option<String> {
	let nd = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
	nd.succ_opt().map(|next| next.format("%Y%m%d").to_string())
}

/// Calendar days touched by `[stime, etime]`, oldest first.
pub fn dates_of_range(stime: i64, etime: i64) -> Vec<String> {
	let mut dates = Vec::new();
	if stime > etime {
		return dates;
	}
	let last = date_of_ms(etime);
	let mut date = date_of_ms(stime);
	loop {
		let done = date == last;
		dates.push(date.clone());
		if done || dates.len() >= 4000 {
			break;
		}
		date = match next_date(&date) {
			Some(next) => next,
			None => break,
		};
	}
	dates
}

/// Eight digits, including the permanent area.
pub fn looks_like_date(name: &str) -> bool {
	name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

pub fn day_dir(base: &Path, date: &str, kind: &str) -> PathBuf {
	base.join(date).join(kind)
}

/// Dates the container cache must keep: the trailing `keep_hours` window
/// rounded up to day boundaries, always including today and yesterday.
pub fn keep_dates(now_ms: i64, keep_hours: u32) -> HashSet<String> {
	let mut keep = HashSet::new();
	keep.insert(date_of_ms(now_ms));
	keep.insert(date_of_ms(now_ms - DAY_MS));
	let mut t = now_ms - keep_hours as i64 * 3600 * 1000;
	while t <= now_ms {
		keep.insert(date_of_ms(t));
		t += DAY_MS;
	}
	keep
}

/// Open day containers for one store, keyed by `YYYYMMDD`.
pub struct DayMap<C> {
	map: Mutex<HashMap<String, Arc<C>>>,
}

impl<C> DayMap<C> {
	pub fn new() -> DayMap<C> {
		DayMap { map: Mutex::new(HashMap::new()) }
	}

	/// Writer path: the container is created on first access.
	pub fn get_or_open<F>(&self, date: &str, open: F) -> Result<Arc<C>>
	where
		F: FnOnce() -> Result<C>,
	{
		let mut map = self.map.lock();
		if let Some(day) = map.get(date) {
			return Ok(day.clone());
		}
		let day = Arc::new(open()?);
		map.insert(date.to_string(), day.clone());
		Ok(day)
	}

	/// Reader path: `None` when the day was never written.
	pub fn get_if_present<F>(&self, date: &str, open: F) -> Result<Option<Arc<C>>>
	where
		F: FnOnce() -> Result<Option<C>>,
	{
		let mut map = self.map.lock();
		if let Some(day) = map.get(date) {
			return Ok(Some(day.clone()));
		}
		match open()? {
			Some(day) => {
				let day = Arc::new(day);
				map.insert(date.to_string(), day.clone());
				Ok(Some(day))
			}
			None => Ok(None),
		}
	}

	/// Drop containers for dates outside the keep set. Files close on the
	/// last `Arc` drop.
	pub fn purge(&self, keep: &HashSet<String>) -> usize {
		let mut map = self.map.lock();
		let before = map.len();
		map.retain(|date, _| keep.contains(date));
		before - map.len()
	}

	pub fn values(&self) -> Vec<Arc<C>> {
		self.map.lock().values().cloned().collect()
	}

	pub fn dates(&self) -> Vec<String> {
		self.map.lock().keys().cloned().collect()
	}

	pub fn clear(&self) {
		self.map.lock().clear();
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn date_of_day_start_round_trips() {
		let ms = date_start_ms("20260801").unwrap();
		assert_eq!(date_of_ms(ms), "20260801");
		assert_eq!(ms_since_local_midnight(ms), 0);
		assert_eq!(ms_since_local_midnight(ms + 1234), 1234);
		assert_eq!(date_of_ms(ms + DAY_MS - 1), "20260801");
		assert_eq!(date_of_ms(ms + DAY_MS), "20260802");
	}

	#[test]
	fn date_parsing_rejects_junk() {
		assert!(date_start_ms("2026080").is_none());
		assert!(date_start_ms("2026x801").is_none());
		assert!(looks_like_date("20260801"));
		assert!(looks_like_date(PERMANENT_DATE));
		assert!(!looks_like_date("2026080a"));
		assert!(!looks_like_date("202608011"));
	}

	#[test]
	fn keep_dates_covers_window_and_today() {
		let now = date_start_ms("20260810").unwrap() + 6 * 3600 * 1000;
		let keep = keep_dates(now, 48);
		assert!(keep.contains("20260810"));
		assert!(keep.contains("20260809"));
		assert!(keep.contains("20260808"));
		assert!(!keep.contains("20260731"));
	}

	#[test]
	fn day_map_opens_once_and_purges() {
		let map: DayMap<u32> = DayMap::new();
		let a = map.get_or_open("20260801", || Ok(7)).unwrap();
		let b = map.get_or_open("20260801", || panic!("already open")).unwrap();
		assert_eq!(*a, *b);
		assert!(map.get_if_present("20260802", || Ok(None)).unwrap().is_none());

		let mut keep = HashSet::new();
		keep.insert("20260802".to_string());
		assert_eq!(map.purge(&keep), 1);
		assert!(map.dates().is_empty());
	}
}
