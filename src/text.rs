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

// Interned text symbols. Agents send `(div, hash, text)` once per
// symbol; a `has_key` probe keeps re-sends from writing twice.
//
// Stable vocabularies (service names, SQL texts, ...) go to the
// permanent area `{base}/00000000/text/`, one index and data file per
// div, keyed by the 4-byte text hash. Everything else lands in one
// per-day index keyed `[divHash: 4][textHash: 4]` with the text stored
// directly as the record value.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec;
use crate::datafile::{read_framed_u32, write_framed_u32, DataFile};
use crate::day::{day_dir, DayMap, PERMANENT_DATE};
use crate::error::Result;
use crate::flush::FlushScheduler;
use crate::hash_index::{key_hash, HashIndex, IndexOptions};
use crate::options::Options;

const KIND: &str = "text";

/// Divs whose symbols are stable across days and interned permanently.
const PERMANENT_DIVS: &[&str] =
	&["service", "sql", "apicall", "method", "ua", "group", "city", "referrer"];

pub fn is_permanent_div(div: &str) -> bool {
	PERMANENT_DIVS.contains(&div)
}

struct PermDiv {
	index: HashIndex,
	data: DataFile,
}

struct TextDay {
	index: HashIndex,
}

pub struct TextStore {
	base: PathBuf,
	perm: Mutex<HashMap<String, Arc<PermDiv>>>,
	days: DayMap<TextDay>,
	scheduler: Arc<FlushScheduler>,
	text_index_mb: HashMap<String, u32>,
	daily_index_mb: u32,
	warn_depth: usize,
}

fn daily_key(div: &str, hash: i32) -> [u8; 8] {
	let mut key = [0u8; 8];
	key[..4].copy_from_slice(&key_hash(div.as_bytes()).to_be_bytes());
	key[4..].copy_from_slice(&hash.to_be_bytes());
	key
}

impl TextStore {
	pub fn new(options: &Options, scheduler: Arc<FlushScheduler>) -> TextStore {
		TextStore {
			base: options.base_dir.clone(),
			perm: Mutex::new(HashMap::new()),
			days: DayMap::new(),
			scheduler,
			text_index_mb: options.text_index_mb.clone(),
			daily_index_mb: options.daily_text_index_mb,
			warn_depth: options.traversal_warn,
		}
	}

	fn perm_div(&self, div: &str) -> Result<Arc<PermDiv>> {
		let mut perm = self.perm.lock();
		if let Some(existing) = perm.get(div) {
			return Ok(existing.clone());
		}
		let dir = day_dir(&self.base, PERMANENT_DATE, KIND);
		std::fs::create_dir_all(&dir)?;
		let mb = self.text_index_mb.get(div).copied().unwrap_or(1);
		let options = IndexOptions { bucket_mb: mb, ttl: false, warn_depth: self.warn_depth };
		let opened = Arc::new(PermDiv {
			index: HashIndex::open(&dir, &format!("text_{}", div), options, Some(&self.scheduler))?,
			data: DataFile::open(&dir.join(format!("text_{}.data", div)))?,
		});
		perm.insert(div.to_string(), opened.clone());
		Ok(opened)
	}

	fn open_day(&self, date: &str) -> Result<TextDay> {
		let dir = day_dir(&self.base, date, KIND);
		std::fs::create_dir_all(&dir)?;
		let options =
			IndexOptions { bucket_mb: self.daily_index_mb, ttl: false, warn_depth: self.warn_depth };
		Ok(TextDay { index: HashIndex::open(&dir, "text", options, Some(&self.scheduler))? })
	}

	fn day_for_read(&self, date: &str) -> Result<Option<Arc<TextDay>>> {
		self.days.get_if_present(date, || {
			if day_dir(&self.base, date, KIND).is_dir() {
				self.open_day(date).map(Some)
			} else {
				Ok(None)
			}
		})
	}

	/// Interns one symbol. Returns false when the hash was already
	/// known and nothing was written.
	pub fn set(&self, date: &str, div: &str, hash: i32, text: &str) -> Result<bool> {
		if is_permanent_div(div) {
			let perm = self.perm_div(div)?;
			let key = hash.to_be_bytes();
			if perm.index.has_key(&key)? {
				return Ok(false);
			}
			let offset = write_framed_u32(&perm.data, text.as_bytes())?;
			perm.index.put(&key, &codec::int5_bytes(offset as i64))?;
			perm.data.flush()?;
			Ok(true)
		} else {
			let day = self.days.get_or_open(date, || self.open_day(date))?;
			let key = daily_key(div, hash);
			if day.index.has_key(&key)? {
				return Ok(false);
			}
			day.index.put(&key, text.as_bytes())?;
			Ok(true)
		}
	}

	pub fn get(&self, date: &str, div: &str, hash: i32) -> Result<Option<String>> {
		if is_permanent_div(div) {
			let perm = self.perm_div(div)?;
			match perm.index.get(&hash.to_be_bytes())? {
				Some(value) => {
					let body = read_framed_u32(&perm.data, codec::int5_of(&value) as u64)?;
					Ok(Some(String::from_utf8_lossy(&body).into_owned()))
				}
				None => Ok(None),
			}
		} else {
			let day = match self.day_for_read(date)? {
				Some(day) => day,
				None => return Ok(None),
			};
			Ok(day
				.index
				.get(&daily_key(div, hash))?
				.map(|value| String::from_utf8_lossy(&value).into_owned()))
		}
	}

	pub fn purge_old_days(&self, keep: &HashSet<String>) {
		let purged = self.days.purge(keep);
		if purged > 0 {
			log::info!(target: "tracestore", "text: closed {} old day containers", purged);
		}
	}

	pub fn flush_all(&self) {
		for perm in self.perm.lock().values() {
			if let Err(e) = perm.data.flush().and_then(|_| perm.index.flush()) {
				log::warn!(target: "tracestore", "text flush failed: {}", e);
			}
		}
		for day in self.days.values() {
			if let Err(e) = day.index.flush() {
				log::warn!(target: "tracestore", "text flush failed: {}", e);
			}
		}
	}

	pub fn close(&self) {
		self.flush_all();
		self.perm.lock().clear();
		self.days.clear();
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::flush::{FlushScheduler, Shutdown};
	use crate::testutil::TempDir;

	fn store(dir: &TempDir) -> TextStore {
		let scheduler = FlushScheduler::new(Arc::new(Shutdown::new()));
		TextStore::new(&Options::with_base(dir.root()), scheduler)
	}

	#[test]
	fn second_set_is_a_no_op() {
		let dir = TempDir::new("text-dedup");
		let store = store(&dir);
		assert!(store.set("20260801", "service", 101, "/order/list").unwrap());
		assert!(!store.set("20260801", "service", 101, "/order/list").unwrap());
		assert_eq!(store.get("20260801", "service", 101).unwrap().unwrap(), "/order/list");

		// Exactly one data record was written.
		let perm = store.perm_div("service").unwrap();
		let expected = 4 + "/order/list".len() as u64;
		assert_eq!(perm.data.len(), expected);
	}

	#[test]
	fn permanent_divs_ignore_the_date() {
		let dir = TempDir::new("text-perm");
		let store = store(&dir);
		store.set("20260801", "sql", 7, "SELECT 1").unwrap();
		assert_eq!(store.get("20260725", "sql", 7).unwrap().unwrap(), "SELECT 1");
		assert!(dir.path("00000000").join("text").join("text_sql.kfile").is_file());
	}

	#[test]
	fn daily_divs_are_scoped_by_day() {
		let dir = TempDir::new("text-daily");
		let store = store(&dir);
		store.set("20260801", "hashed_msg", 5, "slow query detected").unwrap();
		assert_eq!(
			store.get("20260801", "hashed_msg", 5).unwrap().unwrap(),
			"slow query detected"
		);
		assert!(store.get("20260802", "hashed_msg", 5).unwrap().is_none());
		// Same hash under a different div resolves independently.
		store.set("20260801", "custom", 5, "other").unwrap();
		assert_eq!(store.get("20260801", "custom", 5).unwrap().unwrap(), "other");
		assert_eq!(
			store.get("20260801", "hashed_msg", 5).unwrap().unwrap(),
			"slow query detected"
		);
	}

	#[test]
	fn survives_reopen() {
		let dir = TempDir::new("text-reopen");
		{
			let store = store(&dir);
			store.set("20260801", "service", 1, "/a").unwrap();
			store.set("20260801", "other", 2, "/b").unwrap();
			store.close();
		}
		let store = store(&dir);
		assert_eq!(store.get("20260801", "service", 1).unwrap().unwrap(), "/a");
		assert_eq!(store.get("20260801", "other", 2).unwrap().unwrap(), "/b");
	}
}
