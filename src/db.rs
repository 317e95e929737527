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

// The assembled engine. One `Db` owns the flush scheduler, the five
// stores with their writer queues, and the retention threads. Writes go
// through bounded queues and a background worker per kind; reads hit
// the same stores, so the freshest, not-yet-synced state is visible.
// Shutdown closes the queues, drains the workers, then flushes and
// closes every container.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::alert::{AlertRecord, AlertStore};
use crate::counter::{CounterStore, CounterValue, RealCounterRecord};
use crate::day::{keep_dates, now_ms};
use crate::error::Result;
use crate::flush::{FlushScheduler, Shutdown};
use crate::options::Options;
use crate::profile::{ProfileRecord, ProfileStore};
use crate::queue::{self, WriteQueue};
use crate::retention;
use crate::text::TextStore;
use crate::xlog::{XLogRecord, XLogStore};

const BACKGROUND_TICK: Duration = Duration::from_secs(3600);
const SIDE_QUEUE_SIZE: usize = 10_000;

pub struct Db {
	options: Options,
	shutdown: Arc<Shutdown>,
	xlog: Arc<XLogStore>,
	profile: Arc<ProfileStore>,
	counter: Arc<CounterStore>,
	text: Arc<TextStore>,
	alert: Arc<AlertStore>,
	xlog_queue: Option<WriteQueue<XLogRecord>>,
	profile_queue: Option<WriteQueue<ProfileRecord>>,
	counter_queue: Option<WriteQueue<RealCounterRecord>>,
	alert_queue: Option<WriteQueue<AlertRecord>>,
	workers: Vec<JoinHandle<()>>,
	background: Vec<JoinHandle<()>>,
}

impl Db {
	pub fn open(options: Options) -> Result<Db> {
		std::fs::create_dir_all(&options.base_dir)?;
		log::info!(target: "tracestore", "Opening database at {:?}", options.base_dir);

		let shutdown = Arc::new(Shutdown::new());
		let scheduler = FlushScheduler::new(shutdown.clone());
		let mut background = vec![scheduler.spawn()?];

		let xlog = Arc::new(XLogStore::new(&options, scheduler.clone()));
		let profile = Arc::new(ProfileStore::new(&options, scheduler.clone()));
		let counter = Arc::new(CounterStore::new(&options, scheduler.clone()));
		let text = Arc::new(TextStore::new(&options, scheduler.clone()));
		let alert = Arc::new(AlertStore::new(&options, scheduler.clone()));

		let (xlog_queue, handle) = queue::spawn(options.xlog_queue_size, xlog.clone())?;
		let mut workers = vec![handle];
		let (profile_queue, handle) = queue::spawn(options.profile_queue_size, profile.clone())?;
		workers.push(handle);
		let (counter_queue, handle) = queue::spawn(SIDE_QUEUE_SIZE, counter.clone())?;
		workers.push(handle);
		let (alert_queue, handle) = queue::spawn(SIDE_QUEUE_SIZE, alert.clone())?;
		workers.push(handle);

		background.push(Self::spawn_purger(&options, &shutdown, (
			xlog.clone(),
			profile.clone(),
			counter.clone(),
			text.clone(),
			alert.clone(),
		))?);
		background.push(Self::spawn_sweeper(&options, &shutdown)?);

		Ok(Db {
			options,
			shutdown,
			xlog,
			profile,
			counter,
			text,
			alert,
			xlog_queue: Some(xlog_queue),
			profile_queue: Some(profile_queue),
			counter_queue: Some(counter_queue),
			alert_queue: Some(alert_queue),
			workers,
			background,
		})
	}

	fn spawn_purger(
		options: &Options,
		shutdown: &Arc<Shutdown>,
		stores: (
			Arc<XLogStore>,
			Arc<ProfileStore>,
			Arc<CounterStore>,
			Arc<TextStore>,
			Arc<AlertStore>,
		),
	) -> Result<JoinHandle<()>> {
		let shutdown = shutdown.clone();
		let keep_hours = options.container_keep_hours;
		Ok(std::thread::Builder::new().name("tracestore-purge".into()).spawn(move || {
			while !shutdown.wait(BACKGROUND_TICK) {
				let keep = keep_dates(now_ms(), keep_hours);
				purge_all(&stores, &keep);
			}
		})?)
	}

	fn spawn_sweeper(options: &Options, shutdown: &Arc<Shutdown>) -> Result<JoinHandle<()>> {
		let shutdown = shutdown.clone();
		let base = options.base_dir.clone();
		let keep_days = options.keep_days;
		let max_pct = options.max_disk_usage_pct;
		Ok(std::thread::Builder::new().name("tracestore-retention".into()).spawn(move || {
			while !shutdown.wait(BACKGROUND_TICK) {
				if let Err(e) = retention::sweep(&base, keep_days, max_pct, now_ms()) {
					log::warn!(target: "tracestore", "Retention sweep failed: {}", e);
				}
			}
		})?)
	}

	// Write side. Enqueues never block; a full queue drops the record.

	pub fn write_xlog(&self, record: XLogRecord) {
		if let Some(queue) = &self.xlog_queue {
			queue.push(record);
		}
	}

	pub fn write_profile(&self, record: ProfileRecord) {
		if let Some(queue) = &self.profile_queue {
			queue.push(record);
		}
	}

	pub fn write_counter(&self, record: RealCounterRecord) {
		if let Some(queue) = &self.counter_queue {
			queue.push(record);
		}
	}

	pub fn write_alert(&self, record: AlertRecord) {
		if let Some(queue) = &self.alert_queue {
			queue.push(record);
		}
	}

	/// Records dropped on full queues since open.
	pub fn dropped_records(&self) -> u64 {
		let mut dropped = 0;
		if let Some(queue) = &self.xlog_queue {
			dropped += queue.dropped();
		}
		if let Some(queue) = &self.profile_queue {
			dropped += queue.dropped();
		}
		if let Some(queue) = &self.counter_queue {
			dropped += queue.dropped();
		}
		if let Some(queue) = &self.alert_queue {
			dropped += queue.dropped();
		}
		dropped
	}

	// Synchronous writes: daily rollups and text interning.

	pub fn write_daily_counter(
		&self,
		obj_hash: i32,
		name: &str,
		time_ms: i64,
		value: CounterValue,
	) -> Result<()> {
		self.counter.write_daily(obj_hash, name, time_ms, value)
	}

	pub fn set_text(&self, date: &str, div: &str, hash: i32, text: &str) -> Result<bool> {
		self.text.set(date, div, hash, text)
	}

	// Read side.

	pub fn read_xlog_by_time<F: FnMut(XLogRecord) -> bool>(
		&self,
		stime: i64,
		etime: i64,
		f: F,
	) -> Result<()> {
		self.xlog.read_by_time(stime, etime, f)
	}

	pub fn read_xlog_by_time_from_end<F: FnMut(XLogRecord) -> bool>(
		&self,
		stime: i64,
		etime: i64,
		f: F,
	) -> Result<()> {
		self.xlog.read_by_time_from_end(stime, etime, f)
	}

	pub fn get_xlog_by_txid(&self, date: &str, txid: i64) -> Result<Option<XLogRecord>> {
		self.xlog.get_by_txid(date, txid)
	}

	pub fn read_xlog_by_gxid(&self, date: &str, gxid: i64) -> Result<Vec<XLogRecord>> {
		self.xlog.read_by_gxid(date, gxid)
	}

	pub fn read_profile(&self, date: &str, txid: i64, max: i64) -> Result<Vec<Vec<u8>>> {
		self.profile.read(date, txid, max)
	}

	pub fn read_counter(
		&self,
		obj_hash: i32,
		time_sec: i64,
	) -> Result<Option<Vec<(String, CounterValue)>>> {
		self.counter.read_real(obj_hash, time_sec)
	}

	pub fn read_counter_range(
		&self,
		obj_hash: i32,
		s_sec: i64,
		e_sec: i64,
	) -> Result<Vec<(i64, Vec<(String, CounterValue)>)>> {
		self.counter.read_real_range(obj_hash, s_sec, e_sec)
	}

	pub fn read_daily_counter(
		&self,
		date: &str,
		obj_hash: i32,
		name: &str,
	) -> Result<Option<Vec<Option<CounterValue>>>> {
		self.counter.read_daily(date, obj_hash, name)
	}

	pub fn get_text(&self, date: &str, div: &str, hash: i32) -> Result<Option<String>> {
		self.text.get(date, div, hash)
	}

	pub fn read_alerts<F: FnMut(AlertRecord) -> bool>(
		&self,
		stime: i64,
		etime: i64,
		f: F,
	) -> Result<()> {
		self.alert.read(stime, etime, f)
	}

	/// One container purge pass, as the hourly tick runs it.
	pub fn purge_old_days(&self) {
		let keep = keep_dates(now_ms(), self.options.container_keep_hours);
		purge_all(
			&(
				self.xlog.clone(),
				self.profile.clone(),
				self.counter.clone(),
				self.text.clone(),
				self.alert.clone(),
			),
			&keep,
		);
	}

	/// Graceful shutdown: close ingress, drain workers, stop background
	/// threads, flush and drop every container.
	pub fn shutdown(mut self) {
		self.close_impl();
	}

	fn close_impl(&mut self) {
		if self.workers.is_empty() && self.background.is_empty() {
			return;
		}
		log::info!(target: "tracestore", "Shutting down database at {:?}", self.options.base_dir);
		self.xlog_queue.take();
		self.profile_queue.take();
		self.counter_queue.take();
		self.alert_queue.take();
		for worker in self.workers.drain(..) {
			worker.join().ok();
		}
		self.shutdown.stop();
		for thread in self.background.drain(..) {
			thread.join().ok();
		}
		self.xlog.close();
		self.profile.close();
		self.counter.close();
		self.text.close();
		self.alert.close();
	}
}

impl Drop for Db {
	fn drop(&mut self) {
		self.close_impl();
	}
}

fn purge_all(
	stores: &(
		Arc<XLogStore>,
		Arc<ProfileStore>,
		Arc<CounterStore>,
		Arc<TextStore>,
		Arc<AlertStore>,
	),
	keep: &HashSet<String>,
) {
	stores.0.purge_old_days(keep);
	stores.1.purge_old_days(keep);
	stores.2.purge_old_days(keep);
	stores.3.purge_old_days(keep);
	stores.4.purge_old_days(keep);
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::alert::AlertLevel;
	use crate::day::{date_of_ms, date_start_ms};
	use crate::testutil::TempDir;

	fn wait_until<F: FnMut() -> bool>(what: &str, mut f: F) {
		for _ in 0..500 {
			if f() {
				return;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		panic!("timed out waiting for {}", what);
	}

	fn open(dir: &TempDir) -> Db {
		Db::open(Options::with_base(dir.root())).unwrap()
	}

	#[test]
	fn writes_become_readable_and_survive_restart() {
		let dir = TempDir::new("db-e2e");
		let t = date_start_ms("20260801").unwrap() + 9 * 3600 * 1000;
		let date = "20260801";
		let sec = t / 1000;
		{
			let db = open(&dir);
			db.write_xlog(XLogRecord {
				end_time: t,
				txid: 1001,
				gxid: 5001,
				service_hash: 7,
				..Default::default()
			});
			db.write_profile(ProfileRecord { time: t, txid: 1001, block: b"step data".to_vec() });
			db.write_counter(RealCounterRecord {
				obj_hash: 1,
				time_sec: sec,
				counters: vec![("TPS".to_string(), CounterValue::Decimal(42))],
			});
			db.write_alert(AlertRecord {
				time: t,
				level: AlertLevel::Warn,
				obj_hash: 1,
				title: "t".to_string(),
				message: "m".to_string(),
			});
			db.set_text(date, "service", 7, "/checkout").unwrap();
			db.write_daily_counter(1, "TPS", t, CounterValue::Decimal(9)).unwrap();

			// Read-your-writes: the queues drain asynchronously, after
			// that every surface answers from the writer's containers.
			wait_until("xlog visible", || db.get_xlog_by_txid(date, 1001).unwrap().is_some());
			wait_until("profile visible", || !db.read_profile(date, 1001, -1).unwrap().is_empty());
			wait_until("counter visible", || db.read_counter(1, sec).unwrap().is_some());

			let related = db.read_xlog_by_gxid(date, 5001).unwrap();
			assert_eq!(related.len(), 1);
			assert_eq!(db.get_text(date, "service", 7).unwrap().unwrap(), "/checkout");
			assert_eq!(db.dropped_records(), 0);
			db.shutdown();
		}

		let db = open(&dir);
		assert_eq!(db.get_xlog_by_txid(date, 1001).unwrap().unwrap().service_hash, 7);
		assert_eq!(db.read_profile(date, 1001, -1).unwrap(), vec![b"step data".to_vec()]);
		let counters = db.read_counter(1, sec).unwrap().unwrap();
		assert_eq!(counters[0].1, CounterValue::Decimal(42));
		let slots = db.read_daily_counter(date, 1, "TPS").unwrap().unwrap();
		assert!(slots.iter().any(|s| *s == Some(CounterValue::Decimal(9))));
		let mut alerts = 0;
		db.read_alerts(t - 1000, t + 1000, |_| {
			alerts += 1;
			true
		})
		.unwrap();
		assert_eq!(alerts, 1);

		let mut range = Vec::new();
		db.read_xlog_by_time(t - 1000, t + 1000, |r| {
			range.push(r.txid);
			true
		})
		.unwrap();
		assert_eq!(range, vec![1001]);
	}

	#[test]
	fn purge_keeps_recent_containers() {
		let dir = TempDir::new("db-purge");
		let db = open(&dir);
		let old = date_start_ms("20260601").unwrap() + 1000;
		let fresh = now_ms();
		db.write_xlog(XLogRecord { end_time: old, txid: 1, ..Default::default() });
		db.write_xlog(XLogRecord { end_time: fresh, txid: 2, ..Default::default() });
		wait_until("both days visible", || {
			db.get_xlog_by_txid("20260601", 1).unwrap().is_some()
				&& db.get_xlog_by_txid(&date_of_ms(fresh), 2).unwrap().is_some()
		});

		db.purge_old_days();
		// The old container is gone from memory but reopens from disk.
		assert!(db.get_xlog_by_txid("20260601", 1).unwrap().is_some());
		assert!(db.get_xlog_by_txid(&date_of_ms(fresh), 2).unwrap().is_some());
	}
}
