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

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// An object with buffered state the scheduler may push out.
pub trait Flushable: Send + Sync {
	fn name(&self) -> String;
	fn is_dirty(&self) -> bool;
	fn flush(&self) -> Result<()>;
	/// Preferred flush interval. The scheduler tick is authoritative, an
	/// object is never flushed more often than once per tick.
	fn interval(&self) -> Duration {
		Duration::from_secs(1)
	}
}

/// Wakeable sleep shared by the background threads. `stop` releases every
/// waiter immediately.
pub struct Shutdown {
	stopped: Mutex<bool>,
	condvar: Condvar,
}

impl Shutdown {
	pub fn new() -> Shutdown {
		Shutdown { stopped: Mutex::new(false), condvar: Condvar::new() }
	}

	/// Sleeps for `timeout` unless stopped. Returns true when the caller
	/// should exit.
	pub fn wait(&self, timeout: Duration) -> bool {
		let mut stopped = self.stopped.lock();
		if *stopped {
			return true;
		}
		self.condvar.wait_for(&mut stopped, timeout);
		*stopped
	}

	pub fn stop(&self) {
		*self.stopped.lock() = true;
		self.condvar.notify_all();
	}
}

struct Registration {
	target: Weak<dyn Flushable>,
	last_flush: Instant,
}

/// Process-wide periodic flusher. One background worker, 1 s tick; dirty
/// registrants whose preferred interval has elapsed are flushed. Owned by
/// the `Db` and handed to components as a collaborator.
pub struct FlushScheduler {
	registered: Mutex<Vec<Registration>>,
	shutdown: Arc<Shutdown>,
}

const TICK: Duration = Duration::from_secs(1);

impl FlushScheduler {
	pub fn new(shutdown: Arc<Shutdown>) -> Arc<FlushScheduler> {
		Arc::new(FlushScheduler { registered: Mutex::new(Vec::new()), shutdown })
	}

	pub fn spawn(self: &Arc<FlushScheduler>) -> std::io::Result<std::thread::JoinHandle<()>> {
		let scheduler = self.clone();
		std::thread::Builder::new().name("tracestore-flush".into()).spawn(move || {
			while !scheduler.shutdown.wait(TICK) {
				scheduler.tick();
			}
			// Final pass so nothing dirty is left behind on shutdown.
			scheduler.tick_all();
		})
	}

	pub fn register(&self, target: Weak<dyn Flushable>) {
		self.registered.lock().push(Registration { target, last_flush: Instant::now() });
	}

	pub fn registered_count(&self) -> usize {
		self.registered.lock().len()
	}

	fn due(&self, now: Instant) -> Vec<Arc<dyn Flushable>> {
		let mut registered = self.registered.lock();
		let mut due = Vec::new();
		registered.retain_mut(|reg| match reg.target.upgrade() {
			Some(target) => {
				if now.duration_since(reg.last_flush) >= target.interval() && target.is_dirty() {
					reg.last_flush = now;
					due.push(target);
				}
				true
			}
			None => false,
		});
		due
	}

	fn tick(&self) {
		for target in self.due(Instant::now()) {
			flush_one(&*target);
		}
	}

	fn tick_all(&self) {
		let mut registered = self.registered.lock();
		registered.retain(|reg| reg.target.upgrade().is_some());
		let targets: Vec<_> = registered.iter().filter_map(|r| r.target.upgrade()).collect();
		drop(registered);
		for target in targets {
			if target.is_dirty() {
				flush_one(&*target);
			}
		}
	}
}

fn flush_one(target: &dyn Flushable) {
	if let Err(e) = target.flush() {
		log::warn!(target: "tracestore", "Flush of {} failed: {}", target.name(), e);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	struct Probe {
		dirty: AtomicBool,
		flushed: AtomicUsize,
	}

	impl Flushable for Probe {
		fn name(&self) -> String {
			"probe".into()
		}
		fn is_dirty(&self) -> bool {
			self.dirty.load(Ordering::Relaxed)
		}
		fn flush(&self) -> Result<()> {
			self.dirty.store(false, Ordering::Relaxed);
			self.flushed.fetch_add(1, Ordering::Relaxed);
			Ok(())
		}
		fn interval(&self) -> Duration {
			Duration::from_millis(0)
		}
	}

	#[test]
	fn flushes_dirty_and_prunes_dead() {
		let shutdown = Arc::new(Shutdown::new());
		let scheduler = FlushScheduler::new(shutdown);
		let probe = Arc::new(Probe { dirty: AtomicBool::new(true), flushed: AtomicUsize::new(0) });
		scheduler.register(Arc::downgrade(&probe) as Weak<dyn Flushable>);

		scheduler.tick();
		assert_eq!(probe.flushed.load(Ordering::Relaxed), 1);
		scheduler.tick();
		assert_eq!(probe.flushed.load(Ordering::Relaxed), 1, "clean object is not reflushed");

		probe.dirty.store(true, Ordering::Relaxed);
		scheduler.tick();
		assert_eq!(probe.flushed.load(Ordering::Relaxed), 2);

		drop(probe);
		scheduler.tick();
		assert_eq!(scheduler.registered_count(), 0);
	}

	#[test]
	fn shutdown_releases_waiters() {
		let shutdown = Arc::new(Shutdown::new());
		let waiter = shutdown.clone();
		let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(60)));
		std::thread::sleep(Duration::from_millis(10));
		shutdown.stop();
		assert!(handle.join().unwrap());
	}
}
