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

// Writer ingress. Producers never block: a full queue drops the record
// and counts it. One consumer thread per queue drains batches and lets
// the sink flush its data files once per batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::Result;

pub const BATCH_SIZE: usize = 512;

/// A store's write side: record ingestion plus the once-per-batch flush.
pub trait BatchSink<T>: Send + Sync {
	fn name(&self) -> &'static str;
	fn write(&self, record: T) -> Result<()>;
	fn end_batch(&self);
}

pub struct WriteQueue<T> {
	sender: Sender<T>,
	dropped: Arc<AtomicU64>,
}

impl<T> WriteQueue<T> {
	/// Non-blocking enqueue; overflow drops the record.
	pub fn push(&self, record: T) {
		match self.sender.try_send(record) {
			Ok(()) => {}
			Err(TrySendError::Full(_)) => {
				self.dropped.fetch_add(1, Ordering::Relaxed);
				log::debug!(target: "tracestore", "Write queue full, record dropped");
			}
			Err(TrySendError::Disconnected(_)) => {
				log::debug!(target: "tracestore", "Write queue closed, record dropped");
			}
		}
	}

	pub fn dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

/// Spawns the consumer worker. Dropping every `WriteQueue` clone closes
/// the channel; the worker finishes the backlog and exits.
pub fn spawn<T, S>(
	capacity: usize,
	sink: Arc<S>,
) -> std::io::Result<(WriteQueue<T>, std::thread::JoinHandle<()>)>
where
	T: Send + 'static,
	S: BatchSink<T> + 'static,
{
	let (sender, receiver) = bounded(capacity);
	let name = sink.name();
	let handle = std::thread::Builder::new()
		.name(format!("tracestore-{}", name))
		.spawn(move || worker(receiver, sink))?;
	Ok((WriteQueue { sender, dropped: Arc::new(AtomicU64::new(0)) }, handle))
}

fn worker<T, S: BatchSink<T>>(receiver: Receiver<T>, sink: Arc<S>) {
	loop {
		let first = match receiver.recv() {
			Ok(record) => record,
			Err(_) => break,
		};
		write_one(&*sink, first);
		let mut batched = 1;
		while batched < BATCH_SIZE {
			match receiver.try_recv() {
				Ok(record) => {
					write_one(&*sink, record);
					batched += 1;
				}
				Err(_) => break,
			}
		}
		sink.end_batch();
	}
	log::debug!(target: "tracestore", "{} writer drained and stopped", sink.name());
}

fn write_one<T, S: BatchSink<T>>(sink: &S, record: T) {
	// A bad record never stalls the stream; log and move on.
	if let Err(e) = sink.write(record) {
		log::warn!(target: "tracestore", "{}: dropping record: {}", sink.name(), e);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use parking_lot::Mutex;
	use std::sync::atomic::AtomicUsize;

	struct Collector {
		seen: Mutex<Vec<u32>>,
		batches: AtomicUsize,
		gate: Mutex<()>,
	}

	impl BatchSink<u32> for Collector {
		fn name(&self) -> &'static str {
			"collector"
		}
		fn write(&self, record: u32) -> Result<()> {
			let _gate = self.gate.lock();
			self.seen.lock().push(record);
			Ok(())
		}
		fn end_batch(&self) {
			self.batches.fetch_add(1, Ordering::Relaxed);
		}
	}

	fn collector() -> Arc<Collector> {
		Arc::new(Collector {
			seen: Mutex::new(Vec::new()),
			batches: AtomicUsize::new(0),
			gate: Mutex::new(()),
		})
	}

	#[test]
	fn preserves_enqueue_order_and_drains_on_close() {
		let sink = collector();
		let (queue, handle) = spawn(1000, sink.clone()).unwrap();
		for i in 0..100 {
			queue.push(i);
		}
		drop(queue);
		handle.join().unwrap();
		assert_eq!(*sink.seen.lock(), (0..100).collect::<Vec<u32>>());
		assert!(sink.batches.load(Ordering::Relaxed) >= 1);
	}

	#[test]
	fn overflow_drops_and_counts() {
		let sink = collector();
		// Stall the worker so the queue can actually fill up.
		let gate = sink.gate.lock();
		let (queue, handle) = spawn(4, sink.clone()).unwrap();
		for i in 0..100 {
			queue.push(i);
		}
		assert!(queue.dropped() > 0);
		let dropped = queue.dropped();
		drop(gate);
		drop(queue);
		handle.join().unwrap();
		assert_eq!(sink.seen.lock().len() as u64 + dropped, 100);
	}
}
