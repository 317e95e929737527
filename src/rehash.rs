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

// Offline index rebuild. A hash index whose chains have grown deep is
// streamed record by record into a fresh index with a larger bucket
// file, then swapped in through `.bak` renames. Value payloads are
// opaque here, so the companion data file is never touched. Run this
// only while the owning server is down.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hash_index::{key_hash, HashIndex, IndexOptions};

const HEADER_SIZE: u64 = 1024;
const SLOT_SIZE: u64 = 5;

#[derive(Debug, PartialEq)]
pub enum RehashOutcome {
	/// No live records; nothing to do.
	SkippedEmpty,
	/// The bucket file already has the requested capacity.
	SkippedCapacity,
	Rebuilt { records: u64 },
}

struct IndexFiles {
	hfile: PathBuf,
	kfile: PathBuf,
}

fn index_files(dir: &Path, name: &str, ttl: bool) -> IndexFiles {
	IndexFiles {
		hfile: dir.join(format!("{}.hfile", name)),
		kfile: dir.join(format!("{}.{}", name, if ttl { "k2file" } else { "kfile" })),
	}
}

fn open_plain(dir: &Path, name: &str, mb: u32, ttl: bool) -> Result<HashIndex> {
	let options = IndexOptions { bucket_mb: mb, ttl, warn_depth: usize::MAX };
	HashIndex::open(dir, name, options, None)
}

pub fn rehash(dir: &Path, name: &str, target_mb: u32, ttl: bool) -> Result<RehashOutcome> {
	let source = open_plain(dir, name, 1, ttl)?;

	let mut records = 0u64;
	source.scan(|_, _| {
		records += 1;
		true
	})?;
	if records == 0 {
		log::info!(target: "tracestore", "Rehash of {}: empty, skipped", name);
		return Ok(RehashOutcome::SkippedEmpty);
	}
	let target_capacity = (target_mb as u64 * 1024 * 1024 - HEADER_SIZE) / SLOT_SIZE;
	if source.bucket_capacity() == target_capacity {
		log::info!(target: "tracestore", "Rehash of {}: capacity already {}, skipped", name, target_capacity);
		return Ok(RehashOutcome::SkippedCapacity);
	}

	let rebuild_name = format!("{}_rebuild", name);
	let rebuild = index_files(dir, &rebuild_name, ttl);
	remove_if_present(&rebuild.hfile)?;
	remove_if_present(&rebuild.kfile)?;

	log::info!(
		target: "tracestore",
		"Rehashing {}: {} records, {} -> {} slots",
		name,
		records,
		source.bucket_capacity(),
		target_capacity,
	);
	let destination = open_plain(dir, &rebuild_name, target_mb, ttl)?;
	let mut copy_error = None;
	let now = crate::keyfile::now_sec();
	source.scan_records(|record| {
		if record.deleted {
			return true;
		}
		// TTL indexes keep their expiries; already-expired records are
		// compacted away.
		let copied = if !ttl {
			destination.put(&record.key, &record.value).map(|_| ())
		} else if record.expire == crate::codec::LONG5_MAX {
			destination.put_ttl(&record.key, &record.value, -1).map(|_| ())
		} else if record.expire > now {
			destination.put_ttl(&record.key, &record.value, record.expire - now).map(|_| ())
		} else {
			Ok(())
		};
		match copied {
			Ok(()) => true,
			Err(e) => {
				copy_error = Some(e);
				false
			}
		}
	})?;
	if let Some(e) = copy_error {
		remove_if_present(&rebuild.hfile)?;
		remove_if_present(&rebuild.kfile)?;
		return Err(e);
	}
	destination.flush()?;
	drop(destination);
	drop(source);

	swap_in(&index_files(dir, name, ttl), &rebuild)?;
	log::info!(target: "tracestore", "Rehash of {} complete", name);
	Ok(RehashOutcome::Rebuilt { records })
}

fn remove_if_present(path: &Path) -> Result<()> {
	match std::fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e.into()),
	}
}

fn bak(path: &Path) -> PathBuf {
	let mut bak = path.as_os_str().to_os_string();
	bak.push(".bak");
	PathBuf::from(bak)
}

/// Moves the live files aside and the rebuilt files into place. Any
/// failure rolls the live files back from `.bak`.
fn swap_in(live: &IndexFiles, rebuilt: &IndexFiles) -> Result<()> {
	let hbak = bak(&live.hfile);
	let kbak = bak(&live.kfile);

	std::fs::rename(&live.hfile, &hbak)?;
	if let Err(e) = std::fs::rename(&live.kfile, &kbak) {
		std::fs::rename(&hbak, &live.hfile).ok();
		return Err(e.into());
	}
	if let Err(e) = std::fs::rename(&rebuilt.hfile, &live.hfile) {
		std::fs::rename(&hbak, &live.hfile).ok();
		std::fs::rename(&kbak, &live.kfile).ok();
		return Err(e.into());
	}
	if let Err(e) = std::fs::rename(&rebuilt.kfile, &live.kfile) {
		std::fs::remove_file(&live.hfile).ok();
		std::fs::rename(&hbak, &live.hfile).ok();
		std::fs::rename(&kbak, &live.kfile).ok();
		return Err(e.into());
	}
	std::fs::remove_file(&hbak).ok();
	std::fs::remove_file(&kbak).ok();
	Ok(())
}

#[derive(Debug)]
pub struct IndexStats {
	pub capacity: u64,
	pub used_slots: i32,
	pub live_records: u64,
	pub deleted_records: u64,
	pub max_chain: u64,
	pub mean_chain: f64,
	/// Chain depth to the number of bucket slots carrying a chain that
	/// deep, fully-tombstoned slots excluded.
	pub chain_histogram: BTreeMap<u64, u64>,
}

/// Chain shape of an index, for deciding whether a rehash is worth it.
pub fn index_stats(dir: &Path, name: &str, ttl: bool) -> Result<IndexStats> {
	let index = open_plain(dir, name, 1, ttl)?;
	let capacity = index.bucket_capacity();
	let mut per_slot = HashMap::new();
	let mut live = 0u64;
	let mut deleted = 0u64;
	index.scan_records(|record| {
		if record.deleted {
			deleted += 1;
			return true;
		}
		live += 1;
		let slot = (key_hash(&record.key) & 0x7fff_ffff) as u64 % capacity;
		*per_slot.entry(slot).or_insert(0u64) += 1;
		true
	})?;
	let mut chain_histogram = BTreeMap::new();
	for depth in per_slot.values() {
		*chain_histogram.entry(*depth).or_insert(0u64) += 1;
	}
	let max_chain = per_slot.values().copied().max().unwrap_or(0);
	let mean_chain = if per_slot.is_empty() { 0.0 } else { live as f64 / per_slot.len() as f64 };
	Ok(IndexStats {
		capacity,
		used_slots: index.count(),
		live_records: live,
		deleted_records: deleted,
		max_chain,
		mean_chain,
		chain_histogram,
	})
}
