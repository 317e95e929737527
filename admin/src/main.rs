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

use std::path::PathBuf;

use structopt::StructOpt;
use tracestore::rehash::{index_stats, rehash, RehashOutcome};

/// Offline maintenance for tracestore databases. Run these only while
/// the owning server is stopped.
#[derive(StructOpt)]
#[structopt(name = "tracestore-admin")]
enum Command {
	/// Rebuild a hash index with a larger bucket table.
	Rehash {
		/// Directory holding the index files, e.g. db/20260801/xlog
		#[structopt(long, parse(from_os_str))]
		path: PathBuf,
		/// Index name without extension, e.g. xlog_tid
		#[structopt(long)]
		name: String,
		/// Target bucket file size in megabytes.
		#[structopt(long)]
		mb: u32,
		/// The index uses the TTL record format.
		#[structopt(long)]
		ttl: bool,
	},
	/// Print entry counts and chain shape for a hash index.
	Stats {
		#[structopt(long, parse(from_os_str))]
		path: PathBuf,
		#[structopt(long)]
		name: String,
		#[structopt(long)]
		ttl: bool,
	},
}

fn main() {
	env_logger::init();
	fdlimit::raise_fd_limit();

	let result = match Command::from_args() {
		Command::Rehash { path, name, mb, ttl } => rehash(&path, &name, mb, ttl).map(|outcome| {
			match outcome {
				RehashOutcome::SkippedEmpty => println!("{}: empty index, nothing to do", name),
				RehashOutcome::SkippedCapacity => {
					println!("{}: bucket file already has the requested capacity", name)
				}
				RehashOutcome::Rebuilt { records } => {
					println!("{}: rebuilt with {} records", name, records)
				}
			}
		}),
		Command::Stats { path, name, ttl } => index_stats(&path, &name, ttl).map(|stats| {
			println!("capacity:        {}", stats.capacity);
			println!("used slots:      {}", stats.used_slots);
			println!("live records:    {}", stats.live_records);
			println!("deleted records: {}", stats.deleted_records);
			println!("max chain:       {}", stats.max_chain);
			println!("mean chain:      {:.2}", stats.mean_chain);
			println!("chain depth histogram:");
			for (depth, slots) in &stats.chain_histogram {
				println!("  {:>5}: {} slots", depth, slots);
			}
		}),
	};

	if let Err(e) = result {
		eprintln!("error: {}", e);
		std::process::exit(1);
	}
}
