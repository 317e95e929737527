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

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Engine configuration. `Options::from_env` reads the flat key set the
/// server configuration layer exposes as environment variables; malformed
/// values keep the default and log a warning.
#[derive(Clone, Debug)]
pub struct Options {
	/// `db_dir`
	pub base_dir: PathBuf,
	/// `db_keep_days`; 0 disables deletion by age.
	pub keep_days: u32,
	/// `db_max_disk_usage_pct`; 0 disables the pressure sweep.
	pub max_disk_usage_pct: u8,
	/// `day_container_keep_hours`
	pub container_keep_hours: u32,
	/// `xlog_queue_size`
	pub xlog_queue_size: usize,
	/// `profile_queue_size`
	pub profile_queue_size: usize,
	/// `log_index_traversal_warning_count`
	pub traversal_warn: usize,
	/// `compress_xlog_enabled`
	pub compress_xlog: bool,
	/// `compress_profile_enabled`
	pub compress_profile: bool,
	/// `_mgr_text_db_index_{div}_mb` overrides, keyed by div.
	pub text_index_mb: HashMap<String, u32>,
	/// `_mgr_text_db_daily_index_mb`
	pub daily_text_index_mb: u32,
}

impl Default for Options {
	fn default() -> Options {
		Options {
			base_dir: PathBuf::from("./database"),
			keep_days: 0,
			max_disk_usage_pct: 0,
			container_keep_hours: 48,
			xlog_queue_size: 10_000,
			profile_queue_size: 10_000,
			traversal_warn: 100,
			compress_xlog: false,
			compress_profile: false,
			text_index_mb: HashMap::new(),
			daily_text_index_mb: 1,
		}
	}
}

const TEXT_INDEX_PREFIX: &str = "_mgr_text_db_index_";
const TEXT_INDEX_SUFFIX: &str = "_mb";

impl Options {
	pub fn with_base<P: Into<PathBuf>>(base: P) -> Options {
		Options { base_dir: base.into(), ..Default::default() }
	}

	pub fn from_env() -> Options {
		let mut options = Options::default();
		if let Ok(dir) = std::env::var("db_dir") {
			options.base_dir = PathBuf::from(dir);
		}
		read_var("db_keep_days", &mut options.keep_days);
		read_var("db_max_disk_usage_pct", &mut options.max_disk_usage_pct);
		read_var("day_container_keep_hours", &mut options.container_keep_hours);
		read_var("xlog_queue_size", &mut options.xlog_queue_size);
		read_var("profile_queue_size", &mut options.profile_queue_size);
		read_var("log_index_traversal_warning_count", &mut options.traversal_warn);
		read_var("compress_xlog_enabled", &mut options.compress_xlog);
		read_var("compress_profile_enabled", &mut options.compress_profile);
		read_var("_mgr_text_db_daily_index_mb", &mut options.daily_text_index_mb);
		for (key, value) in std::env::vars() {
			if key.starts_with(TEXT_INDEX_PREFIX) && key.ends_with(TEXT_INDEX_SUFFIX) {
				let div = &key[TEXT_INDEX_PREFIX.len()..key.len() - TEXT_INDEX_SUFFIX.len()];
				if div == "daily" {
					continue;
				}
				match value.parse::<u32>() {
					Ok(mb) => {
						options.text_index_mb.insert(div.to_string(), mb);
					}
					Err(_) => {
						log::warn!(target: "tracestore", "Ignoring bad value for {}: {}", key, value);
					}
				}
			}
		}
		options
	}

	/// Bucket file size for a permanent text div, in megabytes.
	pub fn text_index_mb(&self, div: &str) -> u32 {
		self.text_index_mb.get(div).copied().unwrap_or(1)
	}
}

fn read_var<T: FromStr + std::fmt::Debug>(key: &str, slot: &mut T) {
	if let Ok(value) = std::env::var(key) {
		match value.parse::<T>() {
			Ok(v) => *slot = v,
			Err(_) => {
				log::warn!(
					target: "tracestore",
					"Ignoring bad value for {}: {} (keeping {:?})",
					key,
					value,
					slot,
				);
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn defaults() {
		let options = Options::default();
		assert_eq!(options.container_keep_hours, 48);
		assert_eq!(options.xlog_queue_size, 10_000);
		assert_eq!(options.traversal_warn, 100);
		assert_eq!(options.text_index_mb("service"), 1);
	}

	#[test]
	fn env_round_trip() {
		std::env::set_var("day_container_keep_hours", "72");
		std::env::set_var("compress_xlog_enabled", "true");
		std::env::set_var("_mgr_text_db_index_sql_mb", "16");
		std::env::set_var("log_index_traversal_warning_count", "not-a-number");
		let options = Options::from_env();
		assert_eq!(options.container_keep_hours, 72);
		assert!(options.compress_xlog);
		assert_eq!(options.text_index_mb("sql"), 16);
		assert_eq!(options.traversal_warn, 100);
		std::env::remove_var("day_container_keep_hours");
		std::env::remove_var("compress_xlog_enabled");
		std::env::remove_var("_mgr_text_db_index_sql_mb");
		std::env::remove_var("log_index_traversal_warning_count");
	}
}
