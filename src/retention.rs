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

// On-disk retention. Whole day directories are deleted by age, and
// under disk pressure the oldest remaining days go first. Readers need
// no coordination: a dropped day simply stops resolving. The permanent
// area is never touched, and neither is today.

use std::path::Path;

use crate::day::{date_of_ms, looks_like_date, PERMANENT_DATE};
use crate::error::Result;

/// Dated day directories under `base`, oldest first.
fn list_day_dirs(base: &Path) -> Result<Vec<String>> {
	let mut dates = Vec::new();
	for entry in std::fs::read_dir(base)? {
		let entry = entry?;
		if !entry.file_type()?.is_dir() {
			continue;
		}
		if let Some(name) = entry.file_name().to_str() {
			if looks_like_date(name) && name != PERMANENT_DATE {
				dates.push(name.to_string());
			}
		}
	}
	dates.sort();
	Ok(dates)
}

fn delete_day(base: &Path, date: &str) -> bool {
	match std::fs::remove_dir_all(base.join(date)) {
		Ok(()) => {
			log::info!(target: "tracestore", "Retention deleted day {}", date);
			true
		}
		Err(e) => {
			log::warn!(target: "tracestore", "Retention failed to delete {}: {}", date, e);
			false
		}
	}
}

fn disk_usage_pct(base: &Path) -> Option<u8> {
	let total = fs2::total_space(base).ok()?;
	if total == 0 {
		return None;
	}
	let available = fs2::available_space(base).ok()?;
	Some(((total - available) * 100 / total) as u8)
}

/// One sweeper pass. `keep_days == 0` disables deletion by age,
/// `max_pct == 0` disables the pressure sweep. Returns the deleted
/// dates.
pub fn sweep(base: &Path, keep_days: u32, max_pct: u8, now_ms: i64) -> Result<Vec<String>> {
	let today = date_of_ms(now_ms);
	let mut dates = list_day_dirs(base)?;
	let mut deleted = Vec::new();

	if keep_days > 0 {
		let threshold = date_of_ms(now_ms - keep_days as i64 * crate::day::DAY_MS);
		// YYYYMMDD compares correctly as a string.
		dates.retain(|date| {
			if date.as_str() < threshold.as_str() && *date != today {
				if delete_day(base, date) {
					deleted.push(date.clone());
				}
				false
			} else {
				true
			}
		});
	}

	if max_pct > 0 {
		while let Some(pct) = disk_usage_pct(base) {
			if pct <= max_pct {
				break;
			}
			// Oldest first, but today always survives.
			let oldest = match dates.first() {
				Some(date) if *date != today => date.clone(),
				_ => break,
			};
			log::warn!(
				target: "tracestore",
				"Disk usage {}% over {}%, dropping {}",
				pct,
				max_pct,
				oldest,
			);
			if !delete_day(base, &oldest) {
				break;
			}
			deleted.push(oldest);
			dates.remove(0);
		}
	}
	Ok(deleted)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::day::date_start_ms;
	use crate::testutil::TempDir;

	fn make_day(dir: &TempDir, date: &str) {
		std::fs::create_dir_all(dir.path(date).join("xlog")).unwrap();
	}

	#[test]
	fn deletes_by_age_only() {
		let dir = TempDir::new("retention-age");
		for date in ["20260701", "20260720", "20260731", "20260801", PERMANENT_DATE] {
			make_day(&dir, date);
		}
		std::fs::write(dir.path("not-a-date"), b"x").unwrap();

		let now = date_start_ms("20260801").unwrap() + 1000;
		let deleted = sweep(dir.root(), 10, 0, now).unwrap();
		assert_eq!(deleted, vec!["20260701".to_string(), "20260720".to_string()]);
		assert!(dir.path("20260731").exists());
		assert!(dir.path("20260801").exists());
		assert!(dir.path(PERMANENT_DATE).exists(), "permanent area survives");
	}

	#[test]
	fn zero_keep_days_deletes_nothing() {
		let dir = TempDir::new("retention-off");
		make_day(&dir, "20100101");
		let now = date_start_ms("20260801").unwrap();
		assert!(sweep(dir.root(), 0, 0, now).unwrap().is_empty());
		assert!(dir.path("20100101").exists());
	}
}
