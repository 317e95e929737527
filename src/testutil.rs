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

use std::path::{Path, PathBuf};

pub struct TempDir(PathBuf);

impl TempDir {
	pub fn new(name: &'static str) -> TempDir {
		env_logger::try_init().ok();
		let mut path = std::env::temp_dir();
		path.push("tracestore-test");
		path.push(name);

		if path.exists() {
			std::fs::remove_dir_all(&path).unwrap();
		}
		std::fs::create_dir_all(&path).unwrap();
		TempDir(path)
	}

	pub fn root(&self) -> &Path {
		&self.0
	}

	pub fn path(&self, file: &str) -> PathBuf {
		self.0.join(file)
	}
}

impl Drop for TempDir {
	fn drop(&mut self) {
		if self.0.exists() {
			std::fs::remove_dir_all(&self.0).ok();
		}
	}
}

pub fn random_value(size: usize) -> Vec<u8> {
	use rand::RngCore;
	let mut result = vec![0u8; size];
	rand::thread_rng().fill_bytes(&mut result);
	result
}
