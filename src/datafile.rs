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

// Append-only byte log. Writers get back the offset their record starts
// at and frame records however they like. Reads go through a separate
// lazily-opened read-only handle, so many readers can pread while the
// owner keeps appending.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

const APPEND_BUF_SIZE: usize = 8 * 1024;

#[cfg(target_os = "macos")]
pub fn disable_read_ahead(file: &File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_RDAHEAD, 0) } != 0 {
		Err(std::io::Error::last_os_error())?
	} else {
		Ok(())
	}
}

#[cfg(not(target_os = "macos"))]
pub fn disable_read_ahead(_file: &File) -> Result<()> {
	Ok(())
}

#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
	use std::os::unix::fs::FileExt;
	Ok(file.read_exact_at(buf, offset)?)
}

#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
	use std::os::unix::fs::FileExt;
	Ok(file.write_all_at(buf, offset)?)
}

#[cfg(windows)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
	use std::os::windows::fs::FileExt;
	while !buf.is_empty() {
		let read = file.seek_read(buf, offset)?;
		if read == 0 {
			Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
		}
		buf = &mut buf[read..];
		offset += read as u64;
	}
	Ok(())
}

#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
	use std::os::windows::fs::FileExt;
	while !buf.is_empty() {
		let written = file.seek_write(buf, offset)?;
		buf = &buf[written..];
		offset += written as u64;
	}
	Ok(())
}

struct DataFileInner {
	file: File,
	append: Vec<u8>,
	file_end: u64,
}

impl DataFileInner {
	fn write_through(&mut self) -> Result<()> {
		if !self.append.is_empty() {
			write_all_at(&self.file, &self.append, self.file_end)?;
			self.file_end += self.append.len() as u64;
			self.append.clear();
		}
		Ok(())
	}
}

pub struct DataFile {
	path: PathBuf,
	inner: Mutex<DataFileInner>,
	read_fd: Mutex<Option<Arc<File>>>,
	dirty: AtomicBool,
}

impl DataFile {
	pub fn open(path: &Path) -> Result<DataFile> {
		let file = std::fs::OpenOptions::new().create(true).read(true).write(true).open(path)?;
		disable_read_ahead(&file)?;
		let file_end = file.metadata()?.len();
		log::debug!(target: "tracestore", "Opened data file {:?}, {} bytes", path, file_end);
		Ok(DataFile {
			path: path.into(),
			inner: Mutex::new(DataFileInner {
				file,
				append: Vec::with_capacity(APPEND_BUF_SIZE),
				file_end,
			}),
			read_fd: Mutex::new(None),
			dirty: AtomicBool::new(false),
		})
	}

	/// Appends `bytes`, returning the offset they start at. A failed write
	/// leaves the logical offset where it was.
	pub fn write(&self, bytes: &[u8]) -> Result<u64> {
		let mut inner = self.inner.lock();
		if !inner.append.is_empty() && inner.append.len() + bytes.len() > APPEND_BUF_SIZE {
			inner.write_through()?;
		}
		let offset = inner.file_end + inner.append.len() as u64;
		if bytes.len() >= APPEND_BUF_SIZE {
			write_all_at(&inner.file, bytes, offset)?;
			inner.file_end = offset + bytes.len() as u64;
		} else {
			inner.append.extend_from_slice(bytes);
		}
		self.dirty.store(true, Ordering::Relaxed);
		Ok(offset)
	}

	/// Logical length: bytes on disk plus the append buffer.
	pub fn len(&self) -> u64 {
		let inner = self.inner.lock();
		inner.file_end + inner.append.len() as u64
	}

	/// Pushes the user-space buffer through to the OS. No fsync.
	pub fn flush(&self) -> Result<()> {
		self.dirty.store(false, Ordering::Relaxed);
		self.inner.lock().write_through()
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty.load(Ordering::Relaxed)
	}

	/// Positional read at any offset below the logical length. Drains the
	/// append buffer first when needed so a just-written record is
	/// readable.
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		if self.dirty.load(Ordering::Relaxed) {
			self.flush()?;
		}
		let fd = self.reader_fd()?;
		read_exact_at(&fd, buf, offset)
	}

	fn reader_fd(&self) -> Result<Arc<File>> {
		let mut read_fd = self.read_fd.lock();
		if let Some(fd) = &*read_fd {
			return Ok(fd.clone());
		}
		let file = std::fs::OpenOptions::new().read(true).open(&self.path)?;
		disable_read_ahead(&file)?;
		let file = Arc::new(file);
		*read_fd = Some(file.clone());
		Ok(file)
	}
}

/// `[u16 BE length][body]` framing used by the xlog data file.
pub fn write_framed_u16(data: &DataFile, body: &[u8]) -> Result<u64> {
	if body.len() > u16::MAX as usize {
		return Err(crate::error::Error::InvalidArgument(format!(
			"record body too large for u16 framing: {}",
			body.len()
		)));
	}
	let mut framed = Vec::with_capacity(2 + body.len());
	framed.extend_from_slice(&(body.len() as u16).to_be_bytes());
	framed.extend_from_slice(body);
	data.write(&framed)
}

pub fn read_framed_u16(data: &DataFile, offset: u64) -> Result<Vec<u8>> {
	let mut prefix = [0u8; 2];
	data.read_at(&mut prefix, offset)?;
	let mut body = vec![0u8; u16::from_be_bytes(prefix) as usize];
	data.read_at(&mut body, offset + 2)?;
	Ok(body)
}

/// `[u32 BE length][body]` framing used by the profile, counter and
/// alert data files.
pub fn write_framed_u32(data: &DataFile, body: &[u8]) -> Result<u64> {
	let mut framed = Vec::with_capacity(4 + body.len());
	framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
	framed.extend_from_slice(body);
	data.write(&framed)
}

pub fn read_framed_u32(data: &DataFile, offset: u64) -> Result<Vec<u8>> {
	let mut prefix = [0u8; 4];
	data.read_at(&mut prefix, offset)?;
	let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
	data.read_at(&mut body, offset + 4)?;
	Ok(body)
}

impl Drop for DataFile {
	fn drop(&mut self) {
		if let Err(e) = self.inner.get_mut().write_through() {
			log::warn!(target: "tracestore", "Final flush of {:?} failed: {}", self.path, e);
		}
	}
}
