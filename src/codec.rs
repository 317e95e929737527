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

// Wire primitives shared by every file format in the engine.
//
// Int3:
// [B0][B1][B2] - big-endian, sign extended into i32.
//
// Int5:
// [B0]..[B4] - big-endian, sign extended into i64. The maximum encodable
// value doubles as the "no expiry" sentinel for TTL records.
//
// Decimal:
// [TAG: 1][PAYLOAD: TAG] - TAG is one of 0, 1, 2, 3, 4, 5, 8 and counts
// the two's-complement big-endian payload bytes. TAG 0 encodes zero and
// carries no payload. The encoder always picks the smallest fitting tag.
//
// Blob:
// [LEN: 1][BODY: LEN]            for LEN <= 253
// [255][LEN: u16 BE][BODY]       for larger bodies up to 65535
// [254][LEN: u32 BE][BODY]       beyond that
//
// ShortBytes:
// [LEN: u16 BE][BODY]
//
// Text is UTF-8 bytes inside a Blob.

use crate::error::{Error, Result};

pub const INT3_MAX: i32 = 8_388_607;
pub const INT3_MIN: i32 = -8_388_608;
pub const LONG5_MAX: i64 = 549_755_813_887;
pub const LONG5_MIN: i64 = -549_755_813_888;

pub fn write_int3(out: &mut Vec<u8>, v: i32) {
	debug_assert!(v >= INT3_MIN && v <= INT3_MAX);
	out.push((v >> 16) as u8);
	out.push((v >> 8) as u8);
	out.push(v as u8);
}

pub fn write_int5(out: &mut Vec<u8>, v: i64) {
	debug_assert!(v >= LONG5_MIN && v <= LONG5_MAX);
	out.push((v >> 32) as u8);
	out.push((v >> 24) as u8);
	out.push((v >> 16) as u8);
	out.push((v >> 8) as u8);
	out.push(v as u8);
}

/// 5-byte Int5 image of a record or data-file position.
pub fn int5_bytes(v: i64) -> [u8; 5] {
	debug_assert!(v >= LONG5_MIN && v <= LONG5_MAX);
	[(v >> 32) as u8, (v >> 24) as u8, (v >> 16) as u8, (v >> 8) as u8, v as u8]
}

pub fn int3_of(b: &[u8]) -> i32 {
	debug_assert!(b.len() >= 3);
	let v = ((b[0] as i32) << 16) | ((b[1] as i32) << 8) | b[2] as i32;
	(v << 8) >> 8
}

pub fn int5_of(b: &[u8]) -> i64 {
	debug_assert!(b.len() >= 5);
	let v = ((b[0] as i64) << 32)
		| ((b[1] as i64) << 24)
		| ((b[2] as i64) << 16)
		| ((b[3] as i64) << 8)
		| b[4] as i64;
	(v << 24) >> 24
}

pub fn write_u16(out: &mut Vec<u8>, v: u16) {
	out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
	out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_i64(out: &mut Vec<u8>, v: i64) {
	out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_f64(out: &mut Vec<u8>, v: f64) {
	out.extend_from_slice(&v.to_bits().to_be_bytes());
}

pub fn write_decimal(out: &mut Vec<u8>, v: i64) {
	if v == 0 {
		out.push(0);
	} else if v >= i8::MIN as i64 && v <= i8::MAX as i64 {
		out.push(1);
		out.push(v as u8);
	} else if v >= i16::MIN as i64 && v <= i16::MAX as i64 {
		out.push(2);
		out.extend_from_slice(&(v as i16).to_be_bytes());
	} else if v >= INT3_MIN as i64 && v <= INT3_MAX as i64 {
		out.push(3);
		write_int3(out, v as i32);
	} else if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
		out.push(4);
		out.extend_from_slice(&(v as i32).to_be_bytes());
	} else if v >= LONG5_MIN && v <= LONG5_MAX {
		out.push(5);
		write_int5(out, v);
	} else {
		out.push(8);
		out.extend_from_slice(&v.to_be_bytes());
	}
}

pub fn write_blob(out: &mut Vec<u8>, body: &[u8]) {
	let len = body.len();
	if len <= 253 {
		out.push(len as u8);
	} else if len <= u16::MAX as usize {
		out.push(255);
		out.extend_from_slice(&(len as u16).to_be_bytes());
	} else {
		out.push(254);
		out.extend_from_slice(&(len as u32).to_be_bytes());
	}
	out.extend_from_slice(body);
}

pub fn write_short_bytes(out: &mut Vec<u8>, body: &[u8]) {
	debug_assert!(body.len() <= u16::MAX as usize);
	out.extend_from_slice(&(body.len() as u16).to_be_bytes());
	out.extend_from_slice(body);
}

pub fn write_text(out: &mut Vec<u8>, text: &str) {
	write_blob(out, text.as_bytes());
}

/// Cursor over a borrowed byte buffer. Truncated input surfaces as
/// `Error::Corruption`, never as a panic.
pub struct Reader<'a> {
	buf: &'a [u8],
	offset: usize,
}

impl<'a> Reader<'a> {
	pub fn new(buf: &'a [u8]) -> Reader<'a> {
		Reader { buf, offset: 0 }
	}

	pub fn offset(&self) -> usize {
		self.offset
	}

	pub fn remaining(&self) -> usize {
		self.buf.len() - self.offset
	}

	pub fn read_slice(&mut self, size: usize) -> Result<&'a [u8]> {
		if self.remaining() < size {
			return Err(Error::Corruption(format!(
				"unexpected end of input: need {} at {}, have {}",
				size,
				self.offset,
				self.remaining()
			)));
		}
		let start = self.offset;
		self.offset += size;
		Ok(&self.buf[start..self.offset])
	}

	pub fn read_u8(&mut self) -> Result<u8> {
		Ok(self.read_slice(1)?[0])
	}

	pub fn read_u16(&mut self) -> Result<u16> {
		let b = self.read_slice(2)?;
		Ok(((b[0] as u16) << 8) | b[1] as u16)
	}

	pub fn read_u32(&mut self) -> Result<u32> {
		let b = self.read_slice(4)?;
		Ok(((b[0] as u32) << 24) | ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | b[3] as u32)
	}

	pub fn read_int3(&mut self) -> Result<i32> {
		Ok(int3_of(self.read_slice(3)?))
	}

	pub fn read_int5(&mut self) -> Result<i64> {
		Ok(int5_of(self.read_slice(5)?))
	}

	pub fn read_i64(&mut self) -> Result<i64> {
		let b = self.read_slice(8)?;
		let mut v = 0i64;
		for byte in b {
			v = (v << 8) | *byte as i64;
		}
		Ok(v)
	}

	pub fn read_f64(&mut self) -> Result<f64> {
		Ok(f64::from_bits(self.read_i64()? as u64))
	}

	pub fn read_decimal(&mut self) -> Result<i64> {
		let tag = self.read_u8()?;
		match tag {
			0 => Ok(0),
			1 => Ok(self.read_u8()? as i8 as i64),
			2 => {
				let b = self.read_slice(2)?;
				Ok((((b[0] as i16) << 8) | b[1] as i16) as i64)
			}
			3 => Ok(self.read_int3()? as i64),
			4 => {
				let b = self.read_slice(4)?;
				let v = ((b[0] as i32) << 24)
					| ((b[1] as i32) << 16)
					| ((b[2] as i32) << 8)
					| b[3] as i32;
				Ok(v as i64)
			}
			5 => self.read_int5(),
			8 => self.read_i64(),
			_ => Err(Error::Corruption(format!("bad decimal tag {}", tag))),
		}
	}

	pub fn read_blob(&mut self) -> Result<&'a [u8]> {
		let prefix = self.read_u8()?;
		let len = match prefix {
			255 => self.read_u16()? as usize,
			254 => self.read_u32()? as usize,
			l => l as usize,
		};
		self.read_slice(len)
	}

	pub fn read_short_bytes(&mut self) -> Result<&'a [u8]> {
		let len = self.read_u16()? as usize;
		self.read_slice(len)
	}

	pub fn read_text(&mut self) -> Result<String> {
		Ok(String::from_utf8_lossy(self.read_blob()?).into_owned())
	}
}

/// Encoded size of a blob body, prefix included.
pub fn blob_size(body_len: usize) -> usize {
	let prefix = if body_len <= 253 {
		1
	} else if body_len <= u16::MAX as usize {
		3
	} else {
		5
	};
	prefix + body_len
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn int3_round_trip() {
		for v in [0, 1, -1, 127, -128, 32767, -32768, INT3_MAX, INT3_MIN] {
			let mut out = Vec::new();
			write_int3(&mut out, v);
			assert_eq!(out.len(), 3);
			assert_eq!(int3_of(&out), v, "value {}", v);
		}
	}

	#[test]
	fn int5_round_trip() {
		for v in [0i64, 1, -1, 1 << 20, -(1 << 20), LONG5_MAX, LONG5_MIN] {
			let mut out = Vec::new();
			write_int5(&mut out, v);
			assert_eq!(out.len(), 5);
			assert_eq!(int5_of(&out), v, "value {}", v);
			assert_eq!(int5_of(&int5_bytes(v)), v);
		}
	}

	#[test]
	fn decimal_round_trip_and_minimal_tag() {
		let cases: &[(i64, usize)] = &[
			(0, 1),
			(1, 2),
			(-1, 2),
			(127, 2),
			(-128, 2),
			(128, 3),
			(-129, 3),
			(32767, 3),
			(32768, 4),
			(INT3_MAX as i64, 4),
			(INT3_MAX as i64 + 1, 5),
			(i32::MAX as i64, 5),
			(i32::MAX as i64 + 1, 6),
			(LONG5_MAX, 6),
			(LONG5_MAX + 1, 9),
			(i64::MAX, 9),
			(i64::MIN, 9),
		];
		for &(v, encoded_len) in cases {
			let mut out = Vec::new();
			write_decimal(&mut out, v);
			assert_eq!(out.len(), encoded_len, "encoded size of {}", v);
			assert_eq!(Reader::new(&out).read_decimal().unwrap(), v);
		}
	}

	#[test]
	fn blob_round_trip() {
		for len in [0usize, 1, 100, 253, 254, 255, 256, 65535, 65536, 100_000] {
			let body: Vec<u8> = (0..len).map(|i| i as u8).collect();
			let mut out = Vec::new();
			write_blob(&mut out, &body);
			assert_eq!(out.len(), blob_size(len), "length {}", len);
			let mut r = Reader::new(&out);
			assert_eq!(r.read_blob().unwrap(), &body[..]);
			assert_eq!(r.remaining(), 0);
		}
	}

	#[test]
	fn empty_blob_is_one_byte() {
		let mut out = Vec::new();
		write_blob(&mut out, &[]);
		assert_eq!(out, vec![0]);
		assert_eq!(Reader::new(&out).read_blob().unwrap(), &[] as &[u8]);
	}

	#[test]
	fn short_bytes_round_trip() {
		let body = vec![7u8; 300];
		let mut out = Vec::new();
		write_short_bytes(&mut out, &body);
		assert_eq!(out.len(), 302);
		assert_eq!(Reader::new(&out).read_short_bytes().unwrap(), &body[..]);
	}

	#[test]
	fn text_round_trip() {
		let mut out = Vec::new();
		write_text(&mut out, "SELECT * FROM 주문");
		assert_eq!(Reader::new(&out).read_text().unwrap(), "SELECT * FROM 주문");
	}

	#[test]
	fn truncated_input_is_an_error() {
		let mut out = Vec::new();
		write_blob(&mut out, &[1, 2, 3, 4]);
		out.truncate(3);
		assert!(Reader::new(&out).read_blob().is_err());
		assert!(Reader::new(&[5]).read_decimal().is_err());
		assert!(Reader::new(&[9]).read_decimal().is_err());
		assert!(Reader::new(&[1, 2]).read_int5().is_err());
	}
}
