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

// Compressed record bodies carry a [0x00][0x01] prefix ahead of the zstd
// stream. Pack encodings lead with a non-zero type tag, so the first byte
// is an unambiguous discriminator and legacy raw bodies decode unchanged.

use crate::error::{Error, Result};

const MARKER: u8 = 0x00;
const METHOD_ZSTD: u8 = 0x01;
const LEVEL: i32 = 3;

pub fn wrap(body: Vec<u8>, enabled: bool) -> Result<Vec<u8>> {
	if !enabled {
		return Ok(body);
	}
	let mut out = vec![MARKER, METHOD_ZSTD];
	out.extend_from_slice(&zstd::encode_all(&body[..], LEVEL)?);
	Ok(out)
}

pub fn unwrap(body: &[u8]) -> Result<Vec<u8>> {
	match body.first() {
		Some(&MARKER) => {
			if body.len() < 2 || body[1] != METHOD_ZSTD {
				return Err(Error::Corruption("unknown compression method".into()));
			}
			Ok(zstd::decode_all(&body[2..])?)
		}
		_ => Ok(body.to_vec()),
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn round_trip_compressed() {
		let body = vec![7u8; 10_000];
		let wrapped = wrap(body.clone(), true).unwrap();
		assert_eq!(wrapped[0], MARKER);
		assert_eq!(wrapped[1], METHOD_ZSTD);
		assert!(wrapped.len() < body.len());
		assert_eq!(unwrap(&wrapped).unwrap(), body);
	}

	#[test]
	fn raw_passthrough() {
		let body = vec![1u8, 2, 3];
		let wrapped = wrap(body.clone(), false).unwrap();
		assert_eq!(wrapped, body);
		assert_eq!(unwrap(&wrapped).unwrap(), body);
	}

	#[test]
	fn bad_method_is_corruption() {
		assert!(unwrap(&[0x00, 0x02, 1, 2]).is_err());
	}
}
