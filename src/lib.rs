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

mod bucket;
mod compress;
mod datafile;
mod display;
mod flush;
mod hash_index;
mod keyfile;
mod queue;
mod time_index;

#[cfg(test)]
mod testutil;

pub mod alert;
pub mod codec;
pub mod counter;
pub mod day;
pub mod db;
pub mod error;
pub mod options;
pub mod profile;
pub mod rehash;
pub mod retention;
pub mod text;
pub mod xlog;

pub use alert::{AlertLevel, AlertRecord};
pub use counter::{CounterValue, RealCounterRecord};
pub use db::Db;
pub use error::{Error, Result};
pub use options::Options;
pub use profile::ProfileRecord;
pub use xlog::XLogRecord;
