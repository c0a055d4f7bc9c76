/*
 * Created on Fri Mar 01 2024
 *
 * This file is a part of JIO
 * JIO is a free and open-source library for journaled, atomic and
 * crash-consistent I/O on regular files, written by Sayan Nandan ("the
 * Author") with the vision to provide transactional guarantees on top of
 * plain files without putting a full database in between
 *
 * Copyright (c) 2024, Sayan Nandan <nandansayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # JIO
//!
//! Atomic, crash-consistent I/O on regular files. A [`Jfs`] handle pairs a
//! data file with a sidecar journal directory; every mutation runs as a
//! [`Transaction`] that is made durable in the journal before it touches
//! the data file, so a crash at any instant either leaves the file
//! untouched or leaves a record that [`jfsck`] replays to completion.
//!
//! ```no_run
//! use jio::Jfs;
//!
//! fn main() -> Result<(), jio::Error> {
//!     let jf = Jfs::create("ledger.db")?;
//!     let mut tx = jf.new_trans();
//!     tx.add(b"credit:100", 0)?;
//!     tx.commit()?;
//!     Ok(())
//! }
//! ```
//!
//! After an unclean shutdown, run [`jfsck`] on the file before using it;
//! it drains whatever the journal directory still holds.

#[macro_use]
mod macros;
mod error;
mod file;
mod fsck;
mod jdir;
mod os;
mod record;
mod txn;
mod util;

pub use {
    error::{Error, JioResult},
    file::{jflags, Jfs, OpenJfs},
    fsck::{jfsck, jfsck_cleanup, FsckResult},
    txn::{tflags, Transaction},
};

/// A result of a raw OS-level I/O operation
pub type IoResult<T> = Result<T, std::io::Error>;
