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

use {core::fmt, std::io::Error as IoError};

pub type JioResult<T> = Result<T, Error>;

#[derive(Debug)]
/// Errors surfaced by the journaled I/O engine
pub enum Error {
    /// the data file does not exist
    NotFound,
    /// the journal directory or the journal lock file is missing or unusable
    NoJournal,
    /// an allocation failed while loading a record
    OutOfMemory,
    /// the operation is illegal for the current state of the transaction
    /// (already committed, already rolled back, or a read-only handle)
    InvalidState,
    /// a record failed header validation or its trailing checksum
    CorruptRecord,
    /// an OS-level I/O failure; the underlying error is preserved for
    /// diagnostics
    Io(IoError),
}

impl Error {
    /// The raw OS error code, if this error wraps one
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "the data file was not found"),
            Self::NoJournal => write!(f, "the journal directory or lock file is missing or broken"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidState => write!(f, "illegal operation for the transaction state"),
            Self::CorruptRecord => write!(f, "the record has a bad header or checksum"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

direct_from! {
    Error => {
        IoError as Io,
    }
}
