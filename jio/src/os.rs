/*
 * Created on Sat Mar 02 2024
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

//! # OS services
//!
//! Byte-range advisory locks (`fcntl` style) and saturated positional I/O.
//! Every data-file mutation and read in the engine goes through these
//! primitives; cooperating processes that use the same engine observe a
//! consistent serialization.

#[cfg(unix)]
pub use unix::*;

#[cfg(unix)]
mod unix {
    use {
        crate::IoResult,
        std::{
            fs::File,
            io::{Error as IoError, ErrorKind},
            mem,
            os::unix::{fs::FileExt, io::AsRawFd},
        },
    };

    /*
        byte-range locks
        ---
        POSIX record locks: a `len` of 0 means "from offset to EOF, however
        far the file grows". Locks are per (process, inode): they serialize
        cooperating processes, not threads of the same process. The engine's
        in-process discipline is the per-handle mutex.
    */

    fn plockf(fd: i32, l_type: libc::c_short, cmd: i32, offset: u64, len: u64) -> i32 {
        let mut fl: libc::flock = unsafe { mem::zeroed() };
        fl.l_type = l_type;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = offset as libc::off_t;
        fl.l_len = len as libc::off_t;
        unsafe { libc::fcntl(fd, cmd, &fl) }
    }

    /// Block until an exclusive lock on `[offset, offset + len)` is held
    /// (`len = 0` locks to EOF)
    pub fn lock_range(file: &File, offset: u64, len: u64) -> IoResult<()> {
        if plockf(
            file.as_raw_fd(),
            libc::F_WRLCK as libc::c_short,
            libc::F_SETLKW,
            offset,
            len,
        ) == -1
        {
            return Err(IoError::last_os_error());
        }
        Ok(())
    }

    /// Attempt an exclusive lock on `[offset, offset + len)` without
    /// blocking. Returns `false` if another process holds a conflicting lock
    pub fn try_lock_range(file: &File, offset: u64, len: u64) -> IoResult<bool> {
        if plockf(
            file.as_raw_fd(),
            libc::F_WRLCK as libc::c_short,
            libc::F_SETLK,
            offset,
            len,
        ) == -1
        {
            let e = IoError::last_os_error();
            return match e.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EAGAIN) => Ok(false),
                _ => Err(e),
            };
        }
        Ok(true)
    }

    /// Release a previously acquired lock on `[offset, offset + len)`
    pub fn unlock_range(file: &File, offset: u64, len: u64) -> IoResult<()> {
        if plockf(
            file.as_raw_fd(),
            libc::F_UNLCK as libc::c_short,
            libc::F_SETLKW,
            offset,
            len,
        ) == -1
        {
            return Err(IoError::last_os_error());
        }
        Ok(())
    }

    #[derive(Debug)]
    /// An acquired byte range, released on drop
    pub struct RangeLock<'a> {
        file: &'a File,
        offset: u64,
        len: u64,
    }

    impl<'a> RangeLock<'a> {
        pub fn acquire(file: &'a File, offset: u64, len: u64) -> IoResult<Self> {
            lock_range(file, offset, len)?;
            Ok(Self { file, offset, len })
        }
        pub fn try_acquire(file: &'a File, offset: u64, len: u64) -> IoResult<Option<Self>> {
            if try_lock_range(file, offset, len)? {
                Ok(Some(Self { file, offset, len }))
            } else {
                Ok(None)
            }
        }
    }

    impl<'a> Drop for RangeLock<'a> {
        fn drop(&mut self) {
            if let Err(e) = unlock_range(self.file, self.offset, self.len) {
                log::error!(
                    "failed to release byte-range lock [{}, +{}): {e}",
                    self.offset,
                    self.len
                );
            }
        }
    }

    /*
        saturated positional I/O
    */

    /// Positional read that loops until `buf` is filled or EOF is reached.
    /// Returns the number of bytes actually read; anything short of
    /// `buf.len()` means EOF was hit
    pub fn spread(file: &File, buf: &mut [u8], offset: u64) -> IoResult<usize> {
        let mut read = 0;
        while read != buf.len() {
            match file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => return Ok(read),
                Ok(n) => read += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    /// Positional write that loops until all of `buf` has been written
    pub fn spwrite(file: &File, buf: &[u8], offset: u64) -> IoResult<()> {
        let mut written = 0;
        while written != buf.len() {
            match file.write_at(&buf[written..], offset + written as u64) {
                Ok(0) => {
                    return Err(IoError::new(
                        ErrorKind::WriteZero,
                        format!("could only write {} of {} bytes", written, buf.len()),
                    ))
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
