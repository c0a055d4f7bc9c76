/*
 * Created on Fri Mar 08 2024
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

//! # The journaled file handle
//!
//! [`Jfs`] is an open data file plus its journal directory. The
//! `read`/`write` family mirrors the plain syscalls but serializes every
//! call under the handle's mutex and the engine's byte-range locks; the
//! write family funnels through single-operation transactions, so each
//! call is atomic and crash-consistent on its own.

use {
    crate::{
        error::{Error, JioResult},
        jdir::JournalDir,
        os::{spread, RangeLock},
        txn::Transaction,
    },
    parking_lot::Mutex,
    std::{
        fs::{self, File, OpenOptions},
        io::{Error as IoError, ErrorKind, IoSlice, IoSliceMut, SeekFrom},
        mem,
        os::unix::fs::OpenOptionsExt,
        path::{Path, PathBuf},
    },
};

/// Engine flags, OR-combinable, fixed at `open`
pub mod jflags {
    /// skip data-file byte-range locking; the caller asserts external
    /// serialization
    pub const NOLOCK: u32 = 1 << 0;
    /// capture undo payloads but refuse rollback requests
    pub const NOROLLBACK: u32 = 1 << 1;
    /// keep records on disk after apply; `jsync` reclaims them in one sweep
    pub const LINGER: u32 = 1 << 2;
    /// open the data file read-only; commits are refused
    pub const RDONLY: u32 = 1 << 3;
}

const DEFAULT_MODE: u32 = 0o666;

#[derive(Debug)]
struct Linger {
    id: u32,
    path: PathBuf,
}

#[derive(Debug)]
/// An open data file and its journal
pub struct Jfs {
    file: File,
    name: PathBuf,
    flags: u32,
    // serializes the seek+operation wrappers; the file pointer is modeled
    // as an explicit cursor since all engine I/O is positional
    cursor: Mutex<u64>,
    // taken around file-extension truncates so a concurrent extender can't
    // shrink the file back under us
    ext_lock: Mutex<()>,
    jdir: JournalDir,
    lingering: Mutex<Vec<Linger>>,
}

#[derive(Debug)]
/// Options for opening a [`Jfs`], in the manner of `std::fs::OpenOptions`
pub struct OpenJfs {
    create: bool,
    create_new: bool,
    truncate: bool,
    mode: u32,
    jflags: u32,
    jdir: Option<PathBuf>,
}

impl Default for OpenJfs {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenJfs {
    pub fn new() -> Self {
        Self {
            create: false,
            create_new: false,
            truncate: false,
            mode: DEFAULT_MODE,
            jflags: 0,
            jdir: None,
        }
    }
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }
    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }
    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }
    /// OR-combined [`jflags`]
    pub fn engine_flags(&mut self, jflags: u32) -> &mut Self {
        self.jflags = jflags;
        self
    }
    /// Override the derived journal directory location
    pub fn journal_dir(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.jdir = Some(path.as_ref().to_path_buf());
        self
    }
    pub fn open(&self, path: impl AsRef<Path>) -> JioResult<Jfs> {
        let path = path.as_ref();
        let rdonly = self.jflags & jflags::RDONLY != 0;
        let mut opts = OpenOptions::new();
        opts.read(true)
            .write(!rdonly)
            .create(self.create && !rdonly)
            .create_new(self.create_new && !rdonly)
            .truncate(self.truncate && !rdonly)
            .mode(self.mode);
        let file = opts.open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NotFound,
            _ => Error::Io(e),
        })?;
        let jdir = JournalDir::bootstrap(path, self.jdir.as_deref())?;
        Ok(Jfs {
            file,
            name: path.to_path_buf(),
            flags: self.jflags,
            cursor: Mutex::new(0),
            ext_lock: Mutex::new(()),
            jdir,
            lingering: Mutex::new(Vec::new()),
        })
    }
}

impl Jfs {
    pub fn options() -> OpenJfs {
        OpenJfs::new()
    }
    /// Open an existing data file read-write with a fresh (or adopted)
    /// journal directory
    pub fn open(path: impl AsRef<Path>) -> JioResult<Self> {
        Self::options().open(path)
    }
    /// Create (or adopt) a data file read-write
    pub fn create(path: impl AsRef<Path>) -> JioResult<Self> {
        Self::options().create(true).open(path)
    }
    /// The recovery entrypoint's handle: data file R/W + O_SYNC, journal
    /// directory required to pre-exist
    pub(crate) fn recovery_open(path: &Path, jdir_override: Option<&Path>) -> JioResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::NotFound,
                _ => Error::Io(e),
            })?;
        let jdir = JournalDir::open_existing(path, jdir_override)?;
        Ok(Jfs {
            file,
            name: path.to_path_buf(),
            flags: 0,
            cursor: Mutex::new(0),
            ext_lock: Mutex::new(()),
            jdir,
            lingering: Mutex::new(Vec::new()),
        })
    }
}

impl Jfs {
    pub fn name(&self) -> &Path {
        &self.name
    }
    pub fn flags(&self) -> u32 {
        self.flags
    }
    pub fn is_rdonly(&self) -> bool {
        self.flags & jflags::RDONLY != 0
    }
    pub(crate) fn file(&self) -> &File {
        &self.file
    }
    pub(crate) fn jdir(&self) -> &JournalDir {
        &self.jdir
    }
    pub(crate) fn ext_lock(&self) -> &Mutex<()> {
        &self.ext_lock
    }
    pub(crate) fn park_linger(&self, id: u32, path: PathBuf) {
        self.lingering.lock().push(Linger { id, path });
    }
    /// Begin an empty transaction against this handle
    pub fn new_trans(&self) -> Transaction<'_> {
        Transaction::new(self)
    }
}

/*
    serialized pass-throughs
    ---
    These only serialize the underlying syscalls with the engine's locks;
    they carry none of the journaling logic themselves. The write family is
    a single-operation transaction per call.
*/

impl Jfs {
    /// Read from the current file position, advancing it
    pub fn read(&self, buf: &mut [u8]) -> JioResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut cur = self.cursor.lock();
        let n = {
            let _l = RangeLock::acquire(&self.file, *cur, buf.len() as u64)?;
            spread(&self.file, buf, *cur)?
        };
        *cur += n as u64;
        Ok(n)
    }
    /// Positional read; the file position is untouched
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> JioResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let _l = RangeLock::acquire(&self.file, offset, buf.len() as u64)?;
        Ok(spread(&self.file, buf, offset)?)
    }
    /// Vectored read from the current position, advancing it
    pub fn readv(&self, bufs: &mut [IoSliceMut<'_>]) -> JioResult<usize> {
        let sum: usize = bufs.iter().map(|b| b.len()).sum();
        if sum == 0 {
            return Ok(0);
        }
        let mut cur = self.cursor.lock();
        let mut read = 0;
        {
            let _l = RangeLock::acquire(&self.file, *cur, sum as u64)?;
            for buf in bufs.iter_mut() {
                let n = spread(&self.file, buf, *cur + read as u64)?;
                read += n;
                if n < buf.len() {
                    break;
                }
            }
        }
        *cur += read as u64;
        Ok(read)
    }
    /// Transactional write at the current position, advancing it
    pub fn write(&self, buf: &[u8]) -> JioResult<usize> {
        let mut cur = self.cursor.lock();
        let mut tx = self.new_trans();
        tx.add(buf, *cur)?;
        let n = tx.commit()?;
        *cur += n as u64;
        Ok(n)
    }
    /// Transactional positional write; the file position is untouched
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> JioResult<usize> {
        let mut tx = self.new_trans();
        tx.add(buf, offset)?;
        tx.commit()
    }
    /// Transactional vectored write at the current position. The iovecs
    /// are coalesced into one operation; the position advances by the
    /// total bytes written
    pub fn writev(&self, bufs: &[IoSlice<'_>]) -> JioResult<usize> {
        let mut cur = self.cursor.lock();
        let sum: usize = bufs.iter().map(|b| b.len()).sum();
        let mut joined = Vec::with_capacity(sum);
        for buf in bufs {
            joined.extend_from_slice(buf);
        }
        let mut tx = self.new_trans();
        tx.add(&joined, *cur)?;
        let n = tx.commit()?;
        *cur += n as u64;
        Ok(n)
    }
    /// Reposition the cursor; `End` resolves against the current file
    /// length
    pub fn lseek(&self, pos: SeekFrom) -> JioResult<u64> {
        let mut cur = self.cursor.lock();
        let new = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => cur.checked_add_signed(delta),
            SeekFrom::End(delta) => self.file.metadata()?.len().checked_add_signed(delta),
        };
        match new {
            Some(n) => {
                *cur = n;
                Ok(n)
            }
            None => Err(IoError::from(ErrorKind::InvalidInput).into()),
        }
    }
    /// Truncate (or extend) the data file, holding a lock from `len` to
    /// EOF. Not journaled: use with care
    pub fn truncate(&self, len: u64) -> JioResult<()> {
        let _l = RangeLock::acquire(&self.file, len, 0)?;
        self.file.set_len(len)?;
        Ok(())
    }
}

/*
    grouped durability
*/

impl Jfs {
    /// Flush the data file once and reclaim every lingering record. This
    /// is the second half of `LINGER`: commits park their records, `jsync`
    /// settles them in one sweep. Returns the number of records reclaimed
    pub fn jsync(&self) -> JioResult<usize> {
        self.file.sync_all()?;
        let mut parked = self.lingering.lock();
        let mut drained = mem::take(&mut *parked);
        let mut settled = 0;
        while !drained.is_empty() {
            if let Err(e) = fs::remove_file(&drained[0].path) {
                // keep the rest parked; recovery can still replay them
                parked.extend(drained);
                return Err(e.into());
            }
            let l = drained.remove(0);
            if let Err(e) = self.jdir.free_tid(l.id) {
                parked.extend(drained);
                return Err(e);
            }
            settled += 1;
        }
        Ok(settled)
    }
    /// Settle lingering records and release the handle
    pub fn close(self) -> JioResult<()> {
        self.jsync()?;
        Ok(())
    }
}

impl Drop for Jfs {
    fn drop(&mut self) {
        if !self.lingering.get_mut().is_empty() {
            if let Err(e) = self.jsync() {
                // records left behind are replayed (idempotently) by the
                // next fsck, so this is survivable
                log::warn!("failed to settle lingering records on close: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{jflags, Jfs},
        crate::{error::Error, util::test_utils::Scratch},
        std::{
            fs,
            io::{IoSlice, IoSliceMut, SeekFrom},
        },
    };

    #[test]
    fn write_advances_cursor() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::create(&path).unwrap();
        assert_eq!(jf.write(b"abc").unwrap(), 3);
        assert_eq!(jf.write(b"def").unwrap(), 3);
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn pwrite_leaves_cursor_alone() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::create(&path).unwrap();
        jf.pwrite(b"xxxx", 4).unwrap();
        assert_eq!(jf.write(b"ab").unwrap(), 2);
        assert_eq!(fs::read(&path).unwrap(), b"ab\0\0xxxx");
    }

    #[test]
    fn read_and_lseek() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        fs::write(&path, b"0123456789").unwrap();
        let jf = Jfs::open(&path).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(jf.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(jf.lseek(SeekFrom::Current(2)).unwrap(), 6);
        assert_eq!(jf.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"6789");
        assert_eq!(jf.lseek(SeekFrom::End(-1)).unwrap(), 9);
        let mut one = [0u8; 1];
        assert_eq!(jf.pread(&mut one, 0).unwrap(), 1);
        assert_eq!(&one, b"0");
    }

    #[test]
    fn writev_advances_by_total_bytes() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::create(&path).unwrap();
        let n = jf
            .writev(&[IoSlice::new(b"abc"), IoSlice::new(b"de")])
            .unwrap();
        assert_eq!(n, 5);
        // the cursor moved by the byte count, not the iovec count
        assert_eq!(jf.lseek(SeekFrom::Current(0)).unwrap(), 5);
        jf.write(b"!").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcde!");
    }

    #[test]
    fn readv_scatters() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        fs::write(&path, b"abcdef").unwrap();
        let jf = Jfs::open(&path).unwrap();
        let (mut a, mut b) = ([0u8; 2], [0u8; 4]);
        let n = jf
            .readv(&mut [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)])
            .unwrap();
        assert_eq!(n, 6);
        assert_eq!(&a, b"ab");
        assert_eq!(&b, b"cdef");
    }

    #[test]
    fn rdonly_refuses_commits() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        fs::write(&path, b"data").unwrap();
        let jf = Jfs::options()
            .engine_flags(jflags::RDONLY)
            .open(&path)
            .unwrap();
        assert!(matches!(jf.write(b"nope"), Err(Error::InvalidState)));
        let mut buf = [0u8; 4];
        assert_eq!(jf.read(&mut buf).unwrap(), 4);
    }

    #[test]
    fn nolock_commit_works() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::options()
            .create(true)
            .engine_flags(jflags::NOLOCK)
            .open(&path)
            .unwrap();
        assert_eq!(jf.write(b"unlocked").unwrap(), 8);
        assert_eq!(fs::read(&path).unwrap(), b"unlocked");
    }

    #[test]
    fn truncate_shrinks() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        fs::write(&path, b"0123456789").unwrap();
        let jf = Jfs::open(&path).unwrap();
        jf.truncate(4).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"0123");
    }

    #[test]
    fn linger_parks_records_until_jsync() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::options()
            .create(true)
            .engine_flags(jflags::LINGER)
            .open(&path)
            .unwrap();
        jf.write(b"one").unwrap();
        jf.pwrite(b"two", 8).unwrap();
        // both records are still on disk
        let live = |jf: &Jfs| {
            fs::read_dir(jf.jdir().path())
                .unwrap()
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .parse::<u32>()
                        .is_ok()
                })
                .count()
        };
        assert_eq!(live(&jf), 2);
        assert_eq!(jf.jsync().unwrap(), 2);
        assert_eq!(live(&jf), 0);
        // and the data survived
        assert_eq!(&fs::read(&path).unwrap()[..3], b"one");
    }
}
