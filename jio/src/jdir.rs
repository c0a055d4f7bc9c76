/*
 * Created on Mon Mar 04 2024
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

//! # Path & ID services
//!
//! Every data file `/D/F` gets a sidecar journal directory `/D/.F.jio`
//! holding one record file per outstanding transaction (named by its
//! decimal id) and a `lock` file whose first word is the highest assigned
//! id, little-endian. Id allocation and release happen under an exclusive
//! whole-file lock on `lock`; the mapped window over its first word is a
//! fast read path, never a second source of truth.

use {
    crate::{
        error::{Error, JioResult},
        os::{spread, spwrite, RangeLock},
    },
    memmap2::{MmapMut, MmapOptions},
    parking_lot::Mutex,
    std::{
        fs::{DirBuilder, File, OpenOptions},
        io::ErrorKind,
        os::unix::fs::{DirBuilderExt, OpenOptionsExt},
        path::{Path, PathBuf},
    },
};

pub const LOCK_FILE_NAME: &str = "lock";
const JDIR_MODE: u32 = 0o750;
const JFILE_MODE: u32 = 0o600;
const COUNTER_SIZE: usize = sizeof!(u32);

/// Derive the journal directory path for a data file: `/D/F` -> `/D/.F.jio`
pub fn jdir_for(data_path: &Path) -> JioResult<PathBuf> {
    let base = data_path.file_name().ok_or(Error::NotFound)?;
    let mut name = String::with_capacity(base.len() + 5);
    name.push('.');
    name.push_str(&base.to_string_lossy());
    name.push_str(".jio");
    Ok(match data_path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    })
}

#[derive(Debug)]
/// An open journal directory: the directory itself, the `lock` file and the
/// shared window over its counter word
pub struct JournalDir {
    path: PathBuf,
    lock_file: File,
    counter: MmapMut,
    // fcntl locks don't exclude threads sharing the fd, so in-process
    // allocator calls serialize here
    alloc_lock: Mutex<()>,
}

impl JournalDir {
    /// Open the journal directory for `data_path`, creating the directory
    /// and the lock file as needed (the normal `open` path)
    pub fn bootstrap(data_path: &Path, jdir_override: Option<&Path>) -> JioResult<Self> {
        let path = match jdir_override {
            Some(p) => p.to_path_buf(),
            None => jdir_for(data_path)?,
        };
        match DirBuilder::new().mode(JDIR_MODE).create(&path) {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        if !path.is_dir() {
            return Err(Error::NoJournal);
        }
        let (lock_file, counter) = Self::open_lock_file(&path)?;
        Ok(Self {
            path,
            lock_file,
            counter,
            alloc_lock: Mutex::new(()),
        })
    }
    /// Open a pre-existing journal directory (the recovery path). The
    /// directory must exist; the lock file is recreated if it went missing
    pub fn open_existing(data_path: &Path, jdir_override: Option<&Path>) -> JioResult<Self> {
        let path = match jdir_override {
            Some(p) => p.to_path_buf(),
            None => jdir_for(data_path)?,
        };
        if !path.is_dir() {
            return Err(Error::NoJournal);
        }
        let (lock_file, counter) =
            Self::open_lock_file(&path).map_err(|e| match e {
                Error::Io(_) => Error::NoJournal,
                e => e,
            })?;
        Ok(Self {
            path,
            lock_file,
            counter,
            alloc_lock: Mutex::new(()),
        })
    }
    fn open_lock_file(jdir: &Path) -> JioResult<(File, MmapMut)> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(JFILE_MODE)
            .custom_flags(libc::O_SYNC)
            .open(jdir.join(LOCK_FILE_NAME))?;
        {
            // two concurrent openers race on initialization, hence the lock
            let _guard = RangeLock::acquire(&lock_file, 0, 0)?;
            if lock_file.metadata()?.len() < COUNTER_SIZE as u64 {
                spwrite(&lock_file, &1u32.to_le_bytes(), 0)?;
            }
        }
        let counter = unsafe { MmapOptions::new().len(COUNTER_SIZE).map_mut(&lock_file)? };
        Ok((lock_file, counter))
    }
}

impl JournalDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The on-disk path of the record for transaction `tid`
    pub fn record_path(&self, tid: u32) -> PathBuf {
        self.path.join(tid.to_string())
    }
    fn read_counter(&self) -> u32 {
        u32::from_le_bytes([
            self.counter[0],
            self.counter[1],
            self.counter[2],
            self.counter[3],
        ])
    }
    /// Allocate the next transaction id. Ids are nonzero and monotonic for
    /// a process run; the max wraps back to 1 on overflow
    pub fn get_tid(&self) -> JioResult<u32> {
        let _tguard = self.alloc_lock.lock();
        let _guard = RangeLock::acquire(&self.lock_file, 0, 0)?;
        let cur = self.read_counter();
        let next = match cur.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        spwrite(&self.lock_file, &next.to_le_bytes(), 0)?;
        Ok(next)
    }
    /// Release a transaction id whose record is gone. Only the current max
    /// matters: the counter is walked down to the largest id that still has
    /// a record on disk. Freeing any other id is a no-op
    pub fn free_tid(&self, tid: u32) -> JioResult<()> {
        let _tguard = self.alloc_lock.lock();
        let _guard = RangeLock::acquire(&self.lock_file, 0, 0)?;
        let cur = self.read_counter();
        if tid < cur {
            return Ok(());
        }
        let mut new_max = 0;
        for i in (1..cur).rev() {
            if self.record_path(i).exists() {
                new_max = i;
                break;
            }
        }
        spwrite(&self.lock_file, &new_max.to_le_bytes(), 0)?;
        Ok(())
    }
    /// Force the counter to `max` (recovery rewrites it to the directory
    /// scan's maximum so replay-issued ids cannot collide with survivors)
    pub fn reset_counter(&self, max: u32) -> JioResult<()> {
        let _tguard = self.alloc_lock.lock();
        let _guard = RangeLock::acquire(&self.lock_file, 0, 0)?;
        spwrite(&self.lock_file, &max.to_le_bytes(), 0)?;
        Ok(())
    }
    /// Read the counter under the lock (slow path; used by tests and
    /// recovery diagnostics)
    pub fn current_max(&self) -> JioResult<u32> {
        let _guard = RangeLock::acquire(&self.lock_file, 0, 0)?;
        let mut word = [0u8; COUNTER_SIZE];
        if spread(&self.lock_file, &mut word, 0)? != COUNTER_SIZE {
            return Err(Error::NoJournal);
        }
        Ok(u32::from_le_bytes(word))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{jdir_for, JournalDir},
        crate::util::test_utils::Scratch,
        std::{fs, path::Path},
    };

    #[test]
    fn jdir_derivation() {
        assert_eq!(
            jdir_for(Path::new("/data/records.db")).unwrap(),
            Path::new("/data/.records.db.jio")
        );
        assert_eq!(
            jdir_for(Path::new("records.db")).unwrap(),
            Path::new(".records.db.jio")
        );
    }

    #[test]
    fn bootstrap_initializes_counter_once() {
        let scratch = Scratch::new();
        let data = scratch.path("file.bin");
        fs::write(&data, b"").unwrap();
        let jd = JournalDir::bootstrap(&data, None).unwrap();
        assert_eq!(jd.current_max().unwrap(), 1);
        drop(jd);
        // a second open must not clobber an advanced counter
        let jd = JournalDir::bootstrap(&data, None).unwrap();
        assert_eq!(jd.get_tid().unwrap(), 2);
        drop(jd);
        let jd = JournalDir::bootstrap(&data, None).unwrap();
        assert_eq!(jd.current_max().unwrap(), 2);
    }

    #[test]
    fn tid_allocation_is_monotonic() {
        let scratch = Scratch::new();
        let data = scratch.path("file.bin");
        fs::write(&data, b"").unwrap();
        let jd = JournalDir::bootstrap(&data, None).unwrap();
        let a = jd.get_tid().unwrap();
        let b = jd.get_tid().unwrap();
        let c = jd.get_tid().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn free_tid_scans_down_to_live_record() {
        let scratch = Scratch::new();
        let data = scratch.path("file.bin");
        fs::write(&data, b"").unwrap();
        let jd = JournalDir::bootstrap(&data, None).unwrap();
        let t2 = jd.get_tid().unwrap();
        let t3 = jd.get_tid().unwrap();
        let t4 = jd.get_tid().unwrap();
        assert_eq!((t2, t3, t4), (2, 3, 4));
        // records 2 and 3 exist on disk, 4 was reclaimed
        fs::write(jd.record_path(t2), b"r").unwrap();
        fs::write(jd.record_path(t3), b"r").unwrap();
        jd.free_tid(t4).unwrap();
        assert_eq!(jd.current_max().unwrap(), t3);
        // freeing a non-max id changes nothing
        jd.free_tid(t2).unwrap();
        assert_eq!(jd.current_max().unwrap(), t3);
    }

    #[test]
    fn free_tid_with_no_survivors_resets() {
        let scratch = Scratch::new();
        let data = scratch.path("file.bin");
        fs::write(&data, b"").unwrap();
        let jd = JournalDir::bootstrap(&data, None).unwrap();
        let t = jd.get_tid().unwrap();
        jd.free_tid(t).unwrap();
        assert_eq!(jd.current_max().unwrap(), 0);
        assert_eq!(jd.get_tid().unwrap(), 1);
    }

    #[test]
    fn override_path_is_honored() {
        let scratch = Scratch::new();
        let data = scratch.path("file.bin");
        let custom = scratch.path("elsewhere.jio");
        fs::write(&data, b"").unwrap();
        let jd = JournalDir::bootstrap(&data, Some(&custom)).unwrap();
        assert_eq!(jd.path(), custom.as_path());
        assert!(custom.join("lock").exists());
    }
}
