/*
 * Created on Sun Mar 10 2024
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

//! # Recovery
//!
//! After a crash, surviving records in the journal directory are exactly
//! the transactions whose apply status is unknown. [`jfsck`] drains them:
//! records are replayed in id order through the normal commit engine
//! (replay is idempotent: every op is a deterministic write at an absolute
//! offset), and anything that fails validation is counted and skipped, not
//! fatal. [`jfsck_cleanup`] wipes the journal wholesale.

use {
    crate::{
        error::{Error, JioResult},
        file::Jfs,
        jdir::{jdir_for, LOCK_FILE_NAME},
        os::RangeLock,
        record,
        txn::Transaction,
    },
    memmap2::Mmap,
    std::{
        fs::{self, OpenOptions},
        os::unix::fs::OpenOptionsExt,
        path::Path,
    },
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// Per-record outcome counters for one recovery pass
pub struct FsckResult {
    /// records visited (every id from 1 to the scan maximum)
    pub total: u32,
    /// ids with no record file on disk
    pub invalid: u32,
    /// records locked by a live committer, skipped
    pub in_progress: u32,
    /// records whose structure didn't parse
    pub broken: u32,
    /// records that failed the trailing checksum
    pub corrupt: u32,
    /// records that parsed but failed to re-commit
    pub apply_error: u32,
    /// records fully replayed and reclaimed
    pub reapplied: u32,
}

/// Inspect the journal of `name` and replay every durable record whose
/// apply status is unknown. A single bad record never fails the batch
pub fn jfsck(name: impl AsRef<Path>, jdir: Option<&Path>) -> JioResult<FsckResult> {
    let name = name.as_ref();
    let jfs = Jfs::recovery_open(name, jdir)?;
    let mut res = FsckResult::default();
    // directory scan for the numeric maximum; the counter is rewritten to
    // it up front so ids issued during replay can't collide with survivors
    let mut maxtid = 0;
    for entry in fs::read_dir(jfs.jdir().path()).map_err(|_| Error::NoJournal)? {
        let entry = entry.map_err(|_| Error::NoJournal)?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<u32>() {
            if tid > maxtid {
                maxtid = tid;
            }
        }
    }
    jfs.jdir().reset_counter(maxtid)?;
    for tid in 1..=maxtid {
        res.total += 1;
        let rpath = jfs.jdir().record_path(tid);
        let rfile = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&rpath)
        {
            Ok(f) => f,
            Err(_) => {
                res.invalid += 1;
                continue;
            }
        };
        // a locked record belongs to a committer that is still alive
        let _rlock = match RangeLock::try_acquire(&rfile, 0, 0)? {
            Some(l) => l,
            None => {
                res.in_progress += 1;
                continue;
            }
        };
        let map = match unsafe { Mmap::map(&rfile) } {
            Ok(m) => m,
            Err(_) => {
                res.broken += 1;
                continue;
            }
        };
        let rec = match record::decode(&map) {
            Ok(r) => r,
            // allocator pressure fails the whole pass, not the record
            Err(e @ Error::OutOfMemory) => return Err(e),
            Err(_) => {
                log::warn!("record {tid} has a broken structure, skipping");
                res.broken += 1;
                continue;
            }
        };
        if !record::verify_checksum(&map) {
            log::warn!("record {tid} failed its checksum, skipping");
            res.corrupt += 1;
            continue;
        }
        let mut replay = Transaction::from_record(&jfs, &rec);
        match replay.commit() {
            Ok(_) => {
                drop(rec);
                drop(map);
                fs::remove_file(&rpath)?;
                jfs.jdir().free_tid(tid)?;
                res.reapplied += 1;
            }
            Err(e) => {
                log::error!("replay of record {tid} failed: {e}");
                res.apply_error += 1;
            }
        }
    }
    log::info!(
        "fsck of {}: {} replayed, {} skipped, {} total",
        name.display(),
        res.reapplied,
        res.in_progress + res.broken + res.corrupt + res.apply_error,
        res.total
    );
    Ok(res)
}

/// Remove the journal of `name`: the lock file, every record, and then the
/// directory itself. Files the engine didn't put there are left untouched
pub fn jfsck_cleanup(name: impl AsRef<Path>, jdir: Option<&Path>) -> JioResult<()> {
    let path = match jdir {
        Some(p) => p.to_path_buf(),
        None => jdir_for(name.as_ref())?,
    };
    if !path.is_dir() {
        return Err(Error::NoJournal);
    }
    for entry in fs::read_dir(&path)? {
        let entry = entry?;
        let fname = entry.file_name();
        let fname = fname.to_string_lossy();
        let ours = fname == LOCK_FILE_NAME || fname.parse::<u32>().map_or(false, |tid| tid > 0);
        if ours {
            fs::remove_file(entry.path())?;
        }
    }
    if let Err(e) = fs::remove_dir(&path) {
        // foreign files keep the directory alive; that's on the caller
        log::warn!("journal directory {} not removed: {e}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::{jfsck, jfsck_cleanup},
        crate::{
            error::Error,
            file::Jfs,
            jdir::JournalDir,
            record::{self, DiskOp},
            util::test_utils::Scratch,
        },
        std::fs,
    };

    fn plant_record(jdir: &std::path::Path, tid: u32, img: &[u8]) {
        fs::write(jdir.join(tid.to_string()), img).unwrap();
    }

    #[test]
    fn missing_data_file() {
        let scratch = Scratch::new();
        assert!(matches!(
            jfsck(scratch.path("nope.bin"), None),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn missing_journal_dir() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        fs::write(&path, b"data").unwrap();
        assert!(matches!(jfsck(&path, None), Err(Error::NoJournal)));
    }

    #[test]
    fn quiescent_journal_is_clean() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::create(&path).unwrap();
        jf.write(b"settled").unwrap();
        drop(jf);
        let res = jfsck(&path, None).unwrap();
        assert_eq!(res.total, 0);
        assert_eq!(res.reapplied, 0);
    }

    #[test]
    fn replays_unapplied_record() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::create(&path).unwrap();
        let jdir = jf.jdir().path().to_path_buf();
        drop(jf);
        // a record that was made durable but never applied: the crash
        // window between the fsync and the apply writes
        let img = record::encode(
            1,
            0,
            &[DiskOp {
                plen: 0,
                offset: 0,
                newdata: b"HELLO",
            }],
            b"",
        );
        plant_record(&jdir, 1, &img);
        let res = jfsck(&path, None).unwrap();
        assert_eq!(res.reapplied, 1);
        assert_eq!(res.total, 1);
        assert_eq!(fs::read(&path).unwrap(), b"HELLO");
        // the survivor was reclaimed
        assert!(!jdir.join("1").exists());
    }

    #[test]
    fn replay_is_idempotent() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::create(&path).unwrap();
        let jdir = jf.jdir().path().to_path_buf();
        drop(jf);
        let img = record::encode(
            1,
            0,
            &[DiskOp {
                plen: 0,
                offset: 3,
                newdata: b"xyz",
            }],
            b"",
        );
        // the crash happened mid-apply: the bytes already landed but the
        // record survived
        fs::write(&path, b"\0\0\0xyz").unwrap();
        plant_record(&jdir, 1, &img);
        let res = jfsck(&path, None).unwrap();
        assert_eq!(res.reapplied, 1);
        assert_eq!(fs::read(&path).unwrap(), b"\0\0\0xyz");
    }

    #[test]
    fn corrupt_record_is_skipped() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        fs::write(&path, b"unchanged").unwrap();
        let jf = Jfs::open(&path).unwrap();
        let jdir = jf.jdir().path().to_path_buf();
        drop(jf);
        let mut img = record::encode(
            1,
            0,
            &[DiskOp {
                plen: 0,
                offset: 0,
                newdata: b"CLOBBER",
            }],
            b"",
        );
        let last = img.len() - 1;
        img[last] ^= 0xff;
        plant_record(&jdir, 1, &img);
        let res = jfsck(&path, None).unwrap();
        assert_eq!(res.corrupt, 1);
        assert_eq!(res.reapplied, 0);
        assert_eq!(fs::read(&path).unwrap(), b"unchanged");
        // the bad record is left in place for inspection
        assert!(jdir.join("1").exists());
    }

    #[test]
    fn broken_record_is_skipped() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        fs::write(&path, b"unchanged").unwrap();
        let jf = Jfs::open(&path).unwrap();
        let jdir = jf.jdir().path().to_path_buf();
        drop(jf);
        // declares one op of 100 bytes but carries far fewer
        let mut img = Vec::new();
        img.extend(1u32.to_le_bytes());
        img.extend(0u32.to_le_bytes());
        img.extend(1u32.to_le_bytes());
        img.extend(100u32.to_le_bytes());
        img.extend(0u32.to_le_bytes());
        img.extend(0u64.to_le_bytes());
        img.extend([0xaa; 8]);
        plant_record(&jdir, 1, &img);
        let res = jfsck(&path, None).unwrap();
        assert_eq!(res.broken, 1);
        assert_eq!(res.reapplied, 0);
        assert_eq!(fs::read(&path).unwrap(), b"unchanged");
    }

    #[test]
    fn gaps_count_as_invalid() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::create(&path).unwrap();
        let jdir = jf.jdir().path().to_path_buf();
        drop(jf);
        let img = record::encode(
            5,
            0,
            &[DiskOp {
                plen: 0,
                offset: 0,
                newdata: b"five!",
            }],
            b"",
        );
        plant_record(&jdir, 5, &img);
        let res = jfsck(&path, None).unwrap();
        assert_eq!(res.total, 5);
        assert_eq!(res.invalid, 4);
        assert_eq!(res.reapplied, 1);
        assert_eq!(fs::read(&path).unwrap(), b"five!");
    }

    #[test]
    fn counter_rewritten_to_scan_max() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        fs::write(&path, b"x").unwrap();
        let jf = Jfs::open(&path).unwrap();
        let jdir = jf.jdir().path().to_path_buf();
        drop(jf);
        // an unreplayable (corrupt) survivor pins the counter at its id
        let mut img = record::encode(
            7,
            0,
            &[DiskOp {
                plen: 0,
                offset: 0,
                newdata: b"y",
            }],
            b"",
        );
        let last = img.len() - 1;
        img[last] ^= 0xff;
        plant_record(&jdir, 7, &img);
        jfsck(&path, None).unwrap();
        let jd = JournalDir::bootstrap(&path, None).unwrap();
        assert_eq!(jd.current_max().unwrap(), 7);
    }

    #[test]
    fn cleanup_wipes_engine_files_only() {
        let scratch = Scratch::new();
        let path = scratch.path("f.bin");
        let jf = Jfs::create(&path).unwrap();
        let jdir = jf.jdir().path().to_path_buf();
        drop(jf);
        fs::write(jdir.join("3"), b"stale").unwrap();
        fs::write(jdir.join("not-ours"), b"keep").unwrap();
        jfsck_cleanup(&path, None).unwrap();
        assert!(jdir.is_dir());
        assert!(jdir.join("not-ours").exists());
        assert!(!jdir.join("3").exists());
        assert!(!jdir.join("lock").exists());
        // with nothing foreign left, the directory goes away too
        fs::remove_file(jdir.join("not-ours")).unwrap();
        let jf = Jfs::create(&path).unwrap();
        drop(jf);
        jfsck_cleanup(&path, None).unwrap();
        assert!(!jdir.exists());
    }
}
