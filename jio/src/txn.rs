/*
 * Created on Wed Mar 06 2024
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

//! # Transactions
//!
//! A [`Transaction`] collects ordered `(buffer, offset)` operations against
//! a [`Jfs`](crate::Jfs) and commits them atomically: the record is made
//! durable in the journal directory first, then applied to the data file,
//! then reclaimed. A crash at any point either leaves the data file
//! untouched (record not yet durable) or leaves a durable record that
//! recovery replays idempotently.

use {
    crate::{
        error::{Error, JioResult},
        file::{jflags, Jfs},
        os::{spread, spwrite, RangeLock},
        record::{self, DiskOp, DiskRecord},
    },
    std::{
        fs::{self, OpenOptions},
        os::unix::fs::OpenOptionsExt,
        path::{Path, PathBuf},
    },
};

/// Transaction flag bits, persisted verbatim in the record header. Only
/// `COMMITTED` carries semantics; the rollback bits are informational
pub mod tflags {
    /// the new bytes have been written to the data file
    pub const COMMITTED: u32 = 1 << 0;
    /// this transaction has been reverted by a rollback
    pub const ROLLBACKED: u32 = 1 << 1;
    /// this transaction is the reverse image of another one
    pub const ROLLBACKING: u32 = 1 << 2;
    /// bits recovery strips before replay; anything else in the header is
    /// caller-meaningful and survives the round trip
    pub const TRANSIENT: u32 = COMMITTED | ROLLBACKING;
}

const RECORD_MODE: u32 = 0o600;

#[derive(Debug)]
/// One write of a transaction: the new bytes for `[offset, offset + len)`
/// and, once captured, the bytes they replaced
pub struct Operation {
    buf: Vec<u8>,
    offset: u64,
    pdata: Option<Vec<u8>>,
    plen: usize,
}

impl Operation {
    fn len(&self) -> usize {
        self.buf.len()
    }
    /// `true` once undo capture saw EOF inside this op's range, i.e. the
    /// commit extended the file
    fn extends(&self) -> bool {
        self.plen < self.buf.len()
    }
}

#[derive(Debug)]
pub struct Transaction<'a> {
    fs: &'a Jfs,
    id: u32,
    flags: u32,
    ops: Vec<Operation>,
    user_payload: Option<Vec<u8>>,
    record: Option<PathBuf>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(fs: &'a Jfs) -> Self {
        Self {
            fs,
            id: 0,
            flags: 0,
            ops: Vec::new(),
            user_payload: None,
            record: None,
        }
    }
    /// Rebuild a transaction from a parsed record (recovery replay).
    /// Transient flag bits are stripped; everything else the committer put
    /// in the header is preserved
    pub(crate) fn from_record(fs: &'a Jfs, rec: &DiskRecord<'_>) -> Self {
        Self {
            fs,
            id: 0,
            flags: rec.flags & !tflags::TRANSIENT,
            ops: rec
                .ops
                .iter()
                .map(|op| Operation {
                    buf: op.newdata.to_vec(),
                    offset: op.offset,
                    pdata: None,
                    plen: 0,
                })
                .collect(),
            user_payload: if rec.user_payload.is_empty() {
                None
            } else {
                Some(rec.user_payload.to_vec())
            },
            record: None,
        }
    }
    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn flags(&self) -> u32 {
        self.flags
    }
    pub fn is_committed(&self) -> bool {
        self.flags & tflags::COMMITTED != 0
    }
    /// The record's on-disk path, once the commit has materialized one.
    /// Unless the handle lingers, the file itself is gone by the time a
    /// successful commit returns
    pub fn record_path(&self) -> Option<&Path> {
        self.record.as_deref()
    }
    fn is_settled(&self) -> bool {
        self.flags & (tflags::COMMITTED | tflags::ROLLBACKED) != 0
    }
    /// Append an operation writing `buf` at `offset`. Returns the number of
    /// operations now queued
    pub fn add(&mut self, buf: &[u8], offset: u64) -> JioResult<usize> {
        if self.is_settled() {
            return Err(Error::InvalidState);
        }
        self.ops.push(Operation {
            buf: buf.to_vec(),
            offset,
            pdata: None,
            plen: 0,
        });
        Ok(self.ops.len())
    }
    /// Attach an opaque payload, preserved verbatim in the record between
    /// the operation bodies and the checksum
    pub fn set_user_payload(&mut self, data: &[u8]) -> JioResult<()> {
        if self.is_settled() {
            return Err(Error::InvalidState);
        }
        self.user_payload = Some(data.to_vec());
        Ok(())
    }
}

/*
    commit
    ---
    1. allocate id
    2. create + lock the record file (recovery skips locked records)
    3. range-lock the data file, in offset order
    4. capture undo; ftruncate when the commit extends the file
    5. serialize the record
    6. fsync the record: the transaction is durable from here on
    7. apply the new bytes to the data file
    8. mark COMMITTED
    9. unlink the record, free the id, drop the locks

    A failure before 6 unwinds completely (record unlinked, id freed). A
    failure after 6 leaves the record on disk for recovery to replay.
*/

impl<'a> Transaction<'a> {
    /// Commit this transaction. Returns the total number of bytes applied
    /// to the data file
    pub fn commit(&mut self) -> JioResult<usize> {
        if self.is_settled() || self.fs.is_rdonly() {
            return Err(Error::InvalidState);
        }
        if self.ops.is_empty() {
            // nothing to journal, nothing to apply
            self.flags |= tflags::COMMITTED;
            return Ok(0);
        }
        // (1) id
        let id = self.fs.jdir().get_tid()?;
        // (2) record file
        let rpath = self.fs.jdir().record_path(id);
        let rfile = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(RECORD_MODE)
            .open(&rpath)
        {
            Ok(f) => f,
            Err(e) => {
                let _ = self.fs.jdir().free_tid(id);
                return Err(e.into());
            }
        };
        let rlock = match RangeLock::acquire(&rfile, 0, 0) {
            Ok(l) => l,
            Err(e) => {
                let _ = fs::remove_file(&rpath);
                let _ = self.fs.jdir().free_tid(id);
                return Err(e.into());
            }
        };
        self.id = id;
        self.record = Some(rpath.clone());
        // (3) range locks, offset order so two transactions can't deadlock
        // on disjoint regions
        let jfs = self.fs;
        let mut order: Vec<usize> = (0..self.ops.len()).collect();
        order.sort_by_key(|&i| self.ops[i].offset);
        let mut range_locks = Vec::with_capacity(self.ops.len());
        let nolock = jfs.flags() & jflags::NOLOCK != 0;
        // (3..6) unwind to a clean slate on any failure before the fsync
        if let Err(e) = (|| -> JioResult<()> {
            if !nolock {
                for &i in &order {
                    let (offset, len) = {
                        let op = &self.ops[i];
                        (op.offset, op.len() as u64)
                    };
                    range_locks.push(RangeLock::acquire(jfs.file(), offset, len)?);
                }
            }
            self.capture_undo()?;
            let img = self.serialize(id);
            spwrite(&rfile, &img, 0)?;
            // (6) the only synchronous flush in the critical path: an
            // incomplete record fails the recovery checksum anyway, so only
            // the post-fsync state matters
            rfile.sync_all()?;
            Ok(())
        })() {
            drop(range_locks);
            drop(rlock);
            let _ = fs::remove_file(&rpath);
            let _ = self.fs.jdir().free_tid(id);
            return Err(e);
        }
        // (7) apply; from here a failure leaves the record for recovery
        for op in &self.ops {
            if let Err(e) = spwrite(self.fs.file(), &op.buf, op.offset) {
                log::error!(
                    "apply failed for transaction {id} at offset {}; record retained for recovery",
                    op.offset
                );
                return Err(e.into());
            }
        }
        // (8)
        self.flags |= tflags::COMMITTED;
        // (9)
        let total = self.ops.iter().map(Operation::len).sum();
        if self.fs.flags() & jflags::LINGER != 0 {
            // grouped durability: the record outlives the apply until the
            // next jsync
            self.fs.park_linger(id, rpath);
        } else {
            fs::remove_file(&rpath)?;
            self.fs.jdir().free_tid(id)?;
        }
        Ok(total)
    }
    /// (4) read the bytes each op will overwrite. A short read means the
    /// commit extends the file, in which case the file is truncated up
    /// front so the apply never writes past EOF
    fn capture_undo(&mut self) -> JioResult<()> {
        for op in self.ops.iter_mut() {
            let mut pdata = vec![0u8; op.buf.len()];
            let plen = spread(self.fs.file(), &mut pdata, op.offset)?;
            if plen < op.buf.len() {
                // re-check the length under the extension lock: a
                // concurrent extender may already have grown the file past
                // us, and truncating back down would eat its bytes
                let _ext = self.fs.ext_lock().lock();
                let end = op.offset + op.buf.len() as u64;
                if self.fs.file().metadata()?.len() < end {
                    self.fs.file().set_len(end)?;
                }
            }
            pdata.truncate(plen);
            op.plen = plen;
            op.pdata = Some(pdata);
        }
        Ok(())
    }
    /// (5) the on-disk image, checksum included
    fn serialize(&self, id: u32) -> Vec<u8> {
        let views: Vec<DiskOp<'_>> = self
            .ops
            .iter()
            .map(|op| DiskOp {
                plen: op.plen as u32,
                offset: op.offset,
                newdata: &op.buf,
            })
            .collect();
        record::encode(
            id,
            self.flags,
            &views,
            self.user_payload.as_deref().unwrap_or(&[]),
        )
    }
}

/*
    rollback
    ---
    Builds the reverse transaction: every captured undo payload goes back
    to its offset with len = plen, and any range the original extended is
    truncated away first. This is only sound if nothing else has written to
    the affected ranges since the original commit; that is the caller's
    bargain.
*/

impl<'a> Transaction<'a> {
    /// Revert a committed transaction by committing its reverse image.
    /// Returns the number of bytes written back
    pub fn rollback(&mut self) -> JioResult<usize> {
        if self.fs.flags() & jflags::NOROLLBACK != 0 {
            return Err(Error::InvalidState);
        }
        if !self.is_committed() || self.flags & tflags::ROLLBACKED != 0 {
            return Err(Error::InvalidState);
        }
        let mut rtx = Transaction::new(self.fs);
        rtx.flags |= tflags::ROLLBACKING;
        // if the original grew the file, cut it back to the old length in
        // one shot: the smallest offset+plen across the extending ops is
        // where the file ended before the commit. Truncating per op would
        // re-extend past the cut whenever a later op sits at a higher
        // offset
        let mut cut = None;
        for op in &self.ops {
            let pdata = op.pdata.as_ref().ok_or(Error::InvalidState)?;
            if op.extends() {
                let end = op.offset + op.plen as u64;
                cut = Some(cut.map_or(end, |c: u64| c.min(end)));
            }
            if !pdata.is_empty() {
                rtx.add(pdata, op.offset)?;
            }
        }
        if let Some(cut) = cut {
            self.fs.file().set_len(cut)?;
        }
        let written = rtx.commit()?;
        self.flags |= tflags::ROLLBACKED;
        Ok(written)
    }
}
