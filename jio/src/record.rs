/*
 * Created on Sun Mar 03 2024
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

/*
  On-disk transaction record (all integers little-endian):

  +---------+------------+-------------+
  | ID (4B) | FLAGS (4B) | NUMOPS (4B) |
  +---------+------------+-------------+
  for each op:
  +----------+-----------+-------------+--------------------+
  | LEN (4B) | PLEN (4B) | OFFSET (8B) | NEW DATA (LEN B)   |
  +----------+-----------+-------------+--------------------+
  +----------------------+-------------+
  | USER PAYLOAD (?B)    | CRC32 (4B)  |
  +----------------------+-------------+

  - PLEN is the number of bytes that existed at OFFSET before the
    transaction; LEN - PLEN bytes (if any) are file extension
  - the user payload is whatever sits between the last op body and the
    trailing checksum; its presence is the committer's choice
  - the CRC32 covers every byte that precedes it. A torn record fails the
    checksum and is skipped by recovery, which is what makes the single
    fsync in the commit path sufficient
*/

use crate::{
    error::{Error, JioResult},
    util::copy_slice_to_array as memcpy,
};

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub const DISK_HEADER_SIZE: usize = sizeof!(u32, 3);
pub const DISK_OP_HEADER_SIZE: usize = sizeof!(u32, 2) + sizeof!(u64);
pub const DISK_CHECKSUM_SIZE: usize = sizeof!(u32);

// header field positions
const P0_ID: usize = 0;
const P1_FLAGS: usize = P0_ID + sizeof!(u32);
const P2_NUMOPS: usize = P1_FLAGS + sizeof!(u32);
// op header field positions (relative to the op)
const O0_LEN: usize = 0;
const O1_PLEN: usize = O0_LEN + sizeof!(u32);
const O2_OFFSET: usize = O1_PLEN + sizeof!(u32);

pub fn checksum_of(buf: &[u8]) -> u32 {
    CRC.checksum(buf)
}

#[derive(Debug, PartialEq)]
/// A borrowed view of one operation, as laid out on disk
pub struct DiskOp<'a> {
    pub plen: u32,
    pub offset: u64,
    pub newdata: &'a [u8],
}

#[derive(Debug, PartialEq)]
/// A parsed (but not necessarily checksum-verified) record
pub struct DiskRecord<'a> {
    pub id: u32,
    pub flags: u32,
    pub ops: Vec<DiskOp<'a>>,
    pub user_payload: &'a [u8],
}

/// Serialize a record. The returned buffer is the exact on-disk image,
/// trailing checksum included
pub fn encode(id: u32, flags: u32, ops: &[DiskOp<'_>], user_payload: &[u8]) -> Vec<u8> {
    let body: usize = ops
        .iter()
        .map(|op| DISK_OP_HEADER_SIZE + op.newdata.len())
        .sum();
    let mut buf =
        Vec::with_capacity(DISK_HEADER_SIZE + body + user_payload.len() + DISK_CHECKSUM_SIZE);
    buf.extend(id.to_le_bytes());
    buf.extend(flags.to_le_bytes());
    buf.extend((ops.len() as u32).to_le_bytes());
    for op in ops {
        buf.extend((op.newdata.len() as u32).to_le_bytes());
        buf.extend(op.plen.to_le_bytes());
        buf.extend(op.offset.to_le_bytes());
        buf.extend_from_slice(op.newdata);
    }
    buf.extend_from_slice(user_payload);
    let csum = checksum_of(&buf);
    buf.extend(csum.to_le_bytes());
    buf
}

/// Parse the structure of a record from a mapped extent. Only the layout is
/// validated here; run [`verify_checksum`] before trusting the contents
pub fn decode(map: &[u8]) -> JioResult<DiskRecord<'_>> {
    if map.len() < DISK_HEADER_SIZE + DISK_CHECKSUM_SIZE {
        return Err(Error::CorruptRecord);
    }
    // the checksum is not part of the parseable body
    let body = &map[..map.len() - DISK_CHECKSUM_SIZE];
    let id = u32::from_le_bytes(memcpy(&body[P0_ID..P0_ID + sizeof!(u32)]));
    let flags = u32::from_le_bytes(memcpy(&body[P1_FLAGS..P1_FLAGS + sizeof!(u32)]));
    let numops = u32::from_le_bytes(memcpy(&body[P2_NUMOPS..P2_NUMOPS + sizeof!(u32)]));
    let mut cursor = DISK_HEADER_SIZE;
    // the op table can't declare more entries than the body could carry,
    // so a forged count is a structural failure and never an allocation
    if numops as usize > (body.len() - cursor) / DISK_OP_HEADER_SIZE {
        return Err(Error::CorruptRecord);
    }
    let mut ops = Vec::new();
    ops.try_reserve_exact(numops as usize)
        .map_err(|_| Error::OutOfMemory)?;
    for _ in 0..numops {
        if cursor + DISK_OP_HEADER_SIZE > body.len() {
            return Err(Error::CorruptRecord);
        }
        let op = &body[cursor..];
        let len = u32::from_le_bytes(memcpy(&op[O0_LEN..O0_LEN + sizeof!(u32)]));
        let plen = u32::from_le_bytes(memcpy(&op[O1_PLEN..O1_PLEN + sizeof!(u32)]));
        let offset = u64::from_le_bytes(memcpy(&op[O2_OFFSET..O2_OFFSET + sizeof!(u64)]));
        cursor += DISK_OP_HEADER_SIZE;
        if cursor + len as usize > body.len() {
            return Err(Error::CorruptRecord);
        }
        ops.push(DiskOp {
            plen,
            offset,
            newdata: &body[cursor..cursor + len as usize],
        });
        cursor += len as usize;
    }
    Ok(DiskRecord {
        id,
        flags,
        ops,
        user_payload: &body[cursor..],
    })
}

/// Check the trailing CRC32 against the bytes that precede it
pub fn verify_checksum(map: &[u8]) -> bool {
    if map.len() < DISK_CHECKSUM_SIZE {
        return false;
    }
    let (body, tail) = map.split_at(map.len() - DISK_CHECKSUM_SIZE);
    checksum_of(body) == u32::from_le_bytes(memcpy(tail))
}
