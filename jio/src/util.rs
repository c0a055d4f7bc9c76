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

/// Copy a slice into a fixed-size array. Panics if the lengths don't match
pub fn copy_slice_to_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(slice);
    array
}

#[cfg(test)]
pub mod test_utils {
    use {
        rand::Rng,
        std::{path::PathBuf, sync::Once},
        tempfile::TempDir,
    };

    static LOG_INIT: Once = Once::new();

    /// A scratch directory for a test; removed on drop
    pub struct Scratch {
        dir: TempDir,
    }

    impl Scratch {
        pub fn new() -> Self {
            LOG_INIT.call_once(|| {
                let _ = env_logger::builder().is_test(true).try_init();
            });
            Self {
                dir: TempDir::new().unwrap(),
            }
        }
        pub fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    pub fn random_payload(rng: &mut impl Rng, l: usize) -> Vec<u8> {
        (0..l).map(|_| rng.gen()).collect()
    }
}
