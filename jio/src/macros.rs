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

macro_rules! sizeof {
    ($ty:ty) => {
        ::core::mem::size_of::<$ty>()
    };
    ($ty:ty, $by:literal) => {
        ::core::mem::size_of::<$ty>() * $by
    };
}

macro_rules! direct_from {
    ($for:ty => {$($other:ty as $variant:ident),*$(,)?}) => {
        $(impl ::core::convert::From<$other> for $for {
            fn from(v: $other) -> Self {
                Self::$variant(v.into())
            }
        })*
    }
}
