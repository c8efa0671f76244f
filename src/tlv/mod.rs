/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! A TLV codec restricted to what the session-establishment messages use:
//! anonymous and context tags, unsigned integers, octet strings and
//! structures. The parser is deliberately strict: it reads a structure
//! sequentially and enforces ascending context-tag order, which is how the
//! handshake schemas are validated.

mod parser;
mod writer;

pub use parser::*;
pub use writer::*;

pub(crate) const TAG_SHIFT_BITS: u8 = 5;
pub(crate) const TAG_MASK: u8 = 0xe0;
pub(crate) const TYPE_MASK: u8 = 0x1f;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TagType {
    Anonymous,
    Context(u8),
}
