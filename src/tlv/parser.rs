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

use byteorder::{ByteOrder, LittleEndian};

use super::{TagType, TAG_MASK, TAG_SHIFT_BITS, TYPE_MASK};
use crate::error::{Error, ErrorCode};

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ElementType<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Str(&'a [u8]),
    Struct,
    EndCnt,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TLVElement<'a> {
    pub tag: TagType,
    pub value: ElementType<'a>,
}

impl<'a> TLVElement<'a> {
    pub fn u16(&self) -> Result<u16, Error> {
        match self.value {
            ElementType::U8(a) => Ok(a.into()),
            ElementType::U16(a) => Ok(a),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn u32(&self) -> Result<u32, Error> {
        match self.value {
            ElementType::U8(a) => Ok(a.into()),
            ElementType::U16(a) => Ok(a.into()),
            ElementType::U32(a) => Ok(a),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn u64(&self) -> Result<u64, Error> {
        match self.value {
            ElementType::U8(a) => Ok(a.into()),
            ElementType::U16(a) => Ok(a.into()),
            ElementType::U32(a) => Ok(a.into()),
            ElementType::U64(a) => Ok(a),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn str(&self) -> Result<&'a [u8], Error> {
        match self.value {
            ElementType::Str(s) => Ok(s),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }
}

struct TLVReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> TLVReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.offset + len > self.buf.len() {
            return Err(ErrorCode::TruncatedPacket.into());
        }
        let slice = &self.buf[self.offset..(self.offset + len)];
        self.offset += len;
        Ok(slice)
    }

    fn next(&mut self) -> Result<TLVElement<'a>, Error> {
        let control = self.take(1)?[0];

        let tag = match (control & TAG_MASK) >> TAG_SHIFT_BITS {
            0 => TagType::Anonymous,
            1 => TagType::Context(self.take(1)?[0]),
            // The handshake schemas only ever use anonymous and context tags
            _ => return Err(ErrorCode::TLVTypeMismatch.into()),
        };

        let value = match control & TYPE_MASK {
            4 => ElementType::U8(self.take(1)?[0]),
            5 => ElementType::U16(LittleEndian::read_u16(self.take(2)?)),
            6 => ElementType::U32(LittleEndian::read_u32(self.take(4)?)),
            7 => ElementType::U64(LittleEndian::read_u64(self.take(8)?)),
            16 => {
                let len = self.take(1)?[0] as usize;
                ElementType::Str(self.take(len)?)
            }
            17 => {
                let len = LittleEndian::read_u16(self.take(2)?) as usize;
                ElementType::Str(self.take(len)?)
            }
            21 => ElementType::Struct,
            24 => ElementType::EndCnt,
            _ => return Err(ErrorCode::TLVTypeMismatch.into()),
        };

        Ok(TLVElement { tag, value })
    }
}

/// Sequential reader over the members of a TLV structure.
///
/// Yields the context-tagged members in wire order and rejects anything the
/// handshake schemas disallow: non-context member tags, nested containers,
/// and tags that do not strictly ascend.
pub struct StructReader<'a> {
    rd: TLVReader<'a>,
    last_tag: Option<u8>,
    done: bool,
}

impl<'a> StructReader<'a> {
    pub fn next(&mut self) -> Result<Option<(u8, TLVElement<'a>)>, Error> {
        if self.done {
            return Ok(None);
        }

        let element = self.rd.next()?;
        if element.value == ElementType::EndCnt {
            self.done = true;
            return Ok(None);
        }

        let tag = match element.tag {
            TagType::Context(tag) => tag,
            TagType::Anonymous => return Err(ErrorCode::TLVTypeMismatch.into()),
        };
        if element.value == ElementType::Struct {
            return Err(ErrorCode::TLVTypeMismatch.into());
        }

        if let Some(last_tag) = self.last_tag {
            if tag <= last_tag {
                return Err(ErrorCode::Invalid.into());
            }
        }
        self.last_tag = Some(tag);

        Ok(Some((tag, element)))
    }
}

/// Parse the root of a TLV message, which must be an anonymous structure.
pub fn get_root_node_struct(buf: &[u8]) -> Result<StructReader<'_>, Error> {
    let mut rd = TLVReader::new(buf);
    let root = rd.next()?;
    if root.tag != TagType::Anonymous || root.value != ElementType::Struct {
        return Err(ErrorCode::TLVTypeMismatch.into());
    }

    Ok(StructReader {
        rd,
        last_tag: None,
        done: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::TLVWriter;
    use crate::utils::writebuf::WriteBuf;

    fn sample_msg(buf: &mut [u8]) -> usize {
        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous).unwrap();
        tw.str8(TagType::Context(1), &[0xaa; 4]).unwrap();
        tw.u16(TagType::Context(2), 0x1234).unwrap();
        tw.u64(TagType::Context(3), 0x1_0000_0000).unwrap();
        tw.end_container().unwrap();
        wb.as_slice().len()
    }

    #[test]
    fn test_read_in_order() {
        let mut buf = [0; 64];
        let len = sample_msg(&mut buf);

        let mut root = get_root_node_struct(&buf[..len]).unwrap();

        let (tag, el) = root.next().unwrap().unwrap();
        assert_eq!(tag, 1);
        assert_eq!(el.str().unwrap(), &[0xaa; 4]);

        let (tag, el) = root.next().unwrap().unwrap();
        assert_eq!(tag, 2);
        assert_eq!(el.u16().unwrap(), 0x1234);

        let (tag, el) = root.next().unwrap().unwrap();
        assert_eq!(tag, 3);
        assert_eq!(el.u64().unwrap(), 0x1_0000_0000);

        assert!(root.next().unwrap().is_none());
        // Reading past the end container keeps returning None
        assert!(root.next().unwrap().is_none());
    }

    #[test]
    fn test_widening_reads() {
        let mut buf = [0; 16];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous).unwrap();
        // A u16 field whose value fits in a single octet is wire-encoded as U8
        tw.u16(TagType::Context(1), 7).unwrap();
        tw.end_container().unwrap();
        let len = wb.as_slice().len();

        let mut root = get_root_node_struct(&buf[..len]).unwrap();
        let (_, el) = root.next().unwrap().unwrap();
        assert_eq!(el.u16().unwrap(), 7);
        assert!(el.str().is_err());
    }

    #[test]
    fn test_rejects_descending_tags() {
        let mut buf = [0; 16];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous).unwrap();
        tw.u8(TagType::Context(2), 1).unwrap();
        tw.u8(TagType::Context(1), 2).unwrap();
        tw.end_container().unwrap();
        let len = wb.as_slice().len();

        let mut root = get_root_node_struct(&buf[..len]).unwrap();
        root.next().unwrap();
        assert!(root.next().is_err());
    }

    #[test]
    fn test_rejects_duplicate_tags() {
        let mut buf = [0; 16];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous).unwrap();
        tw.u8(TagType::Context(1), 1).unwrap();
        tw.u8(TagType::Context(1), 2).unwrap();
        tw.end_container().unwrap();
        let len = wb.as_slice().len();

        let mut root = get_root_node_struct(&buf[..len]).unwrap();
        root.next().unwrap();
        assert!(root.next().is_err());
    }

    #[test]
    fn test_rejects_non_struct_root() {
        let buf = [4, 12];
        assert!(get_root_node_struct(&buf).is_err());
    }

    #[test]
    fn test_rejects_truncated_str() {
        // Str8l claiming 10 bytes with only 2 present
        let buf = [21, 48, 1, 10, 0xaa, 0xbb];
        let mut root = get_root_node_struct(&buf).unwrap();
        assert!(root.next().is_err());
    }
}
