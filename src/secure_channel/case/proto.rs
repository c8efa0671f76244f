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

//! Wire schemas of the four Sigma messages and of the to-be-signed /
//! to-be-encrypted payloads inside them.
//!
//! Parsing is strict: context tags in ascending order, exact field lengths,
//! no unknown tags, and the two resumption fields of Sigma1 either both
//! present or both absent. Schema violations are rejected before any
//! cryptographic work is done on the message.

use crate::crypto::{
    AEAD_MIC_LEN_BYTES, EC_POINT_LEN_BYTES, EC_SIGNATURE_LEN_BYTES, SHA256_HASH_LEN_BYTES,
};
use crate::error::{Error, ErrorCode};
use crate::resumption::RESUMPTION_ID_LEN;
use crate::tlv::{get_root_node_struct, TLVElement, TLVWriter, TagType};
use crate::utils::writebuf::WriteBuf;

pub const CASE_RANDOM_LEN: usize = 32;

fn expect_str<'a>(element: &TLVElement<'a>, len: usize) -> Result<&'a [u8], Error> {
    let s = element.str()?;
    if s.len() != len {
        return Err(ErrorCode::InvalidArgument.into());
    }
    Ok(s)
}

#[derive(Debug)]
pub struct Sigma1<'a> {
    pub initiator_random: &'a [u8],
    pub initiator_sessid: u16,
    pub dest_id: &'a [u8],
    pub peer_pub_key: &'a [u8],
    pub resumption_id: Option<&'a [u8]>,
    pub resume_mic: Option<&'a [u8]>,
}

impl<'a> Sigma1<'a> {
    pub fn from_tlv(buf: &'a [u8]) -> Result<Self, Error> {
        let mut root = get_root_node_struct(buf)?;

        let mut initiator_random = None;
        let mut initiator_sessid = None;
        let mut dest_id = None;
        let mut peer_pub_key = None;
        let mut resumption_id = None;
        let mut resume_mic = None;

        while let Some((tag, element)) = root.next()? {
            match tag {
                1 => initiator_random = Some(expect_str(&element, CASE_RANDOM_LEN)?),
                2 => initiator_sessid = Some(element.u16()?),
                3 => dest_id = Some(expect_str(&element, SHA256_HASH_LEN_BYTES)?),
                4 => peer_pub_key = Some(expect_str(&element, EC_POINT_LEN_BYTES)?),
                6 => resumption_id = Some(expect_str(&element, RESUMPTION_ID_LEN)?),
                7 => resume_mic = Some(expect_str(&element, AEAD_MIC_LEN_BYTES)?),
                _ => return Err(ErrorCode::Invalid.into()),
            }
        }

        if resumption_id.is_some() != resume_mic.is_some() {
            return Err(ErrorCode::InvalidArgument.into());
        }

        Ok(Self {
            initiator_random: initiator_random.ok_or(ErrorCode::TLVNotFound)?,
            initiator_sessid: initiator_sessid.ok_or(ErrorCode::TLVNotFound)?,
            dest_id: dest_id.ok_or(ErrorCode::TLVNotFound)?,
            peer_pub_key: peer_pub_key.ok_or(ErrorCode::TLVNotFound)?,
            resumption_id,
            resume_mic,
        })
    }

    pub fn to_tlv(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), self.initiator_random)?;
        tw.u16(TagType::Context(2), self.initiator_sessid)?;
        tw.str8(TagType::Context(3), self.dest_id)?;
        tw.str8(TagType::Context(4), self.peer_pub_key)?;
        if let Some(resumption_id) = self.resumption_id {
            tw.str8(TagType::Context(6), resumption_id)?;
        }
        if let Some(resume_mic) = self.resume_mic {
            tw.str8(TagType::Context(7), resume_mic)?;
        }
        tw.end_container()
    }
}

#[derive(Debug)]
pub struct Sigma2<'a> {
    pub responder_random: &'a [u8],
    pub responder_sessid: u16,
    pub responder_pub_key: &'a [u8],
    pub encrypted2: &'a [u8],
}

impl<'a> Sigma2<'a> {
    pub fn from_tlv(buf: &'a [u8]) -> Result<Self, Error> {
        let mut root = get_root_node_struct(buf)?;

        let mut responder_random = None;
        let mut responder_sessid = None;
        let mut responder_pub_key = None;
        let mut encrypted2 = None;

        while let Some((tag, element)) = root.next()? {
            match tag {
                1 => responder_random = Some(expect_str(&element, CASE_RANDOM_LEN)?),
                2 => responder_sessid = Some(element.u16()?),
                3 => responder_pub_key = Some(expect_str(&element, EC_POINT_LEN_BYTES)?),
                4 => {
                    let s = element.str()?;
                    if s.len() <= AEAD_MIC_LEN_BYTES {
                        return Err(ErrorCode::InvalidArgument.into());
                    }
                    encrypted2 = Some(s)
                }
                _ => return Err(ErrorCode::Invalid.into()),
            }
        }

        Ok(Self {
            responder_random: responder_random.ok_or(ErrorCode::TLVNotFound)?,
            responder_sessid: responder_sessid.ok_or(ErrorCode::TLVNotFound)?,
            responder_pub_key: responder_pub_key.ok_or(ErrorCode::TLVNotFound)?,
            encrypted2: encrypted2.ok_or(ErrorCode::TLVNotFound)?,
        })
    }

    pub fn to_tlv(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), self.responder_random)?;
        tw.u16(TagType::Context(2), self.responder_sessid)?;
        tw.str8(TagType::Context(3), self.responder_pub_key)?;
        tw.str16(TagType::Context(4), self.encrypted2)?;
        tw.end_container()
    }
}

#[derive(Debug)]
pub struct Sigma2Resume<'a> {
    pub resumption_id: &'a [u8],
    pub resume_mic: &'a [u8],
    pub responder_sessid: u16,
}

impl<'a> Sigma2Resume<'a> {
    pub fn from_tlv(buf: &'a [u8]) -> Result<Self, Error> {
        let mut root = get_root_node_struct(buf)?;

        let mut resumption_id = None;
        let mut resume_mic = None;
        let mut responder_sessid = None;

        while let Some((tag, element)) = root.next()? {
            match tag {
                1 => resumption_id = Some(expect_str(&element, RESUMPTION_ID_LEN)?),
                2 => resume_mic = Some(expect_str(&element, AEAD_MIC_LEN_BYTES)?),
                3 => responder_sessid = Some(element.u16()?),
                _ => return Err(ErrorCode::Invalid.into()),
            }
        }

        Ok(Self {
            resumption_id: resumption_id.ok_or(ErrorCode::TLVNotFound)?,
            resume_mic: resume_mic.ok_or(ErrorCode::TLVNotFound)?,
            responder_sessid: responder_sessid.ok_or(ErrorCode::TLVNotFound)?,
        })
    }

    pub fn to_tlv(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), self.resumption_id)?;
        tw.str8(TagType::Context(2), self.resume_mic)?;
        tw.u16(TagType::Context(3), self.responder_sessid)?;
        tw.end_container()
    }
}

#[derive(Debug)]
pub struct Sigma3<'a> {
    pub encrypted3: &'a [u8],
}

impl<'a> Sigma3<'a> {
    pub fn from_tlv(buf: &'a [u8]) -> Result<Self, Error> {
        let mut root = get_root_node_struct(buf)?;

        let mut encrypted3 = None;

        while let Some((tag, element)) = root.next()? {
            match tag {
                1 => {
                    let s = element.str()?;
                    if s.len() <= AEAD_MIC_LEN_BYTES {
                        return Err(ErrorCode::InvalidArgument.into());
                    }
                    encrypted3 = Some(s)
                }
                _ => return Err(ErrorCode::Invalid.into()),
            }
        }

        Ok(Self {
            encrypted3: encrypted3.ok_or(ErrorCode::TLVNotFound)?,
        })
    }

    pub fn to_tlv(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str16(TagType::Context(1), self.encrypted3)?;
        tw.end_container()
    }
}

/// The decrypted payload of Sigma2 and Sigma3: the sender's certificates and
/// signature, plus (in Sigma2 only) the resumption id the responder issues.
#[derive(Debug)]
pub struct SigmaTbe<'a> {
    pub noc: &'a [u8],
    pub icac: Option<&'a [u8]>,
    pub signature: &'a [u8],
    pub resumption_id: Option<&'a [u8]>,
}

impl<'a> SigmaTbe<'a> {
    pub fn from_tlv(buf: &'a [u8], with_resumption_id: bool) -> Result<Self, Error> {
        let mut root = get_root_node_struct(buf)?;

        let mut noc = None;
        let mut icac = None;
        let mut signature = None;
        let mut resumption_id = None;

        while let Some((tag, element)) = root.next()? {
            match tag {
                1 => {
                    let s = element.str()?;
                    if s.is_empty() {
                        return Err(ErrorCode::InvalidArgument.into());
                    }
                    noc = Some(s)
                }
                2 => icac = Some(element.str()?),
                3 => signature = Some(expect_str(&element, EC_SIGNATURE_LEN_BYTES)?),
                4 if with_resumption_id => {
                    resumption_id = Some(expect_str(&element, RESUMPTION_ID_LEN)?)
                }
                _ => return Err(ErrorCode::Invalid.into()),
            }
        }

        if with_resumption_id && resumption_id.is_none() {
            return Err(ErrorCode::TLVNotFound.into());
        }

        Ok(Self {
            noc: noc.ok_or(ErrorCode::TLVNotFound)?,
            icac,
            signature: signature.ok_or(ErrorCode::TLVNotFound)?,
            resumption_id,
        })
    }

    pub fn to_tlv(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str16(TagType::Context(1), self.noc)?;
        if let Some(icac) = self.icac {
            tw.str16(TagType::Context(2), icac)?;
        }
        tw.str8(TagType::Context(3), self.signature)?;
        if let Some(resumption_id) = self.resumption_id {
            tw.str8(TagType::Context(4), resumption_id)?;
        }
        tw.end_container()
    }
}

/// Serialize the to-be-signed structure covering both ephemeral public keys,
/// from the sender's point of view.
pub fn write_tbs(
    buf: &mut [u8],
    noc: &[u8],
    icac: Option<&[u8]>,
    sender_pub_key: &[u8],
    receiver_pub_key: &[u8],
) -> Result<usize, Error> {
    let mut wb = WriteBuf::new(buf);
    let mut tw = TLVWriter::new(&mut wb);
    tw.start_struct(TagType::Anonymous)?;
    tw.str16(TagType::Context(1), noc)?;
    if let Some(icac) = icac {
        tw.str16(TagType::Context(2), icac)?;
    }
    tw.str8(TagType::Context(3), sender_pub_key)?;
    tw.str8(TagType::Context(4), receiver_pub_key)?;
    tw.end_container()?;
    Ok(wb.as_slice().len())
}
