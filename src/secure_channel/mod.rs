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

//! The secure-channel protocol surface: opcodes, status codes and the
//! session-establishment state machines.

pub mod case;

use byteorder::{ByteOrder, LittleEndian};
use num_derive::FromPrimitive;

use crate::error::{Error, ErrorCode};
use crate::session::CryptoContext;
use crate::transport::Exchange;
use crate::utils::writebuf::WriteBuf;

/* Secure Channel Protocol ID as per the Matter Spec */
pub const PROTO_ID_SECURE_CHANNEL: u16 = 0x00;

#[derive(FromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    MRPStandAloneAck = 0x10,
    CASESigma1 = 0x30,
    CASESigma2 = 0x31,
    CASESigma3 = 0x32,
    CASESigma2Resume = 0x33,
    StatusReport = 0x40,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SCStatusCodes {
    SessionEstablishmentSuccess = 0,
    NoSharedTrustRoots = 1,
    InvalidParameter = 2,
    CloseSession = 3,
    Busy = 4,
    SessionNotFound = 5,
}

#[derive(FromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum GeneralCode {
    Success = 0,
    Failure = 1,
    BadPrecondition = 2,
    OutOfRange = 3,
    BadRequest = 4,
    Unsupported = 5,
    Unexpected = 6,
    ResourceExhausted = 7,
    Busy = 8,
    Timeout = 9,
    Continue = 10,
    Aborted = 11,
    InvalidArgument = 12,
    NotFound = 13,
    AlreadyExists = 14,
    PermissionDenied = 15,
    DataLoss = 16,
}

/// The secure-channel status report: a general code, the protocol the
/// detailed code belongs to, and the protocol-specific code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub general_code: GeneralCode,
    pub proto_id: u32,
    pub proto_code: u16,
}

impl StatusReport {
    pub fn write(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        wb.le_u16(self.general_code as u16)?;
        wb.le_u32(self.proto_id)?;
        wb.le_u16(self.proto_code)
    }

    pub fn read(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 8 {
            return Err(ErrorCode::TruncatedPacket.into());
        }
        let general_code: GeneralCode =
            num::FromPrimitive::from_u16(LittleEndian::read_u16(&buf[0..2]))
                .ok_or(ErrorCode::Invalid)?;
        Ok(Self {
            general_code,
            proto_id: LittleEndian::read_u32(&buf[2..6]),
            proto_code: LittleEndian::read_u16(&buf[6..8]),
        })
    }
}

/// Send a secure-channel status report terminating (or acknowledging) a
/// session-establishment exchange.
pub fn send_status_report(
    exchange: &mut dyn Exchange,
    status_code: SCStatusCodes,
) -> Result<(), Error> {
    let general_code = match status_code {
        SCStatusCodes::SessionEstablishmentSuccess | SCStatusCodes::CloseSession => {
            GeneralCode::Success
        }
        SCStatusCodes::Busy
        | SCStatusCodes::InvalidParameter
        | SCStatusCodes::NoSharedTrustRoots
        | SCStatusCodes::SessionNotFound => GeneralCode::Failure,
    };

    let report = StatusReport {
        general_code,
        proto_id: PROTO_ID_SECURE_CHANNEL as u32,
        proto_code: status_code as u16,
    };

    let mut buf = [0u8; 8];
    let mut wb = WriteBuf::new(&mut buf);
    report.write(&mut wb)?;

    exchange.send(OpCode::StatusReport as u8, wb.as_slice())
}

/// A successfully established session, as handed to the delegate: the
/// ready-to-use crypto context plus the identifiers the session holder needs
/// to install it.
pub struct EstablishedSession {
    pub crypto: CryptoContext,
    pub peer_node_id: u64,
    pub local_fabric_idx: u8,
    pub resumption_id: [u8; crate::resumption::RESUMPTION_ID_LEN],
}

/// Terminal outcome callbacks of one session-establishment attempt. Exactly
/// one of the two is invoked per attempt.
pub trait PairingDelegate {
    fn on_session_established(&mut self, session: EstablishedSession);
    fn on_session_establishment_error(&mut self, err: Error);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoopbackExchange {
        sent: Vec<(u8, Vec<u8>)>,
    }

    impl Exchange for LoopbackExchange {
        fn send(&mut self, proto_opcode: u8, payload: &[u8]) -> Result<(), Error> {
            self.sent.push((proto_opcode, payload.to_vec()));
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_status_report_roundtrip() {
        let mut exch = LoopbackExchange { sent: Vec::new() };
        send_status_report(&mut exch, SCStatusCodes::NoSharedTrustRoots).unwrap();

        let (opcode, payload) = exch.sent.pop().unwrap();
        assert_eq!(opcode, OpCode::StatusReport as u8);

        let report = StatusReport::read(&payload).unwrap();
        assert_eq!(report.general_code, GeneralCode::Failure);
        assert_eq!(report.proto_id, PROTO_ID_SECURE_CHANNEL as u32);
        assert_eq!(report.proto_code, SCStatusCodes::NoSharedTrustRoots as u16);
    }

    #[test]
    fn test_status_report_truncated() {
        assert!(StatusReport::read(&[0, 0, 0]).is_err());
    }
}
