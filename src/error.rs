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

use core::{array::TryFromSliceError, fmt};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    AlreadyInitialized,
    BufferTooSmall,
    /// Any cryptographic failure: signature mismatch, AEAD authentication
    /// failure, key derivation failure. Deliberately a single code so the
    /// individual causes are not distinguishable on the wire or in timing
    /// of the error path.
    Crypto,
    Duplicate,
    Invalid,
    InvalidArgument,
    /// Certificate-chain validation failure. Kept distinct from `Crypto` so
    /// the commissioning layer can present a meaningful error; the peer only
    /// ever sees a generic failure status.
    InvalidCertificate,
    InvalidOpcode,
    InvalidState,
    InvalidUseOfSessionKey,
    NoSpace,
    NotFound,
    RwLock,
    StdIoError,
    SysTimeFail,
    Timeout,
    TLVNotFound,
    TLVTypeMismatch,
    TruncatedPacket,
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

pub struct Error {
    code: ErrorCode,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self { code }
    }

    pub const fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<std::io::Error> for Error {
    fn from(_e: std::io::Error) -> Self {
        Self::new(ErrorCode::StdIoError)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_e: std::sync::PoisonError<T>) -> Self {
        Self::new(ErrorCode::RwLock)
    }
}

impl From<ccm::aead::Error> for Error {
    fn from(_e: ccm::aead::Error) -> Self {
        Self::new(ErrorCode::Crypto)
    }
}

impl From<p256::ecdsa::Error> for Error {
    fn from(_e: p256::ecdsa::Error) -> Self {
        Self::new(ErrorCode::Crypto)
    }
}

impl From<p256::elliptic_curve::Error> for Error {
    fn from(_e: p256::elliptic_curve::Error) -> Self {
        Self::new(ErrorCode::Crypto)
    }
}

impl From<hkdf::InvalidLength> for Error {
    fn from(_e: hkdf::InvalidLength) -> Self {
        Self::new(ErrorCode::Crypto)
    }
}

impl From<hmac::digest::InvalidLength> for Error {
    fn from(_e: hmac::digest::InvalidLength) -> Self {
        Self::new(ErrorCode::Crypto)
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(_e: std::time::SystemTimeError) -> Self {
        Error::new(ErrorCode::SysTimeFail)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_e: TryFromSliceError) -> Self {
        Self::new(ErrorCode::Invalid)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error::{}", self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code())
    }
}

impl std::error::Error for Error {}
