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

//! Certificate-authenticated session establishment (CASE) for the Matter
//! protocol, together with the per-message secure-channel crypto it produces.
//!
//! This crate is the session-establishment slice of a Matter node: the
//! three-message Sigma handshake (plus its abbreviated resumption variant),
//! the derivation of per-session AEAD keys bound to the handshake transcript,
//! and the [`session::CryptoContext`] that encrypts and decrypts every
//! subsequent message on the established session.
//!
//! It is a library for a larger messaging stack. The stack supplies the
//! reliable-message exchange ([`transport::Exchange`]), certificate
//! validation ([`cert::CertProvider`]) and optional persistence
//! ([`persist::KvBlobStore`]); this crate supplies the protocol.
//!
//! A handshake is driven by explicit events: the owner creates a
//! [`secure_channel::case::CaseInitiator`] or
//! [`secure_channel::case::CaseResponder`] bound to local identities
//! ([`fabric::Fabric`]) and re-enters it with each received message. On
//! success the delegate receives a ready-to-use `CryptoContext`; on the first
//! failure of any step the attempt terminates, erases its ephemeral secrets
//! and reports exactly once.

pub mod cert;
pub mod crypto;
pub mod error;
pub mod fabric;
pub mod persist;
pub mod resumption;
pub mod secure_channel;
pub mod session;
pub mod tlv;
pub mod transport;
pub mod utils;
