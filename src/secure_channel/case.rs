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

//! The CASE handshake state machines.
//!
//! One instance drives exactly one establishment attempt, strictly
//! sequentially: it is entered with `start` (initiator only) and re-entered
//! with each received message or a timeout. The first failure of any step
//! transitions to the terminal failed state, scrubs all ephemeral key
//! material and reports through the delegate exactly once; a message that
//! does not match the expected protocol step is rejected without touching
//! any state. A failed attempt is never retried on the same instance.

pub mod proto;

use log::{error, trace};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::cert::CertProvider;
use crate::crypto::{
    self, KeyPair, Sha256, AEAD_MIC_LEN_BYTES, AEAD_NONCE_LEN_BYTES, ECDH_SHARED_SECRET_LEN_BYTES,
    EC_POINT_LEN_BYTES, EC_SIGNATURE_LEN_BYTES, SHA256_HASH_LEN_BYTES, SYMM_KEY_LEN_BYTES,
};
use crate::error::{Error, ErrorCode};
use crate::fabric::Fabric;
use crate::resumption::{ResumptionStore, RESUMPTION_ID_LEN};
use crate::secure_channel::{
    send_status_report, EstablishedSession, GeneralCode, OpCode, PairingDelegate, SCStatusCodes,
    StatusReport, PROTO_ID_SECURE_CHANNEL,
};
use crate::session::{CryptoContext, KeyPurpose, SessionRole};
use crate::transport::Exchange;
use crate::utils::rand::Rand;
use crate::utils::writebuf::WriteBuf;

use proto::{Sigma1, Sigma2, Sigma2Resume, Sigma3, SigmaTbe, CASE_RANDOM_LEN};

const MAX_CASE_MSG_LEN: usize = 1024;
const MAX_TBS_TBE_LEN: usize = 800;

const S2K_INFO: &[u8] = b"Sigma2";
const S3K_INFO: &[u8] = b"Sigma3";
const S1RK_INFO: &[u8] = b"Sigma1_Resume";
const S2RK_INFO: &[u8] = b"Sigma2_Resume";

const SIGMA2_NONCE: [u8; AEAD_NONCE_LEN_BYTES] = *b"NCASE_Sigma2N";
const SIGMA3_NONCE: [u8; AEAD_NONCE_LEN_BYTES] = *b"NCASE_Sigma3N";
const RESUME1_NONCE: [u8; AEAD_NONCE_LEN_BYTES] = *b"NCASE_SigmaS1";
const RESUME2_NONCE: [u8; AEAD_NONCE_LEN_BYTES] = *b"NCASE_SigmaS2";

fn current_hash(tt: &Sha256) -> Result<[u8; SHA256_HASH_LEN_BYTES], Error> {
    let mut hash = [0u8; SHA256_HASH_LEN_BYTES];
    tt.clone().finish(&mut hash)?;
    Ok(hash)
}

fn compute_sigma2_key(
    ipk: &[u8],
    responder_random: &[u8],
    responder_pub_key: &[u8],
    tt_hash: &[u8],
    shared_secret: &[u8],
    key: &mut [u8],
) -> Result<(), Error> {
    let mut salt = heapless::Vec::<u8, 256>::new();
    salt.extend_from_slice(ipk)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;
    salt.extend_from_slice(responder_random)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;
    salt.extend_from_slice(responder_pub_key)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;
    salt.extend_from_slice(tt_hash)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;

    crypto::hkdf_sha256(salt.as_slice(), shared_secret, S2K_INFO, key)
}

fn compute_sigma3_key(
    ipk: &[u8],
    tt_hash: &[u8],
    shared_secret: &[u8],
    key: &mut [u8],
) -> Result<(), Error> {
    let mut salt = heapless::Vec::<u8, 256>::new();
    salt.extend_from_slice(ipk)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;
    salt.extend_from_slice(tt_hash)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;

    crypto::hkdf_sha256(salt.as_slice(), shared_secret, S3K_INFO, key)
}

fn session_keys_salt(
    ipk: &[u8],
    tt_hash: &[u8],
) -> Result<heapless::Vec<u8, { SYMM_KEY_LEN_BYTES + SHA256_HASH_LEN_BYTES }>, Error> {
    let mut salt = heapless::Vec::new();
    salt.extend_from_slice(ipk)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;
    salt.extend_from_slice(tt_hash)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;
    Ok(salt)
}

fn resume_salt(
    initiator_random: &[u8],
    resumption_id: &[u8],
) -> Result<heapless::Vec<u8, { CASE_RANDOM_LEN + RESUMPTION_ID_LEN }>, Error> {
    let mut salt = heapless::Vec::new();
    salt.extend_from_slice(initiator_random)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;
    salt.extend_from_slice(resumption_id)
        .map_err(|_| Error::new(ErrorCode::NoSpace))?;
    Ok(salt)
}

/// The resume MIC is the CCM tag over an empty plaintext with a key derived
/// from the cached shared secret, proving possession without revealing it.
fn compute_resume_mic(
    shared_secret: &[u8],
    initiator_random: &[u8],
    resumption_id: &[u8],
    info: &[u8],
    nonce: &[u8; AEAD_NONCE_LEN_BYTES],
) -> Result<[u8; AEAD_MIC_LEN_BYTES], Error> {
    let salt = resume_salt(initiator_random, resumption_id)?;

    let mut key = Zeroizing::new([0u8; SYMM_KEY_LEN_BYTES]);
    crypto::hkdf_sha256(salt.as_slice(), shared_secret, info, key.as_mut())?;

    let mut mic = [0u8; AEAD_MIC_LEN_BYTES];
    crypto::encrypt_in_place(key.as_ref(), nonce, &[], &mut mic, 0)?;
    Ok(mic)
}

fn validate_resume_mic(
    shared_secret: &[u8],
    initiator_random: &[u8],
    resumption_id: &[u8],
    info: &[u8],
    nonce: &[u8; AEAD_NONCE_LEN_BYTES],
    mic: &[u8],
) -> Result<(), Error> {
    let expected = compute_resume_mic(shared_secret, initiator_random, resumption_id, info, nonce)?;
    if expected.as_slice().ct_eq(mic).into() {
        Ok(())
    } else {
        Err(ErrorCode::Crypto.into())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum InitiatorState {
    Idle,
    AwaitingSigma2,
    AwaitingStatus,
    Established,
    Failed,
}

/// The initiator side of one CASE establishment attempt.
pub struct CaseInitiator<'a> {
    fabric: &'a Fabric,
    certs: &'a dyn CertProvider,
    resumptions: Option<&'a ResumptionStore>,
    rand: Rand,
    peer_node_id: u64,
    local_sessid: u16,
    local_fabric_idx: u8,
    state: InitiatorState,
    tt_hash: Option<Sha256>,
    key_pair: Option<KeyPair>,
    our_random: [u8; CASE_RANDOM_LEN],
    our_pub_key: [u8; EC_POINT_LEN_BYTES],
    peer_sessid: u16,
    shared_secret: Zeroizing<[u8; ECDH_SHARED_SECRET_LEN_BYTES]>,
    resume_secret: Option<Zeroizing<[u8; ECDH_SHARED_SECRET_LEN_BYTES]>>,
    new_resumption_id: [u8; RESUMPTION_ID_LEN],
    pending: Option<EstablishedSession>,
}

impl<'a> CaseInitiator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fabric: &'a Fabric,
        certs: &'a dyn CertProvider,
        resumptions: Option<&'a ResumptionStore>,
        rand: Rand,
        peer_node_id: u64,
        local_sessid: u16,
        local_fabric_idx: u8,
    ) -> Self {
        Self {
            fabric,
            certs,
            resumptions,
            rand,
            peer_node_id,
            local_sessid,
            local_fabric_idx,
            state: InitiatorState::Idle,
            tt_hash: None,
            key_pair: None,
            our_random: [0; CASE_RANDOM_LEN],
            our_pub_key: [0; EC_POINT_LEN_BYTES],
            peer_sessid: 0,
            shared_secret: Zeroizing::new([0; ECDH_SHARED_SECRET_LEN_BYTES]),
            resume_secret: None,
            new_resumption_id: [0; RESUMPTION_ID_LEN],
            pending: None,
        }
    }

    /// Begin the handshake: build and send Sigma1. If a resumption record for
    /// the target peer is cached, the resumption identifier and proof-of-
    /// possession MIC are included, offering the abbreviated exchange.
    pub fn start(&mut self, exchange: &mut dyn Exchange) -> Result<(), Error> {
        if self.state != InitiatorState::Idle {
            return Err(ErrorCode::InvalidState.into());
        }

        match self.do_start(exchange) {
            Ok(()) => {
                self.state = InitiatorState::AwaitingSigma2;
                Ok(())
            }
            Err(e) => {
                self.scrub();
                self.state = InitiatorState::Failed;
                exchange.close();
                Err(e)
            }
        }
    }

    fn do_start(&mut self, exchange: &mut dyn Exchange) -> Result<(), Error> {
        (self.rand)(&mut self.our_random);

        let key_pair = KeyPair::new(self.rand)?;
        key_pair.get_public_key(&mut self.our_pub_key)?;
        self.key_pair = Some(key_pair);

        let mut dest_id = [0u8; SHA256_HASH_LEN_BYTES];
        self.fabric
            .compute_dest_id(&self.our_random, self.peer_node_id, &mut dest_id)?;

        let record = match self.resumptions {
            Some(store) => store
                .find_by_peer(self.peer_node_id)?
                .filter(|r| r.local_fabric_idx == self.local_fabric_idx),
            None => None,
        };

        let mut resume_mic = [0u8; AEAD_MIC_LEN_BYTES];
        if let Some(record) = record.as_ref() {
            resume_mic = compute_resume_mic(
                &record.shared_secret,
                &self.our_random,
                &record.resumption_id,
                S1RK_INFO,
                &RESUME1_NONCE,
            )?;
            self.resume_secret = Some(Zeroizing::new(record.shared_secret));
        }

        let msg = Sigma1 {
            initiator_random: &self.our_random,
            initiator_sessid: self.local_sessid,
            dest_id: &dest_id,
            peer_pub_key: &self.our_pub_key,
            resumption_id: record.as_ref().map(|r| &r.resumption_id[..]),
            resume_mic: record.as_ref().map(|_| &resume_mic[..]),
        };

        let mut buf = [0u8; MAX_CASE_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        msg.to_tlv(&mut wb)?;

        let mut tt = Sha256::new()?;
        tt.update(wb.as_slice())?;
        self.tt_hash = Some(tt);

        exchange.send(OpCode::CASESigma1 as u8, wb.as_slice())
    }

    fn expects(&self, opcode: OpCode) -> bool {
        match self.state {
            InitiatorState::AwaitingSigma2 => {
                opcode == OpCode::CASESigma2
                    || (opcode == OpCode::CASESigma2Resume && self.resume_secret.is_some())
                    // A failure report can arrive instead of Sigma2
                    || opcode == OpCode::StatusReport
            }
            InitiatorState::AwaitingStatus => opcode == OpCode::StatusReport,
            _ => false,
        }
    }

    /// Feed one received protocol message into the state machine.
    ///
    /// A message that is not the expected next step is rejected with
    /// `InvalidState`, leaving the attempt untouched. Any processing failure
    /// is terminal: ephemeral material is scrubbed and the delegate is told,
    /// exactly once, through `on_session_establishment_error`.
    pub fn handle_message(
        &mut self,
        exchange: &mut dyn Exchange,
        delegate: &mut dyn PairingDelegate,
        proto_opcode: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        let opcode: OpCode =
            num::FromPrimitive::from_u8(proto_opcode).ok_or(ErrorCode::InvalidOpcode)?;
        if !self.expects(opcode) {
            return Err(ErrorCode::InvalidState.into());
        }

        let result = match opcode {
            OpCode::CASESigma2 => self.process_sigma2(exchange, payload),
            OpCode::CASESigma2Resume => self.process_sigma2_resume(exchange, payload),
            OpCode::StatusReport => self.process_status(payload),
            _ => Err(ErrorCode::InvalidOpcode.into()),
        };

        match result {
            Ok(Some(established)) => {
                self.scrub();
                self.state = InitiatorState::Established;
                delegate.on_session_established(established);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                // Never answer a status report with another one
                self.fail(exchange, delegate, e, opcode != OpCode::StatusReport);
                Ok(())
            }
        }
    }

    /// A response timeout signaled by the exchange layer; terminal like any
    /// other failure.
    pub fn handle_timeout(
        &mut self,
        exchange: &mut dyn Exchange,
        delegate: &mut dyn PairingDelegate,
    ) {
        if matches!(
            self.state,
            InitiatorState::Established | InitiatorState::Failed
        ) {
            return;
        }
        self.scrub();
        self.state = InitiatorState::Failed;
        exchange.close();
        delegate.on_session_establishment_error(ErrorCode::Timeout.into());
    }

    fn process_sigma2(
        &mut self,
        exchange: &mut dyn Exchange,
        payload: &[u8],
    ) -> Result<Option<EstablishedSession>, Error> {
        let r = Sigma2::from_tlv(payload)?;
        self.peer_sessid = r.responder_sessid;

        let key_pair = self.key_pair.as_ref().ok_or(ErrorCode::InvalidState)?;
        let len = key_pair.derive_secret(r.responder_pub_key, &mut self.shared_secret[..])?;
        if len != ECDH_SHARED_SECRET_LEN_BYTES {
            return Err(ErrorCode::Crypto.into());
        }

        let tt = self.tt_hash.as_mut().ok_or(ErrorCode::InvalidState)?;
        let tt1_hash = current_hash(tt)?;

        let mut sigma2_key = Zeroizing::new([0u8; SYMM_KEY_LEN_BYTES]);
        compute_sigma2_key(
            self.fabric.ipk().op_key(),
            r.responder_random,
            r.responder_pub_key,
            &tt1_hash,
            &self.shared_secret[..],
            sigma2_key.as_mut(),
        )?;

        let mut decrypted = [0u8; MAX_TBS_TBE_LEN];
        if r.encrypted2.len() > decrypted.len() {
            error!("Encrypted data too large");
            return Err(ErrorCode::BufferTooSmall.into());
        }
        let decrypted = &mut decrypted[..r.encrypted2.len()];
        decrypted.copy_from_slice(r.encrypted2);
        let len = crypto::decrypt_in_place(sigma2_key.as_ref(), &SIGMA2_NONCE, &[], decrypted)?;
        let decrypted = &decrypted[..len];

        let d = SigmaTbe::from_tlv(decrypted, true)?;

        if let Err(e) = self
            .certs
            .validate_chain(d.noc, d.icac, self.fabric.root_ca())
        {
            error!("Certificate chain doesn't match: {}", e);
            return Err(ErrorCode::InvalidCertificate.into());
        }
        let peer_identity = self.certs.identity(d.noc)?;
        if peer_identity.fabric_id != self.fabric.fabric_id()
            || peer_identity.node_id != self.peer_node_id
        {
            error!("Responder identity doesn't match the dialed peer");
            return Err(ErrorCode::InvalidCertificate.into());
        }

        let mut tbs = [0u8; MAX_TBS_TBE_LEN];
        let tbs_len = proto::write_tbs(
            &mut tbs,
            d.noc,
            d.icac,
            r.responder_pub_key,
            &self.our_pub_key,
        )?;
        let responder_pub_key = self.certs.public_key(d.noc)?;
        KeyPair::new_from_public(&responder_pub_key)?.verify_msg(&tbs[..tbs_len], d.signature)?;

        // The responder-issued resumption id, cached once the handshake is
        // confirmed
        self.new_resumption_id
            .copy_from_slice(d.resumption_id.ok_or(ErrorCode::TLVNotFound)?);

        tt.update(payload)?;

        // Mirror operation: our signature and certificates, encrypted under
        // the Sigma3 key
        let mut tbs = [0u8; MAX_TBS_TBE_LEN];
        let tbs_len = proto::write_tbs(
            &mut tbs,
            self.fabric.noc(),
            self.fabric.icac(),
            &self.our_pub_key,
            r.responder_pub_key,
        )?;
        let mut signature = [0u8; EC_SIGNATURE_LEN_BYTES];
        self.fabric.sign_msg(&tbs[..tbs_len], &mut signature)?;

        let mut tbe = [0u8; MAX_TBS_TBE_LEN];
        let mut wb = WriteBuf::new(&mut tbe);
        SigmaTbe {
            noc: self.fabric.noc(),
            icac: self.fabric.icac(),
            signature: &signature,
            resumption_id: None,
        }
        .to_tlv(&mut wb)?;

        let tt12_hash = current_hash(tt)?;
        let mut sigma3_key = Zeroizing::new([0u8; SYMM_KEY_LEN_BYTES]);
        compute_sigma3_key(
            self.fabric.ipk().op_key(),
            &tt12_hash,
            &self.shared_secret[..],
            sigma3_key.as_mut(),
        )?;

        wb.append(&[0u8; AEAD_MIC_LEN_BYTES])?;
        let cipher_text = wb.as_mut_slice();
        let data_len = cipher_text.len() - AEAD_MIC_LEN_BYTES;
        crypto::encrypt_in_place(
            sigma3_key.as_ref(),
            &SIGMA3_NONCE,
            &[],
            cipher_text,
            data_len,
        )?;

        let mut msg = [0u8; MAX_CASE_MSG_LEN];
        let mut msg_wb = WriteBuf::new(&mut msg);
        Sigma3 {
            encrypted3: wb.as_slice(),
        }
        .to_tlv(&mut msg_wb)?;

        tt.update(msg_wb.as_slice())?;

        // Keys are bound to the full transcript, Sigma3 included
        let tt_final = current_hash(tt)?;
        let salt = session_keys_salt(self.fabric.ipk().op_key(), &tt_final)?;

        let mut ctx = CryptoContext::new(
            SessionRole::Initiator,
            self.fabric.node_id(),
            self.peer_node_id,
            self.local_sessid,
            self.peer_sessid,
            self.rand,
        );
        ctx.init_from_secret(&self.shared_secret[..], salt.as_slice(), KeyPurpose::Session)?;

        self.pending = Some(EstablishedSession {
            crypto: ctx,
            peer_node_id: self.peer_node_id,
            local_fabric_idx: self.local_fabric_idx,
            resumption_id: self.new_resumption_id,
        });

        exchange.send(OpCode::CASESigma3 as u8, msg_wb.as_slice())?;
        self.state = InitiatorState::AwaitingStatus;
        Ok(None)
    }

    fn process_sigma2_resume(
        &mut self,
        exchange: &mut dyn Exchange,
        payload: &[u8],
    ) -> Result<Option<EstablishedSession>, Error> {
        let r = Sigma2Resume::from_tlv(payload)?;

        let secret = self.resume_secret.as_ref().ok_or(ErrorCode::InvalidState)?;

        validate_resume_mic(
            &secret[..],
            &self.our_random,
            r.resumption_id,
            S2RK_INFO,
            &RESUME2_NONCE,
            r.resume_mic,
        )?;

        self.peer_sessid = r.responder_sessid;
        self.new_resumption_id.copy_from_slice(r.resumption_id);

        // Both sides salt with the initiator random and the fresh resumption
        // id, so every resumption yields distinct session keys
        let salt = resume_salt(&self.our_random, r.resumption_id)?;

        let mut ctx = CryptoContext::new(
            SessionRole::Initiator,
            self.fabric.node_id(),
            self.peer_node_id,
            self.local_sessid,
            self.peer_sessid,
            self.rand,
        );
        ctx.init_from_secret(&secret[..], salt.as_slice(), KeyPurpose::Resumption)?;

        if let Some(store) = self.resumptions {
            store.save(
                &self.new_resumption_id,
                &**secret,
                self.local_fabric_idx,
                self.peer_node_id,
            )?;
        }

        let established = EstablishedSession {
            crypto: ctx,
            peer_node_id: self.peer_node_id,
            local_fabric_idx: self.local_fabric_idx,
            resumption_id: self.new_resumption_id,
        };

        // Confirm the abbreviated exchange towards the responder
        send_status_report(exchange, SCStatusCodes::SessionEstablishmentSuccess)?;

        Ok(Some(established))
    }

    fn process_status(&mut self, payload: &[u8]) -> Result<Option<EstablishedSession>, Error> {
        let report = StatusReport::read(payload)?;
        if report.general_code != GeneralCode::Success
            || report.proto_id != PROTO_ID_SECURE_CHANNEL as u32
            || report.proto_code != SCStatusCodes::SessionEstablishmentSuccess as u16
        {
            error!("Peer reported session establishment failure: {:?}", report);
            return Err(ErrorCode::Invalid.into());
        }
        if self.pending.is_none() {
            // A success report is only meaningful after Sigma3 went out
            return Err(ErrorCode::Invalid.into());
        }

        if let Some(store) = self.resumptions {
            store.save(
                &self.new_resumption_id,
                &*self.shared_secret,
                self.local_fabric_idx,
                self.peer_node_id,
            )?;
        }

        Ok(self.pending.take())
    }

    fn fail(
        &mut self,
        exchange: &mut dyn Exchange,
        delegate: &mut dyn PairingDelegate,
        e: Error,
        notify_peer: bool,
    ) {
        if notify_peer {
            // Best effort; the peer only ever learns a generic failure
            let _ = send_status_report(exchange, SCStatusCodes::InvalidParameter);
        }
        self.scrub();
        self.state = InitiatorState::Failed;
        exchange.close();
        delegate.on_session_establishment_error(e);
    }

    fn scrub(&mut self) {
        self.key_pair = None;
        self.tt_hash = None;
        self.shared_secret.zeroize();
        self.resume_secret = None;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ResponderState {
    Idle,
    AwaitingSigma3,
    AwaitingResumeStatus,
    Established,
    Failed,
}

/// The responder side of one CASE establishment attempt, able to answer for
/// any of the local identities it is constructed with.
pub struct CaseResponder<'a> {
    identities: &'a [Fabric],
    certs: &'a dyn CertProvider,
    resumptions: Option<&'a ResumptionStore>,
    rand: Rand,
    local_sessid: u16,
    state: ResponderState,
    local_fabric_idx: u8,
    tt_hash: Option<Sha256>,
    our_random: [u8; CASE_RANDOM_LEN],
    our_pub_key: [u8; EC_POINT_LEN_BYTES],
    peer_pub_key: [u8; EC_POINT_LEN_BYTES],
    peer_sessid: u16,
    shared_secret: Zeroizing<[u8; ECDH_SHARED_SECRET_LEN_BYTES]>,
    resumption_id: [u8; RESUMPTION_ID_LEN],
    pending: Option<EstablishedSession>,
}

impl<'a> CaseResponder<'a> {
    pub fn new(
        identities: &'a [Fabric],
        certs: &'a dyn CertProvider,
        resumptions: Option<&'a ResumptionStore>,
        rand: Rand,
        local_sessid: u16,
    ) -> Self {
        Self {
            identities,
            certs,
            resumptions,
            rand,
            local_sessid,
            state: ResponderState::Idle,
            local_fabric_idx: 0,
            tt_hash: None,
            our_random: [0; CASE_RANDOM_LEN],
            our_pub_key: [0; EC_POINT_LEN_BYTES],
            peer_pub_key: [0; EC_POINT_LEN_BYTES],
            peer_sessid: 0,
            shared_secret: Zeroizing::new([0; ECDH_SHARED_SECRET_LEN_BYTES]),
            resumption_id: [0; RESUMPTION_ID_LEN],
            pending: None,
        }
    }

    fn expects(&self, opcode: OpCode) -> bool {
        match self.state {
            ResponderState::Idle => opcode == OpCode::CASESigma1,
            ResponderState::AwaitingSigma3 => {
                // A failure report can arrive instead of Sigma3
                opcode == OpCode::CASESigma3 || opcode == OpCode::StatusReport
            }
            ResponderState::AwaitingResumeStatus => opcode == OpCode::StatusReport,
            _ => false,
        }
    }

    /// Feed one received protocol message into the state machine; the same
    /// contract as [`CaseInitiator::handle_message`].
    pub fn handle_message(
        &mut self,
        exchange: &mut dyn Exchange,
        delegate: &mut dyn PairingDelegate,
        proto_opcode: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        let opcode: OpCode =
            num::FromPrimitive::from_u8(proto_opcode).ok_or(ErrorCode::InvalidOpcode)?;
        if !self.expects(opcode) {
            return Err(ErrorCode::InvalidState.into());
        }

        let result = match opcode {
            OpCode::CASESigma1 => self.process_sigma1(exchange, payload),
            OpCode::CASESigma3 => self.process_sigma3(exchange, payload),
            OpCode::StatusReport => self.process_status(payload),
            _ => Err(ErrorCode::InvalidOpcode.into()),
        };

        match result {
            Ok(Some(established)) => {
                self.scrub();
                self.state = ResponderState::Established;
                delegate.on_session_established(established);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                // Never answer a status report with another one
                self.fail(exchange, delegate, e, opcode != OpCode::StatusReport);
                Ok(())
            }
        }
    }

    /// A response timeout signaled by the exchange layer.
    pub fn handle_timeout(
        &mut self,
        exchange: &mut dyn Exchange,
        delegate: &mut dyn PairingDelegate,
    ) {
        if matches!(
            self.state,
            ResponderState::Established | ResponderState::Failed
        ) {
            return;
        }
        self.scrub();
        self.state = ResponderState::Failed;
        exchange.close();
        delegate.on_session_establishment_error(ErrorCode::Timeout.into());
    }

    fn process_sigma1(
        &mut self,
        exchange: &mut dyn Exchange,
        payload: &[u8],
    ) -> Result<Option<EstablishedSession>, Error> {
        // Schema first: nothing cryptographic happens on a malformed message
        let r = Sigma1::from_tlv(payload)?;

        if let (Some(resumption_id), Some(resume_mic)) = (r.resumption_id, r.resume_mic) {
            if let Some(store) = self.resumptions {
                if let Some(record) = store.find_by_id(resumption_id)? {
                    let mic_valid = validate_resume_mic(
                        &record.shared_secret,
                        r.initiator_random,
                        resumption_id,
                        S1RK_INFO,
                        &RESUME1_NONCE,
                        resume_mic,
                    )
                    .is_ok();
                    if mic_valid {
                        return self.resume(exchange, &r, &record);
                    }
                    // An unverifiable resumption attempt falls through to the
                    // full handshake instead of failing, so the cache cannot
                    // be probed through error responses
                    trace!("Resumption MIC mismatch; continuing with full handshake");
                }
            }
        }

        self.full_handshake(exchange, &r, payload)
    }

    fn resume(
        &mut self,
        exchange: &mut dyn Exchange,
        r: &Sigma1,
        record: &crate::resumption::ResumptionRecord,
    ) -> Result<Option<EstablishedSession>, Error> {
        self.peer_sessid = r.initiator_sessid;
        self.local_fabric_idx = record.local_fabric_idx;

        (self.rand)(&mut self.resumption_id);

        let resume_mic = compute_resume_mic(
            &record.shared_secret,
            r.initiator_random,
            &self.resumption_id,
            S2RK_INFO,
            &RESUME2_NONCE,
        )?;

        let msg = Sigma2Resume {
            resumption_id: &self.resumption_id,
            resume_mic: &resume_mic,
            responder_sessid: self.local_sessid,
        };
        let mut buf = [0u8; MAX_CASE_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        msg.to_tlv(&mut wb)?;

        let salt = resume_salt(r.initiator_random, &self.resumption_id)?;

        let local_node_id = self
            .identities
            .get(record.local_fabric_idx as usize)
            .map(|fabric| fabric.node_id())
            .ok_or(ErrorCode::NotFound)?;

        let mut ctx = CryptoContext::new(
            SessionRole::Responder,
            local_node_id,
            record.peer_node_id,
            self.local_sessid,
            self.peer_sessid,
            self.rand,
        );
        ctx.init_from_secret(
            &record.shared_secret,
            salt.as_slice(),
            KeyPurpose::Resumption,
        )?;

        if let Some(store) = self.resumptions {
            store.save(
                &self.resumption_id,
                &record.shared_secret,
                record.local_fabric_idx,
                record.peer_node_id,
            )?;
        }

        self.pending = Some(EstablishedSession {
            crypto: ctx,
            peer_node_id: record.peer_node_id,
            local_fabric_idx: record.local_fabric_idx,
            resumption_id: self.resumption_id,
        });

        exchange.send(OpCode::CASESigma2Resume as u8, wb.as_slice())?;
        self.state = ResponderState::AwaitingResumeStatus;
        Ok(None)
    }

    fn full_handshake(
        &mut self,
        exchange: &mut dyn Exchange,
        r: &Sigma1,
        payload: &[u8],
    ) -> Result<Option<EstablishedSession>, Error> {
        let Some(fabric_idx) = self
            .identities
            .iter()
            .position(|fabric| fabric.match_dest_id(r.initiator_random, r.dest_id).is_ok())
        else {
            // The failure path reports NoSharedTrustRoots for this
            error!("No identity matches the destination id");
            return Err(ErrorCode::NotFound.into());
        };
        self.local_fabric_idx = fabric_idx as u8;
        let fabric = &self.identities[fabric_idx];
        trace!("Destination id matched to fabric index {}", fabric_idx);

        self.peer_sessid = r.initiator_sessid;
        self.peer_pub_key.copy_from_slice(r.peer_pub_key);

        let mut tt = Sha256::new()?;
        tt.update(payload)?;

        // Fresh ephemeral key pair for this attempt
        let key_pair = KeyPair::new(self.rand)?;
        key_pair.get_public_key(&mut self.our_pub_key)?;
        let len = key_pair.derive_secret(r.peer_pub_key, &mut self.shared_secret[..])?;
        if len != ECDH_SHARED_SECRET_LEN_BYTES {
            return Err(ErrorCode::Crypto.into());
        }

        (self.rand)(&mut self.our_random);
        (self.rand)(&mut self.resumption_id);

        let mut tbs = [0u8; MAX_TBS_TBE_LEN];
        let tbs_len = proto::write_tbs(
            &mut tbs,
            fabric.noc(),
            fabric.icac(),
            &self.our_pub_key,
            &self.peer_pub_key,
        )?;
        let mut signature = [0u8; EC_SIGNATURE_LEN_BYTES];
        fabric.sign_msg(&tbs[..tbs_len], &mut signature)?;

        let mut tbe = [0u8; MAX_TBS_TBE_LEN];
        let mut wb = WriteBuf::new(&mut tbe);
        SigmaTbe {
            noc: fabric.noc(),
            icac: fabric.icac(),
            signature: &signature,
            resumption_id: Some(&self.resumption_id),
        }
        .to_tlv(&mut wb)?;

        let tt1_hash = current_hash(&tt)?;
        let mut sigma2_key = Zeroizing::new([0u8; SYMM_KEY_LEN_BYTES]);
        compute_sigma2_key(
            fabric.ipk().op_key(),
            &self.our_random,
            &self.our_pub_key,
            &tt1_hash,
            &self.shared_secret[..],
            sigma2_key.as_mut(),
        )?;

        wb.append(&[0u8; AEAD_MIC_LEN_BYTES])?;
        let cipher_text = wb.as_mut_slice();
        let data_len = cipher_text.len() - AEAD_MIC_LEN_BYTES;
        crypto::encrypt_in_place(
            sigma2_key.as_ref(),
            &SIGMA2_NONCE,
            &[],
            cipher_text,
            data_len,
        )?;

        let msg = Sigma2 {
            responder_random: &self.our_random,
            responder_sessid: self.local_sessid,
            responder_pub_key: &self.our_pub_key,
            encrypted2: wb.as_slice(),
        };
        let mut buf = [0u8; MAX_CASE_MSG_LEN];
        let mut msg_wb = WriteBuf::new(&mut buf);
        msg.to_tlv(&mut msg_wb)?;

        tt.update(msg_wb.as_slice())?;
        self.tt_hash = Some(tt);

        exchange.send(OpCode::CASESigma2 as u8, msg_wb.as_slice())?;
        self.state = ResponderState::AwaitingSigma3;
        Ok(None)
    }

    fn process_sigma3(
        &mut self,
        exchange: &mut dyn Exchange,
        payload: &[u8],
    ) -> Result<Option<EstablishedSession>, Error> {
        let fabric = self
            .identities
            .get(self.local_fabric_idx as usize)
            .ok_or(ErrorCode::InvalidState)?;

        let r = Sigma3::from_tlv(payload)?;

        let tt = self.tt_hash.as_mut().ok_or(ErrorCode::InvalidState)?;
        let tt12_hash = current_hash(tt)?;

        let mut sigma3_key = Zeroizing::new([0u8; SYMM_KEY_LEN_BYTES]);
        compute_sigma3_key(
            fabric.ipk().op_key(),
            &tt12_hash,
            &self.shared_secret[..],
            sigma3_key.as_mut(),
        )?;

        let mut decrypted = [0u8; MAX_TBS_TBE_LEN];
        if r.encrypted3.len() > decrypted.len() {
            error!("Encrypted data too large");
            return Err(ErrorCode::BufferTooSmall.into());
        }
        let decrypted = &mut decrypted[..r.encrypted3.len()];
        decrypted.copy_from_slice(r.encrypted3);
        let len = crypto::decrypt_in_place(sigma3_key.as_ref(), &SIGMA3_NONCE, &[], decrypted)?;
        let decrypted = &decrypted[..len];

        let d = SigmaTbe::from_tlv(decrypted, false)?;

        if let Err(e) = self.certs.validate_chain(d.noc, d.icac, fabric.root_ca()) {
            error!("Certificate chain doesn't match: {}", e);
            return Err(ErrorCode::InvalidCertificate.into());
        }
        let peer_identity = self.certs.identity(d.noc)?;
        if peer_identity.fabric_id != fabric.fabric_id() {
            error!("Initiator fabric id doesn't match");
            return Err(ErrorCode::InvalidCertificate.into());
        }

        let mut tbs = [0u8; MAX_TBS_TBE_LEN];
        let tbs_len = proto::write_tbs(
            &mut tbs,
            d.noc,
            d.icac,
            &self.peer_pub_key,
            &self.our_pub_key,
        )?;
        let initiator_pub_key = self.certs.public_key(d.noc)?;
        KeyPair::new_from_public(&initiator_pub_key)?.verify_msg(&tbs[..tbs_len], d.signature)?;

        // Only now does this message enter the transcript
        tt.update(payload)?;
        let tt_final = current_hash(tt)?;

        let salt = session_keys_salt(fabric.ipk().op_key(), &tt_final)?;
        let mut ctx = CryptoContext::new(
            SessionRole::Responder,
            fabric.node_id(),
            peer_identity.node_id,
            self.local_sessid,
            self.peer_sessid,
            self.rand,
        );
        ctx.init_from_secret(&self.shared_secret[..], salt.as_slice(), KeyPurpose::Session)?;

        if let Some(store) = self.resumptions {
            store.save(
                &self.resumption_id,
                &*self.shared_secret,
                self.local_fabric_idx,
                peer_identity.node_id,
            )?;
        }

        let established = EstablishedSession {
            crypto: ctx,
            peer_node_id: peer_identity.node_id,
            local_fabric_idx: self.local_fabric_idx,
            resumption_id: self.resumption_id,
        };

        send_status_report(exchange, SCStatusCodes::SessionEstablishmentSuccess)?;

        Ok(Some(established))
    }

    fn process_status(&mut self, payload: &[u8]) -> Result<Option<EstablishedSession>, Error> {
        let report = StatusReport::read(payload)?;
        if report.general_code != GeneralCode::Success
            || report.proto_id != PROTO_ID_SECURE_CHANNEL as u32
            || report.proto_code != SCStatusCodes::SessionEstablishmentSuccess as u16
        {
            error!("Peer reported session establishment failure: {:?}", report);
            return Err(ErrorCode::Invalid.into());
        }
        if self.pending.is_none() {
            return Err(ErrorCode::Invalid.into());
        }

        Ok(self.pending.take())
    }

    fn fail(
        &mut self,
        exchange: &mut dyn Exchange,
        delegate: &mut dyn PairingDelegate,
        e: Error,
        notify_peer: bool,
    ) {
        if notify_peer {
            let status = match e.code() {
                ErrorCode::NotFound => SCStatusCodes::NoSharedTrustRoots,
                _ => SCStatusCodes::InvalidParameter,
            };
            let _ = send_status_report(exchange, status);
        }
        self.scrub();
        self.state = ResponderState::Failed;
        exchange.close();
        delegate.on_session_establishment_error(e);
    }

    fn scrub(&mut self) {
        self.tt_hash = None;
        self.shared_secret.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{CertIdentity, CertProvider};
    use crate::utils::rand::sys_rand;

    struct NoCerts;

    impl CertProvider for NoCerts {
        fn validate_chain(
            &self,
            _noc: &[u8],
            _icac: Option<&[u8]>,
            _root_ca: &[u8],
        ) -> Result<(), Error> {
            Err(ErrorCode::InvalidCertificate.into())
        }

        fn public_key(&self, _cert: &[u8]) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
            Err(ErrorCode::InvalidCertificate.into())
        }

        fn identity(&self, _noc: &[u8]) -> Result<CertIdentity, Error> {
            Err(ErrorCode::InvalidCertificate.into())
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        established: usize,
        error: Option<ErrorCode>,
    }

    impl PairingDelegate for RecordingDelegate {
        fn on_session_established(&mut self, _session: EstablishedSession) {
            self.established += 1;
        }

        fn on_session_establishment_error(&mut self, err: Error) {
            self.error = Some(err.code());
        }
    }

    #[derive(Default)]
    struct RecordingExchange {
        sent: Vec<(u8, Vec<u8>)>,
        closed: bool,
    }

    impl Exchange for RecordingExchange {
        fn send(&mut self, proto_opcode: u8, payload: &[u8]) -> Result<(), Error> {
            self.sent.push((proto_opcode, payload.to_vec()));
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn test_responder_rejects_early_sigma3_without_state_change() {
        let certs = NoCerts;
        let mut responder = CaseResponder::new(&[], &certs, None, sys_rand, 1);
        let mut exch = RecordingExchange::default();
        let mut delegate = RecordingDelegate::default();

        let err = responder
            .handle_message(&mut exch, &mut delegate, OpCode::CASESigma3 as u8, &[21, 24])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);

        // Nothing moved: no transcript, no key material, no callbacks, and the
        // exchange saw no traffic
        assert_eq!(responder.state, ResponderState::Idle);
        assert!(responder.tt_hash.is_none());
        assert!(exch.sent.is_empty());
        assert!(!exch.closed);
        assert_eq!(delegate.established, 0);
        assert!(delegate.error.is_none());
    }

    #[test]
    fn test_responder_fails_terminally_on_malformed_sigma1() {
        let certs = NoCerts;
        let mut responder = CaseResponder::new(&[], &certs, None, sys_rand, 1);
        let mut exch = RecordingExchange::default();
        let mut delegate = RecordingDelegate::default();

        // Resumption id present but MIC absent: schema error, rejected before
        // any crypto
        let random = [0x01; CASE_RANDOM_LEN];
        let dest_id = [0x02; SHA256_HASH_LEN_BYTES];
        let pub_key = [0x03; EC_POINT_LEN_BYTES];
        let id = [0x04; RESUMPTION_ID_LEN];
        let msg = Sigma1 {
            initiator_random: &random,
            initiator_sessid: 5,
            dest_id: &dest_id,
            peer_pub_key: &pub_key,
            resumption_id: Some(&id),
            resume_mic: None,
        };
        let mut buf = [0u8; MAX_CASE_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        msg.to_tlv(&mut wb).unwrap();

        responder
            .handle_message(
                &mut exch,
                &mut delegate,
                OpCode::CASESigma1 as u8,
                wb.as_slice(),
            )
            .unwrap();

        assert_eq!(responder.state, ResponderState::Failed);
        assert_eq!(delegate.error, Some(ErrorCode::InvalidArgument));
        assert!(exch.closed);

        // A failed instance stays failed: even a valid-looking message is now
        // out of state
        let err = responder
            .handle_message(&mut exch, &mut delegate, OpCode::CASESigma1 as u8, &[21, 24])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert_eq!(delegate.established, 0);
    }

    #[test]
    fn test_initiator_rejects_reuse() {
        let certs = NoCerts;
        let mut exch = RecordingExchange::default();
        let mut delegate = RecordingDelegate::default();

        let key_pair = KeyPair::new(sys_rand).unwrap();
        let fabric = test_fabric(key_pair);
        let mut initiator = CaseInitiator::new(&fabric, &certs, None, sys_rand, 2, 7, 0);

        // Sigma2 before start: out of state, no mutation
        let err = initiator
            .handle_message(&mut exch, &mut delegate, OpCode::CASESigma2 as u8, &[21, 24])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert_eq!(initiator.state, InitiatorState::Idle);

        initiator.start(&mut exch).unwrap();
        assert_eq!(initiator.state, InitiatorState::AwaitingSigma2);
        assert_eq!(exch.sent.len(), 1);
        assert_eq!(exch.sent[0].0, OpCode::CASESigma1 as u8);

        // Starting the same instance twice is a contract violation
        let err = initiator.start(&mut exch).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let certs = NoCerts;
        let mut responder = CaseResponder::new(&[], &certs, None, sys_rand, 1);
        let mut exch = RecordingExchange::default();
        let mut delegate = RecordingDelegate::default();

        let err = responder
            .handle_message(&mut exch, &mut delegate, 0x7f, &[])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOpcode);
    }

    #[test]
    fn test_timeout_is_terminal() {
        let certs = NoCerts;
        let key_pair = KeyPair::new(sys_rand).unwrap();
        let fabric = test_fabric(key_pair);
        let mut initiator = CaseInitiator::new(&fabric, &certs, None, sys_rand, 2, 7, 0);
        let mut exch = RecordingExchange::default();
        let mut delegate = RecordingDelegate::default();

        initiator.start(&mut exch).unwrap();
        initiator.handle_timeout(&mut exch, &mut delegate);

        assert_eq!(initiator.state, InitiatorState::Failed);
        assert_eq!(delegate.error, Some(ErrorCode::Timeout));
        assert!(exch.closed);

        // A second timeout must not produce a second terminal callback
        delegate.error = None;
        initiator.handle_timeout(&mut exch, &mut delegate);
        assert!(delegate.error.is_none());
    }

    fn test_fabric(key_pair: KeyPair) -> Fabric {
        struct FixedCerts;

        impl CertProvider for FixedCerts {
            fn validate_chain(
                &self,
                _noc: &[u8],
                _icac: Option<&[u8]>,
                _root_ca: &[u8],
            ) -> Result<(), Error> {
                Ok(())
            }

            fn public_key(&self, _cert: &[u8]) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
                let mut key = [4u8; EC_POINT_LEN_BYTES];
                key[1] = 1;
                Ok(key)
            }

            fn identity(&self, _noc: &[u8]) -> Result<CertIdentity, Error> {
                Ok(CertIdentity {
                    fabric_id: 0x100,
                    node_id: 0x200,
                })
            }
        }

        Fabric::new(
            key_pair,
            b"root".to_vec(),
            None,
            b"noc".to_vec(),
            &[0x99; 16],
            &FixedCerts,
        )
        .unwrap()
    }
}
