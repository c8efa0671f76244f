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

//! The local operational identity of a node on one fabric: its certificate
//! chain, operational key pair and identity protection key. Instances are
//! constructed by the caller at startup and passed into the session machinery
//! by reference; there is no process-wide fabric registry here.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cert::CertProvider;
use crate::crypto::{self, HmacSha256, KeyPair};
use crate::error::{Error, ErrorCode};

const COMPRESSED_FABRIC_ID_LEN: usize = 8;

/// The identity-protection key set: the fabric-wide epoch key and the
/// operational key derived from it, which is what every handshake
/// computation actually uses.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    epoch_key: [u8; crypto::SYMM_KEY_LEN_BYTES],
    op_key: [u8; crypto::SYMM_KEY_LEN_BYTES],
}

impl KeySet {
    pub fn new(epoch_key: &[u8], compressed_id: &[u8]) -> Result<Self, Error> {
        if epoch_key.len() != crypto::SYMM_KEY_LEN_BYTES {
            return Err(ErrorCode::InvalidArgument.into());
        }
        let mut ks = KeySet::default();
        KeySet::op_key_from_ipk(epoch_key, compressed_id, &mut ks.op_key)?;
        ks.epoch_key.copy_from_slice(epoch_key);
        Ok(ks)
    }

    fn op_key_from_ipk(ipk: &[u8], compressed_id: &[u8], opkey: &mut [u8]) -> Result<(), Error> {
        const GRP_KEY_INFO: &[u8] = b"GroupKey v1.0";

        crypto::hkdf_sha256(compressed_id, ipk, GRP_KEY_INFO, opkey)
    }

    pub fn op_key(&self) -> &[u8] {
        &self.op_key
    }

    pub fn epoch_key(&self) -> &[u8] {
        &self.epoch_key
    }
}

/// A local operational identity: this node's membership in one fabric.
pub struct Fabric {
    node_id: u64,
    fabric_id: u64,
    key_pair: KeyPair,
    root_ca: Vec<u8>,
    icac: Option<Vec<u8>>,
    noc: Vec<u8>,
    root_pub_key: [u8; crypto::EC_POINT_LEN_BYTES],
    ipk: KeySet,
    compressed_id: [u8; COMPRESSED_FABRIC_ID_LEN],
}

impl Fabric {
    /// Assemble a local identity from its certificate chain and key material.
    ///
    /// The node and fabric ids and the root public key are pulled out of the
    /// certificates through the caller-supplied provider, so that this crate
    /// never interprets certificate encodings itself.
    pub fn new(
        key_pair: KeyPair,
        root_ca: Vec<u8>,
        icac: Option<Vec<u8>>,
        noc: Vec<u8>,
        ipk_epoch_key: &[u8],
        certs: &dyn CertProvider,
    ) -> Result<Self, Error> {
        let identity = certs.identity(&noc)?;
        let root_pub_key = certs.public_key(&root_ca)?;

        let mut compressed_id = [0; COMPRESSED_FABRIC_ID_LEN];
        Fabric::get_compressed_id(&root_pub_key, identity.fabric_id, &mut compressed_id)?;
        let ipk = KeySet::new(ipk_epoch_key, &compressed_id)?;

        Ok(Self {
            node_id: identity.node_id,
            fabric_id: identity.fabric_id,
            key_pair,
            root_ca,
            icac,
            noc,
            root_pub_key,
            ipk,
            compressed_id,
        })
    }

    fn get_compressed_id(root_pubkey: &[u8], fabric_id: u64, out: &mut [u8]) -> Result<(), Error> {
        // The uncompressed-point prefix octet is not part of the derivation
        let root_pubkey = &root_pubkey[1..];
        let mut fabric_id_be: [u8; 8] = [0; 8];
        BigEndian::write_u64(&mut fabric_id_be, fabric_id);
        const COMPRESSED_FABRIC_ID_INFO: &[u8] = b"CompressedFabric";

        crypto::hkdf_sha256(&fabric_id_be, root_pubkey, COMPRESSED_FABRIC_ID_INFO, out)
    }

    /// Compute the destination identifier binding a Sigma1 to `node_id` on
    /// this fabric.
    pub fn compute_dest_id(
        &self,
        initiator_random: &[u8],
        node_id: u64,
        out: &mut [u8],
    ) -> Result<(), Error> {
        if out.len() != crypto::SHA256_HASH_LEN_BYTES {
            return Err(ErrorCode::InvalidArgument.into());
        }

        let mut mac = HmacSha256::new(self.ipk.op_key())?;

        mac.update(initiator_random)?;
        mac.update(&self.root_pub_key)?;

        let mut buf: [u8; 8] = [0; 8];
        LittleEndian::write_u64(&mut buf, self.fabric_id);
        mac.update(&buf)?;

        LittleEndian::write_u64(&mut buf, node_id);
        mac.update(&buf)?;

        mac.finish(out)
    }

    /// Check whether a received destination identifier addresses this node.
    ///
    /// The comparison is constant-time, so a responder holding several
    /// identities does not leak which one matched through the compare itself.
    pub fn match_dest_id(&self, initiator_random: &[u8], target: &[u8]) -> Result<(), Error> {
        let mut id = [0_u8; crypto::SHA256_HASH_LEN_BYTES];
        self.compute_dest_id(initiator_random, self.node_id, &mut id)?;

        if id.as_slice().ct_eq(target).into() {
            Ok(())
        } else {
            Err(ErrorCode::NotFound.into())
        }
    }

    pub fn sign_msg(&self, msg: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        self.key_pair.sign_msg(msg, signature)
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn fabric_id(&self) -> u64 {
        self.fabric_id
    }

    pub fn ipk(&self) -> &KeySet {
        &self.ipk
    }

    pub fn noc(&self) -> &[u8] {
        &self.noc
    }

    pub fn icac(&self) -> Option<&[u8]> {
        self.icac.as_deref()
    }

    pub fn root_ca(&self) -> &[u8] {
        &self.root_ca
    }

    pub fn root_pub_key(&self) -> &[u8] {
        &self.root_pub_key
    }

    pub fn compressed_id(&self) -> &[u8] {
        &self.compressed_id
    }
}
