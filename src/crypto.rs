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

//! Cryptographic primitive layer.
//!
//! Thin wrappers over the RustCrypto crates, exposing exactly the operations
//! the session-establishment protocol needs: SHA-256, HMAC-SHA256,
//! HKDF-SHA256, AES-128-CCM, AES-128-CTR and P-256 ECDH/ECDSA.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::KeyInit;
use ccm::consts::{U13, U16};
use ccm::{AeadInPlace, Ccm};
use ctr::cipher::{KeyIvInit, StreamCipher};
use elliptic_curve::sec1::ToEncodedPoint;
use hmac::Mac;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::Digest;

use crate::error::{Error, ErrorCode};
use crate::utils::rand::{Rand, RandRngCore};

pub const SYMM_KEY_LEN_BYTES: usize = 16;

pub const AEAD_NONCE_LEN_BYTES: usize = 13;
pub const AEAD_MIC_LEN_BYTES: usize = 16;

pub const SHA256_HASH_LEN_BYTES: usize = 32;

pub const EC_POINT_LEN_BYTES: usize = 65;
pub const EC_SIGNATURE_LEN_BYTES: usize = 64;
pub const ECDH_SHARED_SECRET_LEN_BYTES: usize = 32;
pub const BIGNUM_LEN_BYTES: usize = 32;

type AesCcm = Ccm<Aes128, U16, U13>;
type AesCtr = ctr::Ctr128BE<Aes128>;

#[derive(Clone)]
pub struct Sha256 {
    hasher: sha2::Sha256,
}

impl Sha256 {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            hasher: sha2::Sha256::new(),
        })
    }

    pub fn update(&mut self, data: &[u8]) -> Result<(), Error> {
        self.hasher.update(data);
        Ok(())
    }

    pub fn finish(self, digest: &mut [u8]) -> Result<(), Error> {
        if digest.len() != SHA256_HASH_LEN_BYTES {
            return Err(ErrorCode::InvalidArgument.into());
        }
        digest.copy_from_slice(self.hasher.finalize().as_slice());
        Ok(())
    }
}

pub struct HmacSha256 {
    inner: hmac::Hmac<sha2::Sha256>,
}

impl HmacSha256 {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            inner: <hmac::Hmac<sha2::Sha256> as hmac::Mac>::new_from_slice(key)?,
        })
    }

    pub fn update(&mut self, data: &[u8]) -> Result<(), Error> {
        self.inner.update(data);
        Ok(())
    }

    pub fn finish(self, out: &mut [u8]) -> Result<(), Error> {
        if out.len() != SHA256_HASH_LEN_BYTES {
            return Err(ErrorCode::InvalidArgument.into());
        }
        out.copy_from_slice(&self.inner.finalize().into_bytes());
        Ok(())
    }
}

enum KeyType {
    Private(p256::SecretKey),
    Public(p256::PublicKey),
}

/// A P-256 key pair (or a public-key-only half of one).
///
/// The wrapped secret key zeroizes itself on drop, which is what makes
/// ephemeral handshake keys safe to hold as plain values.
pub struct KeyPair {
    key: KeyType,
}

impl KeyPair {
    pub fn new(rand: Rand) -> Result<Self, Error> {
        let mut rng = RandRngCore(rand);
        let secret_key = p256::SecretKey::random(&mut rng);

        Ok(Self {
            key: KeyType::Private(secret_key),
        })
    }

    pub fn new_from_components(_pub_key: &[u8], priv_key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            key: KeyType::Private(p256::SecretKey::from_slice(priv_key)?),
        })
    }

    pub fn new_from_public(pub_key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            key: KeyType::Public(p256::PublicKey::from_sec1_bytes(pub_key)?),
        })
    }

    fn private_key(&self) -> Result<&p256::SecretKey, Error> {
        match &self.key {
            KeyType::Private(key) => Ok(key),
            KeyType::Public(_) => Err(ErrorCode::Invalid.into()),
        }
    }

    pub fn get_public_key(&self, pub_key: &mut [u8]) -> Result<usize, Error> {
        let point = match &self.key {
            KeyType::Private(key) => key.public_key().to_encoded_point(false),
            KeyType::Public(key) => key.to_encoded_point(false),
        };
        let len = point.as_bytes().len();
        if pub_key.len() < len {
            return Err(ErrorCode::NoSpace.into());
        }
        pub_key[..len].copy_from_slice(point.as_bytes());
        Ok(len)
    }

    pub fn get_private_key(&self, priv_key: &mut [u8]) -> Result<usize, Error> {
        let key = self.private_key()?;
        let bytes = key.to_bytes();
        let len = bytes.len();
        if priv_key.len() < len {
            return Err(ErrorCode::NoSpace.into());
        }
        priv_key[..len].copy_from_slice(bytes.as_slice());
        Ok(len)
    }

    pub fn derive_secret(&self, peer_pub_key: &[u8], secret: &mut [u8]) -> Result<usize, Error> {
        let key = self.private_key()?;
        let peer_pub_key = p256::PublicKey::from_sec1_bytes(peer_pub_key)?;

        let shared = p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), peer_pub_key.as_affine());
        let shared = shared.raw_secret_bytes();
        if secret.len() < shared.len() {
            return Err(ErrorCode::NoSpace.into());
        }
        secret[..shared.len()].copy_from_slice(shared.as_slice());
        Ok(shared.len())
    }

    pub fn sign_msg(&self, msg: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        let key = self.private_key()?;
        if signature.len() < EC_SIGNATURE_LEN_BYTES {
            return Err(ErrorCode::NoSpace.into());
        }

        let signing_key = SigningKey::from(key);
        let sig: Signature = signing_key.sign(msg);
        signature[..EC_SIGNATURE_LEN_BYTES].copy_from_slice(&sig.to_bytes());
        Ok(EC_SIGNATURE_LEN_BYTES)
    }

    pub fn verify_msg(&self, msg: &[u8], signature: &[u8]) -> Result<(), Error> {
        let verifying_key = match &self.key {
            KeyType::Private(key) => *SigningKey::from(key).verifying_key(),
            KeyType::Public(key) => VerifyingKey::from(*key),
        };
        let sig = Signature::from_slice(signature)?;
        verifying_key
            .verify(msg, &sig)
            .map_err(|_| Error::new(ErrorCode::Crypto))
    }
}

pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], key: &mut [u8]) -> Result<(), Error> {
    hkdf::Hkdf::<sha2::Sha256>::new(Some(salt), ikm)
        .expand(info, key)
        .map_err(|_| Error::new(ErrorCode::Crypto))
}

/// AEAD-encrypt `data[..data_len]` in place, appending the MIC.
///
/// `data` must have room for `data_len + AEAD_MIC_LEN_BYTES` bytes; the
/// written length is returned.
pub fn encrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
    data_len: usize,
) -> Result<usize, Error> {
    if key.len() != SYMM_KEY_LEN_BYTES || nonce.len() != AEAD_NONCE_LEN_BYTES {
        return Err(ErrorCode::InvalidArgument.into());
    }
    if data.len() < data_len + AEAD_MIC_LEN_BYTES {
        return Err(ErrorCode::NoSpace.into());
    }

    let cipher = AesCcm::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(nonce);

    let tag = cipher.encrypt_in_place_detached(nonce, ad, &mut data[..data_len])?;
    data[data_len..(data_len + AEAD_MIC_LEN_BYTES)].copy_from_slice(tag.as_slice());

    Ok(data_len + AEAD_MIC_LEN_BYTES)
}

/// AEAD-decrypt `data` (ciphertext followed by MIC) in place.
///
/// Returns the plaintext length. A MIC mismatch surfaces as the generic
/// `Crypto` error; wrong key and tampered data are indistinguishable.
pub fn decrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
) -> Result<usize, Error> {
    if key.len() != SYMM_KEY_LEN_BYTES || nonce.len() != AEAD_NONCE_LEN_BYTES {
        return Err(ErrorCode::InvalidArgument.into());
    }
    if data.len() < AEAD_MIC_LEN_BYTES {
        return Err(ErrorCode::TruncatedPacket.into());
    }

    let data_len = data.len() - AEAD_MIC_LEN_BYTES;

    let cipher = AesCcm::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(nonce);

    let mut tag = [0u8; AEAD_MIC_LEN_BYTES];
    tag.copy_from_slice(&data[data_len..]);

    cipher.decrypt_in_place_detached(
        nonce,
        ad,
        &mut data[..data_len],
        GenericArray::from_slice(&tag),
    )?;

    Ok(data_len)
}

/// Apply the AES-128-CTR keystream for the given 13-byte nonce to `data`.
///
/// The counter blocks follow the CCM* layout: flags octet 0x01 (2-octet
/// counter), the nonce, and a big-endian counter starting at 1. Used for the
/// header privacy transform, where encrypt and decrypt are the same XOR.
pub fn aes_ctr_in_place(key: &[u8], nonce: &[u8], data: &mut [u8]) -> Result<(), Error> {
    if key.len() != SYMM_KEY_LEN_BYTES || nonce.len() != AEAD_NONCE_LEN_BYTES {
        return Err(ErrorCode::InvalidArgument.into());
    }

    let mut iv = [0u8; 16];
    iv[0] = 0x01;
    iv[1..14].copy_from_slice(nonce);
    iv[15] = 0x01;

    let mut cipher = AesCtr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    cipher.apply_keystream(data);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::rand::sys_rand;

    fn test_nonce(ctr: u32, node_id: u64) -> [u8; AEAD_NONCE_LEN_BYTES] {
        let mut nonce = [0u8; AEAD_NONCE_LEN_BYTES];
        nonce[1..5].copy_from_slice(&ctr.to_le_bytes());
        nonce[5..13].copy_from_slice(&node_id.to_le_bytes());
        nonce
    }

    #[test]
    fn test_decrypt_success() {
        // These values are captured from an execution run of the chip-tool binary
        let recvd_ctr = 15287282;
        let input_buf: [u8; 71] = [
            0x0, 0x2, 0x0, 0x0, 0xf2, 0x43, 0xe9, 0x0, 0x31, 0xb5, 0x66, 0xec, 0x8b, 0x5b, 0xf4,
            0x17, 0xe4, 0x80, 0xf3, 0xd5, 0x11, 0x59, 0x19, 0xb5, 0x23, 0x91, 0x35, 0x37, 0xb,
            0xf9, 0xbf, 0x69, 0x55, 0x11, 0x75, 0x87, 0x77, 0x19, 0xfc, 0xf3, 0x5d, 0x4b, 0x47,
            0x1f, 0xb0, 0x5e, 0xbe, 0xb5, 0x10, 0xad, 0xc6, 0x78, 0x94, 0x50, 0xe5, 0xd2, 0xe0,
            0x80, 0xef, 0xa8, 0x3a, 0xf0, 0xa6, 0xaf, 0x1b, 0x2, 0x35, 0xa7, 0xd1, 0xc6, 0x32,
        ];
        let key = [
            0x66, 0x63, 0x31, 0x97, 0x43, 0x9c, 0x17, 0xb9, 0x7e, 0x10, 0xee, 0x47, 0xc8, 0x8,
            0x80, 0x4a,
        ];

        let aad = &input_buf[..8];
        let mut data = [0u8; 63];
        data.copy_from_slice(&input_buf[8..]);

        let len = decrypt_in_place(&key, &test_nonce(recvd_ctr, 0), aad, &mut data).unwrap();
        assert_eq!(
            &data[..len],
            [
                0x5, 0x8, 0x70, 0x0, 0x1, 0x0, 0x15, 0x28, 0x0, 0x28, 0x1, 0x36, 0x2, 0x15, 0x37,
                0x0, 0x24, 0x0, 0x0, 0x24, 0x1, 0x30, 0x24, 0x2, 0x2, 0x18, 0x35, 0x1, 0x24, 0x0,
                0x0, 0x2c, 0x1, 0x2, 0x57, 0x57, 0x24, 0x2, 0x3, 0x25, 0x3, 0xb8, 0xb, 0x18, 0x18,
                0x18, 0x18
            ]
        );
    }

    #[test]
    fn test_encrypt_success() {
        // These values are captured from an execution run of the chip-tool binary
        let send_ctr = 41;

        let plain_hdr: [u8; 8] = [0x0, 0x11, 0x0, 0x0, 0x29, 0x0, 0x0, 0x0];

        let plain_text: [u8; 28] = [
            5, 8, 0x58, 0x28, 0x01, 0x00, 0x15, 0x36, 0x00, 0x15, 0x37, 0x00, 0x24, 0x00, 0x01,
            0x24, 0x02, 0x06, 0x24, 0x03, 0x01, 0x18, 0x35, 0x01, 0x18, 0x18, 0x18, 0x18,
        ];
        let key = [
            0x44, 0xd4, 0x3c, 0x91, 0xd2, 0x27, 0xf3, 0xba, 0x08, 0x24, 0xc5, 0xd8, 0x7c, 0xb8,
            0x1b, 0x33,
        ];

        let mut data = [0u8; 28 + AEAD_MIC_LEN_BYTES];
        data[..28].copy_from_slice(&plain_text);

        let len =
            encrypt_in_place(&key, &test_nonce(send_ctr, 0), &plain_hdr, &mut data, 28).unwrap();
        assert_eq!(
            &data[..len],
            [
                189, 83, 250, 121, 38, 87, 97, 17, 153, 78, 243, 20, 36, 11, 131, 142, 136, 165,
                227, 107, 204, 129, 193, 153, 42, 131, 138, 254, 22, 190, 76, 244, 116, 45, 156,
                215, 229, 130, 215, 147, 73, 21, 88, 216
            ]
        );
    }

    #[test]
    fn test_tamper_detection() {
        let key = [0x42; SYMM_KEY_LEN_BYTES];
        let nonce = test_nonce(7, 0xcafe);
        let aad = [1, 2, 3, 4];

        let mut data = [0u8; 16 + AEAD_MIC_LEN_BYTES];
        data[..16].copy_from_slice(b"the lights is on");
        let len = encrypt_in_place(&key, &nonce, &aad, &mut data, 16).unwrap();

        for bit in 0..(len * 8) {
            let mut tampered = data;
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(decrypt_in_place(&key, &nonce, &aad, &mut tampered[..len]).is_err());
        }
    }

    #[test]
    fn test_sign_verify() {
        let key_pair = KeyPair::new(sys_rand).unwrap();

        let msg = b"message to be signed";
        let mut signature = [0u8; EC_SIGNATURE_LEN_BYTES];
        let len = key_pair.sign_msg(msg, &mut signature).unwrap();
        assert_eq!(len, EC_SIGNATURE_LEN_BYTES);

        let mut pub_key = [0u8; EC_POINT_LEN_BYTES];
        key_pair.get_public_key(&mut pub_key).unwrap();

        let verifier = KeyPair::new_from_public(&pub_key).unwrap();
        verifier.verify_msg(msg, &signature).unwrap();
        assert!(verifier.verify_msg(b"a different message", &signature).is_err());
    }

    #[test]
    fn test_ecdh_agreement() {
        let a = KeyPair::new(sys_rand).unwrap();
        let b = KeyPair::new(sys_rand).unwrap();

        let mut a_pub = [0u8; EC_POINT_LEN_BYTES];
        let mut b_pub = [0u8; EC_POINT_LEN_BYTES];
        a.get_public_key(&mut a_pub).unwrap();
        b.get_public_key(&mut b_pub).unwrap();

        let mut secret_ab = [0u8; ECDH_SHARED_SECRET_LEN_BYTES];
        let mut secret_ba = [0u8; ECDH_SHARED_SECRET_LEN_BYTES];
        a.derive_secret(&b_pub, &mut secret_ab).unwrap();
        b.derive_secret(&a_pub, &mut secret_ba).unwrap();

        assert_eq!(secret_ab, secret_ba);
    }

    #[test]
    fn test_aes_ctr_roundtrip() {
        let key = [0x13; SYMM_KEY_LEN_BYTES];
        let nonce = [0x07; AEAD_NONCE_LEN_BYTES];

        let mut data = *b"obfuscated header fields";
        aes_ctr_in_place(&key, &nonce, &mut data).unwrap();
        assert_ne!(&data, b"obfuscated header fields");

        aes_ctr_in_place(&key, &nonce, &mut data).unwrap();
        assert_eq!(&data, b"obfuscated header fields");
    }
}
