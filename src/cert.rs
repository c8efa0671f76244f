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

//! The certificate-provider seam.
//!
//! Certificate storage, chain building and trust-anchor handling live outside
//! this crate. The handshake consumes certificates as opaque octet strings and
//! relies on a caller-supplied [`CertProvider`] to validate chains and pull
//! the leaf's public key and operational identity out of them.

use crate::crypto::EC_POINT_LEN_BYTES;
use crate::error::Error;

/// Fabric id and node id as embedded in a node operational certificate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    pub fabric_id: u64,
    pub node_id: u64,
}

/// Validation and extraction over opaque operational certificates.
///
/// Implementations are expected to be stateless with respect to the handshake:
/// the session holds the provider by reference for its whole lifetime and may
/// call it from any handshake step.
pub trait CertProvider {
    /// Validate `noc` (and `icac`, when present) against the trust anchor
    /// `root_ca`.
    ///
    /// Must fail for any defect in the chain: a break in the signatures, an
    /// expired certificate, or wrong basic-constraints/key-usage on any link.
    /// The error is reported to the local application as a certificate
    /// failure; the peer only ever sees a generic failure status.
    fn validate_chain(
        &self,
        noc: &[u8],
        icac: Option<&[u8]>,
        root_ca: &[u8],
    ) -> Result<(), Error>;

    /// Extract the subject public key of the given certificate, as an
    /// uncompressed P-256 point.
    fn public_key(&self, cert: &[u8]) -> Result<[u8; EC_POINT_LEN_BYTES], Error>;

    /// Extract the operational identity embedded in the given NOC.
    fn identity(&self, noc: &[u8]) -> Result<CertIdentity, Error>;
}
