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

//! The exchange seam towards the reliable-messaging layer.
//!
//! The handshake state machines never touch the network. They hand outgoing
//! protocol messages to an [`Exchange`] and are re-entered by the owner with
//! each received message. Acknowledgement, retransmission and response
//! timeouts are entirely the exchange layer's concern; a timeout is delivered
//! back into the state machine as an explicit event by the owner.

use crate::error::Error;

pub trait Exchange {
    /// Send one protocol message with the given secure-channel opcode.
    fn send(&mut self, proto_opcode: u8, payload: &[u8]) -> Result<(), Error>;

    /// Close the exchange. Further sends are not expected.
    fn close(&mut self);
}
