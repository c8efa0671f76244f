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

//! The session-resumption cache: the outcome of successful handshakes, keyed
//! by the resumption identifier the responder handed out, so a later session
//! between the same peers can skip the certificate exchange.

use core::time::Duration;
use std::sync::Mutex;

use log::warn;
use zeroize::Zeroize;

use crate::crypto::ECDH_SHARED_SECRET_LEN_BYTES;
use crate::error::{Error, ErrorCode};
use crate::persist::KvBlobStore;
use crate::utils::epoch::Epoch;
use crate::utils::parsebuf::ParseBuf;
use crate::utils::writebuf::WriteBuf;

pub const RESUMPTION_ID_LEN: usize = 16;

pub const MAX_RESUMPTION_RECORDS: usize = 16;

const RECORD_LEN: usize = RESUMPTION_ID_LEN + ECDH_SHARED_SECRET_LEN_BYTES + 8 + 1 + 8;
const PSM_KEY: &str = "case-resumption";

#[derive(Clone)]
pub struct ResumptionRecord {
    pub resumption_id: [u8; RESUMPTION_ID_LEN],
    pub shared_secret: [u8; ECDH_SHARED_SECRET_LEN_BYTES],
    pub peer_node_id: u64,
    pub local_fabric_idx: u8,
    pub created: Duration,
}

impl Drop for ResumptionRecord {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Fixed-capacity table of resumption records shared by all concurrent
/// handshakes; a coarse lock is all the small table needs. Inserting into a
/// full table evicts the oldest record. Optionally mirrored into a key-value
/// store so resumption survives a reboot.
pub struct ResumptionStore {
    records: Mutex<heapless::Vec<ResumptionRecord, MAX_RESUMPTION_RECORDS>>,
    epoch: Epoch,
    psm: Option<Box<dyn KvBlobStore + Send + Sync>>,
}

impl ResumptionStore {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            records: Mutex::new(heapless::Vec::new()),
            epoch,
            psm: None,
        }
    }

    pub fn new_persistent(epoch: Epoch, psm: Box<dyn KvBlobStore + Send + Sync>) -> Self {
        let store = Self {
            records: Mutex::new(heapless::Vec::new()),
            epoch,
            psm: Some(psm),
        };
        if let Err(e) = store.load() {
            warn!("Failed to load resumption records: {}", e);
        }
        store
    }

    /// Record a successful handshake. An existing record for the same peer is
    /// replaced; a full table evicts its oldest entry first.
    pub fn save(
        &self,
        resumption_id: &[u8; RESUMPTION_ID_LEN],
        shared_secret: &[u8; ECDH_SHARED_SECRET_LEN_BYTES],
        local_fabric_idx: u8,
        peer_node_id: u64,
    ) -> Result<(), Error> {
        let mut records = self.records.lock()?;

        if let Some(pos) = records.iter().position(|r| r.peer_node_id == peer_node_id) {
            records.remove(pos);
        }
        if records.is_full() {
            records.remove(0);
        }

        let record = ResumptionRecord {
            resumption_id: *resumption_id,
            shared_secret: *shared_secret,
            peer_node_id,
            local_fabric_idx,
            created: (self.epoch)(),
        };
        records
            .push(record)
            .map_err(|_| Error::new(ErrorCode::NoSpace))?;

        self.persist(&records);
        Ok(())
    }

    pub fn find_by_id(
        &self,
        resumption_id: &[u8],
    ) -> Result<Option<ResumptionRecord>, Error> {
        let records = self.records.lock()?;
        Ok(records
            .iter()
            .find(|r| r.resumption_id[..] == *resumption_id)
            .cloned())
    }

    /// The initiator-side lookup: is there a cached secret for this peer?
    pub fn find_by_peer(&self, peer_node_id: u64) -> Result<Option<ResumptionRecord>, Error> {
        let records = self.records.lock()?;
        Ok(records
            .iter()
            .find(|r| r.peer_node_id == peer_node_id)
            .cloned())
    }

    /// Drop the record for a peer, if any. Used on explicit session teardown.
    pub fn invalidate(&self, peer_node_id: u64) -> Result<(), Error> {
        let mut records = self.records.lock()?;
        records.retain(|r| r.peer_node_id != peer_node_id);
        self.persist(&records);
        Ok(())
    }

    /// Drop every record scoped to the given fabric. Used on fabric removal.
    pub fn invalidate_all(&self, local_fabric_idx: u8) -> Result<(), Error> {
        let mut records = self.records.lock()?;
        records.retain(|r| r.local_fabric_idx != local_fabric_idx);
        self.persist(&records);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.records.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.records.lock()?.is_empty())
    }

    fn persist(&self, records: &[ResumptionRecord]) {
        let Some(psm) = self.psm.as_ref() else {
            return;
        };

        fn encode(records: &[ResumptionRecord], wb: &mut WriteBuf) -> Result<(), Error> {
            for record in records {
                wb.append(&record.resumption_id)?;
                wb.append(&record.shared_secret)?;
                wb.le_u64(record.peer_node_id)?;
                wb.le_u8(record.local_fabric_idx)?;
                wb.le_u64(record.created.as_secs())?;
            }
            Ok(())
        }

        let mut buf = [0u8; RECORD_LEN * MAX_RESUMPTION_RECORDS];
        let mut wb = WriteBuf::new(&mut buf);
        if encode(records, &mut wb).is_err() {
            warn!("Failed to encode resumption records");
            return;
        }

        // Persistence is best-effort; the in-memory table stays authoritative
        if let Err(e) = psm.store(PSM_KEY, wb.as_slice()) {
            warn!("Failed to persist resumption records: {}", e);
        }
    }

    fn load(&self) -> Result<(), Error> {
        let Some(psm) = self.psm.as_ref() else {
            return Ok(());
        };

        // One spare byte, so a full table does not read as buffer overrun
        let mut buf = [0u8; RECORD_LEN * MAX_RESUMPTION_RECORDS + 1];
        let Some(data) = psm.load(PSM_KEY, &mut buf)? else {
            return Ok(());
        };
        if data.len() % RECORD_LEN != 0 {
            return Err(ErrorCode::Invalid.into());
        }

        let mut data_copy = [0u8; RECORD_LEN * MAX_RESUMPTION_RECORDS];
        let data_len = data.len();
        data_copy[..data_len].copy_from_slice(data);

        let mut records = self.records.lock()?;
        records.clear();

        let mut pb = ParseBuf::new(&mut data_copy[..data_len]);
        while !pb.as_slice().is_empty() {
            let mut record = ResumptionRecord {
                resumption_id: [0; RESUMPTION_ID_LEN],
                shared_secret: [0; ECDH_SHARED_SECRET_LEN_BYTES],
                peer_node_id: 0,
                local_fabric_idx: 0,
                created: Duration::from_secs(0),
            };
            record.resumption_id = pb.parse_head_with(RESUMPTION_ID_LEN, |x| {
                let mut id = [0; RESUMPTION_ID_LEN];
                id.copy_from_slice(&x.as_slice()[..RESUMPTION_ID_LEN]);
                id
            })?;
            record.shared_secret = pb.parse_head_with(ECDH_SHARED_SECRET_LEN_BYTES, |x| {
                let mut secret = [0; ECDH_SHARED_SECRET_LEN_BYTES];
                secret.copy_from_slice(&x.as_slice()[..ECDH_SHARED_SECRET_LEN_BYTES]);
                secret
            })?;
            record.peer_node_id = pb.le_u64()?;
            record.local_fabric_idx = pb.le_u8()?;
            record.created = Duration::from_secs(pb.le_u64()?);

            records
                .push(record)
                .map_err(|_| Error::new(ErrorCode::NoSpace))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::FilePsm;
    use crate::utils::epoch::dummy_epoch;

    fn record_id(i: u8) -> [u8; RESUMPTION_ID_LEN] {
        [i; RESUMPTION_ID_LEN]
    }

    #[test]
    fn test_find_by_id_and_peer() {
        let store = ResumptionStore::new(dummy_epoch);
        store.save(&record_id(1), &[0xaa; 32], 1, 1001).unwrap();
        store.save(&record_id(2), &[0xbb; 32], 1, 1002).unwrap();

        let r = store.find_by_id(&record_id(2)).unwrap().unwrap();
        assert_eq!(r.peer_node_id, 1002);

        let r = store.find_by_peer(1001).unwrap().unwrap();
        assert_eq!(r.resumption_id, record_id(1));

        assert!(store.find_by_id(&record_id(9)).unwrap().is_none());
    }

    #[test]
    fn test_oldest_evicted_on_overflow() {
        let store = ResumptionStore::new(dummy_epoch);

        for i in 0..(MAX_RESUMPTION_RECORDS + 1) {
            store
                .save(&record_id(i as u8), &[i as u8; 32], 1, 2000 + i as u64)
                .unwrap();
        }

        assert_eq!(store.len().unwrap(), MAX_RESUMPTION_RECORDS);
        // Exactly the oldest record is gone
        assert!(store.find_by_id(&record_id(0)).unwrap().is_none());
        for i in 1..(MAX_RESUMPTION_RECORDS + 1) {
            assert!(store.find_by_id(&record_id(i as u8)).unwrap().is_some());
        }
    }

    #[test]
    fn test_same_peer_replaces() {
        let store = ResumptionStore::new(dummy_epoch);
        store.save(&record_id(1), &[0xaa; 32], 1, 1001).unwrap();
        store.save(&record_id(2), &[0xbb; 32], 1, 1001).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert!(store.find_by_id(&record_id(1)).unwrap().is_none());
        assert_eq!(
            store.find_by_peer(1001).unwrap().unwrap().resumption_id,
            record_id(2)
        );
    }

    #[test]
    fn test_survives_reload() {
        let dir = std::env::temp_dir().join(format!(
            "resumption-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));

        {
            let psm = FilePsm::new(dir.clone()).unwrap();
            let store = ResumptionStore::new_persistent(dummy_epoch, Box::new(psm));
            store.save(&record_id(1), &[0xaa; 32], 3, 1001).unwrap();
            store.save(&record_id(2), &[0xbb; 32], 3, 1002).unwrap();
        }

        let psm = FilePsm::new(dir.clone()).unwrap();
        let store = ResumptionStore::new_persistent(dummy_epoch, Box::new(psm));
        assert_eq!(store.len().unwrap(), 2);

        let r = store.find_by_id(&record_id(1)).unwrap().unwrap();
        assert_eq!(r.peer_node_id, 1001);
        assert_eq!(r.local_fabric_idx, 3);
        assert_eq!(r.shared_secret, [0xaa; 32]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_invalidate() {
        let store = ResumptionStore::new(dummy_epoch);
        store.save(&record_id(1), &[0xaa; 32], 1, 1001).unwrap();
        store.save(&record_id(2), &[0xbb; 32], 2, 1002).unwrap();
        store.save(&record_id(3), &[0xcc; 32], 2, 1003).unwrap();

        store.invalidate(1001).unwrap();
        assert!(store.find_by_peer(1001).unwrap().is_none());
        assert_eq!(store.len().unwrap(), 2);

        store.invalidate_all(2).unwrap();
        assert!(store.is_empty().unwrap());
    }
}
