//! Client session map
//!
//! Tracks which clients hold open sessions and which of their requests
//! have completed (so a reconnecting client can be answered without
//! re-executing). The map is versioned; a flush walks through
//! `committing` to `committed`, and journal entries compare themselves
//! against those marks to decide expiry.

use crate::completion::Completion;
use bytes::Bytes;
use quillfs_common::{ClientId, ClientInst, Error, RequestId, Result, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// The serialized image of the session table, as embedded in journal
/// entries.
#[derive(Serialize, Deserialize)]
struct ClientMapImage {
    version: Version,
    sessions: BTreeMap<ClientId, ClientInst>,
}

/// The client session map.
pub struct ClientMap {
    version: Version,
    committing: Version,
    committed: Version,
    /// Head version including not-yet-journaled session changes.
    projected: Version,
    sessions: BTreeMap<ClientId, ClientInst>,
    completed_requests: HashSet<RequestId>,
    trim_waiters: HashMap<RequestId, Vec<Completion>>,
    commit_waiters: Vec<Completion>,
}

impl Default for ClientMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: 0,
            committing: 0,
            committed: 0,
            projected: 0,
            sessions: BTreeMap::new(),
            completed_requests: HashSet::new(),
            trim_waiters: HashMap::new(),
            commit_waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn get_version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn get_committing(&self) -> Version {
        self.committing
    }

    #[must_use]
    pub fn get_committed(&self) -> Version {
        self.committed
    }

    pub fn set_committing(&mut self, v: Version) {
        self.committing = v;
    }

    /// A flush finished: everything through `committing` is durable.
    pub fn mark_committed(&mut self) {
        self.committed = self.committing;
        debug!("clientmap committed through v{}", self.committed);
        for cb in self.commit_waiters.drain(..) {
            cb();
        }
    }

    pub fn add_commit_waiter(&mut self, cb: Completion) {
        self.commit_waiters.push(cb);
    }

    // ---- sessions ----

    pub fn open_session(&mut self, inst: ClientInst) {
        debug!("clientmap open session {}", inst.client);
        self.sessions.insert(inst.client, inst);
        self.version += 1;
    }

    pub fn close_session(&mut self, client: ClientId) {
        debug!("clientmap close session {}", client);
        self.sessions.remove(&client);
        self.version += 1;
    }

    #[must_use]
    pub fn have_session(&self, client: ClientId) -> bool {
        self.sessions.contains_key(&client)
    }

    #[must_use]
    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Snap the projected version back to the real one.
    pub fn reset_projected(&mut self) {
        self.projected = self.version;
    }

    #[must_use]
    pub fn get_projected(&self) -> Version {
        self.projected
    }

    // ---- completed requests ----

    pub fn add_completed_request(&mut self, reqid: RequestId) {
        self.completed_requests.insert(reqid);
    }

    #[must_use]
    pub fn have_completed_request(&self, reqid: RequestId) -> bool {
        self.completed_requests.contains(&reqid)
    }

    pub fn add_trim_waiter(&mut self, reqid: RequestId, cb: Completion) {
        self.trim_waiters.entry(reqid).or_default().push(cb);
    }

    /// Completion tracking for `reqid` is no longer needed; drop it and
    /// wake anyone waiting on the trim.
    pub fn trim_completed_request(&mut self, reqid: RequestId) {
        self.completed_requests.remove(&reqid);
        if let Some(waiters) = self.trim_waiters.remove(&reqid) {
            for cb in waiters {
                cb();
            }
        }
    }

    // ---- journal image ----

    /// Serialize the session table for embedding in a journal entry.
    pub fn encode(&self) -> Result<Bytes> {
        let image = ClientMapImage {
            version: self.version,
            sessions: self.sessions.clone(),
        };
        let buf = bincode::serialize(&image).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Replace the live session table with a journaled image.
    pub fn decode(&mut self, bytes: &Bytes) -> Result<()> {
        let image: ClientMapImage =
            bincode::deserialize(bytes).map_err(|e| Error::Decode(e.to_string()))?;
        self.sessions = image.sessions;
        self.version = image.version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::flag;

    fn inst(id: u64) -> ClientInst {
        ClientInst {
            client: ClientId(id),
            addr: "127.0.0.1:6789".parse().unwrap(),
        }
    }

    #[test]
    fn test_session_open_close_bumps_version() {
        let mut m = ClientMap::new();
        m.open_session(inst(1));
        assert_eq!(m.get_version(), 1);
        assert!(m.have_session(ClientId(1)));
        m.close_session(ClientId(1));
        assert_eq!(m.get_version(), 2);
        assert!(!m.have_session(ClientId(1)));
    }

    #[test]
    fn test_image_roundtrip() {
        let mut m = ClientMap::new();
        m.open_session(inst(1));
        m.open_session(inst(2));
        let image = m.encode().unwrap();

        let mut other = ClientMap::new();
        other.decode(&image).unwrap();
        assert_eq!(other.get_version(), 2);
        assert!(other.have_session(ClientId(1)));
        assert!(other.have_session(ClientId(2)));
    }

    #[test]
    fn test_trim_waiter_fires() {
        let mut m = ClientMap::new();
        let reqid = RequestId {
            client: ClientId(1),
            tid: 7,
        };
        m.add_completed_request(reqid);
        assert!(m.have_completed_request(reqid));

        let (cb, fired) = flag();
        m.add_trim_waiter(reqid, cb);
        m.trim_completed_request(reqid);
        assert!(!m.have_completed_request(reqid));
        assert!(fired.get());
    }

    #[test]
    fn test_commit_waiter_fires_on_mark_committed() {
        let mut m = ClientMap::new();
        m.open_session(inst(1));
        m.set_committing(1);
        let (cb, fired) = flag();
        m.add_commit_waiter(cb);
        m.mark_committed();
        assert_eq!(m.get_committed(), 1);
        assert!(fired.get());
    }
}
