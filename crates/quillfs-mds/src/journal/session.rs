//! Client-map journal events
//!
//! `EClientMap` embeds a full serialized image of the session table;
//! `ESession` records a single session open or close. Both expire once
//! the client map has committed past their version.

use crate::completion::Completion;
use crate::mds::Mds;
use bytes::Bytes;
use quillfs_common::{ClientInst, Result, Version};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A versioned snapshot of the whole session table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EClientMap {
    pub cmapv: Version,
    pub map_image: Bytes,
}

impl EClientMap {
    #[must_use]
    pub fn new(cmapv: Version, map_image: Bytes) -> Self {
        Self { cmapv, map_image }
    }

    pub fn has_expired(&self, mds: &Mds) -> bool {
        clientmap_version_expired(mds, self.cmapv)
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        clientmap_version_expire(mds, self.cmapv, c)
    }

    /// The journaled image is the source of truth after a crash: load it
    /// and treat its version as both committed and committing.
    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("EClientMap.replay v{}", self.cmapv);
        mds.clientmap.decode(&self.map_image)?;
        let v = mds.clientmap.get_version();
        mds.clientmap.set_committing(v);
        mds.clientmap.mark_committed();
        Ok(())
    }
}

/// A single session open or close.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ESession {
    pub cmapv: Version,
    pub open: bool,
    pub client_inst: ClientInst,
}

impl ESession {
    #[must_use]
    pub fn new(cmapv: Version, open: bool, client_inst: ClientInst) -> Self {
        Self {
            cmapv,
            open,
            client_inst,
        }
    }

    pub fn has_expired(&self, mds: &Mds) -> bool {
        clientmap_version_expired(mds, self.cmapv)
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        clientmap_version_expire(mds, self.cmapv, c)
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!(
            "ESession.replay {} {}",
            if self.open { "open" } else { "close" },
            self.client_inst.client
        );
        if self.open {
            mds.clientmap.open_session(self.client_inst.clone());
        } else {
            mds.clientmap.close_session(self.client_inst.client);
        }
        mds.clientmap.reset_projected(); // make it follow version
        Ok(())
    }
}

/// Shared predicate: expired once the client map committed past `cmapv`.
fn clientmap_version_expired(mds: &Mds, cmapv: Version) -> bool {
    if mds.clientmap.get_committed() >= cmapv {
        debug!(
            "clientmap {} >= {} has committed",
            mds.clientmap.get_committed(),
            cmapv
        );
        true
    } else if mds.clientmap.get_committing() >= cmapv {
        debug!(
            "clientmap {} >= {} is still committing",
            mds.clientmap.get_committing(),
            cmapv
        );
        false
    } else {
        debug!("clientmap committed {} < {}", mds.clientmap.get_committed(), cmapv);
        false
    }
}

/// Shared expire: join the in-flight flush if one covers `cmapv`, else
/// start a fresh one.
fn clientmap_version_expire(mds: &mut Mds, cmapv: Version, c: Completion) -> Result<()> {
    if mds.clientmap.get_committing() >= cmapv {
        debug!("waiting on in-flight clientmap commit for v{}", cmapv);
        mds.clientmap.add_commit_waiter(c);
        Ok(())
    } else {
        debug!("logging clientmap for v{}", cmapv);
        mds.log_clientmap(c)
    }
}
