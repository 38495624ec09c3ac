use jid::BareJid;
use serde::{Deserialize, Serialize};

use crate::types::Affiliation;

/// An entity's affiliation with a node. One record per bare JID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffiliate {
    jid: BareJid,
    affiliation: Affiliation,
}

impl NodeAffiliate {
    pub fn new(jid: BareJid, affiliation: Affiliation) -> Self {
        Self { jid, affiliation }
    }

    pub fn jid(&self) -> &BareJid {
        &self.jid
    }

    pub fn affiliation(&self) -> Affiliation {
        self.affiliation
    }

    pub(crate) fn set_affiliation(&mut self, affiliation: Affiliation) {
        self.affiliation = affiliation;
    }
}
