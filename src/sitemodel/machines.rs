use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cells::NULL_MACHINE_ID;
use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::storage::{NonSpatialAffinityKey, StorageProxy, StreamKind};
use crate::tagfile::MachineIdentity;

const MACHINES_STREAM: &str = "Machines";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: u16,
    pub identity: MachineIdentity,
}

/// Machines that have contributed passes to a project. Ids are dense
/// from 0 in order of first registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineList {
    machines: Vec<Machine>,
    #[serde(skip)]
    dirty: bool,
}

impl MachineList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `identity`, registering it on first sight.
    pub fn register(&mut self, identity: &MachineIdentity) -> Result<u16> {
        if let Some(machine) = self.find(identity) {
            return Ok(machine.id);
        }

        let id = self.machines.len();
        if id >= NULL_MACHINE_ID as usize {
            return Err(Error::InvalidState(format!(
                "machine list is full at {} entries",
                id
            )));
        }
        let id = id as u16;
        self.machines.push(Machine {
            id,
            identity: identity.clone(),
        });
        self.dirty = true;
        tracing::debug!(machine = %identity.machine_name, id, "Registered machine");
        Ok(id)
    }

    pub fn find(&self, identity: &MachineIdentity) -> Option<&Machine> {
        self.machines.iter().find(|m| &m.identity == identity)
    }

    pub fn get(&self, id: u16) -> Option<&Machine> {
        self.machines.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Whether machines were registered since the list was last saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn load(proxy: &dyn StorageProxy, project: Uuid) -> Result<Self> {
        let key = NonSpatialAffinityKey::new(project, MACHINES_STREAM);
        match proxy.read_non_spatial(&key, StreamKind::Metadata)? {
            Some(bytes) => bincode::deserialize(&bytes),
            None => Ok(Self::new()),
        }
    }

    /// Stages the list on `proxy`; it is clean once the proxy commits.
    pub fn save(&self, proxy: &dyn StorageProxy, project: Uuid) -> Result<()> {
        let key = NonSpatialAffinityKey::new(project, MACHINES_STREAM);
        proxy.write_non_spatial(&key, StreamKind::Metadata, bincode::serialize(self)?)
    }
}
