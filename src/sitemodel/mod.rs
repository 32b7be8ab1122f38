//! Site models: the in-memory face of a project.
//!
//! A site model owns the project's subgrid tree of server leaves, its
//! machine list and the existence map of its production data. Leaves are
//! loaded from storage lazily, the first time ingestion or a read touches
//! them; the store stays authoritative and a leaf can be evicted at any
//! time.
//!
//! ```text
//!  SiteModels ── Mutex<HashMap<project, Arc<SiteModel>>>
//!                                       │
//!                    ┌──────────────────┼───────────────────┐
//!        Mutex<SubGridTree<ServerLeaf>> Mutex<MachineList>  Mutex<ExistenceMap>
//! ```
//!
//! Locks are always taken in that order: tree, existence map, machines.

pub mod integrator;
pub mod machines;

pub use integrator::{IntegrationStats, SubGridIntegrator};
pub use machines::{Machine, MachineList};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::cells::CellPass;
use crate::config::TagDbConfig;
use crate::error::Result;
use crate::storage::{NonSpatialAffinityKey, SpatialAffinityKey, StorageContext, StorageProxy, StreamKind};
use crate::subgrid::{CellAddress, ServerLeafFactory, ServerLeafSubGrid, SubGridTree};
use crate::surfaces::ExistenceMap;
use crate::tagfile::MachineIdentity;

const EXISTENCE_STREAM: &str = "SubGridExistenceMap";

pub(crate) fn production_existence_key(project: Uuid) -> NonSpatialAffinityKey {
    NonSpatialAffinityKey::new(project, EXISTENCE_STREAM)
}

pub struct SiteModel {
    id: Uuid,
    storage: StorageContext,
    pub(crate) tree: Mutex<SubGridTree<ServerLeafSubGrid>>,
    pub(crate) existence: Mutex<ExistenceMap>,
    pub(crate) machines: Mutex<MachineList>,
}

impl SiteModel {
    /// Reads the machine list and production existence map of `id`; a
    /// project with nothing stored starts empty.
    pub fn load(id: Uuid, storage: StorageContext, config: &TagDbConfig) -> Result<Self> {
        let proxy = storage.direct_proxy();
        let machines = MachineList::load(&proxy, id)?;
        let existence = match proxy
            .read_non_spatial(&production_existence_key(id), StreamKind::ExistenceMap)?
        {
            Some(bytes) => ExistenceMap::decode(&bytes)?,
            None => ExistenceMap::new(config.tree_levels, config.cell_size)?,
        };
        let tree = SubGridTree::new(
            config.tree_levels,
            config.cell_size,
            Arc::new(ServerLeafFactory),
        )?;

        Ok(Self {
            id,
            storage,
            tree: Mutex::new(tree),
            existence: Mutex::new(existence),
            machines: Mutex::new(machines),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn register_machine(&self, identity: &MachineIdentity) -> Result<u16> {
        self.machines.lock()?.register(identity)
    }

    pub fn machines(&self) -> Result<MachineList> {
        Ok(self.machines.lock()?.clone())
    }

    /// Number of subgrids holding production data.
    pub fn subgrid_count(&self) -> Result<u64> {
        Ok(self.existence.lock()?.count())
    }

    pub fn has_data(&self, cell: CellAddress) -> Result<bool> {
        Ok(self.existence.lock()?.is_set(cell))
    }

    /// Cell for a world position in this model's grid.
    pub fn cell_for_world(&self, easting: f64, northing: f64) -> Result<Option<CellAddress>> {
        Ok(self.tree.lock()?.cell_for_world(easting, northing))
    }

    /// Every pass of `cell`, oldest first, loading its leaf if needed.
    pub fn cell_passes(&self, cell: CellAddress) -> Result<Vec<CellPass>> {
        if !self.has_data(cell)? {
            return Ok(Vec::new());
        }

        let mut tree = self.tree.lock()?;
        let leaf = tree.locate(cell.x, cell.y)?;
        if !leaf.is_loaded() {
            let key = SpatialAffinityKey::new(self.id, cell.leaf_origin());
            leaf.load_from_storage(&self.storage.direct_proxy(), &key, true, true);
        }
        let (x, y) = cell.leaf_offset();
        Ok(leaf.cell_passes(x, y))
    }

    /// Drops every leaf held in memory.
    pub fn evict_leaves(&self) -> Result<()> {
        self.tree.lock()?.clear();
        Ok(())
    }

    pub fn resident_leaf_count(&self) -> Result<usize> {
        Ok(self.tree.lock()?.leaf_count())
    }
}

/// Every site model of the process, created on first use.
pub struct SiteModels {
    storage: StorageContext,
    config: TagDbConfig,
    models: Mutex<HashMap<Uuid, Arc<SiteModel>>>,
}

impl SiteModels {
    pub fn new(storage: StorageContext, config: TagDbConfig) -> Self {
        Self {
            storage,
            config,
            models: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &StorageContext {
        &self.storage
    }

    pub fn config(&self) -> &TagDbConfig {
        &self.config
    }

    pub fn get_or_create(&self, project: Uuid) -> Result<Arc<SiteModel>> {
        let mut models = self.models.lock()?;
        if let Some(model) = models.get(&project) {
            return Ok(model.clone());
        }

        let model = Arc::new(SiteModel::load(project, self.storage.clone(), &self.config)?);
        tracing::debug!(%project, "Opened site model");
        models.insert(project, model.clone());
        Ok(model)
    }

    pub fn get(&self, project: Uuid) -> Result<Option<Arc<SiteModel>>> {
        Ok(self.models.lock()?.get(&project).cloned())
    }

    /// Forgets the in-memory model; the next access reloads it.
    pub fn evict(&self, project: Uuid) -> Result<bool> {
        Ok(self.models.lock()?.remove(&project).is_some())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.models.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_returns_same_model() -> Result<()> {
        let config = TagDbConfig::default();
        let models = SiteModels::new(StorageContext::in_memory(&config), config);
        let project = Uuid::new_v4();

        let a = models.get_or_create(project)?;
        let b = models.get_or_create(project)?;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(models.len()?, 1);

        assert!(models.evict(project)?);
        assert!(models.get(project)?.is_none());
        assert!(!Arc::ptr_eq(&a, &models.get_or_create(project)?));
        Ok(())
    }

    #[test]
    fn test_empty_project_has_no_data() -> Result<()> {
        let config = TagDbConfig::default();
        let models = SiteModels::new(StorageContext::in_memory(&config), config);
        let model = models.get_or_create(Uuid::new_v4())?;

        let cell = model.cell_for_world(10.0, 10.0)?.expect("inside the grid");
        assert_eq!(model.subgrid_count()?, 0);
        assert!(model.cell_passes(cell)?.is_empty());
        assert_eq!(model.resident_leaf_count()?, 0);
        assert!(model.machines()?.is_empty());
        Ok(())
    }
}
