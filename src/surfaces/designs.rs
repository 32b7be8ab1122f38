use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::existence::{ExistenceMap, ExistenceMaps, WorldExtent};
use crate::config::TagDbConfig;
use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::storage::{NonSpatialAffinityKey, StorageContext, StorageProxy, StreamKind};

const DESIGNS_STREAM: &str = "Designs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignDescriptor {
    pub id: Uuid,
    pub name: String,
    pub extents: WorldExtent,
}

impl DesignDescriptor {
    pub fn new(id: Uuid, name: impl Into<String>, extents: WorldExtent) -> Self {
        Self {
            id,
            name: name.into(),
            extents,
        }
    }
}

/// Design surfaces registered against each project.
///
/// The list of a project is read from its `Designs` stream on first use
/// and rewritten on every change, all under one registry lock.
pub struct DesignRegistry {
    storage: StorageContext,
    maps: Arc<ExistenceMaps>,
    tree_levels: u8,
    cell_size: f64,
    designs: Mutex<HashMap<Uuid, Vec<DesignDescriptor>>>,
}

impl DesignRegistry {
    pub fn new(storage: StorageContext, maps: Arc<ExistenceMaps>, config: &TagDbConfig) -> Self {
        Self {
            storage,
            maps,
            tree_levels: config.tree_levels,
            cell_size: config.cell_size,
            designs: Mutex::new(HashMap::new()),
        }
    }

    fn load(&self, project: Uuid) -> Result<Vec<DesignDescriptor>> {
        let key = NonSpatialAffinityKey::new(project, DESIGNS_STREAM);
        match self
            .storage
            .direct_proxy()
            .read_non_spatial(&key, StreamKind::Metadata)?
        {
            Some(bytes) => Vec::<DesignDescriptor>::decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, project: Uuid, designs: &[DesignDescriptor]) -> Result<()> {
        let key = NonSpatialAffinityKey::new(project, DESIGNS_STREAM);
        let proxy = self.storage.transactional_proxy();
        proxy.write_non_spatial(&key, StreamKind::Metadata, designs.to_vec().encode()?)?;
        if let Err(e) = proxy.commit() {
            proxy.clear();
            return Err(e);
        }
        Ok(())
    }

    fn with_project<T>(
        &self,
        project: Uuid,
        f: impl FnOnce(&mut Vec<DesignDescriptor>) -> Result<T>,
    ) -> Result<T> {
        let mut designs = self.designs.lock()?;
        if !designs.contains_key(&project) {
            let loaded = self.load(project)?;
            designs.insert(project, loaded);
        }
        match designs.get_mut(&project) {
            Some(list) => f(list),
            None => Err(Error::InvalidState(format!(
                "design list of {} vanished while locked",
                project
            ))),
        }
    }

    /// Registers a design. Reusing an id or a name within the project is
    /// rejected.
    pub fn add(&self, project: Uuid, descriptor: DesignDescriptor) -> Result<()> {
        self.with_project(project, |list| {
            if list
                .iter()
                .any(|d| d.id == descriptor.id || d.name == descriptor.name)
            {
                return Err(Error::InvalidArgument(format!(
                    "design {} ({}) already registered in {}",
                    descriptor.name, descriptor.id, project
                )));
            }

            list.push(descriptor);
            if let Err(e) = self.save(project, list) {
                list.pop();
                return Err(e);
            }
            Ok(())
        })
    }

    /// Unregisters a design and drops its existence map. Returns whether
    /// it was registered.
    pub fn remove(&self, project: Uuid, id: Uuid) -> Result<bool> {
        let removed = self.with_project(project, |list| {
            let position = match list.iter().position(|d| d.id == id) {
                Some(position) => position,
                None => return Ok(false),
            };
            let descriptor = list.remove(position);
            if let Err(e) = self.save(project, list) {
                list.insert(position, descriptor);
                return Err(e);
            }
            Ok(true)
        })?;

        if removed {
            self.maps.remove(project, id)?;
            tracing::info!(%project, design = %id, "Removed design");
        }
        Ok(removed)
    }

    pub fn get(&self, project: Uuid, id: Uuid) -> Result<Option<DesignDescriptor>> {
        self.with_project(project, |list| {
            Ok(list.iter().find(|d| d.id == id).cloned())
        })
    }

    pub fn list(&self, project: Uuid) -> Result<Vec<DesignDescriptor>> {
        self.with_project(project, |list| Ok(list.clone()))
    }

    /// Registers a design and stores the existence map of the subgrids its
    /// extents cover.
    pub fn import_surface(
        &self,
        project: Uuid,
        descriptor: DesignDescriptor,
    ) -> Result<Arc<ExistenceMap>> {
        let map = ExistenceMap::from_world_extent(
            self.tree_levels,
            self.cell_size,
            &descriptor.extents,
        )?;
        let id = descriptor.id;
        let name = descriptor.name.clone();
        self.add(project, descriptor)?;

        match self.maps.put(project, id, map) {
            Ok(map) => {
                tracing::info!(
                    %project,
                    design = %id,
                    name = %name,
                    subgrids = map.count(),
                    "Imported design surface"
                );
                Ok(map)
            }
            Err(e) => {
                tracing::warn!(%project, design = %id, error = %e, "Design surface import failed");
                self.with_project(project, |list| {
                    list.retain(|d| d.id != id);
                    self.save(project, list)
                })?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(storage: &StorageContext) -> DesignRegistry {
        let maps = Arc::new(ExistenceMaps::new(storage.clone()));
        DesignRegistry::new(storage.clone(), maps, &TagDbConfig::default())
    }

    fn design(name: &str) -> DesignDescriptor {
        DesignDescriptor::new(Uuid::new_v4(), name, WorldExtent::new(0.0, 0.0, 50.0, 50.0))
    }

    #[test]
    fn test_add_rejects_duplicates() -> Result<()> {
        let storage = StorageContext::in_memory(&TagDbConfig::default());
        let registry = registry(&storage);
        let project = Uuid::new_v4();

        let first = design("Final grade");
        registry.add(project, first.clone())?;
        assert!(matches!(
            registry.add(project, first.clone()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.add(project, design("Final grade")),
            Err(Error::InvalidArgument(_))
        ));

        // Same name in another project is fine
        registry.add(Uuid::new_v4(), design("Final grade"))?;
        assert_eq!(registry.list(project)?, vec![first]);
        Ok(())
    }

    #[test]
    fn test_designs_survive_reopen() -> Result<()> {
        let storage = StorageContext::in_memory(&TagDbConfig::default());
        let project = Uuid::new_v4();
        let (a, b) = (design("Subgrade"), design("Base course"));
        {
            let registry = registry(&storage);
            registry.add(project, a.clone())?;
            registry.add(project, b.clone())?;
            assert!(registry.remove(project, a.id)?);
            assert!(!registry.remove(project, a.id)?);
        }

        let reopened = registry(&storage);
        assert_eq!(reopened.list(project)?, vec![b.clone()]);
        assert_eq!(reopened.get(project, b.id)?, Some(b));
        assert_eq!(reopened.get(project, a.id)?, None);
        Ok(())
    }

    #[test]
    fn test_import_surface_stores_existence_map() -> Result<()> {
        let storage = StorageContext::in_memory(&TagDbConfig::default());
        let maps = Arc::new(ExistenceMaps::new(storage.clone()));
        let registry = DesignRegistry::new(storage.clone(), maps.clone(), &TagDbConfig::default());
        let project = Uuid::new_v4();
        let surface = design("Top of pavement");

        let map = registry.import_surface(project, surface.clone())?;
        // 0..50 m at 10.88 m per subgrid spans five subgrids a side
        assert_eq!(map.count(), 25);
        assert_eq!(registry.get(project, surface.id)?, Some(surface.clone()));

        let stored = ExistenceMaps::new(storage).get(project, surface.id)?;
        assert_eq!(stored.as_deref(), Some(map.as_ref()));

        registry.remove(project, surface.id)?;
        assert!(maps.get(project, surface.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_import_outside_grid_registers_nothing() -> Result<()> {
        let storage = StorageContext::in_memory(&TagDbConfig::default());
        let registry = registry(&storage);
        let project = Uuid::new_v4();
        let far = DesignDescriptor::new(
            Uuid::new_v4(),
            "Far away",
            WorldExtent::new(0.0, 0.0, 1.0e12, 1.0),
        );

        assert!(registry.import_surface(project, far).is_err());
        assert!(registry.list(project)?.is_empty());
        Ok(())
    }
}
