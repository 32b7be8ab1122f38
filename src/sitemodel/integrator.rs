use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools;

use super::{production_existence_key, MachineList, SiteModel};
use crate::cells::ProcessedCellPass;
use crate::config::TagDbConfig;
use crate::error::{Error, Result};
use crate::retirement::SegmentRetirementQueue;
use crate::storage::{
    CommitCounts, SpatialAffinityKey, StorageContext, StorageProxy, StreamKind,
    TransactionalProxy,
};
use crate::subgrid::{CellAddress, ServerLeafSubGrid, SubGridTree};
use crate::surfaces::ExistenceMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrationStats {
    pub passes_added: u64,
    /// Passes the leaf refused, such as a time off the segment axis
    pub passes_rejected: u64,
    pub subgrids_touched: usize,
    pub new_subgrids: usize,
    pub segments_cleaved: usize,
    pub superseded: usize,
    pub counts: CommitCounts,
}

/// Writes processed passes into a site model and persists the result.
///
/// One call is one transaction: every touched leaf, the existence map and
/// the machine list commit together or not at all.
///
/// ```text
///  passes ──group by leaf──► locate ──► load? ──► add ──► cleave ──► latest
///                                                                     │
///       retirement queue ◄── superseded keys ◄── commit ◄── stage ◄───┘
/// ```
pub struct SubGridIntegrator {
    storage: StorageContext,
    retirement: Arc<SegmentRetirementQueue>,
    max_segment_cell_passes: u32,
    min_cleave_pass_count: u32,
}

/// What was changed in memory before the commit, to undo on failure.
#[derive(Default)]
struct Staged {
    touched: Vec<CellAddress>,
    new_subgrids: Vec<CellAddress>,
    superseded: Vec<SpatialAffinityKey>,
}

impl SubGridIntegrator {
    pub fn new(
        storage: StorageContext,
        retirement: Arc<SegmentRetirementQueue>,
        config: &TagDbConfig,
    ) -> Self {
        Self {
            storage,
            retirement,
            max_segment_cell_passes: config.max_segment_cell_passes,
            min_cleave_pass_count: config.min_cleave_pass_count,
        }
    }

    pub fn integrate(
        &self,
        model: &SiteModel,
        passes: &[ProcessedCellPass],
    ) -> Result<IntegrationStats> {
        let mut stats = IntegrationStats::default();
        if passes.is_empty() {
            return Ok(stats);
        }

        let project = model.id();
        let proxy = self.storage.transactional_proxy();
        let mut tree = model.tree.lock()?;
        let mut existence = model.existence.lock()?;
        let mut machines = model.machines.lock()?;

        let mut staged = Staged::default();
        let result = self
            .stage(
                &proxy,
                model,
                &mut tree,
                &mut existence,
                &machines,
                passes,
                &mut staged,
                &mut stats,
            )
            .and_then(|()| proxy.commit_with_counts());

        match result {
            Ok(counts) => {
                machines.mark_clean();
                stats.counts = counts;
                stats.superseded = staged.superseded.len();
                self.retirement
                    .add_all(project, staged.superseded, Utc::now());

                tracing::info!(
                    %project,
                    passes = stats.passes_added,
                    rejected = stats.passes_rejected,
                    subgrids = stats.subgrids_touched,
                    new_subgrids = stats.new_subgrids,
                    superseded = stats.superseded,
                    bytes = counts.bytes,
                    "Integrated cell passes"
                );
                Ok(stats)
            }
            Err(e) => {
                proxy.clear();
                for origin in &staged.touched {
                    tree.remove_leaf(origin.x, origin.y);
                }
                for origin in &staged.new_subgrids {
                    existence.clear_subgrid(*origin);
                }

                tracing::warn!(
                    %project,
                    subgrids = staged.touched.len(),
                    error = %e,
                    "Integration failed, evicted touched leaves"
                );
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stage(
        &self,
        proxy: &TransactionalProxy,
        model: &SiteModel,
        tree: &mut SubGridTree<ServerLeafSubGrid>,
        existence: &mut ExistenceMap,
        machines: &MachineList,
        passes: &[ProcessedCellPass],
        staged: &mut Staged,
        stats: &mut IntegrationStats,
    ) -> Result<()> {
        let project = model.id();
        let groups = passes
            .iter()
            .sorted_by_key(|p| p.cell.leaf_origin())
            .group_by(|p| p.cell.leaf_origin());

        for (origin, group) in &groups {
            let key = SpatialAffinityKey::new(project, origin);
            let leaf = tree.locate(origin.x, origin.y)?;
            staged.touched.push(origin);
            if !leaf.is_loaded() {
                leaf.load_for_update(proxy, &key)?;
            }

            for processed in group {
                let (x, y) = processed.cell.leaf_offset();
                match leaf.add_pass(x, y, processed.pass) {
                    Ok(()) => stats.passes_added += 1,
                    Err(e) => {
                        tracing::debug!(cell = %processed.cell, error = %e, "Rejected cell pass");
                        stats.passes_rejected += 1;
                    }
                }
            }

            stats.segments_cleaved += leaf.cleave(
                self.max_segment_cell_passes,
                self.min_cleave_pass_count,
            );
            leaf.compute_latest_pass_information();

            if !leaf.save_dirty_segments(proxy, &key, &mut staged.superseded)
                || !leaf.save_directory(proxy, &key)
            {
                return Err(Error::CommitFailed(format!(
                    "could not stage subgrid {}",
                    key
                )));
            }

            if !existence.is_set(origin) {
                existence.set_subgrid(origin)?;
                staged.new_subgrids.push(origin);
            }
        }
        stats.subgrids_touched = staged.touched.len();
        stats.new_subgrids = staged.new_subgrids.len();

        if !staged.new_subgrids.is_empty() {
            proxy.write_non_spatial(
                &production_existence_key(project),
                StreamKind::ExistenceMap,
                existence.encode(),
            )?;
        }
        if machines.is_dirty() {
            machines.save(proxy, project)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::pass_at;
    use crate::storage::kv::FlakyStore;
    use crate::sitemodel::SiteModels;
    use crate::storage::{KvStore, MemoryStore, SegmentFormConverter};
    use crate::subgrid::Addressable;
    use crate::tagfile::MachineIdentity;
    use uuid::Uuid;

    const BASE: u32 = 1 << 29;

    fn processed(x: u32, y: u32, millis: i64, height: f32) -> ProcessedCellPass {
        ProcessedCellPass {
            cell: CellAddress::new(x, y),
            easting: 0.0,
            northing: 0.0,
            pass: pass_at(millis, height),
        }
    }

    fn setup(config: &TagDbConfig, storage: StorageContext) -> (SiteModels, SubGridIntegrator, Arc<SegmentRetirementQueue>) {
        let queue = Arc::new(SegmentRetirementQueue::new());
        let integrator = SubGridIntegrator::new(storage.clone(), queue.clone(), config);
        (SiteModels::new(storage, config.clone()), integrator, queue)
    }

    #[test]
    fn test_integrate_persists_passes_and_existence() -> Result<()> {
        let config = TagDbConfig::default();
        let storage = StorageContext::in_memory(&config);
        let (models, integrator, queue) = setup(&config, storage.clone());
        let project = Uuid::new_v4();
        let model = models.get_or_create(project)?;

        let passes = vec![
            processed(BASE + 1, BASE + 1, 1_000, 1.0),
            processed(BASE + 1, BASE + 1, 2_000, 2.0),
            processed(BASE + 40, BASE + 1, 1_500, 3.0),
        ];
        let stats = integrator.integrate(&model, &passes)?;
        assert_eq!(stats.passes_added, 3);
        assert_eq!(stats.subgrids_touched, 2);
        assert_eq!(stats.new_subgrids, 2);
        assert_eq!(stats.superseded, 0);
        assert!(stats.counts.puts > 0);
        assert!(queue.is_empty());

        // A fresh model reads everything back from the store
        let reopened = SiteModels::new(storage, config).get_or_create(project)?;
        assert_eq!(reopened.subgrid_count()?, 2);
        let heights: Vec<_> = reopened
            .cell_passes(CellAddress::new(BASE + 1, BASE + 1))?
            .iter()
            .map(|p| p.height)
            .collect();
        assert_eq!(heights, vec![1.0, 2.0]);
        assert_eq!(reopened.cell_passes(CellAddress::new(BASE + 40, BASE + 1))?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_rewrite_supersedes_previous_segment() -> Result<()> {
        let config = TagDbConfig::default();
        let (models, integrator, queue) = setup(&config, StorageContext::in_memory(&config));
        let project = Uuid::new_v4();
        let model = models.get_or_create(project)?;

        integrator.integrate(&model, &[processed(BASE, BASE, 1_000, 1.0)])?;
        let stats = integrator.integrate(&model, &[processed(BASE, BASE, 2_000, 2.0)])?;

        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.new_subgrids, 0);
        let due = queue.query(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].project, project);
        assert_eq!(due[0].key.origin(), CellAddress::new(BASE, BASE));
        Ok(())
    }

    #[test]
    fn test_large_leaf_is_cleaved() -> Result<()> {
        let config = TagDbConfig::default()
            .max_segment_cell_passes(10)
            .min_cleave_pass_count(2);
        let (models, integrator, _) = setup(&config, StorageContext::in_memory(&config));
        let model = models.get_or_create(Uuid::new_v4())?;

        let passes: Vec<_> = (0..40)
            .map(|i| processed(BASE + (i % 4), BASE, 1_000 * (i as i64 + 1), i as f32))
            .collect();
        let stats = integrator.integrate(&model, &passes)?;
        assert!(stats.segments_cleaved > 0);

        let tree = model.tree.lock()?;
        let leaf = tree.lookup(BASE, BASE).expect("resident leaf");
        assert_eq!(leaf.origin(), CellAddress::new(BASE, BASE));
        assert_eq!(leaf.pass_count(), 40);
        Ok(())
    }

    #[test]
    fn test_failed_commit_evicts_then_retry_succeeds() -> Result<()> {
        let config = TagDbConfig::default();
        let immutable = Arc::new(FlakyStore::default());
        let storage = StorageContext::new(
            Arc::new(MemoryStore::new()),
            immutable.clone(),
            Arc::new(SegmentFormConverter::new(config.immutable_form, config.compress_immutable)),
        );
        let (models, integrator, queue) = setup(&config, storage.clone());
        let project = Uuid::new_v4();
        let model = models.get_or_create(project)?;
        model.register_machine(&MachineIdentity {
            machine_name: "Paver".to_string(),
            ..Default::default()
        })?;

        let passes = vec![
            processed(BASE + 3, BASE + 3, 1_000, 1.0),
            processed(BASE + 3, BASE + 3, 2_000, 2.0),
        ];

        immutable.fail_next(1);
        assert!(matches!(
            integrator.integrate(&model, &passes),
            Err(Error::CommitFailed(_))
        ));
        assert_eq!(model.resident_leaf_count()?, 0);
        assert_eq!(model.subgrid_count()?, 0);
        assert!(queue.is_empty());
        assert_eq!(storage.mutable_store().len()?, 0);

        let stats = integrator.integrate(&model, &passes)?;
        assert_eq!(stats.passes_added, 2);

        let reopened = SiteModels::new(storage, config).get_or_create(project)?;
        assert_eq!(reopened.cell_passes(CellAddress::new(BASE + 3, BASE + 3))?.len(), 2);
        assert_eq!(reopened.machines()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_mutable_commit_leaves_no_trace_then_retry_succeeds() -> Result<()> {
        let config = TagDbConfig::default();
        let mutable = Arc::new(FlakyStore::default());
        let storage = StorageContext::new(
            mutable.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SegmentFormConverter::new(config.immutable_form, config.compress_immutable)),
        );
        let (models, integrator, queue) = setup(&config, storage.clone());
        let project = Uuid::new_v4();
        let model = models.get_or_create(project)?;
        let cell = CellAddress::new(BASE + 7, BASE + 7);
        let passes = vec![
            processed(cell.x, cell.y, 1_000, 1.0),
            processed(cell.x, cell.y, 2_000, 2.0),
        ];

        mutable.fail_next(1);
        assert!(matches!(
            integrator.integrate(&model, &passes),
            Err(Error::CommitFailed(_))
        ));
        assert_eq!(storage.immutable_store().len()?, 0);
        assert_eq!(storage.mutable_store().len()?, 0);
        assert_eq!(model.resident_leaf_count()?, 0);
        assert!(queue.is_empty());

        let reopened = SiteModels::new(storage.clone(), config.clone()).get_or_create(project)?;
        assert!(reopened.cell_passes(cell)?.is_empty());

        let stats = integrator.integrate(&model, &passes)?;
        assert_eq!(stats.passes_added, 2);
        let reopened = SiteModels::new(storage, config).get_or_create(project)?;
        assert_eq!(reopened.cell_passes(cell)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_unreadable_history_is_not_overwritten() -> Result<()> {
        let config = TagDbConfig::default();
        let mutable = Arc::new(FlakyStore::default());
        let storage = StorageContext::new(
            mutable.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SegmentFormConverter::new(config.immutable_form, config.compress_immutable)),
        );
        let (models, integrator, queue) = setup(&config, storage.clone());
        let project = Uuid::new_v4();
        let cell = CellAddress::new(BASE + 2, BASE + 9);
        integrator.integrate(&*models.get_or_create(project)?, &[processed(cell.x, cell.y, 1_000, 1.0)])?;
        let stored = storage.mutable_store().len()?;

        // A model that has not yet loaded the leaf
        let model = SiteModels::new(storage.clone(), config.clone()).get_or_create(project)?;
        mutable.fail_reads(true);
        assert!(matches!(
            integrator.integrate(&model, &[processed(cell.x, cell.y, 2_000, 2.0)]),
            Err(Error::Io(_))
        ));
        mutable.fail_reads(false);
        assert_eq!(storage.mutable_store().len()?, stored);
        assert_eq!(model.resident_leaf_count()?, 0);
        assert!(queue.is_empty());

        integrator.integrate(&model, &[processed(cell.x, cell.y, 2_000, 2.0)])?;
        let heights: Vec<_> = SiteModels::new(storage, config)
            .get_or_create(project)?
            .cell_passes(cell)?
            .iter()
            .map(|p| p.height)
            .collect();
        assert_eq!(heights, vec![1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_empty_batch_is_a_no_op() -> Result<()> {
        let config = TagDbConfig::default();
        let storage = StorageContext::in_memory(&config);
        let (models, integrator, _) = setup(&config, storage.clone());
        let model = models.get_or_create(Uuid::new_v4())?;

        assert_eq!(integrator.integrate(&model, &[])?, IntegrationStats::default());
        assert_eq!(storage.mutable_store().len()?, 0);
        Ok(())
    }
}
