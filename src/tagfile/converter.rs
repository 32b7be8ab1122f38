use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::matchers::MatcherRegistry;
use super::processor::{EpochStats, TagProcessor};
use super::reader::TagFileReader;
use super::sink::MatcherSink;
use super::state::MachineIdentity;
use super::TagReadResult;
use crate::cells::ProcessedCellPass;
use crate::config::TagDbConfig;
use crate::error::Result;
use crate::subgrid::{BitmaskLeaf, BitmaskLeafFactory, SubGridTree};

/// Everything extracted from one TAG file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedTagFile {
    pub read_result: TagReadResult,
    pub identity: MachineIdentity,
    pub design_name: String,
    pub passes: Vec<ProcessedCellPass>,
    pub stats: EpochStats,
    /// Values whose name had no matcher
    pub unknown_values: u64,
}

impl ConvertedTagFile {
    pub fn is_ok(&self) -> bool {
        self.read_result.is_ok()
    }
}

/// Reader, matchers and processor wired together. The same bytes always
/// convert to the same result.
#[derive(Clone)]
pub struct TagFileConverter {
    registry: Arc<MatcherRegistry>,
    tree_levels: u8,
    cell_size: f64,
    cancel: Option<Arc<AtomicBool>>,
}

impl TagFileConverter {
    pub fn new(config: &TagDbConfig) -> Result<Self> {
        // Reject a grid the processor could not address up front
        SubGridTree::<BitmaskLeaf>::new(
            config.tree_levels,
            config.cell_size,
            Arc::new(BitmaskLeafFactory),
        )?;
        Ok(Self {
            registry: Arc::new(MatcherRegistry::standard()),
            tree_levels: config.tree_levels,
            cell_size: config.cell_size,
            cancel: None,
        })
    }

    pub fn with_registry(mut self, registry: Arc<MatcherRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Conversions abort with `ProcessingAborted` once `flag` is set.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn convert(&self, bytes: &[u8]) -> Result<ConvertedTagFile> {
        let processor = TagProcessor::new(self.tree_levels, self.cell_size)?;
        let mut sink = MatcherSink::new(self.registry.clone(), processor);
        if let Some(flag) = &self.cancel {
            sink = sink.with_cancellation(flag.clone());
        }

        let read_result = TagFileReader::read(bytes, &mut sink);
        let unknown_values = sink.unknown_values().values().sum();
        let (state, passes, stats) = sink.into_target().into_parts();

        tracing::debug!(
            result = %read_result,
            passes = passes.len(),
            epochs = stats.seen,
            skipped = stats.skipped,
            "Converted TAG file"
        );

        Ok(ConvertedTagFile {
            read_result,
            identity: state.identity,
            design_name: state.design_name,
            passes,
            stats,
            unknown_values,
        })
    }
}
