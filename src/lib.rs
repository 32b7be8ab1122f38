pub mod cells;
pub mod config;
pub mod encoding;
pub mod error;
pub mod retirement;
pub mod scheduler;
pub mod segment;
pub mod sitemodel;
pub mod storage;
pub mod subgrid;
pub mod submission;
pub mod surfaces;
pub mod tagfile;

pub use cells::{CellPass, ProcessedCellPass};
pub use config::TagDbConfig;
pub use error::{Error, Result};
pub use retirement::{SegmentRetirementQueue, SegmentRetirementTask};
pub use scheduler::Scheduler;
pub use sitemodel::{SiteModel, SiteModels, SubGridIntegrator};
pub use storage::StorageContext;
pub use submission::{QueueProcessor, TagFileBufferQueue, TagFileSubmitter};
pub use tagfile::TagFileConverter;
