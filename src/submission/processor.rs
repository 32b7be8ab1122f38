use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use uuid::Uuid;

use super::queue::{QueuedTagFile, TagFileBufferQueue};
use crate::config::{QueueConfig, TagDbConfig};
use crate::error::{Error, Result};
use crate::sitemodel::{IntegrationStats, SiteModel, SiteModels, SubGridIntegrator};
use crate::tagfile::TagFileConverter;

#[derive(Debug, Clone, PartialEq)]
pub enum TagFileOutcome {
    Integrated(IntegrationStats),
    /// The file could not be read; it is set aside and never retried
    Quarantined(String),
    /// The file was read but its passes could not be stored
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedTagFile {
    pub file_name: String,
    pub project: Uuid,
    pub outcome: TagFileOutcome,
}

/// The single consumer of a [`TagFileBufferQueue`].
///
/// Each cycle takes one project batch, converts every file and integrates
/// its passes into the project's site model. A bad file is recorded and
/// skipped; it never stops the rest of its batch.
pub struct QueueProcessor {
    queue: Arc<TagFileBufferQueue>,
    models: Arc<SiteModels>,
    integrator: Arc<SubGridIntegrator>,
    converter: TagFileConverter,
    config: QueueConfig,
    stop: Arc<AtomicBool>,
    processed: Mutex<Vec<ProcessedTagFile>>,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<TagFileBufferQueue>,
        models: Arc<SiteModels>,
        integrator: Arc<SubGridIntegrator>,
        config: &TagDbConfig,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        Ok(Self {
            queue,
            models,
            integrator,
            converter: TagFileConverter::new(config)?.with_cancellation(stop.clone()),
            config: config.queue.clone(),
            stop,
            processed: Mutex::new(Vec::new()),
        })
    }

    /// Asks the loop to exit at the start of its next cycle. A file being
    /// converted is abandoned; a batch being committed completes.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Outcomes of every file handled so far, in processing order.
    pub fn processed(&self) -> Result<Vec<ProcessedTagFile>> {
        Ok(self.processed.lock()?.clone())
    }

    /// Handles one project batch. Returns the number of files taken from
    /// the queue.
    pub fn process_batch(&self) -> Result<usize> {
        let (project, files) = match self
            .queue
            .take_batch(self.config.max_files_per_batch)?
        {
            Some(batch) => batch,
            None => return Ok(0),
        };

        let model = self.models.get_or_create(project)?;
        for file in &files {
            let outcome = self.process_file(&model, file);
            match &outcome {
                TagFileOutcome::Integrated(stats) => tracing::debug!(
                    file = %file.key.file_name,
                    %project,
                    passes = stats.passes_added,
                    "Processed TAG file"
                ),
                TagFileOutcome::Quarantined(reason) => tracing::warn!(
                    file = %file.key.file_name,
                    %project,
                    reason = %reason,
                    "Quarantined TAG file"
                ),
                TagFileOutcome::Failed(reason) => tracing::error!(
                    file = %file.key.file_name,
                    %project,
                    error = %reason,
                    "Failed to integrate TAG file"
                ),
            }

            self.processed.lock()?.push(ProcessedTagFile {
                file_name: file.key.file_name.clone(),
                project,
                outcome,
            });
        }

        tracing::info!(%project, files = files.len(), "Processed TAG file batch");
        Ok(files.len())
    }

    fn process_file(&self, model: &SiteModel, file: &QueuedTagFile) -> TagFileOutcome {
        let converted = match self.converter.convert(&file.content) {
            Ok(converted) => converted,
            Err(e) => return TagFileOutcome::Quarantined(e.to_string()),
        };
        if !converted.is_ok() {
            return TagFileOutcome::Quarantined(
                Error::TagFile(converted.read_result).to_string(),
            );
        }

        let machine_id = match model.register_machine(&converted.identity) {
            Ok(id) => id,
            Err(e) => return TagFileOutcome::Failed(e.to_string()),
        };
        let mut passes = converted.passes;
        for processed in passes.iter_mut() {
            processed.pass.machine_id = machine_id;
        }

        match self.integrator.integrate(model, &passes) {
            Ok(stats) => TagFileOutcome::Integrated(stats),
            Err(e) => TagFileOutcome::Failed(e.to_string()),
        }
    }

    /// Runs the consumer loop until [`QueueProcessor::stop`]. Batches run on
    /// the blocking pool; an empty queue sleeps for the poll interval.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!("TAG file queue processor started");
            while !self.is_stopped() {
                let processor = self.clone();
                let taken = tokio::task::spawn_blocking(move || processor.process_batch()).await;

                match taken {
                    Ok(Ok(0)) => tokio::time::sleep(self.config.poll_interval).await,
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "TAG file batch failed");
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "TAG file batch panicked");
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
            tracing::debug!("TAG file queue processor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retirement::SegmentRetirementQueue;
    use crate::storage::StorageContext;
    use crate::submission::{SubmitTagFileRequest, TagFileSubmitter};
    use crate::tagfile::converter::tests::three_epoch_file;
    use std::time::Duration;

    struct Pipeline {
        storage: StorageContext,
        models: Arc<SiteModels>,
        submitter: Arc<TagFileSubmitter>,
        processor: Arc<QueueProcessor>,
    }

    fn pipeline() -> Pipeline {
        let config = TagDbConfig::default()
            .queue(QueueConfig::default().poll_interval(Duration::from_millis(10)));
        let storage = StorageContext::in_memory(&config);
        let models = Arc::new(SiteModels::new(storage.clone(), config.clone()));
        let integrator = Arc::new(SubGridIntegrator::new(
            storage.clone(),
            Arc::new(SegmentRetirementQueue::new()),
            &config,
        ));
        let queue = Arc::new(TagFileBufferQueue::new());
        let processor = Arc::new(
            QueueProcessor::new(queue.clone(), models.clone(), integrator, &config).unwrap(),
        );
        Pipeline {
            storage,
            models,
            submitter: Arc::new(TagFileSubmitter::new(queue)),
            processor,
        }
    }

    fn request(name: &str, project: Uuid, content: Vec<u8>) -> SubmitTagFileRequest {
        SubmitTagFileRequest {
            project_override: Some(project),
            file_name: name.to_string(),
            content,
            ..Default::default()
        }
    }

    async fn wait_for(processor: &QueueProcessor, count: usize) -> Result<Vec<ProcessedTagFile>> {
        for _ in 0..500 {
            let processed = processor.processed()?;
            if processed.len() >= count {
                return Ok(processed);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(Error::InvalidState(format!("{} files never processed", count)))
    }

    #[tokio::test]
    async fn test_three_epoch_file_end_to_end() -> Result<()> {
        let pipeline = pipeline();
        let project = Uuid::new_v4();
        let response = pipeline
            .submitter
            .submit(request("roller.tag", project, three_epoch_file("Roller 1", 1_000.0)))
            .await;
        assert!(response.success, "{}", response.message);

        let handle = pipeline.processor.clone().spawn();
        let processed = wait_for(&pipeline.processor, 1).await?;
        pipeline.processor.stop();
        handle.await.map_err(|e| Error::InvalidState(e.to_string()))?;

        match &processed[0].outcome {
            TagFileOutcome::Integrated(stats) => assert_eq!(stats.passes_added, 3),
            other => panic!("unexpected outcome {:?}", other),
        }

        // Read back through a model that only knows the store
        let reopened = SiteModels::new(pipeline.storage.clone(), TagDbConfig::default())
            .get_or_create(project)?;
        assert_eq!(reopened.machines()?.len(), 1);
        for easting in [1_001.0, 1_002.0, 1_002.5] {
            let cell = reopened.cell_for_world(easting, 200.0)?.expect("in grid");
            let passes = reopened.cell_passes(cell)?;
            assert_eq!(passes.len(), 1, "cell at {}", easting);
            assert_eq!(passes[0].machine_id, 0);
            assert!((passes[0].height - 10.0).abs() < 0.05);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_submissions() -> Result<()> {
        let pipeline = pipeline();
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());

        let a = {
            let submitter = pipeline.submitter.clone();
            tokio::spawn(async move {
                submitter
                    .submit(request("a.tag", p1, three_epoch_file("Dozer", 0.0)))
                    .await
            })
        };
        let b = {
            let submitter = pipeline.submitter.clone();
            tokio::spawn(async move {
                submitter
                    .submit(request("b.tag", p2, three_epoch_file("Grader", 5_000.0)))
                    .await
            })
        };
        for response in [a.await, b.await] {
            let response = response.map_err(|e| Error::InvalidState(e.to_string()))?;
            assert!(response.success, "{}", response.message);
        }

        let handle = pipeline.processor.clone().spawn();
        let processed = wait_for(&pipeline.processor, 2).await?;
        pipeline.processor.stop();
        handle.await.map_err(|e| Error::InvalidState(e.to_string()))?;

        assert!(processed
            .iter()
            .all(|p| matches!(p.outcome, TagFileOutcome::Integrated(_))));

        let m1 = pipeline.models.get_or_create(p1)?;
        let m2 = pipeline.models.get_or_create(p2)?;
        assert_eq!(m1.machines()?.get(0).map(|m| m.identity.machine_name.clone()), Some("Dozer".to_string()));
        assert_eq!(m2.machines()?.get(0).map(|m| m.identity.machine_name.clone()), Some("Grader".to_string()));

        let cell = m1.cell_for_world(1.0, 200.0)?.expect("in grid");
        assert_eq!(m1.cell_passes(cell)?.len(), 1);
        assert!(m2.cell_passes(cell)?.is_empty());
        let cell = m2.cell_for_world(5_001.0, 200.0)?.expect("in grid");
        assert_eq!(m2.cell_passes(cell)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_file_is_quarantined_without_stopping_batch() -> Result<()> {
        let pipeline = pipeline();
        let project = Uuid::new_v4();
        for (name, content) in [
            ("junk.tag", vec![0xFF; 40]),
            ("good.tag", three_epoch_file("Paver", 100.0)),
        ] {
            assert!(pipeline.submitter.submit(request(name, project, content)).await.success);
        }

        assert_eq!(pipeline.processor.process_batch()?, 2);
        assert_eq!(pipeline.processor.process_batch()?, 0);

        let processed = pipeline.processor.processed()?;
        assert!(matches!(processed[0].outcome, TagFileOutcome::Quarantined(_)));
        assert!(matches!(processed[1].outcome, TagFileOutcome::Integrated(_)));
        assert_eq!(processed[1].file_name, "good.tag");
        Ok(())
    }
}
