use super::StreamKind;
use crate::error::Result;
use crate::segment::{SegmentBlob, SegmentDirectory, SegmentForm};

/// Turns a blob written to a mutable proxy into its immutable form.
///
/// `Ok(None)` means the blob has no immutable counterpart and is not
/// mirrored.
pub trait MutabilityConverter: Send + Sync {
    fn convert(&self, kind: StreamKind, bytes: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Rewrites segments into the configured form and compression. Directories
/// are rewritten so their descriptors report that form; other streams are
/// mirrored unchanged.
#[derive(Debug, Clone, Copy)]
pub struct SegmentFormConverter {
    pub form: SegmentForm,
    pub compress: bool,
}

impl SegmentFormConverter {
    pub fn new(form: SegmentForm, compress: bool) -> Self {
        Self { form, compress }
    }
}

impl MutabilityConverter for SegmentFormConverter {
    fn convert(&self, kind: StreamKind, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        match kind {
            StreamKind::SegmentPasses => {
                let blob = SegmentBlob::decode(bytes)?.into_form(self.form)?;
                Ok(Some(blob.encode(self.compress)))
            }
            StreamKind::Directory => {
                let mut directory = SegmentDirectory::decode(bytes)?;
                for info in directory.segments.iter_mut() {
                    info.form = self.form;
                }
                Ok(Some(directory.encode()))
            }
            StreamKind::ExistenceMap | StreamKind::Metadata => Ok(Some(bytes.to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::pass_at;
    use crate::segment::{CellPassStacks, SegmentInfo};

    fn full_segment() -> Vec<u8> {
        let mut stacks = CellPassStacks::new();
        stacks.add(2, 2, pass_at(10, 1.0));
        stacks.add(2, 2, pass_at(20, 2.0));
        SegmentBlob::full(stacks).encode(false)
    }

    #[test]
    fn test_segment_converted_to_latest_grid() -> Result<()> {
        let converter = SegmentFormConverter::new(SegmentForm::LatestPassGrid, true);
        let converted = converter
            .convert(StreamKind::SegmentPasses, &full_segment())?
            .expect("segments are mirrored");

        let blob = SegmentBlob::decode(&converted)?;
        assert_eq!(blob.form, SegmentForm::LatestPassGrid);
        assert!(blob.passes.is_none());
        assert_eq!(blob.latest.get(2, 2).map(|p| p.height), Some(2.0));
        Ok(())
    }

    #[test]
    fn test_directory_reports_immutable_form() -> Result<()> {
        let directory = SegmentDirectory {
            next_version: 2,
            segments: vec![SegmentInfo::unbounded()],
            global_latest: None,
        };

        let converter = SegmentFormConverter::new(SegmentForm::LatestPassGrid, false);
        let converted = converter
            .convert(StreamKind::Directory, &directory.encode())?
            .expect("directories are mirrored");
        let decoded = SegmentDirectory::decode(&converted)?;
        assert_eq!(decoded.segments[0].form, SegmentForm::LatestPassGrid);
        assert_eq!(decoded.next_version, 2);
        Ok(())
    }

    #[test]
    fn test_metadata_passes_through() -> Result<()> {
        let converter = SegmentFormConverter::new(SegmentForm::FullPassStack, true);
        assert_eq!(
            converter.convert(StreamKind::Metadata, b"abc")?,
            Some(b"abc".to_vec())
        );
        Ok(())
    }
}
