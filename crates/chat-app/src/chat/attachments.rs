use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use relay_llm::OutboundFile;
use snafu::{ResultExt, Snafu, ensure};

/// Per-file size ceiling: 10 MiB.
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// A file chosen for the next turn but not yet sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingAttachment {
    pub display_name: String,
    pub source_path: PathBuf,
}

impl PendingAttachment {
    /// Builds an attachment whose display name is the final path segment.
    pub fn from_path(path: &Path) -> Self {
        let display_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Self {
            display_name,
            source_path: path.to_path_buf(),
        }
    }

    pub fn to_outbound(&self) -> OutboundFile {
        OutboundFile::new(self.display_name.clone(), self.source_path.clone())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AttachmentError {
    #[snafu(display("{} is already attached", path.display()))]
    AlreadyAttached { stage: &'static str, path: PathBuf },
    #[snafu(display(
        "{} is {size} bytes, over the {limit} byte attachment limit",
        path.display()
    ))]
    FileTooLarge {
        stage: &'static str,
        path: PathBuf,
        size: u64,
        limit: u64,
    },
    #[snafu(display("{} is not a regular file", path.display()))]
    NotAFile { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to read file information for {}: {source}", path.display()))]
    ReadMetadata {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// Result of attaching several files at once.
#[derive(Debug, Default)]
pub struct AttachBatch {
    pub added: Vec<PendingAttachment>,
    pub rejected: Vec<AttachmentError>,
}

/// Files waiting to go out with the next turn, in attach order.
///
/// No two entries share a `source_path`.
#[derive(Debug)]
pub struct AttachmentStore {
    max_bytes: u64,
    pending: Mutex<Vec<PendingAttachment>>,
}

impl Default for AttachmentStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTACHMENT_BYTES)
    }
}

impl AttachmentStore {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn add(&self, path: impl AsRef<Path>) -> AttachmentResult<PendingAttachment> {
        let path = path.as_ref();
        let mut pending = self.lock();

        ensure!(
            !pending.iter().any(|existing| existing.source_path == path),
            AlreadyAttachedSnafu {
                stage: "attach-check-duplicate",
                path,
            }
        );

        let metadata = std::fs::metadata(path).context(ReadMetadataSnafu {
            stage: "attach-read-metadata",
            path,
        })?;
        ensure!(
            metadata.is_file(),
            NotAFileSnafu {
                stage: "attach-check-kind",
                path,
            }
        );
        ensure!(
            metadata.len() <= self.max_bytes,
            FileTooLargeSnafu {
                stage: "attach-check-size",
                path,
                size: metadata.len(),
                limit: self.max_bytes,
            }
        );

        let attachment = PendingAttachment::from_path(path);
        pending.push(attachment.clone());
        tracing::debug!(
            display_name = %attachment.display_name,
            size = metadata.len(),
            pending_count = pending.len(),
            "attachment added"
        );

        Ok(attachment)
    }

    /// Adds every path in order. A refused file never stops the rest of the batch.
    pub fn add_batch<I, P>(&self, paths: I) -> AttachBatch
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut batch = AttachBatch::default();

        for path in paths {
            match self.add(path) {
                Ok(attachment) => batch.added.push(attachment),
                Err(error) => {
                    tracing::warn!(
                        stage = error_stage(&error),
                        error = %error,
                        "attachment rejected"
                    );
                    batch.rejected.push(error);
                }
            }
        }

        batch
    }

    /// Removes the attachment with the same source path. Returns whether
    /// anything was removed.
    pub fn remove(&self, attachment: &PendingAttachment) -> bool {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|existing| existing.source_path != attachment.source_path);
        before != pending.len()
    }

    /// Takes every pending attachment, leaving the store empty.
    pub fn drain_all(&self) -> Vec<PendingAttachment> {
        std::mem::take(&mut *self.lock())
    }

    /// Removes exactly the given entries, matched by source path, and returns
    /// the ones that were still pending. Entries added later stay queued.
    pub fn consume(&self, sent: &[PendingAttachment]) -> Vec<PendingAttachment> {
        let mut pending = self.lock();
        let (consumed, kept) = std::mem::take(&mut *pending)
            .into_iter()
            .partition(|existing| {
                sent.iter()
                    .any(|attachment| attachment.source_path == existing.source_path)
            });
        *pending = kept;
        consumed
    }

    pub fn pending(&self) -> Vec<PendingAttachment> {
        self.lock().clone()
    }

    pub fn find_by_name(&self, display_name: &str) -> Option<PendingAttachment> {
        self.lock()
            .iter()
            .find(|attachment| attachment.display_name == display_name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingAttachment>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn error_stage(error: &AttachmentError) -> &'static str {
    match error {
        AttachmentError::AlreadyAttached { stage, .. }
        | AttachmentError::FileTooLarge { stage, .. }
        | AttachmentError::NotAFile { stage, .. }
        | AttachmentError::ReadMetadata { stage, .. } => *stage,
    }
}
