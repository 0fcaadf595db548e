//! Persistence collaborator boundary.
//!
//! Writing scan results to a structured file lives outside this crate.
//! The engine only needs to configure the store while arming, create the
//! file before the loop starts, and finalize it during cleanup so that
//! observers reacting to the scan-end notification see a consistent
//! result.

use crate::error::ScanResult;
use crate::model::ScanModel;
use async_trait::async_trait;
use std::path::PathBuf;

/// External collaborator that persists acquired frames.
#[async_trait]
pub trait ScanFileStore: Send + Sync {
    /// Prepare the store for the given scan.
    async fn configure(&self, model: &ScanModel) -> ScanResult<()>;

    /// Create the result file, returning its path if one was created.
    async fn create_file(&self) -> ScanResult<Option<PathBuf>>;

    /// Whether this store will actually persist anything. When false the
    /// engine substitutes an empty write pipeline.
    fn is_enabled(&self) -> bool;

    /// Finalize the result file. Called on every exit path, before the
    /// scan-end notification.
    async fn scan_finished(&self) -> ScanResult<()>;

    /// Paths of any files written by detectors themselves.
    fn external_file_paths(&self) -> Vec<PathBuf>;
}

/// Store used when no persistence is wanted; disables the write pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFileStore;

#[async_trait]
impl ScanFileStore for NullFileStore {
    async fn configure(&self, _model: &ScanModel) -> ScanResult<()> {
        Ok(())
    }

    async fn create_file(&self) -> ScanResult<Option<PathBuf>> {
        Ok(None)
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn scan_finished(&self) -> ScanResult<()> {
        Ok(())
    }

    fn external_file_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}
