//! Model catalog and on-disk weight management.

pub mod catalog;
pub mod downloader;
pub mod store;

pub use catalog::{
    find_variant, get_model_catalog, is_in_catalog, list_variants, ModelDescriptor, ModelFamily,
};
pub use downloader::{DownloadError, DownloadOutcome, Downloader};
pub use store::{ModelStore, StoreError};

use serde::{Deserialize, Serialize};

/// Catalog entry combined with its local availability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    /// Completed file present in the store
    pub downloaded: bool,
    /// Bytes of an abandoned partial download, if one exists
    pub partial_bytes: Option<u64>,
}

/// The full catalog annotated with what the store holds.
pub fn list_models(store: &ModelStore) -> Vec<ModelInfo> {
    get_model_catalog()
        .into_iter()
        .map(|descriptor| {
            let downloaded = store.exists(&descriptor);
            let partial_bytes = store.partial_bytes(&descriptor);
            ModelInfo {
                descriptor,
                downloaded,
                partial_bytes,
            }
        })
        .collect()
}
