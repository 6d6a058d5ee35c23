//! External storage collaborators: the blob store (image binaries) and the
//! metadata store (Image/Detection/Job records). Both are traits with a
//! production backend and an in-memory fake, so handlers, the Job Queue,
//! and the Worker Runtime never depend on a live Azure account or MongoDB
//! cluster to be tested.

pub mod blob_store;
pub mod metadata_store;

pub use blob_store::{AzureBlobStore, BlobStore, BlobStoreError};
pub use metadata_store::mongo::MongoMetadataStore;
pub use metadata_store::{MetadataStore, MetadataStoreError, PipelineStats};

#[cfg(any(test, feature = "testing"))]
pub use blob_store::InMemoryBlobStore;
#[cfg(any(test, feature = "testing"))]
pub use metadata_store::memory::InMemoryMetadataStore;
