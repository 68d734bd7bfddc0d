pub mod condition;
pub mod config;
pub mod history;
pub mod ownership;
pub mod partitionworkload_types;
pub mod reconciler;
pub mod revision;
pub mod status;
pub mod sync;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get PartitionWorkload: {0}")]
    GetPartitionWorkloadFailed(#[source] kube::Error),

    #[error("Failed to list pods: {0}")]
    PodListFailed(#[source] kube::Error),

    #[error("Failed to claim pods: {0}")]
    ClaimPodsFailed(#[source] kube::Error),

    #[error("PartitionWorkload no longer exists or is terminating; refusing to adopt pods")]
    AdoptionPreconditionFailed,

    #[error("Failed to list ControllerRevisions: {0}")]
    RevisionListFailed(#[source] kube::Error),

    #[error("Failed to create ControllerRevision: {0}")]
    RevisionCreateFailed(#[source] kube::Error),

    #[error("Failed to update ControllerRevision: {0}")]
    RevisionUpdateFailed(#[source] kube::Error),

    #[error("Failed to delete ControllerRevision: {0}")]
    RevisionDeleteFailed(#[source] kube::Error),

    #[error("Failed to create pod: {0}")]
    PodCreationFailed(#[source] kube::Error),

    #[error("Failed to delete pod: {0}")]
    PodDeletionFailed(#[source] kube::Error),

    #[error("Not enough pods with the updated revision to delete")]
    NotEnoughUpdatedPodsToDelete,

    #[error("Not enough pods with the current revision to delete")]
    NotEnoughCurrentPodsToDelete,

    #[error("spec.replicas is not set")]
    MissingReplicas,

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Failed to encode object: {0}")]
    EncodeFailed(#[source] serde_json::Error),

    #[error("Failed to decode revision data: {0}")]
    RevisionDecodeFailed(#[source] serde_json::Error),

    #[error("ControllerRevision carries no data")]
    EmptyRevisionData,

    #[error("Failed to update status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
}

impl Error {
    /// Errors that no amount of requeueing can fix; only a user edit can.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidSelector(_) | Error::RevisionDecodeFailed(_) | Error::EmptyRevisionData
        )
    }
}
