use thiserror::Error;

/// Classified error kinds surfaced by the cluster façade. Collaborator I/O
/// errors never escape without being mapped onto one of these.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("cluster discovery invalid")]
    DiscoveryInvalid,

    #[error("cluster group not found")]
    GroupNotFound,

    #[error("cluster no engine available")]
    NoEngineAvailable,

    #[error("cluster metadata not found")]
    MetaDataNotFound,

    #[error("cluster container not found")]
    ContainerNotFound,

    #[error("cluster containers instances invalid")]
    InstancesInvalid,

    #[error("cluster create container name conflict")]
    CreateContainerNameConflict,

    #[error("cluster containers meta create failure")]
    MetaCreateFailure,

    #[error("cluster create container failure, {reason}")]
    CreateContainerFailure { reason: String },

    #[error("cluster containers upgrading, please wait a moment")]
    ContainersUpgrading,

    #[error("cluster containers migrating, please wait a moment")]
    ContainersMigrating,

    #[error("cluster containers setting, please wait a moment")]
    ContainersSetting,

    #[error("upgrade containers failure to {image_tag}")]
    UpgradeFailure { image_tag: String },
}
