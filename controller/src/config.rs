/// Max number of non-live ControllerRevisions kept around. A revision is
/// live while it is the current or update revision of the PartitionWorkload
/// or at least one owned pod still carries its hash; the limit never counts
/// live revisions.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Label carrying the full revision name on every managed pod.
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";

/// Label carrying the short (last `-` segment) form of the revision hash.
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Size of the first pod-creation batch; subsequent batches double.
pub const INITIAL_BATCH_SIZE: usize = 1;

/// Attempts made by the conflict-retrying writers before giving up.
pub const MAX_UPDATE_RETRIES: usize = 5;
