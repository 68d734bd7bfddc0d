use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::cmp::min;
use std::collections::BTreeMap;
use tracing::info;

use crate::config::{CONTROLLER_REVISION_HASH_LABEL, INITIAL_BATCH_SIZE, POD_TEMPLATE_HASH_LABEL};
use crate::partitionworkload_types::PartitionWorkload;
use crate::revision::apply_revision;
use crate::Error;

/// How many pods of each cohort must be created or deleted to reach the
/// declared (replicas, partition) target. All counts are non-negative.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpectationDiffs {
    /// Updated-revision pods to create.
    pub scale_up_updated: usize,
    /// Current-revision pods to create.
    pub scale_up_current: usize,
    /// Updated-revision pods to delete.
    pub scale_down_updated: usize,
    /// Current-revision pods to delete.
    pub scale_down_current: usize,
}

impl ExpectationDiffs {
    pub fn is_empty(&self) -> bool {
        *self == ExpectationDiffs::default()
    }
}

/// Converts the declared state and the observed pod population into cohort
/// create/delete counts. Scale up, scale down, rollout and rollback all
/// reduce to the same arithmetic: recreate updates mean a version change is
/// a delete in one cohort plus a create in the other.
pub fn calculate_diffs(
    pw: &PartitionWorkload,
    pods: &[Pod],
    current_revision: &str,
    updated_revision: &str,
) -> ExpectationDiffs {
    let replicas = pw.spec.replicas.unwrap_or_default() as i64;
    let partition = match pw.spec.partition {
        Some(p) => min(p as i64, replicas),
        None => replicas,
    };

    let updated_count = pods
        .iter()
        .filter(|p| equal_to_revision_hash(p, updated_revision))
        .count() as i64;
    let other_count = pods.len() as i64 - updated_count;

    // With a single revision every pod counts as updated; folding the old
    // cohort away keeps a pure scale operation from demanding deletions of
    // old pods that cannot exist.
    let (updated_diff, other_diff) = if updated_revision == current_revision {
        (updated_count + other_count - replicas, 0)
    } else {
        (updated_count - partition, other_count - (replicas - partition))
    };

    let mut res = ExpectationDiffs::default();
    if updated_diff < 0 {
        res.scale_up_updated = updated_diff.unsigned_abs() as usize;
    }
    if other_diff < 0 {
        res.scale_up_current = other_diff.unsigned_abs() as usize;
    }
    if updated_diff > 0 {
        res.scale_down_updated = updated_diff as usize;
    }
    if other_diff > 0 {
        res.scale_down_current = other_diff as usize;
    }
    res
}

pub fn equal_to_revision_hash(pod: &Pod, hash: &str) -> bool {
    pod.labels()
        .get(CONTROLLER_REVISION_HASH_LABEL)
        .map(|v| v == hash)
        .unwrap_or(false)
}

pub fn group_updated_and_not_updated_pods(
    pods: Vec<Pod>,
    updated_revision: &str,
) -> (Vec<Pod>, Vec<Pod>) {
    pods.into_iter()
        .partition(|p| equal_to_revision_hash(p, updated_revision))
}

/// Stamps both revision labels. The full revision name goes into
/// controller-revision-hash; pod-template-hash always carries the short
/// form, which is the last `-` segment of the name.
pub fn write_revision_hash(labels: &mut BTreeMap<String, String>, hash: &str) {
    labels.insert(CONTROLLER_REVISION_HASH_LABEL.to_string(), hash.to_string());
    labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), short_hash(hash).to_string());
}

fn short_hash(hash: &str) -> &str {
    hash.rsplit('-').next().unwrap_or(hash)
}

/// Sorts by creation time ascending, breaking timestamp ties by name so
/// delete candidates are deterministic.
pub fn sort_pods_oldest_first(pods: &mut [Pod]) {
    pods.sort_by(|a, b| {
        let a_created = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let b_created = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
        a_created
            .cmp(&b_created)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

fn new_versioned_pods(pw: &PartitionWorkload, revision: &str, count: usize) -> Vec<Pod> {
    let mut pods = Vec::with_capacity(count);
    for _ in 0..count {
        let template = &pw.spec.template;
        let mut labels = template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        write_revision_hash(&mut labels, revision);

        pods.push(Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", pw.name_any())),
                namespace: pw.metadata.namespace.clone(),
                labels: Some(labels),
                annotations: template.metadata.as_ref().and_then(|m| m.annotations.clone()),
                owner_references: pw.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            spec: template.spec.clone(),
            status: None,
        });
    }
    pods
}

/// Creates the requested pods, current cohort first, in doubling batches so
/// a large scale-up paces the API instead of flooding it. The first failure
/// aborts the remainder.
async fn create_pods(
    client: Client,
    expected_updated_creations: usize,
    expected_current_creations: usize,
    current_pw: &PartitionWorkload,
    updated_pw: &PartitionWorkload,
    current_revision: &str,
    updated_revision: &str,
) -> Result<(), Error> {
    if expected_current_creations == 0 && expected_updated_creations == 0 {
        return Ok(());
    }

    let mut new_pods = new_versioned_pods(current_pw, current_revision, expected_current_creations);
    new_pods.extend(new_versioned_pods(
        updated_pw,
        updated_revision,
        expected_updated_creations,
    ));

    info!(
        "Creating {} current-revision and {} updated-revision pods for {}",
        expected_current_creations,
        expected_updated_creations,
        updated_pw.name_any()
    );

    let api: Api<Pod> = Api::namespaced(
        client,
        updated_pw.metadata.namespace.as_deref().unwrap_or_default(),
    );
    let mut remaining = new_pods.as_slice();
    let mut batch_size = INITIAL_BATCH_SIZE;
    while !remaining.is_empty() {
        let (batch, rest) = remaining.split_at(min(batch_size, remaining.len()));
        for pod in batch {
            api.create(&PostParams::default(), pod)
                .await
                .map_err(Error::PodCreationFailed)?;
        }
        remaining = rest;
        batch_size *= 2;
    }
    Ok(())
}

/// Deletes the requested number of pods from each cohort, oldest first,
/// updated cohort before current cohort. Asking for more deletions than a
/// cohort holds is an error rather than a silent truncation.
async fn delete_pods(
    client: Client,
    namespace: &str,
    expected_updated_deletions: usize,
    expected_current_deletions: usize,
    mut updated_pods: Vec<Pod>,
    mut not_updated_pods: Vec<Pod>,
) -> Result<(), Error> {
    if expected_updated_deletions == 0 && expected_current_deletions == 0 {
        return Ok(());
    }

    let mut pods_to_delete: Vec<Pod> = Vec::new();
    if expected_updated_deletions > 0 {
        if updated_pods.len() < expected_updated_deletions {
            return Err(Error::NotEnoughUpdatedPodsToDelete);
        }
        sort_pods_oldest_first(&mut updated_pods);
        pods_to_delete.extend(updated_pods.into_iter().take(expected_updated_deletions));
    }

    if expected_current_deletions > 0 {
        if not_updated_pods.len() < expected_current_deletions {
            return Err(Error::NotEnoughCurrentPodsToDelete);
        }
        sort_pods_oldest_first(&mut not_updated_pods);
        pods_to_delete.extend(not_updated_pods.into_iter().take(expected_current_deletions));
    }

    info!(
        "Deleting {} updated-revision and {} current-revision pods",
        expected_updated_deletions, expected_current_deletions
    );

    let api: Api<Pod> = Api::namespaced(client, namespace);
    for pod in &pods_to_delete {
        api.delete(&pod.name_any(), &DeleteParams::default())
            .await
            .map_err(Error::PodDeletionFailed)?;
    }
    Ok(())
}

/// Drives the owned pod population to the declared (replicas, partition)
/// target: computes the cohort diffs, creates what is missing and deletes
/// what is surplus.
pub async fn scale_and_update(
    client: Client,
    current_pw: &PartitionWorkload,
    updated_pw: &PartitionWorkload,
    current_revision: &str,
    updated_revision: &str,
    pods: &[Pod],
) -> Result<(), Error> {
    if updated_pw.spec.replicas.is_none() {
        return Err(Error::MissingReplicas);
    }
    if updated_pw.metadata.deletion_timestamp.is_some() {
        // Garbage collection tears the pods down with the owner.
        return Ok(());
    }

    let diffs = calculate_diffs(updated_pw, pods, current_revision, updated_revision);
    if !diffs.is_empty() {
        info!(
            "Calculated diffs for {}: {:?}",
            updated_pw.name_any(),
            diffs
        );
    }

    let (updated_pods, not_updated_pods) =
        group_updated_and_not_updated_pods(pods.to_vec(), updated_revision);

    create_pods(
        client.clone(),
        diffs.scale_up_updated,
        diffs.scale_up_current,
        current_pw,
        updated_pw,
        current_revision,
        updated_revision,
    )
    .await?;

    delete_pods(
        client,
        updated_pw.metadata.namespace.as_deref().unwrap_or_default(),
        diffs.scale_down_updated,
        diffs.scale_down_current,
        updated_pods,
        not_updated_pods,
    )
    .await
}

/// Reconstructs the PartitionWorkload at both active revisions and applies
/// the diff between the declared and the observed population.
pub async fn sync_partition_workload(
    client: Client,
    instance: &PartitionWorkload,
    current_revision: &ControllerRevision,
    update_revision: &ControllerRevision,
    pods: &[Pod],
) -> Result<(), Error> {
    let current_pw = apply_revision(instance, current_revision)?;
    let updated_pw = apply_revision(instance, update_revision)?;
    scale_and_update(
        client,
        &current_pw,
        &updated_pw,
        &current_revision.name_any(),
        &update_revision.name_any(),
        pods,
    )
    .await
}
