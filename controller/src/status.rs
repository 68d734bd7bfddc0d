use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::info;

use crate::config::MAX_UPDATE_RETRIES;
use crate::partitionworkload_types::{PartitionWorkload, PartitionWorkloadStatus};
use crate::sync::equal_to_revision_hash;
use crate::Error;

/// Counts the owned population into the status and publishes it through the
/// status subresource, skipping the write when nothing observable changed.
pub async fn update_status(
    client: Client,
    pw: &PartitionWorkload,
    new_status: &mut PartitionWorkloadStatus,
    pods: &[Pod],
) -> Result<(), Error> {
    calculate_status(pw, new_status, pods);
    if !inconsistent_status(pw, new_status) {
        return Ok(());
    }
    info!(
        "Updating status of {}: replicas={} updatedReplicas={} currentRevision={:?} updateRevision={:?}",
        pw.name_any(),
        new_status.replicas,
        new_status.updated_replicas,
        new_status.current_revision,
        new_status.update_revision
    );
    commit_status_update(client, pw, new_status).await
}

fn calculate_status(pw: &PartitionWorkload, new_status: &mut PartitionWorkloadStatus, pods: &[Pod]) {
    new_status.replicas = 0;
    new_status.ready_replicas = 0;
    new_status.updated_replicas = 0;

    let update_revision = new_status.update_revision.as_deref().unwrap_or_default();
    for pod in pods {
        new_status.replicas += 1;
        if equal_to_revision_hash(pod, update_revision) {
            new_status.updated_replicas += 1;
        }
        if pod_ready(pod) {
            new_status.ready_replicas += 1;
        }
    }

    // A completed rollout makes the update revision the new baseline.
    if new_status.updated_replicas == new_status.replicas
        && Some(new_status.replicas) == pw.spec.replicas
    {
        new_status.current_revision = new_status.update_revision.clone();
    }
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn inconsistent_status(pw: &PartitionWorkload, new_status: &PartitionWorkloadStatus) -> bool {
    let old_status = pw.status.clone().unwrap_or_default();
    new_status.observed_generation.unwrap_or_default()
        > old_status.observed_generation.unwrap_or_default()
        || new_status.replicas != old_status.replicas
        || new_status.updated_replicas != old_status.updated_replicas
        || new_status.update_revision != old_status.update_revision
        || new_status.current_revision != old_status.current_revision
}

// Refetches the object on every attempt so a conflicting writer only costs
// a retry, then overwrites .status wholesale through the subresource.
async fn commit_status_update(
    client: Client,
    pw: &PartitionWorkload,
    new_status: &PartitionWorkloadStatus,
) -> Result<(), Error> {
    let api: Api<PartitionWorkload> =
        Api::namespaced(client, pw.metadata.namespace.as_deref().unwrap_or_default());
    let name = pw.name_any();

    for attempt in 0..MAX_UPDATE_RETRIES {
        let mut clone = api.get(&name).await.map_err(Error::StatusUpdateFailed)?;
        clone.status = Some(new_status.clone());
        let payload = serde_json::to_vec(&clone).map_err(Error::EncodeFailed)?;
        match api.replace_status(&name, &PostParams::default(), payload).await {
            Ok(_) => return Ok(()),
            Err(kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
                if reason == "Conflict" && attempt + 1 < MAX_UPDATE_RETRIES => {}
            Err(e) => return Err(Error::StatusUpdateFailed(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use std::collections::BTreeMap;

    use crate::partitionworkload_types::PartitionWorkloadSpec;
    use crate::sync::write_revision_hash;

    const REVISION_1: &str = "test-pw-1111111111111111";
    const REVISION_2: &str = "test-pw-2222222222222222";

    fn test_pw(replicas: i32) -> PartitionWorkload {
        PartitionWorkload::new(
            "test-pw",
            PartitionWorkloadSpec {
                replicas: Some(replicas),
                selector: LabelSelector::default(),
                template: PodTemplateSpec::default(),
                partition: None,
            },
        )
    }

    fn pod_on(revision: &str, ready: bool) -> Pod {
        let mut labels = BTreeMap::new();
        write_revision_hash(&mut labels, revision);
        Pod {
            metadata: ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn status_with(update: &str, current: &str) -> PartitionWorkloadStatus {
        PartitionWorkloadStatus {
            update_revision: Some(update.to_string()),
            current_revision: Some(current.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn counts_split_by_update_revision() {
        let pw = test_pw(3);
        let mut status = status_with(REVISION_2, REVISION_1);
        let pods = vec![
            pod_on(REVISION_2, true),
            pod_on(REVISION_1, true),
            pod_on(REVISION_1, false),
        ];
        calculate_status(&pw, &mut status, &pods);
        assert_eq!(status.replicas, 3);
        assert_eq!(status.updated_replicas, 1);
        assert_eq!(status.ready_replicas, 2);
        // Rollout incomplete: the baseline must not advance.
        assert_eq!(status.current_revision.as_deref(), Some(REVISION_1));
    }

    #[test]
    fn full_rollout_advances_the_current_revision() {
        let pw = test_pw(2);
        let mut status = status_with(REVISION_2, REVISION_1);
        let pods = vec![pod_on(REVISION_2, true), pod_on(REVISION_2, true)];
        calculate_status(&pw, &mut status, &pods);
        assert_eq!(status.current_revision.as_deref(), Some(REVISION_2));
    }

    #[test]
    fn partial_population_does_not_advance_the_baseline() {
        // All pods updated but fewer than spec.replicas.
        let pw = test_pw(3);
        let mut status = status_with(REVISION_2, REVISION_1);
        let pods = vec![pod_on(REVISION_2, true)];
        calculate_status(&pw, &mut status, &pods);
        assert_eq!(status.current_revision.as_deref(), Some(REVISION_1));
    }

    #[test]
    fn unchanged_status_is_consistent() {
        let mut pw = test_pw(2);
        let mut observed = status_with(REVISION_2, REVISION_1);
        observed.replicas = 2;
        observed.updated_replicas = 1;
        pw.status = Some(observed.clone());
        assert!(!inconsistent_status(&pw, &observed));

        let mut changed = observed.clone();
        changed.updated_replicas = 2;
        assert!(inconsistent_status(&pw, &changed));
    }

    #[test]
    fn ready_count_changes_alone_do_not_trigger_a_write() {
        let mut pw = test_pw(2);
        let mut observed = status_with(REVISION_2, REVISION_1);
        observed.replicas = 2;
        pw.status = Some(observed.clone());

        let mut churned = observed.clone();
        churned.ready_replicas = 1;
        assert!(!inconsistent_status(&pw, &churned));
    }
}
