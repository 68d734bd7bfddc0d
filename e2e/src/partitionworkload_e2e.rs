use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams, ResourceExt},
    discovery::Discovery,
    Client,
};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::*;

use partitionworkload_controller::config::CONTROLLER_REVISION_HASH_LABEL;
use partitionworkload_controller::partitionworkload_types::{
    PartitionWorkload, PartitionWorkloadStatus,
};

use crate::common::*;

const PW_NAME: &str = "pw-e2e";
const SCALE_PW_NAME: &str = "pw-scale";

pub fn partition_workload() -> String {
    "
    apiVersion: workload.scott.dev/v1alpha1
    kind: PartitionWorkload
    metadata:
      name: pw-e2e
    spec:
      replicas: 2
      partition: 1
      selector:
        matchLabels:
          app: pw-e2e
      template:
        metadata:
          labels:
            app: pw-e2e
        spec:
          containers:
          - name: nginx
            image: nginx
    "
    .to_string()
}

pub fn scaling_partition_workload() -> String {
    "
    apiVersion: workload.scott.dev/v1alpha1
    kind: PartitionWorkload
    metadata:
      name: pw-scale
    spec:
      replicas: 1
      partition: 1
      selector:
        matchLabels:
          app: pw-scale
      template:
        metadata:
          labels:
            app: pw-scale
        spec:
          containers:
          - name: nginx
            image: nginx
    "
    .to_string()
}

pub fn invalid_partition_workload() -> String {
    "
    apiVersion: workload.scott.dev/v1alpha1
    kind: PartitionWorkload
    metadata:
      name: pw-invalid
    spec:
      replicas: 2
      partition: 3
      selector:
        matchLabels:
          app: pw-invalid
      template:
        metadata:
          labels:
            app: pw-invalid
        spec:
          containers:
          - name: nginx
            image: nginx
    "
    .to_string()
}

async fn get_status(client: Client, name: &str) -> Result<PartitionWorkloadStatus, Error> {
    let api: Api<PartitionWorkload> = Api::default_namespaced(client);
    let pw = api.get(name).await?;
    Ok(pw.status.unwrap_or_default())
}

async fn list_owned_pods(client: Client, name: &str) -> Result<Vec<Pod>, Error> {
    let api: Api<Pod> = Api::default_namespaced(client);
    let pods = api
        .list(&ListParams::default().labels(&format!("app={}", name)))
        .await?;
    Ok(pods
        .items
        .into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect())
}

async fn list_owned_revisions(
    client: Client,
    name: &str,
) -> Result<Vec<ControllerRevision>, Error> {
    let api: Api<ControllerRevision> = Api::default_namespaced(client);
    let revisions = api
        .list(&ListParams::default().labels(&format!("app={}", name)))
        .await?;
    Ok(revisions
        .items
        .into_iter()
        .filter(|cr| {
            cr.owner_references()
                .iter()
                .any(|r| r.controller == Some(true) && r.name == name)
        })
        .collect())
}

fn image_counts(pods: &[Pod], image: &str) -> usize {
    pods.iter()
        .filter(|p| {
            p.spec
                .as_ref()
                .map(|s| s.containers.iter().any(|c| c.image.as_deref() == Some(image)))
                .unwrap_or(false)
        })
        .count()
}

fn pods_on_revision(pods: &[Pod], revision: &str) -> usize {
    pods.iter()
        .filter(|p| {
            p.labels()
                .get(CONTROLLER_REVISION_HASH_LABEL)
                .map(|v| v == revision)
                .unwrap_or(false)
        })
        .count()
}

/// One polling step of every scenario: the expected population and status
/// for a (nginx pods, nginx2 pods, updatedReplicas, revisions, stabilized)
/// tuple.
async fn wait_for_state(
    client: Client,
    name: &str,
    nginx_pods: usize,
    nginx2_pods: usize,
    updated_replicas: i32,
    revision_count: usize,
    stabilized: bool,
) -> Result<(), Error> {
    let timeout = Duration::from_secs(360);
    let start = Instant::now();
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > timeout {
            error!("Time out waiting for the desired state");
            return Err(Error::Timeout);
        }

        let pods = match list_owned_pods(client.clone(), name).await {
            Err(e) => {
                info!("List pods failed with error {}.", e);
                continue;
            }
            Ok(pods) => pods,
        };
        if image_counts(&pods, "nginx") != nginx_pods
            || image_counts(&pods, "nginx2") != nginx2_pods
        {
            info!(
                "Pod population is {} nginx / {} nginx2; want {} / {}.",
                image_counts(&pods, "nginx"),
                image_counts(&pods, "nginx2"),
                nginx_pods,
                nginx2_pods
            );
            continue;
        }

        let status = match get_status(client.clone(), name).await {
            Err(e) => {
                info!("Get status failed with error {}.", e);
                continue;
            }
            Ok(status) => status,
        };
        let expected_replicas = (nginx_pods + nginx2_pods) as i32;
        if status.replicas != expected_replicas || status.updated_replicas != updated_replicas {
            info!(
                "Status replicas={} updatedReplicas={}; want {} and {}.",
                status.replicas, status.updated_replicas, expected_replicas, updated_replicas
            );
            continue;
        }
        let (current, update) = match (&status.current_revision, &status.update_revision) {
            (Some(current), Some(update)) => (current.clone(), update.clone()),
            _ => {
                info!("Revisions not yet published in status.");
                continue;
            }
        };
        if stabilized != (current == update) {
            info!(
                "currentRevision={} updateRevision={}; want stabilized={}.",
                current, update, stabilized
            );
            continue;
        }
        if pods_on_revision(&pods, &update) != updated_replicas as usize {
            info!("Pods are not yet labeled with the update revision.");
            continue;
        }

        let revisions = match list_owned_revisions(client.clone(), name).await {
            Err(e) => {
                info!("List revisions failed with error {}.", e);
                continue;
            }
            Ok(revisions) => revisions,
        };
        if revisions.len() != revision_count {
            info!(
                "Revision count is {}; want {}.",
                revisions.len(),
                revision_count
            );
            continue;
        }

        return Ok(());
    }
}

pub async fn desired_state_test(client: Client) -> Result<(), Error> {
    // replicas=2, partition=1 on a fresh create: one revision, both cohorts
    // on it, stabilized immediately.
    wait_for_state(client, PW_NAME, 2, 0, 2, 1, true).await?;
    info!("Desired state test passed.");
    Ok(())
}

pub async fn rollout_test(client: Client) -> Result<(), Error> {
    run_command(
        "kubectl",
        vec![
            "patch",
            "pw",
            PW_NAME,
            "--type=merge",
            "-p",
            "{\"spec\":{\"template\":{\"spec\":{\"containers\":[{\"name\":\"nginx\",\"image\":\"nginx2\"}]}}}}",
        ],
        "failed to update PartitionWorkload template",
    );
    // partition=1 holds one pod on each revision.
    wait_for_state(client, PW_NAME, 1, 1, 1, 2, false).await?;
    info!("Rollout test passed.");
    Ok(())
}

pub async fn rollback_test(client: Client) -> Result<(), Error> {
    run_command(
        "kubectl",
        vec![
            "patch",
            "pw",
            PW_NAME,
            "--type=merge",
            "-p",
            "{\"spec\":{\"partition\":0}}",
        ],
        "failed to set partition",
    );
    // Every pod back on the old image; history untouched.
    wait_for_state(client, PW_NAME, 2, 0, 0, 2, false).await?;
    info!("Rollback test passed.");
    Ok(())
}

pub async fn full_rollout_test(client: Client) -> Result<(), Error> {
    run_command(
        "kubectl",
        vec![
            "patch",
            "pw",
            PW_NAME,
            "--type=merge",
            "-p",
            "{\"spec\":{\"partition\":2}}",
        ],
        "failed to set partition",
    );
    // Rollout completes and the current revision advances.
    wait_for_state(client, PW_NAME, 0, 2, 2, 2, true).await?;
    info!("Full rollout test passed.");
    Ok(())
}

pub async fn scaling_test(client: Client) -> Result<(), Error> {
    let discovery = Discovery::new(client.clone()).run().await?;
    apply(scaling_partition_workload(), client.clone(), &discovery).await?;
    wait_for_state(client.clone(), SCALE_PW_NAME, 1, 0, 1, 1, true).await?;

    run_command(
        "kubectl",
        vec![
            "patch",
            "pw",
            SCALE_PW_NAME,
            "--type=merge",
            "-p",
            "{\"spec\":{\"replicas\":2}}",
        ],
        "failed to scale PartitionWorkload",
    );
    wait_for_state(client.clone(), SCALE_PW_NAME, 2, 0, 2, 1, true).await?;

    run_command(
        "kubectl",
        vec![
            "patch",
            "pw",
            SCALE_PW_NAME,
            "--type=merge",
            "-p",
            "{\"spec\":{\"replicas\":1}}",
        ],
        "failed to scale PartitionWorkload",
    );
    wait_for_state(client.clone(), SCALE_PW_NAME, 1, 0, 1, 1, true).await?;

    info!("Scaling test passed.");
    Ok(())
}

pub async fn webhook_test(client: Client) -> Result<(), Error> {
    let discovery = Discovery::new(client.clone()).run().await?;
    match apply(invalid_partition_workload(), client.clone(), &discovery).await {
        Ok(_) => {
            error!("Invalid PartitionWorkload was admitted.");
            return Err(Error::WebhookAcceptedInvalid);
        }
        Err(e) => {
            info!("Invalid PartitionWorkload was rejected: {}", e);
        }
    }

    // Nothing may have materialized for the rejected object.
    let pods = list_owned_pods(client.clone(), "pw-invalid").await?;
    let revisions = list_owned_revisions(client, "pw-invalid").await?;
    if !pods.is_empty() || !revisions.is_empty() {
        return Err(Error::WebhookAcceptedInvalid);
    }

    info!("Webhook test passed.");
    Ok(())
}

pub async fn partitionworkload_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    match crd_api.get("partitionworkloads.workload.scott.dev").await {
        Err(e) => {
            error!("No CRD found, create one before run the e2e test.");
            return Err(Error::CRDGetFailed(e));
        }
        Ok(_) => {
            info!("CRD found, continue to run the e2e test.");
        }
    }

    let discovery = Discovery::new(client.clone()).run().await?;
    apply(partition_workload(), client.clone(), &discovery).await?;

    desired_state_test(client.clone()).await?;
    rollout_test(client.clone()).await?;
    rollback_test(client.clone()).await?;
    full_rollout_test(client.clone()).await?;
    scaling_test(client.clone()).await?;

    info!("E2e test passed.");
    Ok(())
}

pub async fn webhook_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    webhook_test(client).await?;
    info!("Webhook e2e test passed.");
    Ok(())
}
