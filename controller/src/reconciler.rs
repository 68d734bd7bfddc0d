use std::sync::Arc;
use std::time::Duration;

use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};

use crate::condition::{failed_scale_condition, set_condition};
use crate::history;
use crate::ownership::{self, PodSelector};
use crate::partitionworkload_types::{PartitionWorkload, PartitionWorkloadStatus};
use crate::revision;
use crate::status;
use crate::sync;
use crate::Error;

pub struct Data {
    pub client: Client,
}

/// Runs a single reconcile: fetch, claim, revise, sync, publish status,
/// truncate history. A sync failure still publishes status and truncates
/// before the error is handed back for requeueing.
pub async fn reconcile(pw: Arc<PartitionWorkload>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = ctx.client.clone();
    let namespace = pw.namespace().unwrap();
    let name = pw.name_any();

    let api: Api<PartitionWorkload> = Api::namespaced(client.clone(), &namespace);
    let instance = match api
        .get_opt(&name)
        .await
        .map_err(Error::GetPartitionWorkloadFailed)?
    {
        Some(instance) => instance,
        None => {
            info!("PartitionWorkload {}/{} has been deleted", namespace, name);
            return Ok(Action::await_change());
        }
    };

    let selector = match PodSelector::parse(&instance.spec.selector) {
        Ok(selector) => selector,
        Err(e) => {
            // Only a user edit can fix the selector; requeueing would spin.
            error!(
                "Error converting selector of PartitionWorkload {}/{}: {}",
                namespace, name, e
            );
            return Ok(Action::await_change());
        }
    };

    let active_pods = ownership::get_active_pods(client.clone(), &instance).await?;
    let managed_pods = ownership::claim_pods(client.clone(), &instance, &selector, active_pods).await?;

    let revisions =
        history::list_controller_revisions(client.clone(), &instance, &selector.label_query())
            .await?;

    let (current_revision, update_revision, collision_count) =
        revision::get_active_revisions(client.clone(), &instance, &revisions).await?;

    let mut new_status = PartitionWorkloadStatus {
        observed_generation: instance.metadata.generation,
        current_revision: current_revision.metadata.name.clone(),
        update_revision: update_revision.metadata.name.clone(),
        collision_count: Some(collision_count),
        conditions: instance
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
        ..Default::default()
    };

    let sync_result = sync::sync_partition_workload(
        client.clone(),
        &instance,
        &current_revision,
        &update_revision,
        &managed_pods,
    )
    .await;

    if let Err(e) = &sync_result {
        warn!(
            "Failed to scale PartitionWorkload {}/{}: {}",
            namespace, name, e
        );
        set_condition(&mut new_status, failed_scale_condition(&e.to_string()));
    }

    status::update_status(client.clone(), &instance, &mut new_status, &managed_pods).await?;

    if let Err(e) = history::truncate_history(
        client,
        &instance,
        &managed_pods,
        &revisions,
        &current_revision,
        &update_revision,
    )
    .await
    {
        error!(
            "Failed to truncate history for PartitionWorkload {}/{}: {}",
            namespace, name, e
        );
    }

    match sync_result {
        Ok(()) => Ok(Action::requeue(Duration::from_secs(300))),
        Err(e) if e.is_fatal() => {
            error!(
                "Giving up on PartitionWorkload {}/{} until the spec changes: {}",
                namespace, name, e
            );
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// object that caused the failure and the actual error
pub fn error_policy(_obj: Arc<PartitionWorkload>, _error: &Error, _ctx: Arc<Data>) -> Action {
    Action::requeue(Duration::from_secs(60))
}
