use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use std::collections::HashSet;
use tracing::info;

use crate::config::{CONTROLLER_REVISION_HASH_LABEL, DEFAULT_HISTORY_LIMIT, MAX_UPDATE_RETRIES};
use crate::ownership::controller_ref;
use crate::partitionworkload_types::PartitionWorkload;
use crate::revision;
use crate::Error;

fn revision_api(client: Client, pw: &PartitionWorkload) -> Api<ControllerRevision> {
    Api::namespaced(client, pw.metadata.namespace.as_deref().unwrap_or_default())
}

/// Lists the ControllerRevisions in the PartitionWorkload's namespace that
/// match the selector and are controlled by it, sorted oldest first.
pub async fn list_controller_revisions(
    client: Client,
    pw: &PartitionWorkload,
    label_query: &str,
) -> Result<Vec<ControllerRevision>, Error> {
    let api = revision_api(client, pw);
    let lp = ListParams::default().labels(label_query);
    let list = api.list(&lp).await.map_err(Error::RevisionListFailed)?;

    let pw_uid = pw.metadata.uid.as_deref().unwrap_or_default();
    let mut owned: Vec<ControllerRevision> = list
        .items
        .into_iter()
        .filter(|cr| controller_ref(cr).map(|r| r.uid == pw_uid).unwrap_or(false))
        .collect();
    sort_controller_revisions(&mut owned);
    Ok(owned)
}

/// Orders revisions by revision number, breaking ties by creation time and
/// finally by name.
pub fn sort_controller_revisions(revisions: &mut [ControllerRevision]) {
    revisions.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| {
                let a_created = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
                let b_created = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
                a_created.cmp(&b_created)
            })
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

/// Creates the revision, renaming with an incremented collision count until
/// the name is free. Finding an existing revision with identical data is a
/// dedup hit, not an error. Terminates because every bump yields a fresh
/// name.
pub async fn create_controller_revision(
    client: Client,
    pw: &PartitionWorkload,
    revision: ControllerRevision,
    collision_count: &mut i32,
) -> Result<ControllerRevision, Error> {
    let api = revision_api(client, pw);
    let mut clone = revision;

    loop {
        let data = revision::revision_data(&clone)?;
        let hash = revision::hash_revision_data(data, *collision_count)?;
        let name = format!("{}-{}", pw.name_any(), hash);
        clone.metadata.name = Some(name.clone());

        match api.create(&PostParams::default(), &clone).await {
            Ok(created) => return Ok(created),
            Err(kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
                if reason == "AlreadyExists" =>
            {
                let existing = api.get(&name).await.map_err(Error::RevisionCreateFailed)?;
                if revision::equal_revision(&existing, &clone) {
                    return Ok(existing);
                }
                *collision_count += 1;
                info!(
                    "Hash collision on ControllerRevision {}; retrying with collision count {}",
                    name, collision_count
                );
            }
            Err(e) => return Err(Error::RevisionCreateFailed(e)),
        }
    }
}

/// Bumps the revision number, retrying on write conflicts with a refetch.
/// A revision already at the requested number is left untouched.
pub async fn update_revision_number(
    client: Client,
    revision: &ControllerRevision,
    new_number: i64,
) -> Result<ControllerRevision, Error> {
    let ns = revision.metadata.namespace.as_deref().unwrap_or_default();
    let api: Api<ControllerRevision> = Api::namespaced(client, ns);
    let name = revision.name_any();
    let mut clone = revision.clone();

    for attempt in 0..MAX_UPDATE_RETRIES {
        if clone.revision == new_number {
            return Ok(clone);
        }
        clone.revision = new_number;
        match api.replace(&name, &PostParams::default(), &clone).await {
            Ok(updated) => return Ok(updated),
            Err(kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
                if reason == "Conflict" && attempt + 1 < MAX_UPDATE_RETRIES =>
            {
                clone = api.get(&name).await.map_err(Error::RevisionUpdateFailed)?;
            }
            Err(e) => return Err(Error::RevisionUpdateFailed(e)),
        }
    }
    Ok(clone)
}

pub async fn delete_controller_revision(
    client: Client,
    revision: &ControllerRevision,
) -> Result<(), Error> {
    let ns = revision.metadata.namespace.as_deref().unwrap_or_default();
    let api: Api<ControllerRevision> = Api::namespaced(client, ns);
    api.delete(&revision.name_any(), &DeleteParams::default())
        .await
        .map_err(Error::RevisionDeleteFailed)?;
    Ok(())
}

/// Deletes the oldest non-live revisions beyond the history limit. Live
/// revisions (current, update, or referenced by an owned pod) never count
/// against the limit and are never deleted.
pub async fn truncate_history(
    client: Client,
    pw: &PartitionWorkload,
    pods: &[Pod],
    revisions: &[ControllerRevision],
    current: &ControllerRevision,
    update: &ControllerRevision,
) -> Result<(), Error> {
    let excess = excess_non_live_revisions(pods, revisions, current, update);
    for stale in excess {
        info!("Truncating ControllerRevision {}", stale.name_any());
        delete_controller_revision(client.clone(), stale).await?;
    }
    Ok(())
}

fn excess_non_live_revisions<'a>(
    pods: &[Pod],
    revisions: &'a [ControllerRevision],
    current: &ControllerRevision,
    update: &ControllerRevision,
) -> Vec<&'a ControllerRevision> {
    let mut live: HashSet<&str> = HashSet::new();
    if let Some(name) = current.metadata.name.as_deref() {
        live.insert(name);
    }
    if let Some(name) = update.metadata.name.as_deref() {
        live.insert(name);
    }
    for pod in pods {
        if let Some(hash) = pod.labels().get(CONTROLLER_REVISION_HASH_LABEL) {
            live.insert(hash.as_str());
        }
    }

    // `revisions` is sorted ascending, so the front of the non-live list is
    // the oldest.
    let non_live: Vec<&ControllerRevision> = revisions
        .iter()
        .filter(|r| {
            r.metadata
                .name
                .as_deref()
                .map(|name| !live.contains(name))
                .unwrap_or(false)
        })
        .collect();
    if non_live.len() <= DEFAULT_HISTORY_LIMIT {
        return Vec::new();
    }
    non_live[..non_live.len() - DEFAULT_HISTORY_LIMIT].to_vec()
}
