use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::info;

use crate::history;
use crate::partitionworkload_types::PartitionWorkload;
use crate::Error;

/// Builds the ControllerRevision capturing the PartitionWorkload's current
/// pod template at the given revision number. The revision name embeds a
/// hash of the template data salted with the collision count.
pub fn new_revision(
    pw: &PartitionWorkload,
    revision_number: i64,
    collision_count: i32,
) -> Result<ControllerRevision, Error> {
    let patch = template_patch(pw)?;
    let hash = hash_revision_data(&patch, collision_count)?;
    let name = format!("{}-{}", pw.name_any(), hash);

    Ok(ControllerRevision {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: pw.metadata.namespace.clone(),
            labels: pw
                .spec
                .template
                .metadata
                .as_ref()
                .and_then(|m| m.labels.clone()),
            annotations: pw.metadata.annotations.clone(),
            owner_references: pw.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(RawExtension(patch)),
        revision: revision_number,
    })
}

/// Extracts `spec.template` from the canonical encoding of the
/// PartitionWorkload and wraps it as a replace-patch, so that re-applying
/// it later swaps the whole template instead of merging field by field.
fn template_patch(pw: &PartitionWorkload) -> Result<Value, Error> {
    let raw = serde_json::to_value(pw).map_err(Error::EncodeFailed)?;
    let mut template = raw
        .get("spec")
        .and_then(|s| s.get("template"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    if let Some(obj) = template.as_object_mut() {
        obj.insert("$patch".to_string(), Value::String("replace".to_string()));
    }
    Ok(json!({ "spec": { "template": template } }))
}

/// Stable hash of the revision data plus the collision-count salt. Rendered
/// as 16 hex chars with no `-`, so the short hash is always the last dash
/// segment of the revision name.
pub fn hash_revision_data(data: &Value, collision_count: i32) -> Result<String, Error> {
    let payload = serde_json::to_vec(data).map_err(Error::EncodeFailed)?;
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    collision_count.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}

pub fn revision_data(revision: &ControllerRevision) -> Result<&Value, Error> {
    revision
        .data
        .as_ref()
        .map(|raw| &raw.0)
        .ok_or(Error::EmptyRevisionData)
}

/// Two revisions represent the same pod template iff their data match.
pub fn equal_revision(a: &ControllerRevision, b: &ControllerRevision) -> bool {
    a.data == b.data
}

/// Reconstructs the PartitionWorkload as it looked at the given revision by
/// applying the stored replace-patch to the canonical encoding.
pub fn apply_revision(
    pw: &PartitionWorkload,
    revision: &ControllerRevision,
) -> Result<PartitionWorkload, Error> {
    let mut encoded = serde_json::to_value(pw).map_err(Error::EncodeFailed)?;
    strategic_merge(&mut encoded, revision_data(revision)?.clone());
    serde_json::from_value(encoded).map_err(Error::RevisionDecodeFailed)
}

// Object members merge key by key; a member object marked `$patch: replace`
// is swapped in wholesale with the directive stripped. Scalars and arrays
// always replace. This covers every patch shape the codec produces.
fn strategic_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                let replace = patch_value
                    .as_object()
                    .and_then(|o| o.get("$patch"))
                    .map(|d| d == "replace")
                    .unwrap_or(false);
                if replace {
                    let mut replacement = patch_value;
                    if let Some(obj) = replacement.as_object_mut() {
                        obj.remove("$patch");
                    }
                    base_map.insert(key, replacement);
                } else if patch_value.is_object() {
                    let slot = base_map.entry(key).or_insert_with(|| json!({}));
                    strategic_merge(slot, patch_value);
                } else {
                    base_map.insert(key, patch_value);
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

/// Resolves the update and current revisions for this reconcile, persisting
/// a new ControllerRevision when the template changed and renumbering an
/// old one when the user rolled back to it. Returns the possibly bumped
/// collision count so status can persist it.
pub async fn get_active_revisions(
    client: Client,
    pw: &PartitionWorkload,
    revisions: &[ControllerRevision],
) -> Result<(ControllerRevision, ControllerRevision, i32), Error> {
    let mut collision_count = pw
        .status
        .as_ref()
        .and_then(|s| s.collision_count)
        .unwrap_or(0);

    let next_number = revisions.last().map(|r| r.revision + 1).unwrap_or(1);
    let candidate = new_revision(pw, next_number, collision_count)?;

    let equal: Vec<&ControllerRevision> = revisions
        .iter()
        .filter(|r| equal_revision(r, &candidate))
        .collect();

    let update_revision = match equal.last() {
        None => {
            // Template never seen before; persist it.
            history::create_controller_revision(client.clone(), pw, candidate, &mut collision_count)
                .await?
        }
        Some(latest_equal)
            if revisions
                .last()
                .map(|r| r.metadata.name == latest_equal.metadata.name)
                .unwrap_or(false) =>
        {
            // Still on the newest revision.
            (*latest_equal).clone()
        }
        Some(latest_equal) => {
            // Rolled back to an older template; make that revision the
            // newest by renumbering instead of minting a duplicate.
            info!(
                "Detected rollback to revision {}",
                latest_equal.name_any()
            );
            history::update_revision_number(client.clone(), latest_equal, next_number).await?
        }
    };

    let current_revision = match pw.status.as_ref().and_then(|s| s.current_revision.as_deref()) {
        Some(current_name) => revisions
            .iter()
            .find(|r| r.metadata.name.as_deref() == Some(current_name))
            .cloned()
            .unwrap_or_else(|| update_revision.clone()),
        // First reconcile: the update revision doubles as the baseline.
        None => update_revision.clone(),
    };

    Ok((current_revision, update_revision, collision_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;

    use crate::partitionworkload_types::PartitionWorkloadSpec;

    fn test_pw() -> PartitionWorkload {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "test-app".to_string());
        let mut pw = PartitionWorkload::new(
            "parent-pw",
            PartitionWorkloadSpec {
                replicas: Some(2),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "nginx".to_string(),
                            image: Some("nginx".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                partition: Some(1),
            },
        );
        pw.metadata.namespace = Some("default".to_string());
        pw.metadata.uid = Some("test-uid".to_string());
        pw
    }

    #[test]
    fn new_revision_names_and_labels() {
        let pw = test_pw();
        let revision = new_revision(&pw, 1, 0).unwrap();
        let name = revision.metadata.name.as_deref().unwrap();
        assert!(name.starts_with("parent-pw-"));
        assert_eq!(revision.revision, 1);
        assert_eq!(
            revision
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("app"))
                .map(String::as_str),
            Some("test-app")
        );
        let owner = &revision.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "PartitionWorkload");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn identical_templates_hash_identically() {
        let pw = test_pw();
        let mut other = test_pw();
        other.metadata.name = Some("sibling".to_string());
        other.spec.replicas = Some(7);
        other.spec.partition = Some(3);
        let a = new_revision(&pw, 1, 0).unwrap();
        let b = new_revision(&other, 5, 0).unwrap();
        assert!(equal_revision(&a, &b));
    }

    #[test]
    fn collision_count_changes_the_name() {
        let pw = test_pw();
        let a = new_revision(&pw, 1, 0).unwrap();
        let b = new_revision(&pw, 1, 1).unwrap();
        assert_ne!(a.metadata.name, b.metadata.name);
        // Data is the salt-independent part.
        assert!(equal_revision(&a, &b));
    }

    #[test]
    fn apply_revision_restores_the_old_template() {
        let pw = test_pw();
        let old_revision = new_revision(&pw, 1, 0).unwrap();

        let mut mutated = pw.clone();
        mutated.spec.template.spec.as_mut().unwrap().containers[0].image =
            Some("nginx2".to_string());

        let restored = apply_revision(&mutated, &old_revision).unwrap();
        assert_eq!(
            restored.spec.template.spec.as_ref().unwrap().containers[0]
                .image
                .as_deref(),
            Some("nginx")
        );
        // Fields outside the template survive untouched.
        assert_eq!(restored.spec.replicas, Some(2));
    }

    #[test]
    fn revision_round_trip_produces_equal_data() {
        let pw = test_pw();
        let revision = new_revision(&pw, 1, 0).unwrap();

        let mut mutated = pw.clone();
        mutated.spec.template.spec.as_mut().unwrap().containers[0].name = "foo".to_string();

        let restored = apply_revision(&mutated, &revision).unwrap();
        let round_tripped = new_revision(&restored, 2, 0).unwrap();
        assert!(equal_revision(&revision, &round_tripped));
    }

    #[test]
    fn replace_patch_does_not_merge_partial_templates() {
        // A later template that dropped a field must not inherit it from
        // the base when the revision is re-applied.
        let pw = test_pw();
        let revision = new_revision(&pw, 1, 0).unwrap();

        let mut mutated = pw.clone();
        let spec = mutated.spec.template.spec.as_mut().unwrap();
        spec.containers[0].command = Some(vec!["sleep".to_string()]);

        let restored = apply_revision(&mutated, &revision).unwrap();
        assert_eq!(
            restored.spec.template.spec.as_ref().unwrap().containers[0].command,
            None
        );
    }
}
