use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::info;

use crate::partitionworkload_types::PartitionWorkload;
use crate::Error;

/// One parsed label requirement, mirroring the operators a LabelSelector
/// can express.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SelectorRequirement {
    Eq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

/// A validated label selector that can both match pod labels in-process and
/// render itself as a list-request label query.
#[derive(Debug, Clone)]
pub struct PodSelector {
    requirements: Vec<SelectorRequirement>,
}

impl PodSelector {
    pub fn parse(selector: &LabelSelector) -> Result<Self, Error> {
        let mut requirements = Vec::new();
        if let Some(labels) = &selector.match_labels {
            for (key, value) in labels {
                requirements.push(SelectorRequirement::Eq(key.clone(), value.clone()));
            }
        }
        if let Some(exprs) = &selector.match_expressions {
            for expr in exprs {
                let values = expr.values.clone().unwrap_or_default();
                match expr.operator.as_str() {
                    "In" => {
                        if values.is_empty() {
                            return Err(Error::InvalidSelector(format!(
                                "operator In on key {} requires values",
                                expr.key
                            )));
                        }
                        requirements.push(SelectorRequirement::In(expr.key.clone(), values));
                    }
                    "NotIn" => {
                        if values.is_empty() {
                            return Err(Error::InvalidSelector(format!(
                                "operator NotIn on key {} requires values",
                                expr.key
                            )));
                        }
                        requirements.push(SelectorRequirement::NotIn(expr.key.clone(), values));
                    }
                    "Exists" => requirements.push(SelectorRequirement::Exists(expr.key.clone())),
                    "DoesNotExist" => {
                        requirements.push(SelectorRequirement::DoesNotExist(expr.key.clone()))
                    }
                    other => {
                        return Err(Error::InvalidSelector(format!(
                            "unknown operator {} on key {}",
                            other, expr.key
                        )))
                    }
                }
            }
        }
        if requirements.is_empty() {
            return Err(Error::InvalidSelector(
                "selector must not be empty".to_string(),
            ));
        }
        Ok(PodSelector { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            SelectorRequirement::Eq(key, value) => labels.get(key) == Some(value),
            SelectorRequirement::In(key, values) => {
                labels.get(key).map(|v| values.contains(v)).unwrap_or(false)
            }
            SelectorRequirement::NotIn(key, values) => {
                labels.get(key).map(|v| !values.contains(v)).unwrap_or(true)
            }
            SelectorRequirement::Exists(key) => labels.contains_key(key),
            SelectorRequirement::DoesNotExist(key) => !labels.contains_key(key),
        })
    }

    /// The selector as a label query usable in list requests.
    pub fn label_query(&self) -> String {
        self.requirements
            .iter()
            .map(|req| match req {
                SelectorRequirement::Eq(key, value) => format!("{}={}", key, value),
                SelectorRequirement::In(key, values) => {
                    format!("{} in ({})", key, values.join(","))
                }
                SelectorRequirement::NotIn(key, values) => {
                    format!("{} notin ({})", key, values.join(","))
                }
                SelectorRequirement::Exists(key) => key.clone(),
                SelectorRequirement::DoesNotExist(key) => format!("!{}", key),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// The owner reference marked as controller, if any.
pub fn controller_ref<T: ResourceExt>(obj: &T) -> Option<&OwnerReference> {
    obj.owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// A pod counts toward the owned population while it is not terminating and
/// has not reached a terminal phase.
pub fn is_pod_active(pod: &Pod) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default();
    pod.metadata.deletion_timestamp.is_none() && phase != "Succeeded" && phase != "Failed"
}

/// Lists every active pod in the PartitionWorkload's namespace. Ownership
/// filtering happens in [`claim_pods`]; listing unfiltered is what lets the
/// claim step see adoptable and releasable pods alike.
pub async fn get_active_pods(client: Client, pw: &PartitionWorkload) -> Result<Vec<Pod>, Error> {
    let api: Api<Pod> =
        Api::namespaced(client, pw.metadata.namespace.as_deref().unwrap_or_default());
    let pods = api
        .list(&ListParams::default())
        .await
        .map_err(Error::PodListFailed)?;
    Ok(pods.items.into_iter().filter(is_pod_active).collect())
}

/// Produces the managed pod set: keeps pods owned by this PartitionWorkload
/// that still match the selector, adopts matching orphans, releases owned
/// pods that stopped matching, and ignores pods owned by anyone else.
/// Adoption and release are optimistic; a concurrent writer surfaces as a
/// conflict and the reconcile is retried.
pub async fn claim_pods(
    client: Client,
    pw: &PartitionWorkload,
    selector: &PodSelector,
    pods: Vec<Pod>,
) -> Result<Vec<Pod>, Error> {
    let ns = pw.metadata.namespace.as_deref().unwrap_or_default();
    let pod_api: Api<Pod> = Api::namespaced(client.clone(), ns);
    let pw_uid = pw.metadata.uid.as_deref().unwrap_or_default();

    let mut precondition_checked = false;
    let mut managed = Vec::new();

    for pod in pods {
        let matches = selector.matches(pod.labels());
        let owner_uid = controller_ref(&pod).map(|r| r.uid.clone());
        match owner_uid.as_deref() {
            Some(uid) if uid == pw_uid => {
                if matches {
                    managed.push(pod);
                } else {
                    ensure_can_claim(client.clone(), pw, &mut precondition_checked).await?;
                    release_pod(&pod_api, pw_uid, pod).await?;
                }
            }
            // Controlled by someone else; not ours to touch.
            Some(_) => {}
            None => {
                if matches {
                    ensure_can_claim(client.clone(), pw, &mut precondition_checked).await?;
                    managed.push(adopt_pod(&pod_api, pw, pod).await?);
                }
            }
        }
    }
    Ok(managed)
}

// One-shot precondition shared by every adoption and release in a claim
// pass: the PartitionWorkload must still exist and must not be terminating,
// otherwise newly written owner references would dangle.
async fn ensure_can_claim(
    client: Client,
    pw: &PartitionWorkload,
    checked: &mut bool,
) -> Result<(), Error> {
    if *checked {
        return Ok(());
    }
    let api: Api<PartitionWorkload> =
        Api::namespaced(client, pw.metadata.namespace.as_deref().unwrap_or_default());
    let fresh = api
        .get_opt(&pw.name_any())
        .await
        .map_err(Error::ClaimPodsFailed)?;
    match fresh {
        Some(current)
            if current.metadata.uid == pw.metadata.uid
                && current.metadata.deletion_timestamp.is_none() =>
        {
            *checked = true;
            Ok(())
        }
        _ => Err(Error::AdoptionPreconditionFailed),
    }
}

async fn adopt_pod(api: &Api<Pod>, pw: &PartitionWorkload, mut pod: Pod) -> Result<Pod, Error> {
    let name = pod.name_any();
    info!("Adopting pod {}", name);
    let owner_ref = pw.controller_owner_ref(&()).ok_or(Error::AdoptionPreconditionFailed)?;
    pod.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(owner_ref);
    api.replace(&name, &PostParams::default(), &pod)
        .await
        .map_err(Error::ClaimPodsFailed)
}

async fn release_pod(api: &Api<Pod>, pw_uid: &str, mut pod: Pod) -> Result<(), Error> {
    let name = pod.name_any();
    info!("Releasing pod {}", name);
    if let Some(refs) = pod.metadata.owner_references.as_mut() {
        refs.retain(|r| r.uid != pw_uid);
    }
    match api.replace(&name, &PostParams::default(), &pod).await {
        Ok(_) => Ok(()),
        // The pod vanished on its own; release is moot.
        Err(kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
            if reason == "NotFound" =>
        {
            Ok(())
        }
        Err(e) => Err(Error::ClaimPodsFailed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn empty_selector_is_rejected() {
        assert!(PodSelector::parse(&LabelSelector::default()).is_err());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let selector = LabelSelector {
            match_expressions: Some(vec![expr("tier", "Near", &["web"])]),
            ..Default::default()
        };
        assert!(PodSelector::parse(&selector).is_err());
    }

    #[test]
    fn match_labels_require_equality() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            ..Default::default()
        };
        let parsed = PodSelector::parse(&selector).unwrap();
        assert!(parsed.matches(&labels(&[("app", "web"), ("extra", "x")])));
        assert!(!parsed.matches(&labels(&[("app", "db")])));
        assert!(!parsed.matches(&labels(&[])));
    }

    #[test]
    fn expressions_cover_all_operators() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                expr("tier", "In", &["web", "api"]),
                expr("env", "NotIn", &["dev"]),
                expr("owned", "Exists", &[]),
                expr("legacy", "DoesNotExist", &[]),
            ]),
            ..Default::default()
        };
        let parsed = PodSelector::parse(&selector).unwrap();
        assert!(parsed.matches(&labels(&[("tier", "web"), ("env", "prod"), ("owned", "1")])));
        assert!(!parsed.matches(&labels(&[("tier", "cache"), ("owned", "1")])));
        assert!(!parsed.matches(&labels(&[("tier", "web"), ("env", "dev"), ("owned", "1")])));
        assert!(!parsed.matches(&labels(&[("tier", "web"), ("owned", "1"), ("legacy", "y")])));
        assert!(!parsed.matches(&labels(&[("tier", "web")])));
    }

    #[test]
    fn label_query_renders_requirements() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: Some(vec![expr("tier", "In", &["web", "api"])]),
            ..Default::default()
        };
        let parsed = PodSelector::parse(&selector).unwrap();
        assert_eq!(parsed.label_query(), "app=web,tier in (web,api)");
    }

    #[test]
    fn active_pod_filter() {
        let mut pod = Pod::default();
        assert!(is_pod_active(&pod));

        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(!is_pod_active(&pod));

        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert!(is_pod_active(&pod));

        pod.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(!is_pod_active(&pod));
    }

    #[test]
    fn controller_ref_picks_the_controller_owner() {
        let mut pod = Pod::default();
        pod.metadata.owner_references = Some(vec![
            OwnerReference {
                name: "bystander".to_string(),
                uid: "other".to_string(),
                ..Default::default()
            },
            OwnerReference {
                name: "owner".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                ..Default::default()
            },
        ]);
        assert_eq!(controller_ref(&pod).map(|r| r.uid.as_str()), Some("uid-1"));
    }
}
