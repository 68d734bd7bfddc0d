use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PartitionWorkloadSpec defines the desired state of PartitionWorkload.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "workload.scott.dev",
    version = "v1alpha1",
    kind = "PartitionWorkload",
    status = "PartitionWorkloadStatus",
    shortname = "pw",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PartitionWorkloadSpec {
    /// Replicas is the desired number of instantiations of Template.
    /// If unspecified, defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Selector is a label query over pods that should match the replica
    /// count. It must match the pod template's labels.
    pub selector: LabelSelector,

    /// Template describes the pods that will be created.
    #[schemars(schema_with = "pod_template_schema")]
    pub template: PodTemplateSpec,

    /// Partition is the number of pods kept at the latest pod template
    /// revision; the remaining replicas - partition pods stay on older
    /// revisions. Defaults to replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

/// PartitionWorkloadStatus defines the observed state of PartitionWorkload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartitionWorkloadStatus {
    /// ObservedGeneration is the most recent generation observed for this
    /// PartitionWorkload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Replicas is the number of active pods owned by the controller.
    #[serde(default)]
    pub replicas: i32,

    /// ReadyReplicas is the number of owned pods with a Ready condition.
    #[serde(default)]
    pub ready_replicas: i32,

    /// UpdatedReplicas is the number of owned pods created from the
    /// revision indicated by updateRevision.
    #[serde(default)]
    pub updated_replicas: i32,

    /// CurrentRevision, if not empty, is the stable revision of the
    /// PartitionWorkload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    /// UpdateRevision, if not empty, is the latest revision of the
    /// PartitionWorkload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,

    /// CollisionCount is the count of hash collisions seen while naming
    /// ControllerRevisions, used as a salt when the name must be recomputed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Conditions represents the latest available observations of the
    /// PartitionWorkload's current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PartitionWorkloadCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PartitionWorkloadConditionType {
    /// Pod creation or deletion failed during the last sync.
    FailedScale,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartitionWorkloadCondition {
    /// Type of PartitionWorkload condition.
    #[serde(rename = "type")]
    pub type_: PartitionWorkloadConditionType,

    /// Status of the condition, one of True, False, Unknown.
    pub status: String,

    /// Last time the condition was updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    /// Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    /// The reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// A human readable message indicating details about the transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

// The template keeps whatever fields the user wrote; the server must not
// prune unknown ones, so the schema is an open object.
fn pod_template_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(schema)
}
