use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::ResourceExt;
use std::convert::Infallible;
use tracing::*;
use warp::*;

use partitionworkload_controller::partitionworkload_types::PartitionWorkload;

/// Rejects partitions that the declared replica count can never satisfy.
/// Deletion is always allowed.
pub fn validate_partition_workload(pw: &PartitionWorkload) -> Result<(), String> {
    let partition = match pw.spec.partition {
        Some(partition) => partition,
        None => return Ok(()),
    };

    match pw.spec.replicas {
        None if partition > 1 => Err(format!(
            "spec.partition: Invalid value: {}: must be <= 1 when spec.replicas is nil",
            partition
        )),
        Some(replicas) if partition > replicas => Err(format!(
            "spec.partition: Invalid value: {}: must be <= spec.replicas",
            partition
        )),
        _ => Ok(()),
    }
}

pub async fn validate_handler(
    body: AdmissionReview<PartitionWorkload>,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err.to_string());
            return Ok(reply::json(
                &AdmissionResponse::invalid(err.to_string()).into_review(),
            ));
        }
    };

    let mut res = AdmissionResponse::from(&req);
    if let Some(pw) = &req.object {
        let name = pw.name_any();
        res = match req.operation {
            Operation::Create | Operation::Update => match validate_partition_workload(pw) {
                Ok(()) => {
                    info!("accepted: {:?} on resource {}", req.operation, name);
                    res
                }
                Err(err) => {
                    warn!("denied: {:?} on {} ({})", req.operation, name, err);
                    res.deny(format!(
                        "PartitionWorkload.workload.scott.dev \"{}\" is invalid: {}",
                        name, err
                    ))
                }
            },
            _ => res,
        };
    }
    Ok(reply::json(&res.into_review()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let routes = path("validate-workload-scott-dev-v1alpha1-partitionworkload")
        .and(body::json())
        .and_then(validate_handler)
        .with(trace::request());

    serve(post().and(routes))
        .tls()
        .cert_path("/certs/tls.crt")
        .key_path("/certs/tls.key")
        .run(([0, 0, 0, 0], 8443))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    use partitionworkload_controller::partitionworkload_types::PartitionWorkloadSpec;

    fn pw(replicas: Option<i32>, partition: Option<i32>) -> PartitionWorkload {
        PartitionWorkload::new(
            "test-pw",
            PartitionWorkloadSpec {
                replicas,
                selector: LabelSelector::default(),
                template: PodTemplateSpec::default(),
                partition,
            },
        )
    }

    #[test]
    fn partition_within_replicas_is_accepted() {
        assert!(validate_partition_workload(&pw(Some(2), Some(2))).is_ok());
        assert!(validate_partition_workload(&pw(Some(2), Some(0))).is_ok());
        assert!(validate_partition_workload(&pw(Some(2), None)).is_ok());
    }

    #[test]
    fn partition_above_replicas_is_rejected() {
        let err = validate_partition_workload(&pw(Some(2), Some(3))).unwrap_err();
        assert!(err.contains("spec.partition"));
        assert!(err.contains("must be <= spec.replicas"));
    }

    #[test]
    fn defaulted_replicas_allow_partition_of_at_most_one() {
        assert!(validate_partition_workload(&pw(None, Some(1))).is_ok());
        let err = validate_partition_workload(&pw(None, Some(2))).unwrap_err();
        assert!(err.contains("must be <= 1 when spec.replicas is nil"));
    }
}
