use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::controller::Controller,
    Client, CustomResourceExt,
};
use std::{env, sync::Arc};
use tracing::*;

use partitionworkload_controller::partitionworkload_types::PartitionWorkload;
use partitionworkload_controller::reconciler::{error_policy, reconcile, Data};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = env::args().collect();
    let cmd = args[1].clone();

    if cmd == String::from("export") {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&PartitionWorkload::crd())?);
        Ok(())
    } else if cmd == String::from("run") {
        info!("running partitionworkload-controller");
        let client = Client::try_default().await?;
        let pws = Api::<PartitionWorkload>::all(client.clone());
        let pods = Api::<Pod>::all(client.clone());
        let revisions = Api::<ControllerRevision>::all(client.clone());

        Controller::new(pws, ListParams::default())
            .owns(pods, ListParams::default())
            .owns(revisions, ListParams::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::new(Data { client }))
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .await;
        info!("controller terminated");
        Ok(())
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
        Ok(())
    }
}
