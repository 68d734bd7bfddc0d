pub mod common;
pub mod partitionworkload_e2e;

use common::Error;
use partitionworkload_e2e::{partitionworkload_e2e_test, webhook_e2e_test};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = env::args().collect();
    let cmd = args[1].clone();
    match cmd.as_str() {
        "partitionworkload" => {
            println!("Running partitionworkload end-to-end test");
            return partitionworkload_e2e_test().await;
        }
        "webhook" => {
            println!("Running partitionworkload webhook end-to-end test");
            return webhook_e2e_test().await;
        }
        _ => {
            println!("Please specify one test suite");
            Ok(())
        }
    }
}
