//! The control surface handed to whatever exposes the agent over the network.
//! Errors are flattened to strings for the wire.

use crate::config::RunConfig;

use super::controller::{RunController, StatusResponse};

pub async fn start_run(controller: &RunController, config_json: &str) -> Result<StatusResponse, String> {
    let config = RunConfig::from_json(config_json).map_err(|e| e.to_string())?;
    controller.start(config).await.map_err(|e| e.to_string())
}

pub async fn stop_run(controller: &RunController) -> Result<StatusResponse, String> {
    Ok(controller.stop().await)
}

pub async fn run_status(controller: &RunController) -> Result<StatusResponse, String> {
    Ok(controller.status().await)
}
