//! User-data envelope handed to every launched VM.
//!
//! The VM boots, decodes the envelope, runs the init payload, downloads the
//! bootstrap agent from the presigned URL and starts it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::driver::{ComputeDriver, ComputeError, Result};
use crate::config::ProviderConfig;

/// The JSON document the in-VM bootstrap reader consumes.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserData {
    #[serde(rename = "vm-init-config")]
    pub vm_init: String,
    #[serde(rename = "bootstrap-agent-config")]
    pub bootstrap_agent: String,
    #[serde(rename = "bootstrap-agent-download-url")]
    pub presigned_url: String,
}

/// Build the base64 user data for a VM launch.
///
/// The document is encoded twice: the bootstrap reader expects base64 input,
/// and the compute API requires user data itself to be base64.
pub async fn build_user_data(driver: &dyn ComputeDriver, cfg: &ProviderConfig) -> Result<String> {
    let presigned_url = driver
        .presign_artifact_url(&cfg.bootstrap_agent.s3_bucket, &cfg.bootstrap_agent.s3_key)
        .await?;

    let document = UserData {
        vm_init: cfg.vm_config.init_data.clone(),
        bootstrap_agent: cfg.bootstrap_agent.init_data.clone(),
        presigned_url,
    };

    let json = serde_json::to_string(&document)
        .map_err(|e| ComputeError::Fatal(format!("can't encode user data: {e}")))?;

    Ok(encode_user_data(&encode_user_data(&revert_html_escapes(
        &json,
    ))))
}

pub fn encode_user_data(user_data: &str) -> String {
    STANDARD.encode(user_data.as_bytes())
}

/// Replace HTML-escaped characters with their literal form. JSON encoders
/// that escape for HTML embedding produce these; the bootstrap reader does
/// not understand them.
pub fn revert_html_escapes(data: &str) -> String {
    data.replace("\\u003c", "<")
        .replace("\\u003e", ">")
        .replace("\\u0026", "&")
}
