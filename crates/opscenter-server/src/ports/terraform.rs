//! Renders a cluster into a Terraform JSON configuration bundle.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Provisioner, ProvisionerError};
use crate::storage::{ClusterDetail, NewArtifact, NewArtifactFile};

/// Name of the artifact this provisioner produces.
pub const TERRAFORM_ARTIFACT: &str = "terraform-configuration";

const JSON_MIME: &str = "application/json";

/// [`Provisioner`] emitting `main.tf.json` and `terraform.tfvars.json`.
#[derive(Debug, Clone, Default)]
pub struct TerraformProvisioner {
    /// Provider source address written into `required_providers`.
    provider_source: String,
}

impl TerraformProvisioner {
    pub fn new(provider_source: impl Into<String>) -> Self {
        Self {
            provider_source: provider_source.into(),
        }
    }

    fn main_tf(&self) -> Value {
        json!({
            "terraform": {
                "required_providers": {
                    "incus": { "source": self.provider_source }
                }
            },
            "variable": {
                "cluster_name": { "type": "string" },
                "cluster_url": { "type": "string" },
                "cluster_fingerprint": { "type": "string" },
                "members": { "type": "list(string)" },
                "services_config": { "type": "any" },
                "application_seed_config": { "type": "any" }
            },
            "provider": {
                "incus": {
                    "remote": [{
                        "name": "${var.cluster_name}",
                        "address": "${var.cluster_url}",
                        "default": true
                    }]
                }
            }
        })
    }
}

fn parse_config(field: &str, raw: &str) -> Result<Value, ProvisionerError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| ProvisionerError::Render(format!("{field}: {e}")))
}

fn pretty(value: &Value) -> Result<Vec<u8>, ProvisionerError> {
    serde_json::to_vec_pretty(value).map_err(|e| ProvisionerError::Render(e.to_string()))
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn materialize(
        &self,
        detail: &ClusterDetail,
    ) -> Result<Vec<NewArtifact>, ProvisionerError> {
        let cluster = &detail.cluster;
        let members: Vec<&str> = detail.members.iter().map(String::as_str).collect();

        let tfvars = json!({
            "cluster_name": cluster.name,
            "cluster_url": cluster.connection_url,
            "cluster_fingerprint": cluster.fingerprint,
            "members": members,
            "services_config": parse_config("services_config", &cluster.services_config)?,
            "application_seed_config":
                parse_config("application_seed_config", &cluster.application_seed_config)?,
        });

        let mut properties = BTreeMap::new();
        properties.insert("format".to_string(), "terraform-json".to_string());
        properties.insert("channel".to_string(), cluster.channel.clone());

        Ok(vec![NewArtifact {
            name: TERRAFORM_ARTIFACT.to_string(),
            description: format!("Terraform configuration for cluster {}", cluster.name),
            properties,
            files: vec![
                NewArtifactFile {
                    name: "main.tf.json".to_string(),
                    mime_type: JSON_MIME.to_string(),
                    content: pretty(&self.main_tf())?,
                },
                NewArtifactFile {
                    name: "terraform.tfvars.json".to_string(),
                    mime_type: JSON_MIME.to_string(),
                    content: pretty(&tfvars)?,
                },
            ],
        }])
    }
}
