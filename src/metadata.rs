//! Cloud instance identity, used to enrich `gceAK` attestations.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::common::env::{ENV_GCE_METADATA_HOST_DEFAULT, ENV_GCE_METADATA_HOST_KEY};
use crate::error::{self, Result};
use crate::record::GceInstanceInfo;

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";
const METADATA_TIMEOUT_SECS: u64 = 5;

/// Identity of the running instance. Every getter may fail on its own.
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    async fn project_id(&self) -> Result<String>;

    async fn numeric_project_id(&self) -> Result<String>;

    async fn zone(&self) -> Result<String>;

    async fn instance_id(&self) -> Result<String>;

    async fn instance_name(&self) -> Result<String>;
}

/// Collects the full identity block. Any failed or malformed field aborts.
pub async fn instance_info(metadata: &dyn InstanceMetadata) -> Result<GceInstanceInfo> {
    let project_id = metadata.project_id().await?;
    let project_number = parse_id("numeric project id", &metadata.numeric_project_id().await?)?;
    let zone = metadata.zone().await?;
    let instance_id = parse_id("instance id", &metadata.instance_id().await?)?;
    let instance_name = metadata.instance_name().await?;

    Ok(GceInstanceInfo {
        zone,
        project_id,
        project_number,
        instance_name,
        instance_id,
    })
}

fn parse_id(what: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>()
        .map_err(|e| error::conversion(e, Some(format!("invalid {} '{}'", what, value))))
}

/// Client for the GCE metadata server.
#[derive(Clone, Debug)]
pub struct GceMetadataClient {
    client: reqwest::Client,
    base_url: String,
}

impl GceMetadataClient {
    /// Targets `GCE_METADATA_HOST`, or the link-local metadata address.
    pub fn new() -> Result<Self> {
        let host = env::var(ENV_GCE_METADATA_HOST_KEY)
            .unwrap_or(ENV_GCE_METADATA_HOST_DEFAULT.to_string());

        Self::with_host(&host)
    }

    pub fn with_host(host: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(METADATA_TIMEOUT_SECS))
            .build()
            .map_err(|e| error::fetch(e, Some("failed to build metadata client".into())))?;

        Ok(Self {
            client,
            base_url: format!("http://{}/computeMetadata/v1", host),
        })
    }

    async fn get(&self, suffix: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, suffix);
        debug!("querying metadata server: {}", url);

        let response = self.client.get(&url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .send().await
            .map_err(|e| error::fetch(e, Some(format!("failed to query metadata '{}'", suffix))))?;

        if !response.status().is_success() {
            return Err(error::fetch(format!("status: {}", response.status()),
                                    Some(format!("metadata server rejected '{}'", suffix))));
        }

        let body = response.text().await
            .map_err(|e| error::fetch(e, Some(format!("failed to read metadata '{}'", suffix))))?;

        Ok(body.trim().to_string())
    }
}

#[async_trait]
impl InstanceMetadata for GceMetadataClient {
    async fn project_id(&self) -> Result<String> {
        self.get("project/project-id").await
    }

    async fn numeric_project_id(&self) -> Result<String> {
        self.get("project/numeric-project-id").await
    }

    async fn zone(&self) -> Result<String> {
        // projects/<number>/zones/<zone>
        let zone = self.get("instance/zone").await?;
        Ok(zone.rsplit('/').next().unwrap_or_default().to_string())
    }

    async fn instance_id(&self) -> Result<String> {
        self.get("instance/id").await
    }

    async fn instance_name(&self) -> Result<String> {
        self.get("instance/name").await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::error::{self, Result};

    use super::InstanceMetadata;

    /// Fixed identity; the getter named by `fail` returns a fetch error.
    #[derive(Clone, Default)]
    pub(crate) struct FakeMetadata {
        pub(crate) fail: Option<&'static str>,
        pub(crate) numeric_project_id: Option<&'static str>,
        pub(crate) calls: Arc<AtomicUsize>,
    }

    impl FakeMetadata {
        fn field(&self, name: &'static str, value: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail == Some(name) {
                return Err(error::fetch("metadata server unavailable", Some(name.to_string())));
            }
            Ok(value.to_string())
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InstanceMetadata for FakeMetadata {
        async fn project_id(&self) -> Result<String> {
            self.field("project_id", "confidential-project")
        }

        async fn numeric_project_id(&self) -> Result<String> {
            self.field("numeric_project_id", self.numeric_project_id.unwrap_or("123456789"))
        }

        async fn zone(&self) -> Result<String> {
            self.field("zone", "us-central1-a")
        }

        async fn instance_id(&self) -> Result<String> {
            self.field("instance_id", "4242424242")
        }

        async fn instance_name(&self) -> Result<String> {
            self.field("instance_name", "cvm-1")
        }
    }
}
