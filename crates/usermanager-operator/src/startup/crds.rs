//! CRD installation
//!
//! The operator makes sure its two CRDs exist on startup. A CRD that is already
//! present is left as is, so an administrator's copy is never overwritten.

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use kube::{Client, CustomResourceExt};

#[cfg(test)]
use mockall::automock;

use usermanager_common::crd::{LensUser, LuConfig};
use usermanager_common::{Error, FIELD_MANAGER};

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "lensuser.osip.cc",
            crd: LensUser::crd(),
        },
        CrdDef {
            name: "luconfig.osip.cc",
            crd: LuConfig::crd(),
        },
    ]
}

/// CRD reads and creates
#[cfg_attr(test, automock)]
#[async_trait]
trait CrdStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, Error>;
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), Error>;
}

struct KubeCrdStore {
    api: Api<CustomResourceDefinition>,
}

#[async_trait]
impl CrdStore for KubeCrdStore {
    async fn exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.api.get_opt(name).await?.is_some())
    }

    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), Error> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api.create(&params, crd).await?;
        Ok(())
    }
}

async fn ensure_crds_present(store: &dyn CrdStore) -> anyhow::Result<()> {
    for def in crds() {
        let present = store
            .exists(def.name)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read {} CRD: {}", def.name, e))?;
        if present {
            tracing::debug!(crd = def.name, "CRD already present");
            continue;
        }

        tracing::info!(crd = def.name, "creating CRD");
        match store.create(&def.crd).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                tracing::debug!(crd = def.name, "CRD created concurrently");
            }
            Err(e) => return Err(anyhow::anyhow!("failed to create {} CRD: {}", def.name, e)),
        }
    }
    Ok(())
}

/// Create the LensUser and LuConfig CRDs when they are missing
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let store = KubeCrdStore {
        api: Api::all(client.clone()),
    };
    ensure_crds_present(&store).await?;
    tracing::info!("CRDs present");
    Ok(())
}

/// Both CRDs as a multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let docs = crds()
        .iter()
        .map(|def| {
            serde_yaml::to_string(&def.crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}
