//! Cluster API gateway
//!
//! Every read and write the controller performs goes through
//! [`ClusterGateway`], keyed by (name, namespace). Gets map 404 to `None`;
//! creates and deletes surface 409/404 unchanged so callers decide what is
//! tolerable (see [`Error::is_already_exists`] and [`Error::is_not_found`]).

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use usermanager_common::crd::{LensUser, LensUserStatus, LuConfig};
use usermanager_common::FIELD_MANAGER;

use crate::Error;

/// Trait abstracting Kubernetes client operations for the LensUser controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Get a ServiceAccount by name and namespace
    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>, Error>;

    /// Create a ServiceAccount
    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<(), Error>;

    /// Apply a JSON patch to a ServiceAccount
    async fn patch_service_account(
        &self,
        name: &str,
        namespace: &str,
        patch: json_patch::Patch,
    ) -> Result<(), Error>;

    /// Delete a ServiceAccount
    async fn delete_service_account(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a Secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Delete a Secret
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Create a RoleBinding
    async fn create_role_binding(&self, namespace: &str, rb: &RoleBinding) -> Result<(), Error>;

    /// Delete a RoleBinding
    async fn delete_role_binding(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a LuConfig by name and namespace
    async fn get_lu_config(&self, name: &str, namespace: &str)
        -> Result<Option<LuConfig>, Error>;

    /// Create a LuConfig
    async fn create_lu_config(&self, namespace: &str, config: &LuConfig) -> Result<(), Error>;

    /// Replace a LuConfig; `config` must carry the current resourceVersion
    async fn replace_lu_config(
        &self,
        name: &str,
        namespace: &str,
        config: &LuConfig,
    ) -> Result<(), Error>;

    /// Delete a LuConfig
    async fn delete_lu_config(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Merge-patch the status of a LensUser
    async fn patch_lens_user_status(
        &self,
        name: &str,
        namespace: &str,
        status: &LensUserStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer to a LensUser
    async fn add_finalizer(&self, name: &str, namespace: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a LensUser
    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    /// Create a new KubeGateway wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<(), Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), sa).await?;
        Ok(())
    }

    async fn patch_service_account(
        &self,
        name: &str,
        namespace: &str,
        patch: json_patch::Patch,
    ) -> Result<(), Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Json::<()>(patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_service_account(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_role_binding(&self, namespace: &str, rb: &RoleBinding) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), rb).await?;
        Ok(())
    }

    async fn delete_role_binding(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_lu_config(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<LuConfig>, Error> {
        let api: Api<LuConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_lu_config(&self, namespace: &str, config: &LuConfig) -> Result<(), Error> {
        let api: Api<LuConfig> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), config).await?;
        Ok(())
    }

    async fn replace_lu_config(
        &self,
        name: &str,
        namespace: &str,
        config: &LuConfig,
    ) -> Result<(), Error> {
        let api: Api<LuConfig> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &Self::post_params(), config).await?;
        Ok(())
    }

    async fn delete_lu_config(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<LuConfig> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn patch_lens_user_status(
        &self,
        name: &str,
        namespace: &str,
        status: &LensUserStatus,
    ) -> Result<(), Error> {
        let api: Api<LensUser> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<LensUser> = Api::namespaced(self.client.clone(), namespace);

        let user = api.get(name).await?;
        let mut finalizers = user.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<LensUser> = Api::namespaced(self.client.clone(), namespace);

        let user = match api.get_opt(name).await? {
            Some(user) => user,
            None => return Ok(()),
        };
        let finalizers: Vec<String> = user
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
