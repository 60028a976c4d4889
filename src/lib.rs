use hiro_system_kit::{slog, Logger};
use hyper::{body::Bytes, Body, Request, Response};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Namespace},
};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tower::BoxError;

pub mod app_config;
pub mod config;
pub mod dex;
pub mod orchestrator;
pub mod registry;
pub mod template_parser;

#[cfg(test)]
mod tests;

const PROFILE_GROUP: &str = "kubeflow.org";
const PROFILE_VERSION: &str = "v1";
const PROFILE_KIND: &str = "Profile";
const PROFILE_PLURAL: &str = "profiles";

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Missing or malformed local input: template, rendered manifest, prompt value.
    #[error("{0}")]
    Input(String),
    /// The cluster rejected or failed an API call.
    #[error("{message}")]
    Api { message: String, code: u16 },
    /// A cluster call exceeded its deadline and was abandoned.
    #[error("{0}")]
    Timeout(String),
    /// The dex configmap does not have the structure we expect.
    #[error("{0}")]
    ConfigStructure(String),
    /// The user registry could not be read or written.
    #[error("{0}")]
    Registry(String),
    /// Password hashing failed.
    #[error("{0}")]
    Credential(String),
}

#[derive(Clone)]
pub struct Context {
    pub logger: Option<Logger>,
    pub tracer: bool,
}

impl Context {
    pub fn empty() -> Context {
        Context {
            logger: None,
            tracer: false,
        }
    }

    pub fn try_log<F>(&self, closure: F)
    where
        F: FnOnce(&Logger),
    {
        if let Some(ref logger) = self.logger {
            closure(logger)
        }
    }
}

/// Deadlines applied to every cluster call. Delete operations default to 30s;
/// create-path operations get a longer but still bounded deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub apply_secs: u64,
    pub delete_secs: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Deadlines {
            apply_secs: 60,
            delete_secs: 30,
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Typed client for the cluster operations the lifecycle flows need: applying
/// rendered Profile manifests, deleting profiles and namespaces (with a forced
/// finalizer-strip variant), and reading/replacing/restarting dex.
#[derive(Clone)]
pub struct TenantK8sManager {
    client: Client,
    ctx: Context,
    deadlines: Deadlines,
}

impl TenantK8sManager {
    pub async fn default(ctx: &Context) -> TenantK8sManager {
        let client = Client::try_default()
            .await
            .expect("could not create kube client");
        TenantK8sManager {
            client,
            ctx: ctx.to_owned(),
            deadlines: Deadlines::default(),
        }
    }

    pub async fn new<S, B, T>(service: S, default_namespace: T, ctx: &Context) -> TenantK8sManager
    where
        S: tower::Service<Request<Body>, Response = Response<B>> + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
        T: Into<String>,
    {
        let client = Client::new(service, default_namespace);
        TenantK8sManager {
            client,
            ctx: ctx.to_owned(),
            deadlines: Deadlines::default(),
        }
    }

    pub fn with_deadlines(mut self, deadlines: Deadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    fn profile_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(PROFILE_GROUP, PROFILE_VERSION, PROFILE_KIND);
        let resource = ApiResource::from_gvk_with_plural(&gvk, PROFILE_PLURAL);
        Api::all_with(self.client.to_owned(), &resource)
    }

    fn namespace_api(&self) -> Api<Namespace> {
        Api::all(self.client.to_owned())
    }

    /// Parses a rendered Profile manifest and creates it in the cluster. The
    /// profile controller creates the matching tenant namespace on its own.
    pub async fn apply_profile(&self, manifest_yaml: &str) -> Result<(), ProvisionError> {
        let profile: DynamicObject = match serde_yaml::from_str(manifest_yaml) {
            Ok(p) => p,
            Err(e) => {
                let msg = format!("unable to parse rendered manifest: {}", e);
                self.ctx.try_log(|logger| slog::error!(logger, "{}", msg));
                return Err(ProvisionError::Input(msg));
            }
        };
        let name = match profile.metadata.name.as_ref() {
            Some(name) => name.to_owned(),
            None => {
                let msg = "rendered manifest has no metadata.name".to_string();
                self.ctx.try_log(|logger| slog::error!(logger, "{}", msg));
                return Err(ProvisionError::Input(msg));
            }
        };

        let resource_details = format!("RESOURCE: profile, NAME: {}", name);
        self.ctx
            .try_log(|logger| slog::info!(logger, "creating {}", resource_details));

        let api = self.profile_api();
        let pp = PostParams::default();
        self.within_deadline(
            self.deadlines.apply_secs,
            format!("creating {}", resource_details),
            async move { api.create(&pp, &profile).await.map(|_| ()) },
        )
        .await?;

        self.ctx
            .try_log(|logger| slog::info!(logger, "successfully created {}", resource_details));
        Ok(())
    }

    pub async fn delete_profile(&self, username: &str) -> Result<(), ProvisionError> {
        self.delete_resource(self.profile_api(), "profile", username, false)
            .await
    }

    /// Forced variant: strip finalizers, then delete with zero grace period.
    /// A failed finalizer patch is logged and the delete still attempted; the
    /// delete result is the only verdict that matters.
    pub async fn force_delete_profile(&self, username: &str) -> Result<(), ProvisionError> {
        if let Err(e) = self
            .strip_finalizers(self.profile_api(), "profile", username)
            .await
        {
            self.ctx.try_log(|logger| {
                slog::warn!(
                    logger,
                    "failed to strip finalizers from profile {}: {}",
                    username,
                    e
                )
            });
        }
        self.delete_resource(self.profile_api(), "profile", username, true)
            .await
    }

    pub async fn delete_namespace(&self, username: &str) -> Result<(), ProvisionError> {
        self.delete_resource(self.namespace_api(), "namespace", username, false)
            .await
    }

    pub async fn force_delete_namespace(&self, username: &str) -> Result<(), ProvisionError> {
        if let Err(e) = self
            .strip_finalizers(self.namespace_api(), "namespace", username)
            .await
        {
            self.ctx.try_log(|logger| {
                slog::warn!(
                    logger,
                    "failed to strip finalizers from namespace {}: {}",
                    username,
                    e
                )
            });
        }
        self.delete_resource(self.namespace_api(), "namespace", username, true)
            .await
    }

    pub async fn get_dex_config(&self) -> Result<ConfigMap, ProvisionError> {
        let resource_details = format!(
            "RESOURCE: configmap, NAME: {}, NAMESPACE: {}",
            dex::DEX_CONFIGMAP,
            dex::DEX_NAMESPACE
        );
        self.ctx
            .try_log(|logger| slog::info!(logger, "fetching {}", resource_details));

        let api: Api<ConfigMap> = Api::namespaced(self.client.to_owned(), dex::DEX_NAMESPACE);
        let configmap = self
            .within_deadline(
                self.deadlines.apply_secs,
                format!("fetching {}", resource_details),
                async move { api.get(dex::DEX_CONFIGMAP).await },
            )
            .await?;

        self.ctx
            .try_log(|logger| slog::info!(logger, "successfully fetched {}", resource_details));
        Ok(configmap)
    }

    pub async fn apply_dex_config(&self, configmap: &ConfigMap) -> Result<(), ProvisionError> {
        let resource_details = format!(
            "RESOURCE: configmap, NAME: {}, NAMESPACE: {}",
            dex::DEX_CONFIGMAP,
            dex::DEX_NAMESPACE
        );
        self.ctx
            .try_log(|logger| slog::info!(logger, "replacing {}", resource_details));

        let api: Api<ConfigMap> = Api::namespaced(self.client.to_owned(), dex::DEX_NAMESPACE);
        let pp = PostParams::default();
        let configmap = configmap.clone();
        self.within_deadline(
            self.deadlines.apply_secs,
            format!("replacing {}", resource_details),
            async move {
                api.replace(dex::DEX_CONFIGMAP, &pp, &configmap)
                    .await
                    .map(|_| ())
            },
        )
        .await?;

        self.ctx
            .try_log(|logger| slog::info!(logger, "successfully replaced {}", resource_details));
        Ok(())
    }

    /// Rolling restart of the dex deployment so it picks up the new static
    /// credentials, issued the same way `kubectl rollout restart` does it.
    pub async fn restart_dex(&self) -> Result<(), ProvisionError> {
        let resource_details = format!(
            "RESOURCE: deployment, NAME: {}, NAMESPACE: {}",
            dex::DEX_DEPLOYMENT,
            dex::DEX_NAMESPACE
        );
        self.ctx
            .try_log(|logger| slog::info!(logger, "restarting {}", resource_details));

        let api: Api<Deployment> = Api::namespaced(self.client.to_owned(), dex::DEX_NAMESPACE);
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            "kubectl.kubernetes.io/restartedAt": now_rfc3339()
                        }
                    }
                }
            }
        });
        let pp = PatchParams::default();
        self.within_deadline(
            self.deadlines.apply_secs,
            format!("restarting {}", resource_details),
            async move {
                api.patch(dex::DEX_DEPLOYMENT, &pp, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            },
        )
        .await?;

        self.ctx
            .try_log(|logger| slog::info!(logger, "successfully restarted {}", resource_details));
        Ok(())
    }

    async fn delete_resource<K>(
        &self,
        api: Api<K>,
        kind: &str,
        name: &str,
        forced: bool,
    ) -> Result<(), ProvisionError>
    where
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        let dp = if forced {
            DeleteParams {
                grace_period_seconds: Some(0),
                ..Default::default()
            }
        } else {
            DeleteParams::default()
        };

        let resource_details = format!("RESOURCE: {}, NAME: {}", kind, name);
        self.ctx
            .try_log(|logger| slog::info!(logger, "deleting {}", resource_details));

        let name = name.to_owned();
        self.within_deadline(
            self.deadlines.delete_secs,
            format!("deleting {}", resource_details),
            async move { api.delete(&name, &dp).await.map(|_| ()) },
        )
        .await?;

        self.ctx
            .try_log(|logger| slog::info!(logger, "successfully deleted {}", resource_details));
        Ok(())
    }

    async fn strip_finalizers<K>(
        &self,
        api: Api<K>,
        kind: &str,
        name: &str,
    ) -> Result<(), ProvisionError>
    where
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        let resource_details = format!("RESOURCE: {}, NAME: {}", kind, name);
        self.ctx.try_log(|logger| {
            slog::info!(logger, "stripping finalizers from {}", resource_details)
        });

        let patch = json!({ "metadata": { "finalizers": null } });
        let pp = PatchParams::default();
        let name = name.to_owned();
        self.within_deadline(
            self.deadlines.delete_secs,
            format!("stripping finalizers from {}", resource_details),
            async move {
                api.patch(&name, &pp, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    async fn within_deadline<T, F>(
        &self,
        secs: u64,
        action: String,
        fut: F,
    ) -> Result<T, ProvisionError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(Duration::from_secs(secs), fut).await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => {
                let (msg, code) = match e {
                    kube::Error::Api(api_error) => (api_error.message, api_error.code),
                    e => (e.to_string(), 500),
                };
                let msg = format!("failed {}, ERROR: {}", action, msg);
                self.ctx.try_log(|logger| slog::error!(logger, "{}", msg));
                Err(ProvisionError::Api { message: msg, code })
            }
            Err(_) => {
                let msg = format!("timed out after {}s {}", secs, action);
                self.ctx.try_log(|logger| slog::error!(logger, "{}", msg));
                Err(ProvisionError::Timeout(msg))
            }
        }
    }
}
