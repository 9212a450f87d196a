//! Kubernetes access for build backends
//!
//! Backends never hold a `kube::Client` directly. They talk to the cluster
//! through [`BuildClient`], which lets tests drive them with mocks while the
//! operator uses [`KubeBuildClient`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, ServiceAccount};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use notebook_common::Error;

/// Cluster operations needed by build strategies and their helpers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Get a namespaced custom object, `None` if it does not exist
    async fn get_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List namespaced custom objects matching a label selector
    async fn list_objects(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Create a namespaced custom object
    async fn create_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Replace a namespaced custom object (resourceVersion-checked)
    async fn replace_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Delete a namespaced custom object; deleting a missing object succeeds
    async fn delete_object(&self, ar: &ApiResource, namespace: &str, name: &str)
        -> Result<(), Error>;

    /// POST to the `instantiate` subresource of an object and return the result
    async fn instantiate(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        request: &serde_json::Value,
    ) -> Result<DynamicObject, Error>;

    /// Get a cluster-scoped custom object
    async fn get_cluster_object(
        &self,
        ar: &ApiResource,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Replace a cluster-scoped custom object (resourceVersion-checked)
    async fn replace_cluster_object(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Whether the API server serves the given resource in this namespace
    async fn api_available(&self, ar: &ApiResource, namespace: &str) -> Result<bool, Error>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Get a PersistentVolumeClaim
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a PersistentVolumeClaim
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<(), Error>;

    /// List PersistentVolumeClaims matching a label selector
    async fn list_pvcs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error>;

    /// Delete a PersistentVolumeClaim; deleting a missing claim succeeds
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a ServiceAccount
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error>;

    /// Create a ServiceAccount
    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<(), Error>;
}

/// Production [`BuildClient`] backed by a kube `Client`
pub struct KubeBuildClient {
    client: Client,
}

impl KubeBuildClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

fn object_name(obj: &DynamicObject) -> Result<&str, Error> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("build-client", "object has no name"))
}

fn ignore_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl BuildClient for KubeBuildClient {
    async fn get_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.dynamic(ar, namespace).get_opt(name).await?)
    }

    async fn list_objects(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.dynamic(ar, namespace).list(&lp).await?.items)
    }

    async fn create_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        Ok(self
            .dynamic(ar, namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = object_name(obj)?;
        Ok(self
            .dynamic(ar, namespace)
            .replace(name, &PostParams::default(), obj)
            .await?)
    }

    async fn delete_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let result = self
            .dynamic(ar, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(Error::from);
        debug!(kind = %ar.kind, name, namespace, "deleted object");
        ignore_not_found(result)
    }

    async fn instantiate(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        request: &serde_json::Value,
    ) -> Result<DynamicObject, Error> {
        let body = serde_json::to_vec(request)?;
        Ok(self
            .dynamic(ar, namespace)
            .create_subresource("instantiate", name, &PostParams::default(), body)
            .await?)
    }

    async fn get_cluster_object(
        &self,
        ar: &ApiResource,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_cluster_object(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        let name = object_name(obj)?;
        Ok(api.replace(name, &PostParams::default(), obj).await?)
    }

    async fn api_available(&self, ar: &ApiResource, namespace: &str) -> Result<bool, Error> {
        let lp = ListParams::default().limit(1);
        match self.dynamic(ar, namespace).list(&lp).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let result = api
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(Error::from);
        ignore_not_found(result)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
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
        api.create(&PostParams::default(), sa).await?;
        Ok(())
    }
}

/// API resources of the OpenShift and Tekton kinds the backends drive
pub mod kinds {
    use kube::discovery::ApiResource;

    fn resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: format!("{group}/{version}"),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    /// OpenShift BuildConfig
    pub fn build_config() -> ApiResource {
        resource("build.openshift.io", "v1", "BuildConfig", "buildconfigs")
    }

    /// OpenShift Build
    pub fn build() -> ApiResource {
        resource("build.openshift.io", "v1", "Build", "builds")
    }

    /// OpenShift ImageStream
    pub fn image_stream() -> ApiResource {
        resource("image.openshift.io", "v1", "ImageStream", "imagestreams")
    }

    /// Tekton Task
    pub fn task() -> ApiResource {
        resource("tekton.dev", "v1", "Task", "tasks")
    }

    /// Tekton ClusterTask (legacy, cluster-scoped)
    pub fn cluster_task() -> ApiResource {
        resource("tekton.dev", "v1beta1", "ClusterTask", "clustertasks")
    }

    /// Tekton Pipeline
    pub fn pipeline() -> ApiResource {
        resource("tekton.dev", "v1", "Pipeline", "pipelines")
    }

    /// Tekton PipelineRun
    pub fn pipeline_run() -> ApiResource {
        resource("tekton.dev", "v1", "PipelineRun", "pipelineruns")
    }

    /// OpenShift SecurityContextConstraints (cluster-scoped)
    pub fn security_context_constraints() -> ApiResource {
        resource(
            "security.openshift.io",
            "v1",
            "SecurityContextConstraints",
            "securitycontextconstraints",
        )
    }
}
