//! Per-namespace and per-build resources for pipeline builds
//!
//! Pipeline runs need the `git-clone` and `buildah` tasks in their own
//! namespace, a service account allowed to run privileged build steps, and a
//! workspace volume per build. Everything here is check-then-act and
//! converges when several reconciles provision the same namespace at once.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ServiceAccount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DynamicObject, ObjectMeta, TypeMeta};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use notebook_common::labels::{
    is_managed, job_labels, job_selector, managed_labels, COPIED_AT_ANNOTATION,
    COPIED_FROM_ANNOTATION, TASK_TYPE_LABEL, TASK_VERSION_LABEL,
};
use notebook_common::Error;

use crate::client::{kinds, BuildClient};
use crate::settings::BuildSettings;
use crate::strategy::tolerate_already_exists;

/// Task that clones the notebook repository
pub const GIT_CLONE_TASK: &str = "git-clone";

/// Task that builds and pushes the image
pub const BUILDAH_TASK: &str = "buildah";

/// Tasks every pipeline build needs in its namespace
pub const REQUIRED_TASKS: [&str; 2] = [GIT_CLONE_TASK, BUILDAH_TASK];

/// Component label value on build workspace volumes
const WORKSPACE_COMPONENT: &str = "build-workspace";

/// Name of the workspace volume of a build
pub fn workspace_volume_name(build_name: &str) -> String {
    format!("{build_name}-workspace")
}

/// Service account principal as it appears in an SCC `users` list
pub fn service_account_principal(namespace: &str, service_account: &str) -> String {
    format!("system:serviceaccount:{namespace}:{service_account}")
}

/// Make a namespace ready to run pipeline builds.
///
/// Copies or refreshes the required tasks, ensures the build service account
/// and grants it the build security profile.
pub async fn ensure_namespace_resources(
    client: &dyn BuildClient,
    settings: &BuildSettings,
    namespace: &str,
) -> Result<(), Error> {
    for task in REQUIRED_TASKS {
        ensure_task(client, settings, namespace, task).await?;
    }
    ensure_service_account(client, namespace, &settings.service_account).await?;
    grant_security_profile(client, settings, namespace).await
}

/// True if a namespace task copy is managed by us and at the wanted version
fn is_current(task: &DynamicObject, settings: &BuildSettings) -> bool {
    let labels = task.metadata.labels.as_ref();
    is_managed(labels)
        && labels
            .and_then(|l| l.get(TASK_VERSION_LABEL))
            .is_some_and(|v| *v == settings.task_version)
}

async fn ensure_task(
    client: &dyn BuildClient,
    settings: &BuildSettings,
    namespace: &str,
    task: &str,
) -> Result<(), Error> {
    let ar = kinds::task();
    let existing = client.get_object(&ar, namespace, task).await?;
    if let Some(current) = &existing {
        if is_current(current, settings) {
            debug!(task, namespace, "task copy is current");
            return Ok(());
        }
    }

    let (source, copied_from) = fetch_source_task(client, settings, task).await?;
    let mut copy = namespace_copy(&source, task, namespace, &copied_from, settings);

    match existing {
        Some(stale) => {
            copy.metadata.resource_version = stale.metadata.resource_version.clone();
            client.replace_object(&ar, namespace, &copy).await?;
            info!(task, namespace, version = %settings.task_version, "refreshed stale task copy");
        }
        None => {
            if tolerate_already_exists(client.create_object(&ar, namespace, &copy).await)?
                .is_some()
            {
                info!(task, namespace, from = %copied_from, "copied task into namespace");
            }
        }
    }
    Ok(())
}

/// Source definition of a task: the namespaced Task first, then the legacy
/// cluster-scoped ClusterTask
async fn fetch_source_task(
    client: &dyn BuildClient,
    settings: &BuildSettings,
    task: &str,
) -> Result<(DynamicObject, String), Error> {
    if let Some(found) = client
        .get_object(&kinds::task(), &settings.task_source_namespace, task)
        .await?
    {
        return Ok((found, format!("{}/{task}", settings.task_source_namespace)));
    }
    if let Some(found) = client
        .get_cluster_object(&kinds::cluster_task(), task)
        .await?
    {
        return Ok((found, format!("ClusterTask/{task}")));
    }
    Err(Error::task_not_found(task, &settings.task_source_namespace))
}

fn namespace_copy(
    source: &DynamicObject,
    task: &str,
    namespace: &str,
    copied_from: &str,
    settings: &BuildSettings,
) -> DynamicObject {
    let ar = kinds::task();
    let mut labels = managed_labels();
    labels.insert(TASK_TYPE_LABEL.to_string(), task.to_string());
    labels.insert(TASK_VERSION_LABEL.to_string(), settings.task_version.clone());

    let annotations = BTreeMap::from([
        (COPIED_FROM_ANNOTATION.to_string(), copied_from.to_string()),
        (COPIED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339()),
    ]);

    let spec = source
        .data
        .get("spec")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    DynamicObject {
        types: Some(TypeMeta {
            api_version: ar.api_version,
            kind: ar.kind,
        }),
        metadata: ObjectMeta {
            name: Some(task.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        data: serde_json::json!({ "spec": spec }),
    }
}

async fn ensure_service_account(
    client: &dyn BuildClient,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    if client.get_service_account(namespace, name).await?.is_some() {
        return Ok(());
    }
    let sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    };
    if tolerate_already_exists(client.create_service_account(namespace, &sa).await)?.is_some() {
        info!(service_account = name, namespace, "created build service account");
    }
    Ok(())
}

/// Add the build service account to the SCC's `users`.
///
/// Clusters without the SCC API, or where we may not read or update it, are
/// logged and skipped: builds may still work there.
async fn grant_security_profile(
    client: &dyn BuildClient,
    settings: &BuildSettings,
    namespace: &str,
) -> Result<(), Error> {
    let ar = kinds::security_context_constraints();
    let scc = match client.get_cluster_object(&ar, &settings.scc_name).await {
        Ok(Some(scc)) => scc,
        Ok(None) => {
            warn!(scc = %settings.scc_name, "security context constraints not found, skipping grant");
            return Ok(());
        }
        Err(e) if e.is_forbidden() => {
            warn!(scc = %settings.scc_name, error = %e, "not allowed to read security context constraints");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let principal = service_account_principal(namespace, &settings.service_account);
    let mut users: Vec<String> = scc
        .data
        .get("users")
        .and_then(|u| u.as_array())
        .map(|u| {
            u.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if users.contains(&principal) {
        return Ok(());
    }
    users.push(principal.clone());

    let mut updated = scc;
    updated.data["users"] = serde_json::json!(users);
    match client.replace_cluster_object(&ar, &updated).await {
        Ok(_) => {
            info!(scc = %settings.scc_name, %principal, "granted security context constraints");
            Ok(())
        }
        Err(e) if e.is_forbidden() => {
            warn!(scc = %settings.scc_name, error = %e, "not allowed to update security context constraints");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Make sure the workspace volume of a build exists and return its name
pub async fn ensure_build_volume(
    client: &dyn BuildClient,
    settings: &BuildSettings,
    namespace: &str,
    job_name: &str,
    build_name: &str,
) -> Result<String, Error> {
    let name = workspace_volume_name(build_name);
    if client.get_pvc(namespace, &name).await?.is_some() {
        return Ok(name);
    }

    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(job_labels(job_name, WORKSPACE_COMPONENT)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: settings.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(settings.volume_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    if tolerate_already_exists(client.create_pvc(namespace, &pvc).await)?.is_some() {
        info!(volume = %name, namespace, size = %settings.volume_size, "created build workspace volume");
    }
    Ok(name)
}

/// Delete every workspace volume labelled for a job; returns how many
pub async fn sweep_build_resources(
    client: &dyn BuildClient,
    namespace: &str,
    job_name: &str,
) -> Result<usize, Error> {
    let pvcs = client.list_pvcs(namespace, &job_selector(job_name)).await?;
    let mut deleted = 0;
    for pvc in pvcs {
        let name = pvc.name_any();
        client.delete_pvc(namespace, &name).await?;
        debug!(volume = %name, namespace, "swept build volume");
        deleted += 1;
    }
    if deleted > 0 {
        info!(job = job_name, namespace, deleted, "swept build resources");
    }
    Ok(deleted)
}
