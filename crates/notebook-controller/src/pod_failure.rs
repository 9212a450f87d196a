//! Why a validation pod cannot finish
//!
//! Container states show a failure long before the pod phase does: a pod
//! stuck pulling a missing image stays Pending until its active deadline.
//! Init containers are inspected before the validator, in the order the
//! kubelet runs them.

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

/// Failure reasons reported by [`analyze_pod`]
pub mod reasons {
    /// The kubelet gave up pulling an image for now
    pub const IMAGE_PULL_BACK_OFF: &str = "ImagePullBackOff";
    /// An image pull failed; the kubelet retries on its own
    pub const ERR_IMAGE_PULL: &str = "ErrImagePull";
    /// The image reference does not parse
    pub const INVALID_IMAGE_NAME: &str = "InvalidImageName";
    /// A container keeps crashing
    pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";
    /// The runtime refused to start a container
    pub const RUN_CONTAINER_ERROR: &str = "RunContainerError";
    /// A referenced secret, config map or volume is missing or invalid
    pub const CREATE_CONTAINER_CONFIG_ERROR: &str = "CreateContainerConfigError";
    /// A container hit its memory limit
    pub const OOM_KILLED: &str = "OOMKilled";
    /// An init container exited non-zero
    pub const INIT_CONTAINER_ERROR: &str = "InitContainerError";
    /// No node can take the pod
    pub const UNSCHEDULABLE: &str = "Unschedulable";
}

/// A diagnosed pod failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodFailure {
    /// One of [`reasons`]
    pub reason: &'static str,
    /// Container the failure was found in, if any
    pub container: Option<String>,
    /// Whether that container is an init container
    pub init_container: bool,
    /// Detail reported by the kubelet or runtime
    pub detail: Option<String>,
    /// What the user can do about it
    pub suggestion: String,
    /// The kubelet or scheduler may still get past this on its own
    pub recoverable: bool,
}

impl PodFailure {
    /// One-line description for the job's status
    pub fn diagnostics(&self) -> String {
        let mut out = match &self.container {
            Some(name) if self.init_container => format!("init container {name}: {}", self.reason),
            Some(name) => format!("container {name}: {}", self.reason),
            None => self.reason.to_string(),
        };
        if let Some(detail) = self.detail.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(&format!(" ({detail})"));
        }
        out.push_str(". ");
        out.push_str(&self.suggestion);
        out
    }
}

fn scc_violation(message: Option<&str>) -> bool {
    let message = message.unwrap_or_default().to_lowercase();
    ["runasnonroot", "scc", "security context"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn waiting_failure(status: &ContainerStatus, init: bool) -> Option<PodFailure> {
    let waiting = status.state.as_ref()?.waiting.as_ref()?;
    let detail = waiting.message.clone();
    let subject = if init { "Init container" } else { "Container" };

    let (reason, recoverable, suggestion) = match waiting.reason.as_deref()? {
        reasons::IMAGE_PULL_BACK_OFF => (
            reasons::IMAGE_PULL_BACK_OFF,
            false,
            format!(
                "{subject} image could not be pulled. Check the image name, registry \
                 credentials and rate limits."
            ),
        ),
        reasons::ERR_IMAGE_PULL => (
            reasons::ERR_IMAGE_PULL,
            true,
            format!("{subject} image pull failed. Verify the image exists and is accessible."),
        ),
        reasons::INVALID_IMAGE_NAME => (
            reasons::INVALID_IMAGE_NAME,
            false,
            format!("{subject} image reference is malformed. Fix the image name."),
        ),
        reasons::CRASH_LOOP_BACK_OFF => (
            reasons::CRASH_LOOP_BACK_OFF,
            false,
            format!("{subject} is crashing repeatedly. Check its logs for errors."),
        ),
        reasons::RUN_CONTAINER_ERROR if scc_violation(detail.as_deref()) => (
            reasons::RUN_CONTAINER_ERROR,
            false,
            if init {
                "OpenShift SCC violation in the clone step. Build an image to skip it.".to_string()
            } else {
                "OpenShift SCC violation. Use a build with an OpenShift-compatible base image."
                    .to_string()
            },
        ),
        reasons::RUN_CONTAINER_ERROR => (
            reasons::RUN_CONTAINER_ERROR,
            false,
            format!("{subject} failed to run. Check its configuration and logs."),
        ),
        reasons::CREATE_CONTAINER_CONFIG_ERROR => (
            reasons::CREATE_CONTAINER_CONFIG_ERROR,
            false,
            format!(
                "{subject} configuration error. Check referenced secrets, volume mounts \
                 and environment variables."
            ),
        ),
        // ContainerCreating, PodInitializing and friends
        _ => return None,
    };

    Some(PodFailure {
        reason,
        container: Some(status.name.clone()),
        init_container: init,
        detail,
        suggestion,
        recoverable,
    })
}

/// Non-zero exits of the validator itself are notebook failures and are left
/// to the caller; only memory kills are diagnosed here.
fn terminated_failure(status: &ContainerStatus, init: bool) -> Option<PodFailure> {
    let terminated = status.state.as_ref()?.terminated.as_ref()?;
    if terminated.exit_code == 0 {
        return None;
    }
    let oom = terminated.reason.as_deref() == Some(reasons::OOM_KILLED);
    let (reason, suggestion) = match (oom, init) {
        (true, _) => (
            reasons::OOM_KILLED,
            "Container was killed for exceeding its memory limit. Increase memory limits \
             in podConfig.resources."
                .to_string(),
        ),
        (false, true) => (
            reasons::INIT_CONTAINER_ERROR,
            format!(
                "Init container failed with exit code {}. Check the repository URL, ref \
                 and credentials.",
                terminated.exit_code
            ),
        ),
        (false, false) => return None,
    };

    Some(PodFailure {
        reason,
        container: Some(status.name.clone()),
        init_container: init,
        detail: terminated
            .message
            .clone()
            .or_else(|| Some(format!("exit code {}", terminated.exit_code))),
        suggestion,
        recoverable: false,
    })
}

/// Diagnose a validation pod from its container states and conditions.
///
/// Returns `None` when nothing points at a failure.
pub fn analyze_pod(pod: &Pod) -> Option<PodFailure> {
    let status = pod.status.as_ref()?;

    let containers = status
        .init_container_statuses
        .iter()
        .flatten()
        .map(|c| (c, true))
        .chain(status.container_statuses.iter().flatten().map(|c| (c, false)));
    for (container, init) in containers {
        if let Some(failure) =
            waiting_failure(container, init).or_else(|| terminated_failure(container, init))
        {
            return Some(failure);
        }
    }

    status
        .conditions
        .iter()
        .flatten()
        .find(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some(reasons::UNSCHEDULABLE)
        })
        .map(|c| PodFailure {
            reason: reasons::UNSCHEDULABLE,
            container: None,
            init_container: false,
            detail: c.message.clone(),
            suggestion: "Pod cannot be scheduled. Check resource requests, node selectors and \
                         cluster capacity."
                .to_string(),
            recoverable: true,
        })
}
