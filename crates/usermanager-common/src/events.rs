//! Kubernetes Events on LensUser objects
//!
//! Events surface in `kubectl describe lensuser <name>`. Publishing never
//! fails a reconcile; an API error is logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for LensUser events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason`/`action` against `target`
    async fn publish(
        &self,
        target: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by the kube-runtime [`Recorder`]
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller`, tagging the pod name when `POD_NAME` is set
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn build_event(type_: EventType, reason: &str, action: &str, note: Option<String>) -> Event {
    Event {
        type_,
        reason: reason.to_string(),
        note,
        action: action.to_string(),
        secondary: None,
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        target: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = build_event(type_, reason, action, note);
        if let Err(e) = self.recorder.publish(&event, target).await {
            warn!(
                object = target.name.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "dropping LensUser event"
            );
        }
    }
}

/// Event reasons
pub mod reasons {
    /// ServiceAccount, bindings, token and LuConfig are all in place
    pub const USER_PROVISIONED: &str = "UserProvisioned";
    /// RoleBindings changed after a spec update
    pub const BINDINGS_UPDATED: &str = "BindingsUpdated";
    /// Token secret never received a token
    pub const TOKEN_TIMEOUT: &str = "TokenTimeout";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Reconciliation failed with a permanent error
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// Cleanup finished and the finalizer was removed
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
}

/// Event actions
pub mod actions {
    /// Initial provisioning
    pub const PROVISION: &str = "Provision";
    /// Grant diff on spec change
    pub const UPDATE_BINDINGS: &str = "UpdateBindings";
    /// Deletion cleanup
    pub const DELETE: &str = "Delete";
}
