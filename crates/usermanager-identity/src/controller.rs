//! LensUser lifecycle controller
//!
//! The watch loop hands over whole objects; [`UserEvent::derive`] turns the
//! object's spec and status into the event to handle, and [`DISPATCH`] maps
//! (kind, event) to the handler:
//! - `Create` → ServiceAccount → RoleBindings → token → LuConfig → `Ready`
//! - `Update` → RoleBinding diff only (token and LuConfig are unaffected)
//! - `Delete` → explicit cleanup of everything created, then drop the finalizer
//!
//! Permanent failures are written to status as `Failed` with a remediation
//! hint and wait for a spec change; retryable failures requeue.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use usermanager_common::crd::{
    Condition, ConditionStatus, LensUser, LensUserStatus, RoleGrant, UserPhase,
};
use usermanager_common::events::{actions, reasons};
use usermanager_common::kube_utils::{has_finalizer, is_deleting};
use usermanager_common::template::ManifestRenderer;
use usermanager_common::{
    token_secret_name, EventPublisher, KubeEventPublisher, FIELD_MANAGER, LENS_USER_FINALIZER,
};

use crate::gateway::{ClusterGateway, KubeGateway};
use crate::publisher::{build_config, publish, PublisherSettings};
use crate::rolebinding::{effective_bindings, reconcile_bindings, remove_bindings};
use crate::token::{ensure_token, TokenRequest, TokenSettings};
use crate::Error;

/// Requeue delay for retryable failures
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

const READY_CONDITION: &str = "Ready";

// =============================================================================
// Controller context
// =============================================================================

/// Shared context for the LensUser controller
pub struct Context {
    /// Cluster API access (trait object for testability)
    pub gateway: Arc<dyn ClusterGateway>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Manifest renderer
    pub renderer: ManifestRenderer,
    /// Token wait bounds
    pub token: TokenSettings,
    /// Cluster metadata for published kubeconfigs
    pub publisher: PublisherSettings,
}

impl Context {
    /// Create a context backed by the real API server
    pub fn new(client: Client, token: TokenSettings, publisher: PublisherSettings) -> Self {
        Self {
            gateway: Arc::new(KubeGateway::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, FIELD_MANAGER)),
            renderer: ManifestRenderer::new(),
            token,
            publisher,
        }
    }

    /// Create a context for testing with a mock gateway
    #[cfg(test)]
    pub fn for_testing(gateway: Arc<dyn ClusterGateway>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            gateway,
            events,
            renderer: ManifestRenderer::new(),
            token: TokenSettings::default(),
            publisher: PublisherSettings::default(),
        }
    }
}

// =============================================================================
// Event derivation and dispatch
// =============================================================================

/// Event type used as the dispatch key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Provision (or finish provisioning) the user
    Create,
    /// Grant list changed on a ready user
    Update,
    /// User is being deleted
    Delete,
}

/// What a LensUser's current state asks the controller to do
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserEvent {
    /// Run the full pipeline; `old` is the grant list a previous pass applied
    Create {
        /// Grants already reflected in the cluster
        old: Vec<RoleGrant>,
    },
    /// Move bindings from `old` to `new`
    Update {
        /// Grants last applied
        old: Vec<RoleGrant>,
        /// Grants now requested
        new: Vec<RoleGrant>,
    },
    /// Clean up
    Delete,
    /// Nothing to do until the object changes
    Noop,
}

impl UserEvent {
    /// Derive the event from the object.
    ///
    /// - deletion timestamp set → `Delete`
    /// - `Ready` with applied grants equal to the spec's (same set, same first grant
    ///   per namespace) → `Noop`
    /// - `Ready` with different applied grants → `Update`
    /// - `Ready` with a changed `tokenSecretRef` → `Create`
    /// - `Failed` for the current generation → `Noop`
    /// - anything else → `Create`
    pub fn derive(user: &LensUser) -> Self {
        if is_deleting(user) {
            return Self::Delete;
        }
        let status = user.status.as_ref();
        let applied = user.applied_roles().map(<[RoleGrant]>::to_vec);

        match user.phase() {
            UserPhase::Ready => {
                let token_moved = user.spec.token_secret_ref.as_deref().is_some_and(|r| {
                    status.and_then(|s| s.token_secret.as_deref()) != Some(r)
                });
                match applied {
                    Some(old) if token_moved => Self::Create { old },
                    Some(old) if same_grants(&old, &user.spec.roles) => Self::Noop,
                    Some(old) => Self::Update {
                        old,
                        new: user.spec.roles.clone(),
                    },
                    None => Self::Create { old: Vec::new() },
                }
            }
            UserPhase::Failed
                if status.and_then(|s| s.observed_generation).is_some()
                    && status.and_then(|s| s.observed_generation) == user.metadata.generation =>
            {
                Self::Noop
            }
            _ => Self::Create {
                old: applied.unwrap_or_default(),
            },
        }
    }

    /// Dispatch key, `None` for `Noop`
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Create { .. } => Some(EventKind::Create),
            Self::Update { .. } => Some(EventKind::Update),
            Self::Delete => Some(EventKind::Delete),
            Self::Noop => None,
        }
    }
}

/// Same grants and same bound role per namespace
fn same_grants(a: &[RoleGrant], b: &[RoleGrant]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
        && effective_bindings(a) == effective_bindings(b)
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Action, Error>> + Send + 'a>>;

/// Event handler signature
pub type Handler = for<'a> fn(&'a LensUser, &'a UserEvent, &'a Context) -> HandlerFuture<'a>;

/// (resource kind, event type) → handler
pub const DISPATCH: &[(&str, EventKind, Handler)] = &[
    ("LensUser", EventKind::Create, provision_handler as Handler),
    ("LensUser", EventKind::Update, regrant_handler as Handler),
    ("LensUser", EventKind::Delete, cleanup_handler as Handler),
];

/// Look up the handler for `kind` and `event`
pub fn handler_for(kind: &str, event: EventKind) -> Option<Handler> {
    DISPATCH
        .iter()
        .find(|(k, e, _)| *k == kind && *e == event)
        .map(|(_, _, handler)| *handler)
}

fn provision_handler<'a>(
    user: &'a LensUser,
    event: &'a UserEvent,
    ctx: &'a Context,
) -> HandlerFuture<'a> {
    Box::pin(provision(user, event, ctx))
}

fn regrant_handler<'a>(
    user: &'a LensUser,
    event: &'a UserEvent,
    ctx: &'a Context,
) -> HandlerFuture<'a> {
    Box::pin(regrant(user, event, ctx))
}

fn cleanup_handler<'a>(
    user: &'a LensUser,
    _event: &'a UserEvent,
    ctx: &'a Context,
) -> HandlerFuture<'a> {
    Box::pin(cleanup(user, ctx))
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a LensUser resource
#[instrument(skip(user, ctx), fields(user = %user.name_any(), namespace = ?user.namespace()))]
pub async fn reconcile(user: Arc<LensUser>, ctx: Arc<Context>) -> Result<Action, Error> {
    let event = UserEvent::derive(&user);
    let Some(kind) = event.kind() else {
        debug!(phase = %user.phase(), "nothing to do");
        return Ok(Action::await_change());
    };
    let handler = handler_for(&LensUser::kind(&()), kind)
        .ok_or_else(|| Error::internal(format!("no handler for LensUser {:?}", kind)))?;

    info!(event = ?kind, "reconciling LensUser");
    match handler(&user, &event, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) if e.is_retryable() || kind == EventKind::Delete => Err(e),
        Err(e) => {
            record_failure(&user, &ctx, kind, &e).await?;
            Err(e)
        }
    }
}

/// Error policy for the LensUser controller.
///
/// Retryable errors requeue after [`RETRY_INTERVAL`]; permanent ones were
/// already written to status and wait for the object to change.
pub fn error_policy(user: Arc<LensUser>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(user = %user.name_any(), error = %error, "LensUser reconcile failed, will retry");
        Action::requeue(RETRY_INTERVAL)
    } else {
        error!(user = %user.name_any(), error = %error, "LensUser reconcile failed permanently");
        Action::await_change()
    }
}

fn user_namespace(user: &LensUser) -> Result<String, Error> {
    user.namespace()
        .ok_or_else(|| Error::validation_for(user.name_any(), "LensUser must be namespaced"))
}

fn owner_of(user: &LensUser) -> Option<OwnerReference> {
    user.controller_owner_ref(&())
}

/// Create: ServiceAccount, bindings, token, LuConfig.
async fn provision(user: &LensUser, event: &UserEvent, ctx: &Context) -> Result<Action, Error> {
    let name = user.name_any();
    let namespace = user_namespace(user)?;
    user.spec.validate(&name)?;

    if !has_finalizer(user, LENS_USER_FINALIZER) {
        ctx.gateway
            .add_finalizer(&name, &namespace, LENS_USER_FINALIZER)
            .await?;
    }
    set_progress(user, ctx, "provisioning service account and role bindings", None).await?;

    let owner = owner_of(user);
    let mut sa = ctx.renderer.service_account(&name, &namespace)?;
    sa.metadata.owner_references = owner.clone().map(|o| vec![o]);
    match ctx.gateway.create_service_account(&namespace, &sa).await {
        Ok(()) => info!(user = %name, "created service account"),
        Err(e) if e.is_already_exists() => debug!(user = %name, "service account already exists"),
        Err(e) => return Err(e),
    }

    let old: &[RoleGrant] = match event {
        UserEvent::Create { old } => old,
        _ => &[],
    };
    let applied = reconcile_bindings(
        ctx.gateway.as_ref(),
        &ctx.renderer,
        &name,
        &namespace,
        old,
        &user.spec.roles,
    )
    .await?;
    set_progress(user, ctx, "waiting for service account token", Some(applied.clone())).await?;

    let request = TokenRequest {
        user: &name,
        namespace: &namespace,
        explicit_secret: user.spec.token_secret_ref.as_deref(),
        owner: owner.clone(),
    };
    let token = ensure_token(ctx.gateway.as_ref(), &ctx.renderer, &request, &ctx.token).await?;

    let ca = ctx.publisher.resolve_ca(&name, token.ca_crt.as_deref())?;
    let config = build_config(
        &ctx.renderer,
        &name,
        &namespace,
        &ctx.publisher,
        &ca,
        &token.token,
    )?;
    publish(ctx.gateway.as_ref(), config, owner).await?;

    let mut status = LensUserStatus::with_phase(UserPhase::Ready)
        .message(format!("{} role binding(s) applied", applied.len()))
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::True,
            "Provisioned",
            "kubeconfig published",
        ))
        .applied_roles(applied)
        .observed_generation(user.metadata.generation);
    status.service_account = Some(name.clone());
    status.token_secret = Some(token.secret_name);
    status.config_name = Some(name.clone());
    ctx.gateway
        .patch_lens_user_status(&name, &namespace, &status)
        .await?;

    ctx.events
        .publish(
            &user.object_ref(&()),
            EventType::Normal,
            reasons::USER_PROVISIONED,
            actions::PROVISION,
            Some(format!("LuConfig {}/{} published", namespace, name)),
        )
        .await;
    info!(user = %name, "LensUser ready");
    Ok(Action::await_change())
}

/// Update: RoleBinding diff only.
async fn regrant(user: &LensUser, event: &UserEvent, ctx: &Context) -> Result<Action, Error> {
    let UserEvent::Update { old, new } = event else {
        return Err(Error::internal_with_context(
            "regrant",
            format!("unexpected event {:?}", event),
        ));
    };
    let name = user.name_any();
    let namespace = user_namespace(user)?;
    user.spec.validate(&name)?;

    let applied = reconcile_bindings(
        ctx.gateway.as_ref(),
        &ctx.renderer,
        &name,
        &namespace,
        old,
        new,
    )
    .await?;

    let status = LensUserStatus::with_phase(UserPhase::Ready)
        .message(format!("{} role binding(s) applied", applied.len()))
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::True,
            "BindingsUpdated",
            "role bindings match spec",
        ))
        .applied_roles(applied)
        .observed_generation(user.metadata.generation);
    ctx.gateway
        .patch_lens_user_status(&name, &namespace, &status)
        .await?;

    ctx.events
        .publish(
            &user.object_ref(&()),
            EventType::Normal,
            reasons::BINDINGS_UPDATED,
            actions::UPDATE_BINDINGS,
            Some(format!("{} grant(s) now applied", new.len())),
        )
        .await;
    Ok(Action::await_change())
}

/// Delete: remove everything the controller created, then the finalizer.
///
/// Only the finalizer removal can fail the pass.
async fn cleanup(user: &LensUser, ctx: &Context) -> Result<Action, Error> {
    let name = user.name_any();
    let namespace = user_namespace(user)?;
    if !has_finalizer(user, LENS_USER_FINALIZER) {
        return Ok(Action::await_change());
    }
    info!(user = %name, "cleaning up LensUser");

    let gw = ctx.gateway.as_ref();
    let mut failures = remove_bindings(gw, &name, &user.binding_namespaces()).await;

    failures += tolerate_missing(
        "LuConfig",
        &name,
        gw.delete_lu_config(&name, &namespace).await,
    );
    // An explicitly referenced secret belongs to whoever created it
    if user.spec.token_secret_ref.is_none() {
        let secret = token_secret_name(&name);
        failures += tolerate_missing(
            "token secret",
            &secret,
            gw.delete_secret(&secret, &namespace).await,
        );
    }
    failures += tolerate_missing(
        "service account",
        &name,
        gw.delete_service_account(&name, &namespace).await,
    );

    ctx.events
        .publish(
            &user.object_ref(&()),
            EventType::Normal,
            reasons::CLEANUP_COMPLETE,
            actions::DELETE,
            (failures > 0).then(|| format!("{} cleanup step(s) failed; see operator logs", failures)),
        )
        .await;

    gw.remove_finalizer(&name, &namespace, LENS_USER_FINALIZER)
        .await?;
    info!(user = %name, failures, "LensUser cleanup complete");
    Ok(Action::await_change())
}

/// 0 on success or not-found, 1 (logged) otherwise
fn tolerate_missing(kind: &str, name: &str, result: Result<(), Error>) -> usize {
    match result {
        Ok(()) => {
            info!(kind, name, "deleted");
            0
        }
        Err(e) if e.is_not_found() => 0,
        Err(e) => {
            warn!(kind, name, error = %e, "cleanup failed, continuing");
            1
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Check if the status already shows `phase` with `message`
fn is_status_unchanged(user: &LensUser, phase: UserPhase, message: &str) -> bool {
    user.status.as_ref().is_some_and(|s| {
        s.phase == phase
            && s.message.as_deref() == Some(message)
            && s.observed_generation == user.metadata.generation
    })
}

/// Mark the user as `Reconciling`, recording applied grants when given
async fn set_progress(
    user: &LensUser,
    ctx: &Context,
    message: &str,
    applied: Option<Vec<RoleGrant>>,
) -> Result<(), Error> {
    if applied.is_none() && is_status_unchanged(user, UserPhase::Reconciling, message) {
        return Ok(());
    }
    let mut status = LensUserStatus::with_phase(UserPhase::Reconciling)
        .message(message)
        .observed_generation(user.metadata.generation);
    status.applied_roles = applied;
    ctx.gateway
        .patch_lens_user_status(&user.name_any(), &user_namespace(user)?, &status)
        .await
}

/// What an operator should do about a permanent failure
fn remediation(error: &Error) -> &'static str {
    match error {
        Error::Validation { .. } => "fix spec.roles and reapply the LensUser",
        Error::TokenTimeout { .. } => {
            "check that the service account token controller is running, then edit the LensUser to retry"
        }
        Error::TokenSecret { .. } => {
            "point spec.tokenSecretRef at a populated service-account-token secret"
        }
        Error::Endpoint { .. } => {
            "set CLUSTER_NAME, KUBE_API_URL and CLUSTER_CA_FILE (or INSECURE_SKIP_TLS_VERIFY) on the operator"
        }
        Error::Kube { .. } => "check the operator's RBAC permissions for this namespace",
        Error::Template { .. } | Error::Serialization { .. } => {
            "the operator rendered an invalid manifest; report this as a bug"
        }
        Error::Internal { .. } => "the operator will retry",
    }
}

/// Write a permanent failure to status and publish a Warning event
async fn record_failure(
    user: &LensUser,
    ctx: &Context,
    kind: EventKind,
    error: &Error,
) -> Result<(), Error> {
    let message = format!("{}; {}", error, remediation(error));
    if is_status_unchanged(user, UserPhase::Failed, &message) {
        return Ok(());
    }
    warn!(error = %error, "LensUser failed permanently");

    let status = LensUserStatus::with_phase(UserPhase::Failed)
        .message(message.clone())
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            error.reason(),
            message.clone(),
        ))
        .observed_generation(user.metadata.generation);
    ctx.gateway
        .patch_lens_user_status(&user.name_any(), &user_namespace(user)?, &status)
        .await?;

    let reason = match error {
        Error::Validation { .. } => reasons::VALIDATION_FAILED,
        Error::TokenTimeout { .. } => reasons::TOKEN_TIMEOUT,
        _ => reasons::RECONCILE_FAILED,
    };
    let action = match kind {
        EventKind::Update => actions::UPDATE_BINDINGS,
        EventKind::Delete => actions::DELETE,
        EventKind::Create => actions::PROVISION,
    };
    ctx.events
        .publish(
            &user.object_ref(&()),
            EventType::Warning,
            reason,
            action,
            Some(message),
        )
        .await;
    Ok(())
}
