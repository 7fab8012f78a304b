//! Token acquisition for a user's ServiceAccount
//!
//! Kubernetes 1.24+ no longer mints a token secret per ServiceAccount, so the
//! controller creates `<user>-token` itself and waits for the token controller
//! to populate it. Clusters that still auto-create token secrets are covered by
//! scanning the ServiceAccount's `secrets` references first.

use std::time::Duration;

use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{debug, info, warn};

use usermanager_common::kube_utils::poll_for;
use usermanager_common::template::ManifestRenderer;
use usermanager_common::{
    token_secret_name, CA_CERT_KEY, SERVICE_ACCOUNT_NAME_ANNOTATION, SERVICE_ACCOUNT_TOKEN_TYPE,
    TOKEN_KEY,
};

use crate::gateway::ClusterGateway;
use crate::Error;

/// How long to wait for the token controller by default
pub const DEFAULT_TOKEN_WAIT: Duration = Duration::from_secs(30);

/// Interval between token secret reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bounds for the token wait
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenSettings {
    /// Give up after this long
    pub max_wait: Duration,
    /// Time between reads of the token secret
    pub poll_interval: Duration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_TOKEN_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Token material read from a populated token secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPayload {
    /// Secret the token was read from
    pub secret_name: String,
    /// Decoded bearer token
    pub token: String,
    /// Cluster CA bundle, when the token controller included one
    pub ca_crt: Option<Vec<u8>>,
}

impl TokenPayload {
    /// Read the token out of `secret`.
    ///
    /// `Ok(None)` when the token key is absent or empty.
    fn from_secret(secret: &Secret) -> Result<Option<Self>, Error> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let data = match &secret.data {
            Some(data) => data,
            None => return Ok(None),
        };
        let token = match data.get(TOKEN_KEY) {
            Some(bytes) if !bytes.0.is_empty() => bytes,
            _ => return Ok(None),
        };
        let token = String::from_utf8(token.0.clone()).map_err(|_| {
            Error::token_secret(
                &name,
                secret.metadata.namespace.clone().unwrap_or_default(),
                "token is not valid UTF-8",
            )
        })?;
        Ok(Some(Self {
            secret_name: name,
            token,
            ca_crt: data.get(CA_CERT_KEY).map(|b| b.0.clone()),
        }))
    }
}

/// What to acquire a token for
#[derive(Clone, Debug)]
pub struct TokenRequest<'a> {
    /// ServiceAccount (and LensUser) name
    pub user: &'a str,
    /// Namespace of the ServiceAccount
    pub namespace: &'a str,
    /// Use this secret as-is instead of discovering or creating one
    pub explicit_secret: Option<&'a str>,
    /// Owner for a synthesized secret
    pub owner: Option<OwnerReference>,
}

/// Return a populated token for the request's ServiceAccount.
///
/// 1. An explicit secret is read once and returned; missing or empty is permanent.
/// 2. Otherwise the first secret referenced by the ServiceAccount that is a
///    service-account-token bound to this user and already holds a token wins.
/// 3. Otherwise `<user>-token` is created (an existing one is fine), added to
///    the ServiceAccount's `secrets`, and polled until populated or
///    `settings.max_wait` passes, which is a permanent [`Error::TokenTimeout`].
///    A failed read during the wait is returned as is.
pub async fn ensure_token(
    gateway: &dyn ClusterGateway,
    renderer: &ManifestRenderer,
    request: &TokenRequest<'_>,
    settings: &TokenSettings,
) -> Result<TokenPayload, Error> {
    let (user, namespace) = (request.user, request.namespace);

    if let Some(name) = request.explicit_secret {
        let secret = gateway.get_secret(name, namespace).await?.ok_or_else(|| {
            Error::token_secret(name, namespace, "referenced token secret does not exist")
        })?;
        let payload = TokenPayload::from_secret(&secret)?
            .ok_or_else(|| Error::token_secret(name, namespace, "secret holds no token"))?;
        debug!(user, secret = name, "using explicitly referenced token secret");
        return Ok(payload);
    }

    let sa = gateway
        .get_service_account(user, namespace)
        .await?
        .ok_or_else(|| {
            Error::internal_with_context(
                "token",
                format!("service account {}/{} not found", namespace, user),
            )
        })?;
    let referenced: Vec<String> = sa
        .secrets
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|r| r.name.clone())
        .collect();

    for name in &referenced {
        match gateway.get_secret(name, namespace).await {
            Ok(Some(secret)) if is_bound_token_secret(&secret, user) => {
                match TokenPayload::from_secret(&secret) {
                    Ok(Some(payload)) => {
                        debug!(user, secret = %name, "reusing token secret referenced by service account");
                        return Ok(payload);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(user, secret = %name, error = %e, "skipping unusable secret reference"),
                }
            }
            Ok(_) => {}
            Err(e) => debug!(user, secret = %name, error = %e, "skipping unreadable secret reference"),
        }
    }

    let secret_name = token_secret_name(user);
    let mut secret = renderer.token_secret(&secret_name, namespace, user)?;
    if let Some(owner) = &request.owner {
        secret.metadata.owner_references = Some(vec![owner.clone()]);
    }
    match gateway.create_secret(namespace, &secret).await {
        Ok(()) => info!(user, secret = %secret_name, "created token secret"),
        Err(e) if e.is_already_exists() => {
            debug!(user, secret = %secret_name, "token secret already exists")
        }
        Err(e) => return Err(e),
    }

    if !referenced.contains(&secret_name) {
        let list_exists = sa.secrets.as_ref().is_some_and(|s| !s.is_empty());
        let patch = secrets_patch(&secret_name, list_exists);
        // Non-fatal: the token controller only needs the annotation.
        if let Err(e) = gateway.patch_service_account(user, namespace, patch).await {
            warn!(user, secret = %secret_name, error = %e, "failed to reference token secret from service account");
        }
    }

    wait_for_token(gateway, &secret_name, namespace, settings).await
}

/// Poll `secret_name` until its token is populated.
///
/// A failed read ends the wait with that error, keeping its retry class.
pub async fn wait_for_token(
    gateway: &dyn ClusterGateway,
    secret_name: &str,
    namespace: &str,
    settings: &TokenSettings,
) -> Result<TokenPayload, Error> {
    let start = tokio::time::Instant::now();
    let payload = poll_for(settings.max_wait, settings.poll_interval, || async move {
        match gateway.get_secret(secret_name, namespace).await? {
            Some(secret) => TokenPayload::from_secret(&secret),
            None => Ok(None),
        }
    })
    .await?;

    match payload {
        Some(payload) => {
            info!(secret = %secret_name, waited = ?start.elapsed(), "token secret populated");
            Ok(payload)
        }
        None => Err(Error::token_timeout(
            secret_name,
            namespace,
            settings.max_wait.as_secs(),
        )),
    }
}

/// A service-account-token secret annotated for `user`
fn is_bound_token_secret(secret: &Secret, user: &str) -> bool {
    let typed = secret.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN_TYPE);
    let bound = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SERVICE_ACCOUNT_NAME_ANNOTATION))
        .is_some_and(|sa| sa == user);
    typed && bound
}

/// JSON patch adding `secret_name` to a ServiceAccount's `secrets` list.
///
/// Appends when the list exists, otherwise creates it.
fn secrets_patch(secret_name: &str, list_exists: bool) -> json_patch::Patch {
    let reference = serde_json::json!({ "name": secret_name });
    let op = if list_exists {
        AddOperation {
            path: PointerBuf::from_tokens(["secrets", "-"]),
            value: reference,
        }
    } else {
        AddOperation {
            path: PointerBuf::from_tokens(["secrets"]),
            value: serde_json::Value::Array(vec![reference]),
        }
    };
    json_patch::Patch(vec![PatchOperation::Add(op)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockClusterGateway;
    use k8s_openapi::api::core::v1::{ObjectReference, ServiceAccount};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn api_error(code: u16, reason: &str) -> Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_string(),
            reason: reason.to_string(),
            code,
        })
        .into()
    }

    fn token_secret(name: &str, user: &str, token: Option<&str>) -> Secret {
        let mut data = BTreeMap::new();
        if let Some(token) = token {
            data.insert(TOKEN_KEY.to_string(), ByteString(token.as_bytes().to_vec()));
            data.insert(CA_CERT_KEY.to_string(), ByteString(b"CA-PEM".to_vec()));
        }
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kube-system".to_string()),
                annotations: Some(BTreeMap::from([(
                    SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
                    user.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    fn service_account(refs: Option<Vec<&str>>) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some("alice".to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            secrets: refs.map(|names| {
                names
                    .into_iter()
                    .map(|n| ObjectReference {
                        name: Some(n.to_string()),
                        ..Default::default()
                    })
                    .collect()
            }),
            ..Default::default()
        }
    }

    fn request() -> TokenRequest<'static> {
        TokenRequest {
            user: "alice",
            namespace: "kube-system",
            explicit_secret: None,
            owner: None,
        }
    }

    fn fast_settings() -> TokenSettings {
        TokenSettings {
            max_wait: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }

    // =========================================================================
    // Explicit secret
    // =========================================================================

    /// Story: An explicitly referenced secret is read once, never polled
    #[tokio::test]
    async fn story_explicit_secret_is_returned_without_waiting() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_secret()
            .withf(|name, ns| name == "shared-token" && ns == "kube-system")
            .times(1)
            .returning(|_, _| Ok(Some(token_secret("shared-token", "someone-else", Some("tok")))));
        gw.expect_get_service_account().never();
        gw.expect_create_secret().never();

        let req = TokenRequest {
            explicit_secret: Some("shared-token"),
            ..request()
        };
        let payload = ensure_token(&gw, &ManifestRenderer::new(), &req, &fast_settings())
            .await
            .expect("explicit secret should be used");

        assert_eq!(payload.secret_name, "shared-token");
        assert_eq!(payload.token, "tok");
        assert_eq!(payload.ca_crt.as_deref(), Some(b"CA-PEM".as_slice()));
    }

    #[tokio::test]
    async fn explicit_secret_missing_is_permanent() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_secret().returning(|_, _| Ok(None));

        let req = TokenRequest {
            explicit_secret: Some("missing"),
            ..request()
        };
        let err = ensure_token(&gw, &ManifestRenderer::new(), &req, &fast_settings())
            .await
            .expect_err("missing explicit secret must fail");
        assert!(matches!(err, Error::TokenSecret { .. }));
        assert!(!err.is_retryable());
    }

    // =========================================================================
    // Discovery of referenced secrets
    // =========================================================================

    /// Story: A populated, bound secret already referenced by the SA is reused
    #[tokio::test]
    async fn story_existing_bound_secret_is_reused() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(Some(vec!["alice-token-x7k2p"])))));
        gw.expect_get_secret()
            .withf(|name, _| name == "alice-token-x7k2p")
            .times(1)
            .returning(|n, _| Ok(Some(token_secret(n, "alice", Some("legacy-token")))));
        gw.expect_create_secret().never();
        gw.expect_patch_service_account().never();

        let payload = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect("reference should be reused");
        assert_eq!(payload.secret_name, "alice-token-x7k2p");
        assert_eq!(payload.token, "legacy-token");
    }

    /// Story: Unusable references are skipped and a fresh secret is synthesized
    #[tokio::test]
    async fn story_unqualified_references_fall_through_to_creation() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account().returning(|_, _| {
            Ok(Some(service_account(Some(vec![
                "dockercfg",
                "bob-token",
                "empty-token",
                "unreadable",
            ]))))
        });
        gw.expect_get_secret().returning(|name, _| match name {
            "dockercfg" => {
                let mut s = token_secret("dockercfg", "alice", Some("x"));
                s.type_ = Some("kubernetes.io/dockercfg".to_string());
                Ok(Some(s))
            }
            "bob-token" => Ok(Some(token_secret("bob-token", "bob", Some("x")))),
            "empty-token" => Ok(Some(token_secret("empty-token", "alice", None))),
            "unreadable" => Err(api_error(403, "Forbidden")),
            "alice-token" => Ok(Some(token_secret("alice-token", "alice", Some("fresh")))),
            other => panic!("unexpected secret read: {other}"),
        });
        gw.expect_create_secret()
            .withf(|ns, s| ns == "kube-system" && s.metadata.name.as_deref() == Some("alice-token"))
            .times(1)
            .returning(|_, _| Ok(()));
        gw.expect_patch_service_account()
            .withf(|name, _, patch| {
                name == "alice"
                    && serde_json::to_value(patch).unwrap()
                        == serde_json::json!([
                            {"op": "add", "path": "/secrets/-", "value": {"name": "alice-token"}}
                        ])
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let payload = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect("should synthesize a new secret");
        assert_eq!(payload.secret_name, "alice-token");
        assert_eq!(payload.token, "fresh");
    }

    // =========================================================================
    // Synthesis and polling
    // =========================================================================

    /// Story: On 1.24+ the SA has no secrets; we create one, bind it, and wait
    #[tokio::test(start_paused = true)]
    async fn story_created_secret_is_bound_and_polled_until_populated() {
        let reads = Arc::new(AtomicU32::new(0));
        let counter = reads.clone();

        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(None))));
        gw.expect_create_secret()
            .withf(|_, s| {
                s.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN_TYPE)
                    && s.metadata.owner_references.as_ref().map(|o| o.len()) == Some(1)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        gw.expect_patch_service_account()
            .withf(|_, _, patch| {
                serde_json::to_value(patch).unwrap()
                    == serde_json::json!([
                        {"op": "add", "path": "/secrets", "value": [{"name": "alice-token"}]}
                    ])
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        gw.expect_get_secret().returning(move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let token = if n >= 2 { Some("populated") } else { None };
            Ok(Some(token_secret("alice-token", "alice", token)))
        });

        let req = TokenRequest {
            owner: Some(OwnerReference {
                api_version: "osip.cc/v1".to_string(),
                kind: "LensUser".to_string(),
                name: "alice".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }),
            ..request()
        };
        let start = tokio::time::Instant::now();
        let payload = ensure_token(&gw, &ManifestRenderer::new(), &req, &fast_settings())
            .await
            .expect("token should arrive");

        assert_eq!(payload.token, "populated");
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    /// Story: A secret left over from a previous attempt is adopted, not recreated
    #[tokio::test]
    async fn story_already_existing_secret_is_success() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(Some(vec!["alice-token"])))));
        let reads = Arc::new(AtomicU32::new(0));
        let counter = reads.clone();
        // First read is the reference scan (not yet populated), second is the poll.
        gw.expect_get_secret().returning(move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let token = if n >= 1 { Some("tok") } else { None };
            Ok(Some(token_secret("alice-token", "alice", token)))
        });
        gw.expect_create_secret()
            .times(1)
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));
        gw.expect_patch_service_account().never();

        let payload = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect("already-exists must be tolerated");
        assert_eq!(payload.token, "tok");
    }

    /// Story: The token controller never answers; we give up inside the bound
    #[tokio::test(start_paused = true)]
    async fn story_token_wait_times_out_within_bound() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(None))));
        gw.expect_create_secret().returning(|_, _| Ok(()));
        gw.expect_patch_service_account().returning(|_, _, _| Ok(()));
        gw.expect_get_secret()
            .returning(|_, _| Ok(Some(token_secret("alice-token", "alice", None))));

        let settings = fast_settings();
        let start = tokio::time::Instant::now();
        let err = ensure_token(&gw, &ManifestRenderer::new(), &request(), &settings)
            .await
            .expect_err("must time out");

        assert!(matches!(err, Error::TokenTimeout { waited_secs: 30, .. }));
        assert!(!err.is_retryable());
        assert!(start.elapsed() >= settings.max_wait);
        assert!(start.elapsed() <= settings.max_wait + settings.poll_interval);
    }

    /// Story: An API outage during the wait is retried later, not reported as a timeout
    #[tokio::test(start_paused = true)]
    async fn story_unavailable_api_during_wait_stays_retryable() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(None))));
        gw.expect_create_secret().returning(|_, _| Ok(()));
        gw.expect_patch_service_account().returning(|_, _, _| Ok(()));
        gw.expect_get_secret()
            .times(1)
            .returning(|_, _| Err(api_error(503, "ServiceUnavailable")));

        let start = tokio::time::Instant::now();
        let err = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect_err("read failure must surface");

        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.is_retryable());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_read_during_wait_is_not_a_timeout() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(None))));
        gw.expect_create_secret().returning(|_, _| Ok(()));
        gw.expect_patch_service_account().returning(|_, _, _| Ok(()));
        gw.expect_get_secret()
            .times(1)
            .returning(|_, _| Err(api_error(403, "Forbidden")));

        let start = tokio::time::Instant::now();
        let err = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect_err("forbidden must surface");

        assert!(!matches!(err, Error::TokenTimeout { .. }));
        assert!(!err.is_retryable());
        assert!(start.elapsed() < fast_settings().max_wait);
    }

    #[tokio::test]
    async fn non_utf8_referenced_secret_is_skipped() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(Some(vec!["alice-token-old"])))));
        gw.expect_get_secret().returning(|name, _| match name {
            "alice-token-old" => {
                let mut s = token_secret("alice-token-old", "alice", None);
                s.data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(TOKEN_KEY.to_string(), ByteString(vec![0xff, 0xfe]));
                Ok(Some(s))
            }
            _ => Ok(Some(token_secret("alice-token", "alice", Some("fresh")))),
        });
        gw.expect_create_secret().times(1).returning(|_, _| Ok(()));
        gw.expect_patch_service_account().times(1).returning(|_, _, _| Ok(()));

        let payload = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect("garbled reference is skipped");
        assert_eq!(payload.secret_name, "alice-token");
        assert_eq!(payload.token, "fresh");
    }

    #[tokio::test]
    async fn create_failure_other_than_conflict_propagates() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(None))));
        gw.expect_create_secret()
            .returning(|_, _| Err(api_error(403, "Forbidden")));

        let err = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect_err("forbidden must propagate");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_service_account_is_retryable() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account().returning(|_, _| Ok(None));

        let err = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect_err("no service account");
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_secret_reference_patch_is_not_fatal() {
        let mut gw = MockClusterGateway::new();
        gw.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(None))));
        gw.expect_create_secret().returning(|_, _| Ok(()));
        gw.expect_patch_service_account()
            .returning(|_, _, _| Err(api_error(422, "Invalid")));
        gw.expect_get_secret()
            .returning(|_, _| Ok(Some(token_secret("alice-token", "alice", Some("tok")))));

        let payload = ensure_token(&gw, &ManifestRenderer::new(), &request(), &fast_settings())
            .await
            .expect("patch failure is only logged");
        assert_eq!(payload.token, "tok");
    }

    #[test]
    fn bound_secret_requires_type_and_annotation() {
        assert!(is_bound_token_secret(&token_secret("s", "alice", None), "alice"));
        assert!(!is_bound_token_secret(&token_secret("s", "bob", None), "alice"));

        let mut untyped = token_secret("s", "alice", None);
        untyped.type_ = Some("Opaque".to_string());
        assert!(!is_bound_token_secret(&untyped, "alice"));
    }

    #[test]
    fn payload_rejects_non_utf8_token() {
        let mut secret = token_secret("s", "alice", None);
        secret
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(TOKEN_KEY.to_string(), ByteString(vec![0xff, 0xfe]));
        assert!(TokenPayload::from_secret(&secret).is_err());
    }
}
