//! Error types for the user manager
//!
//! Every variant carries enough context (user name, object name) to be
//! actionable from a log line or a status condition. The controller's
//! error policy only looks at [`Error::is_retryable`].

use thiserror::Error;

use crate::template::TemplateError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for user manager operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid LensUser spec
    #[error("validation error for {user}: {message}")]
    Validation {
        /// Name of the LensUser with invalid configuration
        user: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.roles")
        field: Option<String>,
    },

    /// Token secret never received a token
    #[error("token for {namespace}/{secret} not populated after {waited_secs}s")]
    TokenTimeout {
        /// Token secret that was polled
        secret: String,
        /// Namespace of the secret
        namespace: String,
        /// How long we waited
        waited_secs: u64,
    },

    /// Token secret exists but is unusable
    #[error("token secret {namespace}/{secret} unusable: {message}")]
    TokenSecret {
        /// Token secret name
        secret: String,
        /// Namespace of the secret
        namespace: String,
        /// What is wrong with it
        message: String,
    },

    /// Cluster endpoint or CA cannot be determined
    #[error("cluster endpoint error for {user}: {message}")]
    Endpoint {
        /// Name of the LensUser being published
        user: String,
        /// Description of what's missing
        message: String,
    },

    /// Manifest template failed to render or parse
    #[error("template error [{template}]: {message}")]
    Template {
        /// Template name
        template: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "token", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with user context
    pub fn validation_for(user: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            user: user.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with user context and field path
    pub fn validation_for_field(
        user: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            user: user.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a token timeout error
    pub fn token_timeout(
        secret: impl Into<String>,
        namespace: impl Into<String>,
        waited_secs: u64,
    ) -> Self {
        Self::TokenTimeout {
            secret: secret.into(),
            namespace: namespace.into(),
            waited_secs,
        }
    }

    /// Create an unusable token secret error
    pub fn token_secret(
        secret: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::TokenSecret {
            secret: secret.into(),
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create an endpoint error for a user
    pub fn endpoint(user: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Endpoint {
            user: user.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Spec problems, token timeouts and template failures need a spec change
    /// (or operator attention) and are permanent. Kubernetes errors are
    /// permanent for 4xx responses except conflicts and throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => !(400..500).contains(&ae.code) || matches!(ae.code, 409 | 429),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::TokenTimeout { .. } => false,
            Error::TokenSecret { .. } => false,
            Error::Endpoint { .. } => false,
            Error::Template { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when a create hit an existing object (409)
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the user name if this error is associated with a specific LensUser
    pub fn user(&self) -> Option<&str> {
        match self {
            Error::Validation { user, .. } => Some(user),
            Error::Endpoint { user, .. } => Some(user),
            _ => None,
        }
    }

    /// Short machine-readable reason, used for status conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::Validation { .. } => "ValidationFailed",
            Error::TokenTimeout { .. } => "TokenTimeout",
            Error::TokenSecret { .. } => "TokenSecretInvalid",
            Error::Endpoint { .. } => "EndpointUnresolved",
            Error::Template { .. } => "TemplateFailed",
            Error::Serialization { .. } => "SerializationFailed",
            Error::Internal { .. } => "InternalError",
        }
    }
}

impl From<TemplateError> for Error {
    fn from(err: TemplateError) -> Self {
        Self::Template {
            template: err.template().to_string(),
            message: err.to_string(),
        }
    }
}

/// Build a `kube::Error::Api` with the given status code, for tests
#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    })
}
