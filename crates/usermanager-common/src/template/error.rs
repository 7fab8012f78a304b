//! Template error types

use std::fmt;

/// Errors that can occur while rendering a manifest template
#[derive(Debug)]
pub enum TemplateError {
    /// Template rendering failed (syntax error or undefined variable)
    Render {
        /// Template name
        template: String,
        /// Underlying minijinja error
        source: minijinja::Error,
    },
    /// Rendered text is not a valid manifest of the expected type
    Parse {
        /// Template name
        template: String,
        /// Parser message
        message: String,
    },
}

impl TemplateError {
    /// Create a render error for a template
    pub fn render(template: &str, source: minijinja::Error) -> Self {
        Self::Render {
            template: template.to_string(),
            source,
        }
    }

    /// Create a parse error for a template
    pub fn parse(template: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            template: template.to_string(),
            message: message.into(),
        }
    }

    /// Name of the template that failed
    pub fn template(&self) -> &str {
        match self {
            Self::Render { template, .. } | Self::Parse { template, .. } => template,
        }
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render { template, source } => {
                write!(f, "template '{}' render error: {}", template, source)
            }
            Self::Parse { template, message } => {
                write!(f, "template '{}' produced invalid manifest: {}", template, message)
            }
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Render { source, .. } => Some(source),
            Self::Parse { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = TemplateError::parse("service-account", "expected mapping");
        assert!(err.to_string().contains("service-account"));
        assert!(err.to_string().contains("expected mapping"));
        assert_eq!(err.template(), "service-account");
    }
}
