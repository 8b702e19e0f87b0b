//! Provider capability contract and selection.
//!
//! A [`ProviderExecutor`] transforms the unified request shape into its
//! backend's wire format and lifts the reply back out. Provider choice is
//! orthogonal to the tool-loop algorithm: an explicit `model.provider`
//! override wins, else a URL heuristic picks among the registered
//! executors.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use thiserror::Error;

use crate::{error::ErrorDetails, value::ModelDescriptor};

use super::request::{AiRequest, AiResponse};

/// Errors from LM providers.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP or network request failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Provider rate-limited the request (HTTP 429 equivalent).
    #[error("rate limited")]
    RateLimited,

    /// Provider-side failure (HTTP 5xx equivalent).
    #[error("server error: status {0}")]
    ServerError(u16),

    /// Authentication/authorization failed.
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// Could not parse the provider's response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ProviderError {
    /// Whether retrying this request might succeed: rate limits, server
    /// failures, and transport errors are retryable; auth and parse
    /// failures are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited | Self::RequestFailed(_) => true,
            Self::ServerError(status) => *status >= 500,
            _ => false,
        }
    }

    /// Class-name tag preserved on errored values.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::RequestFailed(_) => "RequestFailed",
            Self::RateLimited => "RateLimited",
            Self::ServerError(_) => "ServerError",
            Self::AuthFailed(_) => "AuthFailed",
            Self::InvalidResponse(_) => "InvalidResponse",
            Self::Other(_) => "ProviderError",
        }
    }
}

/// LM provider interface. Object-safe so the driver can hold a registry of
/// `Arc<dyn ProviderExecutor>`.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    async fn execute(&self, request: &AiRequest) -> Result<AiResponse, ProviderError>;
}

/// Which executor family a model routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    AnthropicLike,
    GoogleLike,
    Default,
}

/// Selects the provider family for a model: explicit `provider` override
/// first, then the URL heuristic, then the default.
#[must_use]
pub fn provider_kind(model: &ModelDescriptor) -> ProviderKind {
    if let Some(explicit) = &model.provider {
        let lower = explicit.to_ascii_lowercase();
        if lower.contains("anthropic") || lower.contains("claude") {
            return ProviderKind::AnthropicLike;
        }
        if lower.contains("google") || lower.contains("gemini") {
            return ProviderKind::GoogleLike;
        }
        return ProviderKind::Default;
    }
    if let Some(url) = &model.url {
        let lower = url.to_ascii_lowercase();
        if lower.contains("anthropic") {
            return ProviderKind::AnthropicLike;
        }
        if lower.contains("googleapis") || lower.contains("google") {
            return ProviderKind::GoogleLike;
        }
    }
    ProviderKind::Default
}

/// Registry of provider executors keyed by family, with `Default` as the
/// fallback.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    executors: AHashMap<ProviderKind, Arc<dyn ProviderExecutor>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the default executor, used when no family matches.
    #[must_use]
    pub fn with_default(mut self, executor: Arc<dyn ProviderExecutor>) -> Self {
        self.executors.insert(ProviderKind::Default, executor);
        self
    }

    #[must_use]
    pub fn with_executor(mut self, kind: ProviderKind, executor: Arc<dyn ProviderExecutor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    /// Resolves the executor for a model.
    pub fn select(&self, model: &ModelDescriptor) -> Result<Arc<dyn ProviderExecutor>, ErrorDetails> {
        let kind = provider_kind(model);
        self.executors
            .get(&kind)
            .or_else(|| self.executors.get(&ProviderKind::Default))
            .cloned()
            .ok_or_else(|| ErrorDetails::ai_error(format!("no provider registered for model '{}'", model.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(provider: Option<&str>, url: Option<&str>) -> ModelDescriptor {
        ModelDescriptor {
            name: "m".into(),
            api_key: "k".into(),
            url: url.map(ToOwned::to_owned),
            provider: provider.map(ToOwned::to_owned),
            tools: Vec::new(),
            thinking_level: None,
            server_tools: Vec::new(),
        }
    }

    #[test]
    fn explicit_provider_overrides_url() {
        let m = model(Some("anthropic"), Some("https://googleapis.example"));
        assert_eq!(provider_kind(&m), ProviderKind::AnthropicLike);
    }

    #[test]
    fn url_heuristic_applies_without_override() {
        assert_eq!(
            provider_kind(&model(None, Some("https://api.anthropic.com/v1"))),
            ProviderKind::AnthropicLike
        );
        assert_eq!(
            provider_kind(&model(None, Some("https://generativelanguage.googleapis.com"))),
            ProviderKind::GoogleLike
        );
        assert_eq!(provider_kind(&model(None, Some("https://example.com"))), ProviderKind::Default);
        assert_eq!(provider_kind(&model(None, None)), ProviderKind::Default);
    }

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::ServerError(503).is_retryable());
        assert!(ProviderError::RequestFailed("timeout".into()).is_retryable());
        assert!(!ProviderError::ServerError(404).is_retryable());
        assert!(!ProviderError::AuthFailed("bad key".into()).is_retryable());
        assert!(!ProviderError::InvalidResponse("bad json".into()).is_retryable());
    }
}
