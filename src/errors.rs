use std::collections::BTreeMap;
use thiserror::Error;

/// Structured context attached to errors surfaced to the UI layer.
/// Keys whose names mention key material are scrubbed on insert.
pub type ErrorContext = BTreeMap<String, String>;

/// Semantic error taxonomy for the trading core. Variants map onto the
/// policy table: transient failures are retried by callers, auth failures
/// disable trading, invariant violations fail closed.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("rate limited by upstream")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("stale data: {0}")]
    StaleData(String),

    #[error("limit violated: {0}")]
    LimitViolated(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Short machine-readable kind, used in log_entries and UI payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Auth { .. } => "auth",
            AgentError::RateLimited { .. } => "rate_limited",
            AgentError::OrderRejected { .. } => "order_rejected",
            AgentError::Api { .. } => "api",
            AgentError::Connection(_) => "connection",
            AgentError::StaleData(_) => "stale_data",
            AgentError::LimitViolated(_) => "limit_violated",
            AgentError::Conflict(_) => "conflict",
            AgentError::Invariant(_) => "invariant",
            AgentError::Config(_) => "config",
        }
    }

    /// HTTP status for the UI-facing error surface.
    pub fn status_code(&self) -> u16 {
        match self {
            AgentError::Auth { .. } => 401,
            AgentError::LimitViolated(_) | AgentError::OrderRejected { .. } => 400,
            AgentError::RateLimited { .. } => 429,
            AgentError::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// Whether the caller should retry with backoff (transient external).
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Connection(_) => true,
            AgentError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// True if a context key must never carry its value into logs or payloads.
fn is_sensitive(key: &str) -> bool {
    let k = key.to_lowercase();
    k.contains("key") || k.contains("secret")
}

/// Insert into an error context, redacting sensitive values.
pub fn context_insert(ctx: &mut ErrorContext, key: &str, value: impl Into<String>) {
    if is_sensitive(key) {
        ctx.insert(key.to_string(), "[redacted]".to_string());
    } else {
        ctx.insert(key.to_string(), value.into());
    }
}

/// Redact sensitive entries from an already-built context map.
pub fn scrub_context(ctx: ErrorContext) -> ErrorContext {
    ctx.into_iter()
        .map(|(k, v)| {
            if is_sensitive(&k) {
                (k, "[redacted]".to_string())
            } else {
                (k, v)
            }
        })
        .collect()
}

/// The shape handed to the UI layer: `{error_kind, message, context}`.
#[derive(Debug, serde::Serialize)]
pub struct ApiFault {
    pub error_kind: &'static str,
    pub message: String,
    pub context: ErrorContext,
}

impl ApiFault {
    pub fn from_error(err: &AgentError, ctx: ErrorContext) -> Self {
        ApiFault {
            error_kind: err.kind(),
            message: err.to_string(),
            context: scrub_context(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AgentError::Auth {
                message: "bad signature".into()
            }
            .status_code(),
            401
        );
        assert_eq!(
            AgentError::RateLimited {
                retry_after_secs: Some(2)
            }
            .status_code(),
            429
        );
        assert_eq!(
            AgentError::LimitViolated("daily loss cap".into()).status_code(),
            400
        );
        assert_eq!(
            AgentError::OrderRejected {
                reason: "insufficient balance".into()
            }
            .status_code(),
            400
        );
        assert_eq!(AgentError::Conflict("already approved".into()).status_code(), 409);
        assert_eq!(AgentError::Connection("reset".into()).status_code(), 500);
        assert_eq!(AgentError::Invariant("probs".into()).status_code(), 500);
    }

    #[test]
    fn test_transient_classification() {
        assert!(AgentError::Connection("timeout".into()).is_transient());
        assert!(AgentError::Api {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!AgentError::Api {
            status: 404,
            message: "missing".into()
        }
        .is_transient());
        assert!(!AgentError::Auth {
            message: "expired".into()
        }
        .is_transient());
    }

    #[test]
    fn test_context_scrubs_key_material() {
        let mut ctx = ErrorContext::new();
        context_insert(&mut ctx, "ticker", "KXHIGHNY-26FEB18-B52");
        context_insert(&mut ctx, "api_key_id", "abc-123");
        context_insert(&mut ctx, "client_secret", "hunter2");
        assert_eq!(ctx["ticker"], "KXHIGHNY-26FEB18-B52");
        assert_eq!(ctx["api_key_id"], "[redacted]");
        assert_eq!(ctx["client_secret"], "[redacted]");
    }

    #[test]
    fn test_scrub_context_after_the_fact() {
        let mut ctx = ErrorContext::new();
        ctx.insert("private_key".into(), "-----BEGIN RSA".into());
        ctx.insert("city".into(), "NYC".into());
        let scrubbed = scrub_context(ctx);
        assert_eq!(scrubbed["private_key"], "[redacted]");
        assert_eq!(scrubbed["city"], "NYC");
    }

    #[test]
    fn test_api_fault_shape() {
        let err = AgentError::OrderRejected {
            reason: "market closed".into(),
        };
        let mut ctx = ErrorContext::new();
        ctx.insert("ticker".into(), "KXHIGHCHI-26FEB18-B40".into());
        let fault = ApiFault::from_error(&err, ctx);
        assert_eq!(fault.error_kind, "order_rejected");
        assert!(fault.message.contains("market closed"));
        let json = serde_json::to_value(&fault).unwrap();
        assert!(json.get("error_kind").is_some());
        assert!(json.get("context").is_some());
    }
}
