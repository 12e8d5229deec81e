//! Per-request context.
//!
//! Every engine operation receives a `RequestContext` naming the
//! authenticated tenant and actor. The context is scoped to one call chain;
//! nothing tenant-specific lives in process-wide state. The correlation id is
//! attached to every audit entry a workflow run records.

use serde::{Deserialize, Serialize};

/// Identity and tracing information for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Tenant the request is executing for.
    pub tenant_id: String,
    /// Authenticated actor (user or service principal).
    pub actor_id: String,
    /// Correlation id propagated into audit entries.
    pub correlation_id: String,
}

impl RequestContext {
    /// Create a context with a freshly generated correlation id.
    pub fn new(tenant_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Create a context carrying a caller-supplied correlation id.
    pub fn with_correlation(
        tenant_id: impl Into<String>,
        actor_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
            correlation_id: correlation_id.into(),
        }
    }
}
