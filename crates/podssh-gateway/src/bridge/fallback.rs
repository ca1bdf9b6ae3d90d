//! Transport fallback
//!
//! A negotiation failure on the preferred transport gets exactly one retry
//! on the alternate one. Anything else propagates unchanged.

use std::sync::Arc;

use async_trait::async_trait;

use podssh_core::config::TransportKind;
use podssh_core::TransportError;

use super::{ExecRequest, ExecSession, ExecTransport};

/// Preferred transport with a single retry on its alternate
pub struct FallbackTransport {
    primary: Arc<dyn ExecTransport>,
    secondary: Arc<dyn ExecTransport>,
}

impl FallbackTransport {
    pub fn new(primary: Arc<dyn ExecTransport>, secondary: Arc<dyn ExecTransport>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl ExecTransport for FallbackTransport {
    fn kind(&self) -> TransportKind {
        self.primary.kind()
    }

    async fn open(&self, request: &ExecRequest) -> Result<ExecSession, TransportError> {
        match self.primary.open(request).await {
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    from = %self.primary.kind(),
                    to = %self.secondary.kind(),
                    pod = %request.pod,
                    namespace = %request.namespace,
                    error = %err,
                    "Exec negotiation failed, falling back"
                );
                self.secondary.open(request).await
            }
            other => other,
        }
    }
}
