//! Engine wiring.
//!
//! The HSM and the sinks are process-wide services; rather than ambient
//! globals they are threaded through this context, built once at startup by
//! the composition root and shared by every request-scoped task.

use std::sync::Arc;

use crate::anchor::AnchorSink;
use crate::audit::AuditSink;
use crate::authz::AuthorizationProvider;
use crate::hsm::HsmProvider;
use crate::store::DocumentStore;

#[derive(Clone)]
pub struct CoreContext {
    pub store: Arc<dyn DocumentStore>,
    pub hsm: Arc<dyn HsmProvider>,
    pub authz: Arc<dyn AuthorizationProvider>,
    pub audit: Arc<dyn AuditSink>,
    pub anchor: Arc<dyn AnchorSink>,
}

impl CoreContext {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        hsm: Arc<dyn HsmProvider>,
        authz: Arc<dyn AuthorizationProvider>,
        audit: Arc<dyn AuditSink>,
        anchor: Arc<dyn AnchorSink>,
    ) -> Self {
        CoreContext {
            store,
            hsm,
            authz,
            audit,
            anchor,
        }
    }
}
