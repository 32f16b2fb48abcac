//! Host event subscriber.

use std::sync::Weak;

use crate::host::{HostEvent, HostListener};
use crate::lifecycle::controller::Shared;

/// Keeps the registry in step with the host's session layer while
/// interception is begun.
pub(crate) struct SupportListener {
    shared: Weak<Shared>,
}

impl SupportListener {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }
}

impl HostListener for SupportListener {
    fn on_event(&self, event: &HostEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let engine = &shared.engine;

        match event {
            HostEvent::Login { identity, address } => {
                if engine.registry.bind_pending(*address, *identity).is_none() {
                    tracing::debug!(identity = %identity, address = %address, "Login without a pending connection");
                }
            }
            HostEvent::Join { identity, session } => {
                if let Err(e) =
                    engine
                        .registry
                        .attach_session(identity, session.clone(), engine.adapter.as_ref())
                {
                    tracing::debug!(identity = %identity, error = %e, "Join for an unavailable connection");
                }
            }
            HostEvent::Quit { identity } => {
                if engine.registry.unbind(identity).is_some() {
                    tracing::debug!(identity = %identity, "Identity unbound");
                }
            }
            HostEvent::Shutdown => {
                tracing::info!("Host shutting down, closing interception");
                shared.close();
            }
        }
    }
}
