use async_trait::async_trait;
use tracing::debug;

use crate::chain::{ChainStage, Next};
use crate::core::{CallContext, MeshError, MeshResult};
use crate::protocols::{Connection, Mechanism, NetworkServiceRequest};

/// Chooses the data-plane mechanism at a terminal endpoint.
///
/// The first requester preference whose type the endpoint supports wins. A
/// re-request keeps the mechanism chosen earlier while it is still supported.
#[derive(Debug, Default)]
pub struct SelectMechanismStage {
    /// Supported mechanism types; empty accepts any.
    supported: Vec<String>,
}

impl SelectMechanismStage {
    pub fn new(supported: Vec<String>) -> Self {
        Self { supported }
    }

    fn accepts(&self, mechanism: &Mechanism) -> bool {
        self.supported.is_empty()
            || self
                .supported
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&mechanism.mechanism_type))
    }
}

#[async_trait]
impl ChainStage for SelectMechanismStage {
    async fn request(
        &self,
        ctx: &mut CallContext,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> MeshResult<Connection> {
        let current = request
            .connection
            .mechanism
            .as_ref()
            .filter(|m| self.accepts(m))
            .cloned();

        let chosen = match current {
            Some(mechanism) => Some(mechanism),
            None => {
                let preferred = request
                    .mechanism_preferences
                    .iter()
                    .find(|m| self.accepts(m))
                    .cloned();
                if preferred.is_none() && !request.mechanism_preferences.is_empty() {
                    return Err(MeshError::NoSupportedMechanism {
                        network_service: request.connection.network_service.clone(),
                    });
                }
                preferred
            }
        };

        if let Some(mechanism) = &chosen {
            debug!(cls = %mechanism.cls, mechanism = %mechanism.mechanism_type, "Selected mechanism");
        }
        request.connection.mechanism = chosen;
        next.request(ctx, request).await
    }

    async fn close(
        &self,
        ctx: &mut CallContext,
        connection: Connection,
        next: Next<'_>,
    ) -> MeshResult<()> {
        next.close(ctx, connection).await
    }

    fn name(&self) -> &'static str {
        "select_mechanism"
    }
}
