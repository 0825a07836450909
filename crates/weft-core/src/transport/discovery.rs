//! Discovery bridge: DHT lookup/announce plus relay registration.
//!
//! A private network with a pending invitation looks the other party up
//! by masked user id; every other network announces its network id. The
//! bridge also keeps TCP relays announcing hosted network ids on our
//! behalf.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ConnectionManager, EndPoint};
use crate::crypto::{MaskedUserId, NetworkId};
use crate::error::Result;
use crate::logging::ShortId;

/// DHT lookup and announce facade.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Find endpoints of the peer whose masked user id is `target`.
    async fn find_peers(&self, target: &MaskedUserId, local_only: bool) -> Result<Vec<EndPoint>>;

    /// Announce `network_id` as reachable on `service_port` and return
    /// other participants' endpoints.
    async fn announce(
        &self,
        network_id: &NetworkId,
        local_only: bool,
        service_port: u16,
    ) -> Result<Vec<EndPoint>>;
}

/// Couples the DHT facade with relay registration.
pub struct DiscoveryBridge {
    dht: Arc<dyn Dht>,
    connections: Arc<dyn ConnectionManager>,
}

impl DiscoveryBridge {
    /// Create a bridge over the given facades.
    pub fn new(dht: Arc<dyn Dht>, connections: Arc<dyn ConnectionManager>) -> Self {
        Self { dht, connections }
    }

    /// Look a peer up by masked user id. Lookup failures are logged and
    /// reported as an empty endpoint list; the search timer retries.
    pub async fn search_masked(&self, target: &MaskedUserId, local_only: bool) -> Vec<EndPoint> {
        match self.dht.find_peers(target, local_only).await {
            Ok(endpoints) => {
                debug!(found = endpoints.len(), "masked peer lookup");
                endpoints
            }
            Err(e) => {
                warn!(error = %e, "masked peer lookup failed");
                Vec::new()
            }
        }
    }

    /// Announce a network id and keep relays announcing it too.
    pub async fn announce_network(&self, network_id: &NetworkId, local_only: bool) -> Vec<EndPoint> {
        if let Err(e) = self.connections.register_hosted_network(network_id).await {
            warn!(network = %ShortId(network_id.as_bytes()), error = %e, "relay registration failed");
        }

        match self
            .dht
            .announce(network_id, local_only, self.connections.local_port())
            .await
        {
            Ok(endpoints) => {
                debug!(
                    network = %ShortId(network_id.as_bytes()),
                    found = endpoints.len(),
                    "network announce"
                );
                endpoints
            }
            Err(e) => {
                warn!(network = %ShortId(network_id.as_bytes()), error = %e, "network announce failed");
                Vec::new()
            }
        }
    }

    /// Stop relays announcing a deleted network.
    pub async fn retire_network(&self, network_id: &NetworkId) {
        if let Err(e) = self.connections.unregister_hosted_network(network_id).await {
            warn!(network = %ShortId(network_id.as_bytes()), error = %e, "relay unregistration failed");
        }
    }
}
