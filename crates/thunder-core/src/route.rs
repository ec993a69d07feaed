//! Routes handed to [`crate::manager::ChannelManager::send_payment`].
//!
//! Built by `thunder-routing`'s router or by hand.

use crate::features::{ChannelFeatures, NodeFeatures};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

/// One hop of a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Node at the end of this hop
    pub pubkey: PublicKey,
    /// That node's features
    pub node_features: NodeFeatures,
    /// Channel used to reach it
    pub short_channel_id: u64,
    /// The channel's features
    pub channel_features: ChannelFeatures,
    /// Fee this hop's node charges for forwarding; for the last hop, the
    /// amount delivered
    pub fee_msat: u64,
    /// CLTV delta this hop's node requires; for the last hop, the final CLTV
    pub cltv_expiry_delta: u32,
}

/// One or more paths to the payee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Each path ends at the payee
    pub paths: Vec<Vec<RouteHop>>,
}

impl Route {
    /// Total delivered to the payee across all paths
    #[must_use]
    pub fn total_amount_msat(&self) -> u64 {
        self.paths
            .iter()
            .filter_map(|path| path.last())
            .map(|hop| hop.fee_msat)
            .sum()
    }

    /// Total fees across all paths
    #[must_use]
    pub fn total_fees_msat(&self) -> u64 {
        self.paths
            .iter()
            .map(|path| path.iter().rev().skip(1).map(|hop| hop.fee_msat).sum::<u64>())
            .sum()
    }
}

/// Fee policy of a channel direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingFees {
    /// Flat fee
    pub base_msat: u32,
    /// Proportional fee in millionths
    pub proportional_millionths: u32,
}

impl RoutingFees {
    /// Fee for forwarding `amount_msat`, `None` on overflow
    #[must_use]
    pub fn fee_for(&self, amount_msat: u64) -> Option<u64> {
        let proportional = amount_msat.checked_mul(u64::from(self.proportional_millionths))? / 1_000_000;
        proportional.checked_add(u64::from(self.base_msat))
    }
}

/// A private channel into the payee, from an invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHint {
    /// Node at the far end of the hint channel
    pub src_node_id: PublicKey,
    /// The hint channel
    pub short_channel_id: u64,
    /// Its fee policy
    pub fees: RoutingFees,
    /// Its CLTV delta
    pub cltv_expiry_delta: u16,
    /// Its minimum HTLC
    pub htlc_minimum_msat: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn hop(byte: u8, fee_msat: u64) -> RouteHop {
        let secp = Secp256k1::signing_only();
        RouteHop {
            pubkey: PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap()),
            node_features: NodeFeatures::known(),
            short_channel_id: u64::from(byte),
            channel_features: ChannelFeatures::empty(),
            fee_msat,
            cltv_expiry_delta: 40,
        }
    }

    #[test]
    fn test_route_totals() {
        let route = Route {
            paths: vec![
                vec![hop(1, 100), hop(2, 50), hop(3, 10_000)],
                vec![hop(4, 5_000)],
            ],
        };
        assert_eq!(route.total_amount_msat(), 15_000);
        assert_eq!(route.total_fees_msat(), 150);
    }

    #[test]
    fn test_fee_for() {
        let fees = RoutingFees {
            base_msat: 1000,
            proportional_millionths: 100,
        };
        assert_eq!(fees.fee_for(1_000_000), Some(1100));
        assert_eq!(fees.fee_for(u64::MAX), None);
    }
}
