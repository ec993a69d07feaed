//! Per-node and per-channel policy knobs.
//!
//! All structs deserialize with every field optional, so a TOML file only
//! needs to name the values it changes.

use serde::{Deserialize, Serialize};

/// Parameters we send when opening or accepting a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelHandshakeConfig {
    /// Confirmations we require before the channel is usable (inbound only)
    pub minimum_depth: u32,
    /// Blocks the counterparty must wait to claim their own funds after a
    /// unilateral close
    pub our_to_self_delay: u16,
    /// Smallest HTLC we accept
    pub our_htlc_minimum_msat: u64,
}

impl Default for ChannelHandshakeConfig {
    fn default() -> Self {
        Self {
            minimum_depth: 6,
            our_to_self_delay: 144,
            our_htlc_minimum_msat: 1,
        }
    }
}

/// Limits on what a counterparty may ask of us when opening a channel.
///
/// `open_channel` / `accept_channel` violating any of these is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelHandshakeLimits {
    /// Minimum channel size for inbound channels
    pub min_funding_satoshis: u64,
    /// Maximum `htlc_minimum_msat` the counterparty may set
    pub max_htlc_minimum_msat: u64,
    /// Minimum `max_htlc_value_in_flight_msat` the counterparty may set
    pub min_max_htlc_value_in_flight_msat: u64,
    /// Maximum reserve the counterparty may require of us
    pub max_channel_reserve_satoshis: u64,
    /// Minimum `max_accepted_htlcs` the counterparty may set
    pub min_max_accepted_htlcs: u16,
    /// Lowest acceptable dust limit
    pub min_dust_limit_satoshis: u64,
    /// Highest acceptable dust limit
    pub max_dust_limit_satoshis: u64,
    /// Highest `minimum_depth` the acceptor may demand
    pub max_minimum_depth: u32,
    /// Refuse channels whose announce flag differs from our preference
    pub force_announced_channel_preference: bool,
    /// Highest `to_self_delay` the counterparty may impose on us
    pub their_to_self_delay: u16,
}

impl Default for ChannelHandshakeLimits {
    fn default() -> Self {
        Self {
            min_funding_satoshis: 0,
            max_htlc_minimum_msat: u64::MAX,
            min_max_htlc_value_in_flight_msat: 0,
            max_channel_reserve_satoshis: u64::MAX,
            min_max_accepted_htlcs: 0,
            min_dust_limit_satoshis: 546,
            max_dust_limit_satoshis: u64::MAX,
            max_minimum_depth: 144,
            force_announced_channel_preference: true,
            their_to_self_delay: 2016,
        }
    }
}

/// Options that may change over a channel's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Proportional fee charged for forwarding, in millionths
    pub fee_proportional_millionths: u32,
    /// Announce the channel to the network
    pub announced_channel: bool,
    /// Commit to a shutdown script in `open_channel` / `accept_channel`
    pub commit_upfront_shutdown_pubkey: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            fee_proportional_millionths: 0,
            announced_channel: false,
            commit_upfront_shutdown_pubkey: true,
        }
    }
}

/// Top-level node policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// What we propose
    pub own_channel_config: ChannelHandshakeConfig,
    /// What we accept
    pub peer_channel_config_limits: ChannelHandshakeLimits,
    /// Per-channel options
    pub channel_options: ChannelConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = UserConfig::default();
        assert_eq!(config.own_channel_config.minimum_depth, 6);
        assert_eq!(config.own_channel_config.our_to_self_delay, 144);
        assert_eq!(config.peer_channel_config_limits.min_dust_limit_satoshis, 546);
        assert_eq!(config.peer_channel_config_limits.their_to_self_delay, 2016);
        assert!(config.channel_options.commit_upfront_shutdown_pubkey);
        assert!(!config.channel_options.announced_channel);
    }
}
