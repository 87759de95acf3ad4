/*
[INPUT]:  Channel name, instrument or asset class, auxiliary params
[OUTPUT]: Subscription identity and its wire argument
[POS]:    Subscription layer - desired-state entry
[UPDATE]: When the venue changes its subscription argument format
*/

use serde::{Deserialize, Serialize};

use crate::types::{AssetClass, ConnectionKind, Instrument, SubscriptionParams};
use crate::ws::ChannelArg;

/// One desired (channel, instrument) stream.
///
/// Identity is the full struct; `authenticated` is derived from the
/// channel's handler registration by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub channel: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub asset: Option<AssetClass>,
    #[serde(default)]
    pub params: SubscriptionParams,
    #[serde(default)]
    pub authenticated: bool,
}

impl Subscription {
    pub fn for_instrument(channel: impl Into<String>, instrument: &Instrument) -> Self {
        Self {
            channel: channel.into(),
            symbol: Some(instrument.symbol.clone()),
            asset: Some(instrument.asset),
            params: SubscriptionParams::default(),
            authenticated: false,
        }
    }

    /// Asset-wide channel such as private order updates
    pub fn for_asset(channel: impl Into<String>, asset: AssetClass) -> Self {
        Self {
            channel: channel.into(),
            symbol: None,
            asset: Some(asset),
            params: SubscriptionParams::default(),
            authenticated: false,
        }
    }

    pub fn for_channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            symbol: None,
            asset: None,
            params: SubscriptionParams::default(),
            authenticated: false,
        }
    }

    pub fn with_params(mut self, params: SubscriptionParams) -> Self {
        self.params = params;
        self
    }

    pub fn instrument(&self) -> Option<Instrument> {
        Some(Instrument::new(self.symbol.clone()?, self.asset?))
    }

    pub fn kind(&self) -> ConnectionKind {
        if self.authenticated {
            ConnectionKind::Authenticated
        } else {
            ConnectionKind::Public
        }
    }

    /// Channel tag as sent on the wire; candle intervals are suffixed
    pub fn wire_channel(&self) -> String {
        match &self.params.interval {
            Some(interval) if !self.channel.ends_with(interval.as_str()) => {
                format!("{}{}", self.channel, interval)
            }
            _ => self.channel.clone(),
        }
    }

    /// Subscribe/unsubscribe argument.
    ///
    /// Market channels are addressed by `instId`; account channels also
    /// carry `instType` (or `ANY` when no asset is given).
    pub fn arg(&self) -> ChannelArg {
        let inst_type = match (self.authenticated, self.asset, &self.symbol) {
            (true, Some(asset), _) => Some(asset.inst_type().to_string()),
            (true, None, None) if self.channel == "orders" => Some("ANY".to_string()),
            (false, Some(asset), None) => Some(asset.inst_type().to_string()),
            _ => None,
        };
        ChannelArg {
            channel: Some(self.wire_channel()),
            inst_type,
            inst_id: self.symbol.clone(),
        }
    }
}
