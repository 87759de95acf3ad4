/*
[INPUT]:  Enabled instruments, enabled asset classes, auth availability
[OUTPUT]: Ordered default subscription list
[POS]:    Subscription layer - default channel generation
[UPDATE]: When the default channel set changes
*/

use tracing::warn;

use super::channel::Subscription;
use crate::types::{AssetClass, Instrument};

/// Channels subscribed by default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultChannels {
    /// Per enabled instrument
    pub public: Vec<String>,
    /// Once per account, authenticated only
    pub account: Vec<String>,
    /// Once per enabled asset class, authenticated only
    pub per_asset: Vec<String>,
}

impl Default for DefaultChannels {
    fn default() -> Self {
        Self {
            public: vec!["tickers".into(), "trades".into(), "books".into()],
            account: vec!["account".into()],
            per_asset: vec!["orders".into()],
        }
    }
}

/// Pure function of its inputs; the result is truncated to `max` with a warning.
///
/// Order: for each enabled asset, each public channel over that asset's
/// instruments; then account channels; then per-asset channels.
pub fn generate_default_subscriptions(
    instruments: &[Instrument],
    enabled_assets: &[AssetClass],
    authenticated: bool,
    channels: &DefaultChannels,
    max: Option<usize>,
) -> Vec<Subscription> {
    let mut subs = Vec::new();

    for asset in enabled_assets {
        for channel in &channels.public {
            subs.extend(
                instruments
                    .iter()
                    .filter(|instrument| instrument.asset == *asset)
                    .map(|instrument| Subscription::for_instrument(channel.as_str(), instrument)),
            );
        }
    }

    if authenticated {
        for channel in &channels.account {
            let mut sub = Subscription::for_channel(channel.as_str());
            sub.authenticated = true;
            subs.push(sub);
        }
        for asset in enabled_assets {
            for channel in &channels.per_asset {
                let mut sub = Subscription::for_asset(channel.as_str(), *asset);
                sub.authenticated = true;
                subs.push(sub);
            }
        }
    }

    if let Some(max) = max
        && subs.len() > max
    {
        warn!(generated = subs.len(), max, "default subscriptions exceed venue cap, truncating");
        subs.truncate(max);
    }
    subs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruments() -> Vec<Instrument> {
        vec![
            Instrument::new("BTC-USDT", AssetClass::Spot),
            Instrument::new("ETH-USDT", AssetClass::Spot),
            Instrument::new("BTC-USDT-SWAP", AssetClass::PerpetualSwap),
        ]
    }

    #[test]
    fn test_public_only() {
        let subs = generate_default_subscriptions(
            &instruments(),
            &[AssetClass::Spot],
            false,
            &DefaultChannels::default(),
            None,
        );
        assert_eq!(subs.len(), 6);
        assert!(subs.iter().all(|sub| !sub.authenticated));
        assert_eq!(subs[0].channel, "tickers");
        assert_eq!(subs[0].symbol.as_deref(), Some("BTC-USDT"));
        assert_eq!(subs[5].channel, "books");
    }

    #[test]
    fn test_authenticated_adds_private_channels() {
        let subs = generate_default_subscriptions(
            &instruments(),
            &[AssetClass::Spot, AssetClass::PerpetualSwap],
            true,
            &DefaultChannels::default(),
            None,
        );
        // 3 public channels x 3 instruments + account + orders per asset
        assert_eq!(subs.len(), 9 + 1 + 2);
        let private: Vec<_> = subs.iter().filter(|sub| sub.authenticated).collect();
        assert_eq!(private[0].channel, "account");
        assert_eq!(private[2].asset, Some(AssetClass::PerpetualSwap));
    }

    #[test]
    fn test_truncated_to_cap() {
        let subs = generate_default_subscriptions(
            &instruments(),
            &[AssetClass::Spot],
            true,
            &DefaultChannels::default(),
            Some(4),
        );
        assert_eq!(subs.len(), 4);
    }

    #[test]
    fn test_deterministic() {
        let a = generate_default_subscriptions(&instruments(), &[AssetClass::Spot], true, &DefaultChannels::default(), None);
        let b = generate_default_subscriptions(&instruments(), &[AssetClass::Spot], true, &DefaultChannels::default(), None);
        assert_eq!(a, b);
    }
}
