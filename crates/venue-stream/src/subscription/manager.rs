/*
[INPUT]:  Desired subscriptions, available sockets, auth availability
[OUTPUT]: Batched subscribe/unsubscribe frames and tracked channel state
[POS]:    Subscription layer - desired-state manager
[UPDATE]: When changing subscription lifecycle or limits
*/

use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::batch::batch_requests;
use super::channel::Subscription;
use crate::error::{Result, StreamError};
use crate::types::{ConnectionKind, Instrument, SubscriptionState};
use crate::ws::{FrameSender, Links, Multiplexer, OutboundRequest, RequestCriteria};

const KINDS: [ConnectionKind; 2] = [ConnectionKind::Public, ConnectionKind::Authenticated];

/// Tracks the desired channel set and keeps the venue in step with it.
///
/// State lives behind a short-lived lock that is never held across a
/// send; entries are marked after each batch leaves the socket. Flushes
/// run one at a time so a Pending entry is never sent twice.
#[derive(Debug)]
pub struct SubscriptionManager {
    entries: Mutex<IndexMap<Subscription, SubscriptionState>>,
    flush_lock: tokio::sync::Mutex<()>,
    auth_channels: HashSet<String>,
    max_message_bytes: usize,
    max_subscriptions: Option<usize>,
}

impl SubscriptionManager {
    pub fn new(
        auth_channels: HashSet<String>,
        max_message_bytes: usize,
        max_subscriptions: Option<usize>,
    ) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            auth_channels,
            max_message_bytes,
            max_subscriptions,
        }
    }

    fn normalize(&self, mut sub: Subscription) -> Subscription {
        sub.authenticated = self.auth_channels.contains(&sub.channel);
        sub
    }

    pub fn state(&self, sub: &Subscription) -> Option<SubscriptionState> {
        let sub = self.normalize(sub.clone());
        self.entries.lock().get(&sub).copied()
    }

    pub fn subscriptions(&self) -> Vec<(Subscription, SubscriptionState)> {
        self.entries
            .lock()
            .iter()
            .map(|(sub, state)| (sub.clone(), *state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Add entries and send whatever can be sent right now.
    ///
    /// Duplicates of Pending/Active entries are skipped. Authenticated
    /// entries stay Pending while login is unavailable and go out on the
    /// next [`flush`](Self::flush).
    pub async fn subscribe(&self, links: &Links, subs: Vec<Subscription>) -> Result<()> {
        {
            let mut entries = self.entries.lock();
            let mut fresh: Vec<Subscription> = Vec::new();
            for sub in subs {
                let sub = self.normalize(sub);
                let tracked = matches!(
                    entries.get(&sub),
                    Some(SubscriptionState::Pending | SubscriptionState::Active)
                );
                if tracked || fresh.contains(&sub) {
                    debug!(channel = %sub.channel, symbol = ?sub.symbol, "already subscribed, skipping");
                    continue;
                }
                fresh.push(sub);
            }

            if let Some(max) = self.max_subscriptions {
                for kind in KINDS {
                    let current = entries
                        .iter()
                        .filter(|(sub, state)| {
                            sub.kind() == kind && **state != SubscriptionState::Removing
                        })
                        .count();
                    let incoming = fresh.iter().filter(|sub| sub.kind() == kind).count();
                    if incoming > 0 && current + incoming > max {
                        return Err(StreamError::SubscriptionLimit {
                            current,
                            incoming,
                            max,
                        });
                    }
                }
            }

            for sub in fresh {
                entries.insert(sub, SubscriptionState::Pending);
            }
        }
        self.flush(links).await
    }

    /// Send every Pending entry whose socket is usable
    pub async fn flush(&self, links: &Links) -> Result<()> {
        let _serial = self.flush_lock.lock().await;
        self.flush_pending(links).await
    }

    async fn flush_pending(&self, links: &Links) -> Result<()> {
        for kind in KINDS {
            let Some(link) = links.get(kind) else {
                continue;
            };
            let pending: Vec<Subscription> = self
                .entries
                .lock()
                .iter()
                .filter(|(sub, state)| sub.kind() == kind && **state == SubscriptionState::Pending)
                .map(|(sub, _)| sub.clone())
                .collect();
            if pending.is_empty() {
                continue;
            }

            let args: Vec<_> = pending.iter().map(Subscription::arg).collect();
            for batch in batch_requests("subscribe", &args, self.max_message_bytes)? {
                let bytes = batch.payload.len();
                link.send(batch.payload).await?;
                let mut entries = self.entries.lock();
                for index in &batch.entries {
                    if let Some(state) = entries.get_mut(&pending[*index])
                        && *state == SubscriptionState::Pending
                    {
                        *state = SubscriptionState::Active;
                    }
                }
                info!(%kind, count = batch.entries.len(), bytes, "ws subscribe batch sent");
            }
        }
        Ok(())
    }

    /// Remove entries; unknown entries are a successful no-op
    pub async fn unsubscribe(&self, links: &Links, subs: Vec<Subscription>) -> Result<()> {
        let removing: Vec<Subscription> = {
            let mut entries = self.entries.lock();
            let mut removing = Vec::new();
            for sub in subs {
                let sub = self.normalize(sub);
                match entries.get(&sub).copied() {
                    None | Some(SubscriptionState::Removing) => {
                        debug!(channel = %sub.channel, symbol = ?sub.symbol, "not subscribed, nothing to remove");
                    }
                    Some(SubscriptionState::Pending) => {
                        entries.shift_remove(&sub);
                    }
                    Some(SubscriptionState::Active) => {
                        entries.insert(sub.clone(), SubscriptionState::Removing);
                        removing.push(sub);
                    }
                }
            }
            removing
        };

        for kind in KINDS {
            let group: Vec<Subscription> = removing
                .iter()
                .filter(|sub| sub.kind() == kind)
                .cloned()
                .collect();
            if group.is_empty() {
                continue;
            }
            let Some(link) = links.get(kind) else {
                // Socket gone: the venue already dropped these streams
                self.forget(group.iter());
                continue;
            };

            let args: Vec<_> = group.iter().map(Subscription::arg).collect();
            for batch in batch_requests("unsubscribe", &args, self.max_message_bytes)? {
                link.send(batch.payload).await?;
                self.forget(batch.entries.iter().map(|index| &group[*index]));
                info!(%kind, count = batch.entries.len(), "ws unsubscribe batch sent");
            }
        }
        Ok(())
    }

    fn forget<'a>(&self, subs: impl Iterator<Item = &'a Subscription>) {
        let mut entries = self.entries.lock();
        for sub in subs {
            if entries.get(sub) == Some(&SubscriptionState::Removing) {
                entries.shift_remove(sub);
            }
        }
    }

    /// Forget in-flight removals and mark everything Pending (socket lost)
    pub fn mark_all_pending(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, state| *state != SubscriptionState::Removing);
        for state in entries.values_mut() {
            *state = SubscriptionState::Pending;
        }
    }

    /// Re-send the full desired set (after reconnect)
    pub async fn resubscribe_all(&self, links: &Links) -> Result<()> {
        let _serial = self.flush_lock.lock().await;
        self.mark_all_pending();
        self.flush_pending(links).await
    }

    /// Re-subscribe one instrument and wait for the venue's ack.
    ///
    /// Used for order book recovery; the fresh subscribe makes the venue
    /// send a new snapshot. The wire stream is identified by channel and
    /// instrument id; the asset only breaks ties between entries sharing it.
    pub async fn resubscribe_one(
        &self,
        mux: &Multiplexer,
        links: &Links,
        channel: &str,
        instrument: &Instrument,
        timeout: Duration,
    ) -> Result<()> {
        let Some(sub) = self.resync_target(channel, instrument) else {
            debug!(channel, symbol = %instrument.symbol, "resubscribe skipped, channel no longer tracked");
            return Ok(());
        };

        let link: &dyn FrameSender = match links.get(sub.kind()) {
            Some(link) => link.as_ref(),
            None if sub.authenticated => return Err(StreamError::NotAuthenticated),
            None => return Err(StreamError::NotConnected),
        };

        self.set_state(&sub, SubscriptionState::Pending);
        let payload = OutboundRequest::new("subscribe", [sub.arg()]).to_text()?;
        let criteria = RequestCriteria::event("subscribe")
            .channel(sub.wire_channel())
            .inst_id(instrument.symbol.clone());
        let reply = mux.request(link, None, criteria, payload, timeout).await?;
        if reply.is_error() {
            return Err(reply.api_error());
        }

        self.set_state(&sub, SubscriptionState::Active);
        info!(channel, symbol = %instrument.symbol, asset = ?sub.asset, "resubscribed after desync");
        Ok(())
    }

    /// Tracked entry behind a (wire channel, instId) stream
    fn resync_target(&self, channel: &str, instrument: &Instrument) -> Option<Subscription> {
        let entries = self.entries.lock();
        let candidates: Vec<&Subscription> = entries
            .iter()
            .filter(|(sub, state)| {
                **state != SubscriptionState::Removing
                    && sub.wire_channel() == channel
                    && sub.symbol.as_deref() == Some(instrument.symbol.as_str())
            })
            .map(|(sub, _)| sub)
            .collect();
        candidates
            .iter()
            .find(|sub| sub.asset == Some(instrument.asset))
            .or_else(|| candidates.first())
            .map(|sub| (*sub).clone())
    }

    fn set_state(&self, sub: &Subscription, state: SubscriptionState) {
        if let Some(current) = self.entries.lock().get_mut(sub) {
            *current = state;
        }
    }

    /// Entries to subscribe and to unsubscribe to reach `desired`
    pub fn channel_difference(&self, desired: &[Subscription]) -> (Vec<Subscription>, Vec<Subscription>) {
        let mut seen = HashSet::new();
        let desired: Vec<Subscription> = desired
            .iter()
            .cloned()
            .map(|sub| self.normalize(sub))
            .filter(|sub| seen.insert(sub.clone()))
            .collect();

        let entries = self.entries.lock();
        let to_subscribe = desired
            .iter()
            .filter(|sub| {
                !matches!(
                    entries.get(*sub),
                    Some(SubscriptionState::Pending | SubscriptionState::Active)
                )
            })
            .cloned()
            .collect();
        let to_unsubscribe = entries
            .iter()
            .filter(|(sub, state)| **state != SubscriptionState::Removing && !seen.contains(*sub))
            .map(|(sub, _)| sub.clone())
            .collect();
        (to_subscribe, to_unsubscribe)
    }
}
