/*
[INPUT]:  Desired channel set and socket availability
[OUTPUT]: Size-capped subscribe/unsubscribe traffic and tracked state
[POS]:    Subscription layer - module root
[UPDATE]: When adding subscription features
*/

pub mod batch;
pub mod channel;
pub mod defaults;
pub mod manager;

pub use batch::{Batch, batch_requests};
pub use channel::Subscription;
pub use defaults::{DefaultChannels, generate_default_subscriptions};
pub use manager::SubscriptionManager;
