//! pacer: bounded-concurrency execution and small reactive primitives for
//! async clients.

mod cell;
mod error;
mod expiring;
mod pubsub;
mod ranges;
mod subscription;
mod version;

pub mod config;
pub mod executor;

pub use cell::ObservableCell;
pub use config::Config;
pub use error::{Error, Result};
pub use executor::{BoundedExecutor, ExecutorStats};
pub use expiring::ExpiringMap;
pub use pubsub::PubSub;
pub use ranges::IndexRangeSet;
pub use subscription::{Subscription, SubscriptionId};
pub use version::PACER_VERSION;
