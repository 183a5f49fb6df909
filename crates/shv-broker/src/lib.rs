//! SHV RPC broker.
//!
//! A multi-peer switch: authenticates peers, mounts devices onto a shared
//! path tree, routes requests by mount prefix, fans signals out to
//! subscribers and transparently relays subscriptions to mounted
//! sub-brokers.

mod broker;
mod config;
mod node;
mod peer;
mod state;

pub use broker::RpcBroker;
pub use config::{AutosetupRule, BrokerConfig, BrokerRole, BrokerUser, ConnectConfig};
