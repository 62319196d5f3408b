//! peercall node: contacts, presence and call signaling between peers that
//! know each other's public keys.

pub mod acceptor;
pub mod address;
pub mod call;
pub mod channel;
pub mod config;
pub mod connector;
pub mod media;
pub mod network;
pub mod notify;
pub mod presence;
pub mod state;
pub mod store;

pub use call::{CallSession, CallState, Direction};
pub use config::NodeConfig;
pub use notify::{NodeEvent, Notifier};
pub use state::{NodeError, NodeState};
pub use store::{Contact, ContactState, Settings, StoreOwner};
