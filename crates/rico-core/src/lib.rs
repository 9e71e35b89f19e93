//! Transport boundary for Ricochet.
//!
//! The correlation layers in `rico-client` and `rico-server` never touch the
//! QUIC implementation directly; they consume the narrow [`StreamLink`]
//! interface defined here. This crate provides the event union delivered
//! across that boundary, an in-process channel-backed link pair for tests,
//! and the quinn-backed adapter used over real networks.

pub mod event;
pub mod link;
pub mod quic;

pub use event::{CloseReason, LinkEvent, StreamId};
pub use link::{memory_link_pair, ChannelLink, LinkError, LinkHandle, StreamLink, MESSAGE_MAX};
pub use quic::{
    connect, server_endpoint, LinkRole, PeerVerification, QuicConnectConfig, QuicLink,
    QuicSetupError,
};
