//! Rust client for the Atlas AZM4/AZM8 third-party control protocol
//!
//! This library provides an async API for controlling Atlas Sound AZM4 and
//! AZM8 audio processors over their JSON-RPC 2.0 interface. It supports:
//!
//! - Reading, setting and bumping parameters (`val`, `str` and `pct` formats)
//! - Parameter subscriptions pushed over the TCP control channel
//! - Meter subscriptions pushed over the UDP meter channel
//! - Automatic reconnection with exponential backoff
//! - Subscription replay after every reconnect
//! - Keep-alives ahead of the device's inactivity timeout
//! - A last-known-value cache for every parameter seen
//!
//! # Quick Start
//!
//! ```no_run
//! use atlas_azm::{AzmClient, ClientConfig, FormatTag};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AzmClient::start(ClientConfig::new("192.168.1.50")).await?;
//!     client.wait_ready().await?;
//!
//!     // Control a zone
//!     client.set("ZoneGain_0", FormatTag::Val, -20.0).await?;
//!     client.set("ZoneMute_0", FormatTag::Val, false).await?;
//!     let name = client.get("ZoneName_0", FormatTag::Str).await?;
//!     println!("Zone 0 is {}", name);
//!
//!     // Follow a meter
//!     let mut meter = client.subscribe_meter("SourceMeter_0", FormatTag::Val)?;
//!     while let Ok(update) = meter.recv().await {
//!         println!("{} = {}", update.param, update.value);
//!         break; // Just show one update
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: Public handle, requests and subscriptions
//! - **Supervisor**: Connection state machine owning all mutable state
//! - **Dispatcher**: Routes frames to the cache, subscribers and pending requests
//! - **Transport**: TCP control link and UDP meter listener
//! - **Codec / Protocol**: Newline-delimited JSON-RPC framing and messages
//! - **Types**: Domain types and data structures

mod backoff;
mod cache;
mod client;
mod codec;
mod config;
mod dispatcher;
mod error;
mod keepalive;
mod outbox;
mod pending;
mod protocol;
mod registry;
mod subscription;
mod supervisor;
mod transport;
mod types;

// Public exports
pub use cache::{CacheEntry, ParameterCache};
pub use client::AzmClient;
pub use codec::{AzmCodec, MAX_LINE_LENGTH};
pub use config::{ClientConfig, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
pub use error::{AzmError, Result};
pub use protocol::{decode_message, Message, Method, Params, Request};
pub use subscription::Subscription;
pub use types::{
    ConnectionState, DeviceError, FormatTag, ParamEntry, ParameterName, ParameterUpdate,
    ParameterValue, SubscriptionHandle,
};
