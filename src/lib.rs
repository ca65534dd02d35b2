//! # Meshmon - Monitoring Coordinator for MeshCore Networks
//!
//! Meshmon is a daemon that watches a MeshCore LoRa mesh through a companion
//! radio: it polls tracked repeaters and clients for status and telemetry on
//! independent schedules, keeps a merged registry of the radio's contacts and
//! nodes heard only via advertisement, and attaches radio-layer signal data
//! (SNR, RSSI, path) to channel messages by decrypting the raw RX log.
//!
//! ## Features
//!
//! - **Per-node scheduling**: each tracked node is polled on its own interval
//!   with random jitter, exponential backoff on failure, and an auto-disable
//!   circuit breaker for nodes that stay unreachable.
//! - **Airtime budget**: a shared token bucket caps the rate of requests the
//!   monitor puts on the mesh, whatever the number of tracked nodes.
//! - **Contact registry**: the radio's own contact table merged with
//!   advertisement-discovered nodes, persisted with bounded LRU eviction.
//! - **RX-log correlation**: channel traffic decrypted from the raw packet
//!   log and matched to delivered messages within a short TTL window.
//! - **Repeater recovery**: automatic login and routing-path reset for
//!   repeaters that stop answering.
//! - **Operator commands**: a literal-only call syntax (`send_advert(True)`)
//!   for one-shot radio actions, with no expression evaluation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshmon::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("radio at {}:{}", config.radio.host, config.radio.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`coordinator`] - tick loop, per-node scheduler, rate limiter, registry,
//!   RX-log correlator
//! - [`meshcore`] - companion-radio types, event dispatch, frame codec,
//!   TCP transport and command API
//! - [`commands`] - operator command parsing and execution
//! - [`storage`] - persisted discovered-contact store
//! - [`config`] - configuration management and validation

pub mod commands;
pub mod config;
pub mod coordinator;
pub mod logutil;
pub mod meshcore;
pub mod metrics;
pub mod storage;
