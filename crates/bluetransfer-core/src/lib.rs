//! # BlueTransfer Core Library
//!
//! `bluetransfer-core` is the transfer engine behind BlueTransfer: two peers
//! exchange a file directly over a single TCP connection, with pause, resume
//! and cancel from either side and live throughput reporting.
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`engine`] - The facade used by the presentation layer
//! - [`error`] - Error types
//! - [`mod@file`] - File metadata, hashing and destination paths
//! - [`presenter`] - Callbacks towards the presentation layer
//! - [`protocol`] - Wire protocol implementation
//! - [`transfer`] - State machine, registry and background loops
//!
//! ## Example
//!
//! ```rust,ignore
//! use bluetransfer_core::{ChannelPresenter, Engine, EngineConfig};
//!
//! let (presenter, mut events) = ChannelPresenter::new();
//! let engine = Engine::new(EngineConfig::default(), presenter);
//! engine.launch().await?;
//!
//! let id = engine.initiate_transfer("192.168.1.20".parse()?, "report.pdf").await?;
//! engine.toggle_pause(id).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod engine;
pub mod error;
pub mod file;
pub mod presenter;
pub mod protocol;
pub mod transfer;

use std::time::Duration;

pub use engine::Engine;
pub use error::{Error, Result};
pub use presenter::{ChannelPresenter, Presenter, PresenterEvent};
pub use protocol::TransferId;
pub use transfer::{EngineConfig, TransferDirection, TransferSnapshot, TransferStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TCP port for requests and file data
pub const DEFAULT_PORT: u16 = 15556;

/// Default bytes per DATA message (8 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Default read size while hashing a file (64 KB)
pub const DEFAULT_HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Default telemetry sampling period
pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default wait for the peer to accept or reject a request
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);
