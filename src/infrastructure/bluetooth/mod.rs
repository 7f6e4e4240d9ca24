//! Bluetooth Module
//!
//! Provides the BLE session with a RoboRoach stimulation backpack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              SessionService / SessionHandle              │
//! │  (Session task - public API for the application)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │
//! │           │  │            │  │          │
//! │ - Adverts │  │ - States   │  │ - UUIDs  │
//! │ - Filter  │  │ - Op queue │  │ - Frames │
//! │           │  │ - Timeouts │  │ - Bounds │
//! └───────────┘  └─────┬──────┘  └──────────┘
//!                      │
//!                      ▼
//!               ┌────────────┐
//!               │    Link    │
//!               │ (platform  │
//!               │ or simulated)
//!               └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, frame layout and the stimulation codec
//! - [`link`] - The `DeviceLink` trait and its event channel
//! - [`scanner`] - Advertisement filtering
//! - [`connection`] - Connection state machine and operation queue
//! - [`service`] - Session task and its handle
//! - [`simulated`] - In-process backpack used by tests and the demo binary

pub mod connection;
pub mod link;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;

pub use connection::ConnectionConfig;
pub use link::{link_channel, DeviceLink, LinkEvent};
pub use service::{SessionHandle, SessionService, SessionSnapshot};
pub use simulated::SimulatedDevice;
