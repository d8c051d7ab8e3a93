//! Bring-up engine for Realtek Bluetooth controllers on a three-wire UART.
//!
//! The crate resets the controller over the three-wire (H5) link protocol,
//! downloads a vendor firmware patch, switches the line to its operating
//! speed and then supervises the resulting links for silent degradation.
//!
//! # Layers
//!
//! 1. [`transport`]: raw byte I/O to the UART.
//! 2. [`frame`] and [`framer`]: framing, checksums, sequencing and acks.
//! 3. [`hci`]: one-at-a-time HCI command/event exchange.
//! 4. [`firmware`] and [`speed`]: vendor download and baud negotiation.
//! 5. [`supervisor`]: periodic link-quality monitoring.
//!
//! [`bringup::bring_up`] drives layers 1-4 for one attempt; restarting after a
//! failure or a [`SupervisorAction`] is the caller's decision.

pub mod bringup;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod config;
pub mod errors;
pub mod firmware;
pub mod frame;
pub mod framer;
pub mod hci;
pub mod logging;
pub mod speed;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bringup::{bring_up, bring_up_on, Adapter};
pub use config::{BringupConfig, Settings, SupervisorConfig, VendorProfile};
pub use errors::*;
pub use firmware::{ConfigBlob, FirmwareImage, FirmwareLoader, Progress};
pub use frame::{Frame, FrameType};
pub use framer::{CancelToken, Framer, FramerConfig, LinkSession, LinkState};
pub use hci::{CommandEngine, CommandTimeouts, EventPayload, LocalVersion, PendingCommand};
pub use speed::SpeedNegotiator;
pub use supervisor::{
    ActiveLink, BdAddr, ConnectionRecord, ControllerProbe, HciProbe, LinkKind, LivenessCheck,
    RecordState, Supervisor, SupervisorAction, SupervisorStats,
};
pub use transport::{ByteStream, SerialTransport};
