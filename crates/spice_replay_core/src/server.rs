//! Protocol server contract.
//!
//! The replay core never implements the SPICE protocol itself; it configures
//! a server through [`ProtocolServer`], hands it the display device, and
//! listens for channel events.

use std::sync::Arc;

use crate::device::{DisplayDevice, MemSlot};
use crate::error::Result;

/// Image compression policy requested from the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ImageCompression {
    Off,
    Quic,
    Glz,
    Lz,
    AutoLz,
    #[default]
    AutoGlz,
}

/// Client authentication mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    NoAuth,
    Ticket,
}

/// Channel lifecycle events reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Initialized,
    Disconnected,
}

/// Kind of channel an event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelType {
    Main,
    Display,
    Inputs,
    Cursor,
    Playback,
    Record,
}

/// Receives channel events from the server's event loop.
pub trait ChannelEventHandler: Send + Sync {
    fn on_channel_event(&self, event: ChannelEvent, channel: ChannelType);
}

/// Server-side handle passed to [`DisplayDevice::attach`].
pub trait DeviceWorker: Send + Sync {
    /// Register a guest memory slot.
    fn add_memslot(&self, slot: MemSlot);

    /// Start the virtual machine clock.
    fn start_vm(&self);

    /// Ask the server to poll the device for commands again.
    fn wakeup(&self);
}

/// A protocol server that can drive a display device.
pub trait ProtocolServer: Send + Sync {
    fn set_compression_policy(&mut self, policy: ImageCompression);

    fn set_listen_port(&mut self, port: u16);

    fn set_auth_mode(&mut self, mode: AuthMode);

    /// Start the server's event loop; channel events go to `events`.
    fn init(&mut self, events: Arc<dyn ChannelEventHandler>) -> Result<()>;

    /// Register the display device. The server attaches it when ready.
    fn add_device(&mut self, device: Arc<dyn DisplayDevice>) -> Result<()>;

    fn start_vm(&mut self);

    /// Stop serving and release the device.
    fn shutdown(&mut self);
}
