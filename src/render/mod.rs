//! Render commands for the projector surface and the overlay channel that
//! carries them to the presentation layer.

mod commands;
mod overlay;

pub use commands::{DrawCommand, RenderBatch, RenderCommand};
pub use overlay::{overlay_channel, OverlayReceiver, OverlaySender};
