//! Draw commands addressed to the projector output surface.

use crate::geometry::Pixel;

/// A shape for the presentation layer to draw, in projector pixels.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    /// A fiducial marker, axis-aligned and centred at `center`.
    Marker { id: u16, center: Pixel, size: f64 },
    /// A ring highlighting a tracked piece.
    Ring {
        center: Pixel,
        radius: f64,
        /// Heading of the piece, radians.
        rotation: f64,
    },
}

/// Overlay update for one tracked marker.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCommand {
    DrawOverlay { marker_id: u16, shape: DrawCommand },
    ClearOverlay { marker_id: u16 },
}

impl RenderCommand {
    pub fn marker_id(&self) -> u16 {
        match self {
            RenderCommand::DrawOverlay { marker_id, .. } => *marker_id,
            RenderCommand::ClearOverlay { marker_id } => *marker_id,
        }
    }
}

/// All overlay commands produced by one tracking cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderBatch {
    pub cycle: u64,
    pub commands: Vec<RenderCommand>,
}

impl RenderBatch {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            commands: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn draws(&self) -> impl Iterator<Item = &RenderCommand> {
        self.commands
            .iter()
            .filter(|c| matches!(c, RenderCommand::DrawOverlay { .. }))
    }

    pub fn clears(&self) -> impl Iterator<Item = &RenderCommand> {
        self.commands
            .iter()
            .filter(|c| matches!(c, RenderCommand::ClearOverlay { .. }))
    }

    /// Fold an unconsumed older batch into this one. Clears for markers
    /// this batch does not mention are kept so no overlay is left behind.
    pub fn absorb(&mut self, older: RenderBatch) {
        for command in older.commands {
            if let RenderCommand::ClearOverlay { marker_id } = command {
                if !self.commands.iter().any(|c| c.marker_id() == marker_id) {
                    self.commands.push(command);
                }
            }
        }
    }
}
