//! Marker bit layout and payload validation.
//!
//! A marker is an 8x8 grid of cells. The outer ring is black; the inner 6x6
//! data area has white at its top-left corner cell and black at the other
//! three corners, which fixes the orientation. The remaining 32 data cells
//! hold the 16-bit identity followed by its CRC-16/CCITT-FALSE, row-major,
//! most significant bit first, white = 1. Printed markers need a white quiet
//! zone of at least one cell around the grid.

use crate::error::DetectionError;

/// Cells per side, including the black border.
pub const GRID_CELLS: usize = 8;

/// Cell grid, `true` = white, indexed `[row][col]`.
pub type CellGrid = [[bool; GRID_CELLS]; GRID_CELLS];

const ORIENTATION_CELLS: [(usize, usize, bool); 4] =
    [(1, 1, true), (1, 6, false), (6, 1, false), (6, 6, false)];

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection).
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn is_border(row: usize, col: usize) -> bool {
    row == 0 || col == 0 || row == GRID_CELLS - 1 || col == GRID_CELLS - 1
}

fn is_orientation(row: usize, col: usize) -> bool {
    ORIENTATION_CELLS
        .iter()
        .any(|&(r, c, _)| r == row && c == col)
}

/// Data-area cells that carry payload bits, in bit order.
fn payload_cells() -> impl Iterator<Item = (usize, usize)> {
    (1..GRID_CELLS - 1)
        .flat_map(|r| (1..GRID_CELLS - 1).map(move |c| (r, c)))
        .filter(|&(r, c)| !is_orientation(r, c))
}

/// Encodes identities to cell grids and validates sampled grids.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerCodec;

impl MarkerCodec {
    pub fn new() -> Self {
        Self
    }

    fn payload(id: u16) -> u32 {
        let crc = crc16_ccitt(&id.to_be_bytes());
        ((id as u32) << 16) | crc as u32
    }

    /// Cell pattern of marker `id` in canonical orientation.
    pub fn cells(&self, id: u16) -> CellGrid {
        let mut grid = [[false; GRID_CELLS]; GRID_CELLS];
        for &(r, c, white) in &ORIENTATION_CELLS {
            grid[r][c] = white;
        }
        let payload = Self::payload(id);
        for (bit, (r, c)) in payload_cells().enumerate() {
            grid[r][c] = (payload >> (31 - bit)) & 1 == 1;
        }
        grid
    }

    /// Whether the orientation cells match the canonical layout.
    pub fn orientation_matches(&self, grid: &CellGrid) -> bool {
        ORIENTATION_CELLS
            .iter()
            .all(|&(r, c, white)| grid[r][c] == white)
    }

    /// Validate a grid sampled in canonical orientation and extract the id.
    pub fn decode(&self, grid: &CellGrid) -> Result<u16, DetectionError> {
        let border_ok = (0..GRID_CELLS)
            .flat_map(|r| (0..GRID_CELLS).map(move |c| (r, c)))
            .filter(|&(r, c)| is_border(r, c))
            .all(|(r, c)| !grid[r][c]);
        if !border_ok {
            return Err(DetectionError::MalformedPayload("border is not dark"));
        }
        if !self.orientation_matches(grid) {
            return Err(DetectionError::MalformedPayload("orientation cells do not match"));
        }
        let mut payload: u32 = 0;
        for (r, c) in payload_cells() {
            payload = (payload << 1) | grid[r][c] as u32;
        }
        let id = (payload >> 16) as u16;
        let crc = (payload & 0xFFFF) as u16;
        if crc16_ccitt(&id.to_be_bytes()) != crc {
            return Err(DetectionError::MalformedPayload("checksum mismatch"));
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_payload_cell_count() {
        assert_eq!(payload_cells().count(), 32);
    }

    #[test]
    fn test_cells_decode_to_id() {
        let codec = MarkerCodec::new();
        for id in [0u16, 1, 42, 1000, u16::MAX] {
            assert_eq!(codec.decode(&codec.cells(id)).unwrap(), id);
        }
    }

    #[test]
    fn test_single_bit_flip_rejected() {
        let codec = MarkerCodec::new();
        let mut grid = codec.cells(7);
        grid[3][3] = !grid[3][3];
        assert!(matches!(codec.decode(&grid), Err(DetectionError::MalformedPayload(_))));
    }

    #[test]
    fn test_rotated_grid_fails_orientation() {
        let codec = MarkerCodec::new();
        let grid = codec.cells(99);
        let mut rotated = [[false; GRID_CELLS]; GRID_CELLS];
        for r in 0..GRID_CELLS {
            for c in 0..GRID_CELLS {
                rotated[c][GRID_CELLS - 1 - r] = grid[r][c];
            }
        }
        assert!(!codec.orientation_matches(&rotated));
        assert_eq!(
            codec.decode(&rotated).unwrap_err(),
            DetectionError::MalformedPayload("orientation cells do not match")
        );
    }

    #[test]
    fn test_light_border_rejected() {
        let codec = MarkerCodec::new();
        let mut grid = codec.cells(5);
        grid[0][4] = true;
        assert_eq!(
            codec.decode(&grid).unwrap_err(),
            DetectionError::MalformedPayload("border is not dark")
        );
    }
}
