use anyhow::{ensure, Result};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ColorDepth {
    Eight,
    Sixteen,
}

impl ColorDepth {
    pub fn color_count(self) -> usize {
        match self {
            ColorDepth::Eight => 8,
            ColorDepth::Sixteen => 16,
        }
    }

    pub fn max_index(self) -> u8 {
        match self {
            ColorDepth::Eight => 7,
            ColorDepth::Sixteen => 15,
        }
    }

    // One 8x8 tile: 3 bit planes (24 bytes) or 4 bit planes (32 bytes).
    pub fn tile_bytes(self) -> usize {
        match self {
            ColorDepth::Eight => 24,
            ColorDepth::Sixteen => 32,
        }
    }

    fn planes(self) -> usize {
        match self {
            ColorDepth::Eight => 3,
            ColorDepth::Sixteen => 4,
        }
    }
}

// 8x8 matrix of palette indices, row-major.
pub type TilePixels = [[u8; 8]; 8];

fn byte_popcount(bytes: &[u8]) -> u32 {
    bytes.iter().map(|b| b.count_ones()).sum()
}

fn pixel_popcount(pixels: &TilePixels) -> u32 {
    pixels.iter().flatten().map(|p| (*p as u32).count_ones()).sum()
}

// Offsets of the plane bytes for pixel row `y`. The first two planes are
// interleaved word-wise; the third plane is packed at +16 for 3bpp tiles,
// while 4bpp tiles interleave the third and fourth planes at +16.
fn plane_offsets(y: usize, depth: ColorDepth) -> [usize; 4] {
    match depth {
        ColorDepth::Eight => [y * 2, y * 2 + 1, y + 16, 0],
        ColorDepth::Sixteen => [y * 2, y * 2 + 1, y * 2 + 16, y * 2 + 17],
    }
}

pub fn decode_tile(bytes: &[u8], depth: ColorDepth) -> Result<TilePixels> {
    ensure!(
        bytes.len() == depth.tile_bytes(),
        "planar tile has {} bytes, expected {}",
        bytes.len(),
        depth.tile_bytes()
    );
    let mut pixels: TilePixels = [[0; 8]; 8];
    for y in 0..8 {
        let offsets = plane_offsets(y, depth);
        for j in 0..8 {
            let mut pixel = 0u8;
            for (k, &offset) in offsets[..depth.planes()].iter().enumerate() {
                pixel |= ((bytes[offset] >> j) & 1) << k;
            }
            pixels[y][7 - j] = pixel;
        }
    }
    ensure!(
        byte_popcount(bytes) == pixel_popcount(&pixels),
        "planar tile decode changed its bit count"
    );
    Ok(pixels)
}

pub fn encode_tile(pixels: &TilePixels, depth: ColorDepth) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; depth.tile_bytes()];
    for (y, row) in pixels.iter().enumerate() {
        let offsets = plane_offsets(y, depth);
        for (x, &pixel) in row.iter().enumerate() {
            ensure!(
                pixel <= depth.max_index(),
                "pixel index {} does not fit a {}-color tile",
                pixel,
                depth.color_count()
            );
            let j = 7 - x;
            for (k, &offset) in offsets[..depth.planes()].iter().enumerate() {
                bytes[offset] |= ((pixel >> k) & 1) << j;
            }
        }
    }
    ensure!(
        byte_popcount(&bytes) == pixel_popcount(pixels),
        "planar tile encode changed its bit count"
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tile(depth: ColorDepth) -> TilePixels {
        let mut pixels: TilePixels = [[0; 8]; 8];
        for y in 0..8 {
            for x in 0..8 {
                pixels[y][x] = ((y * 3 + x * 5) as u8) & depth.max_index();
            }
        }
        pixels
    }

    #[test]
    fn round_trip_8color() {
        let pixels = sample_tile(ColorDepth::Eight);
        let bytes = encode_tile(&pixels, ColorDepth::Eight).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(decode_tile(&bytes, ColorDepth::Eight).unwrap(), pixels);
    }

    #[test]
    fn round_trip_16color() {
        let pixels = sample_tile(ColorDepth::Sixteen);
        let bytes = encode_tile(&pixels, ColorDepth::Sixteen).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(decode_tile(&bytes, ColorDepth::Sixteen).unwrap(), pixels);
    }

    #[test]
    fn known_vector_decodes_high_bit_first() {
        // Plane 0 of row 0 set to 0x80: only the leftmost pixel gets bit 0.
        let mut bytes = vec![0u8; 24];
        bytes[0] = 0x80;
        let pixels = decode_tile(&bytes, ColorDepth::Eight).unwrap();
        assert_eq!(pixels[0][0], 1);
        assert_eq!(pixels[0][1..], [0; 7]);

        // Third plane of row 2 set to 0x01: rightmost pixel gets bit 2.
        let mut bytes = vec![0u8; 24];
        bytes[2 + 16] = 0x01;
        let pixels = decode_tile(&bytes, ColorDepth::Eight).unwrap();
        assert_eq!(pixels[2][7], 4);
    }

    #[test]
    fn fourth_plane_is_interleaved() {
        let mut pixels: TilePixels = [[0; 8]; 8];
        pixels[7][0] = 8;
        let bytes = encode_tile(&pixels, ColorDepth::Sixteen).unwrap();
        assert_eq!(bytes[7 * 2 + 17], 0x80);
        assert_eq!(byte_popcount(&bytes), 1);
    }

    #[test]
    fn encode_rejects_out_of_range_index() {
        let mut pixels: TilePixels = [[0; 8]; 8];
        pixels[0][0] = 8;
        assert!(encode_tile(&pixels, ColorDepth::Eight).is_err());
        pixels[0][0] = 16;
        assert!(encode_tile(&pixels, ColorDepth::Sixteen).is_err());
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(decode_tile(&[0; 24], ColorDepth::Sixteen).is_err());
        assert!(decode_tile(&[0; 32], ColorDepth::Eight).is_err());
    }
}
