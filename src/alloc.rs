use anyhow::{ensure, Result};

use crate::layout::Layout;
use crate::palette::{self, pack_color, ColorRGB};
use crate::rom::{PcAddr, Rom};
use crate::stencil::{SpriteSize, Stencil};
use crate::tile::{encode_tile, ColorDepth, TilePixels};

const POINTER_UNIT: usize = 16;

fn align_up(addr: usize) -> usize {
    addr.next_multiple_of(POINTER_UNIT)
}

// Everything needed to recognize a sprite written earlier in the run and
// point a later, identical sprite at the same bytes.
pub struct WrittenSprite {
    pub size: SpriteSize,
    pub depth: ColorDepth,
    pub stencil: Stencil,
    pub tiles: Vec<TilePixels>,
    pub pointer_bits: u16,
    pub stencil_index: u8,
}

struct StencilRegion {
    name: &'static str,
    next_index: usize,
    cursor: PcAddr,
    limit: PcAddr,
}

struct ClaimedPalette {
    slot: u16,
    colors: Vec<ColorRGB>,
}

// Bump allocator over the four expanded regions. Cursors only move forward;
// identical content is shared instead of re-written.
pub struct SpriteAllocator {
    comp8: StencilRegion,
    comp16: StencilRegion,
    palette_base: PcAddr,
    palette_slots: usize,
    next_palette_slot: usize,
    claimed_palettes: Vec<ClaimedPalette>,
    graphics_base: PcAddr,
    graphics_cursor: PcAddr,
    graphics_limit: PcAddr,
    written: Vec<WrittenSprite>,
}

impl SpriteAllocator {
    // Original table entries keep their indices: the caller copies them into
    // the expanded tables and the allocator continues the sequence after them.
    pub fn new(layout: &Layout) -> Self {
        SpriteAllocator {
            comp8: StencilRegion {
                name: "8-color stencil",
                next_index: layout.comp8_count,
                cursor: layout.new_comp8_table
                    + layout.comp8_count * SpriteSize::Small.stencil_bytes(),
                limit: layout.end_new_comp8_table,
            },
            comp16: StencilRegion {
                name: "16-color stencil",
                next_index: layout.comp16_count,
                cursor: layout.new_comp16_table
                    + layout.comp16_count * SpriteSize::Big.stencil_bytes(),
                limit: layout.end_new_comp16_table,
            },
            palette_base: layout.new_palette_table,
            palette_slots: layout.new_palette_slots,
            next_palette_slot: 0,
            claimed_palettes: Vec::new(),
            graphics_base: layout.new_monster_graphics,
            graphics_cursor: layout.new_monster_graphics,
            graphics_limit: layout.end_new_monster_graphics,
            written: Vec::new(),
        }
    }

    pub fn alloc_stencil(
        &mut self,
        rom: &mut Rom,
        sprite_index: usize,
        stencil: &Stencil,
    ) -> Result<u8> {
        if let Some(w) = self.written.iter().find(|w| &w.stencil == stencil) {
            return Ok(w.stencil_index);
        }
        let region = match stencil.size() {
            SpriteSize::Small => &mut self.comp8,
            SpriteSize::Big => &mut self.comp16,
        };
        let bytes = stencil.to_bytes();
        ensure!(
            region.cursor + bytes.len() <= region.limit,
            "{} table exhausted at sprite {:03X}",
            region.name,
            sprite_index
        );
        ensure!(
            region.next_index <= 0xFF,
            "{} table index overflow at sprite {:03X}",
            region.name,
            sprite_index
        );
        rom.write_n(region.cursor, &bytes)?;
        let index = region.next_index as u8;
        region.next_index += 1;
        region.cursor += bytes.len();
        Ok(index)
    }

    pub fn alloc_palette(
        &mut self,
        rom: &mut Rom,
        sprite_index: usize,
        colors: &[ColorRGB],
    ) -> Result<u16> {
        ensure!(
            colors.len() == 8 || colors.len() == 16,
            "sprite {:03X} palette has {} colors",
            sprite_index,
            colors.len()
        );
        for claimed in &self.claimed_palettes {
            if palette::palettes_match(&claimed.colors, colors) {
                return Ok(claimed.slot);
            }
        }
        // A 16-color palette takes a slot and its paired successor slot.
        let slots_needed = colors.len() / 8;
        let slot = self.next_palette_slot;
        ensure!(
            slot + slots_needed <= self.palette_slots,
            "palette table exhausted at sprite {:03X}",
            sprite_index
        );
        ensure!(
            slot <= 0x3FF,
            "palette index overflow at sprite {:03X}",
            sprite_index
        );
        let mut bytes = Vec::with_capacity(colors.len() * 2);
        for &color in colors {
            let word = pack_color(color);
            bytes.push((word & 0xFF) as u8);
            bytes.push((word >> 8) as u8);
        }
        rom.write_n(self.palette_base + slot * 16, &bytes)?;
        self.next_palette_slot += slots_needed;
        self.claimed_palettes.push(ClaimedPalette {
            slot: slot as u16,
            colors: colors.to_vec(),
        });
        Ok(slot as u16)
    }

    pub fn alloc_sprite_body(
        &mut self,
        rom: &mut Rom,
        sprite_index: usize,
        depth: ColorDepth,
        stencil: &Stencil,
        tiles: &[TilePixels],
    ) -> Result<u16> {
        if let Some(w) = self.written.iter().find(|w| {
            w.size == stencil.size() && w.depth == depth && &w.stencil == stencil && w.tiles == tiles
        }) {
            return Ok(w.pointer_bits);
        }
        let start = align_up(self.graphics_cursor);
        let len = tiles.len() * depth.tile_bytes();
        ensure!(
            start + len <= self.graphics_limit,
            "tile heap exhausted at sprite {:03X} ({} bytes requested)",
            sprite_index,
            len
        );
        let pointer = (start - self.graphics_base) / POINTER_UNIT;
        ensure!(
            pointer <= 0x7FFF,
            "tile pointer for sprite {:03X} does not fit 15 bits",
            sprite_index
        );
        let mut offset = start;
        for tile in tiles {
            let bytes = encode_tile(tile, depth)?;
            rom.write_n(offset, &bytes)?;
            offset += bytes.len();
        }
        self.graphics_cursor = align_up(offset);
        Ok(pointer as u16)
    }

    // Registered sprites become dedup sources for everything after them.
    pub fn record_written(&mut self, written: WrittenSprite) {
        self.written.push(written);
    }

    #[cfg(test)]
    fn graphics_used(&self) -> usize {
        self.graphics_cursor - self.graphics_base
    }
}
