use anyhow::{ensure, Context, Result};
use hashbrown::HashMap;
use log::info;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::alloc::{SpriteAllocator, WrittenSprite};
use crate::image_pool::{self, CandidateImage, NormalizedImage, TagConstraints};
use crate::layout::Layout;
use crate::matcher::{ImageMatcher, SlotShape};
use crate::palette::{self, unpack_color, ColorRGB};
use crate::rom::Rom;
use crate::sprite::{self, SpriteRecord, RECORD_BYTES};
use crate::stencil::{SpriteSize, Stencil};
use crate::tile::{decode_tile, ColorDepth, TilePixels};

pub struct MonsterSprite {
    pub index: usize,
    pub record: SpriteRecord,
    pub unseen: bool,
    pub stencil: Stencil,
    pub tiles: Vec<TilePixels>,
    pub palette: Vec<ColorRGB>,
    pub replacement: Option<String>,
}

// One full rewrite run. All mutable state lives here; a fresh Rewriter is
// built per run and the image is saved only after `run` returns Ok.
pub struct Rewriter<'a> {
    pub rom: Rom,
    layout: &'a Layout,
    matcher: ImageMatcher,
    constraints: HashMap<usize, TagConstraints>,
    alloc: SpriteAllocator,
    rng: StdRng,
    seed: u64,
    sprites: Vec<MonsterSprite>,
}

impl<'a> Rewriter<'a> {
    pub fn new(
        mut rom: Rom,
        layout: &'a Layout,
        pool: Vec<CandidateImage>,
        constraints: HashMap<usize, TagConstraints>,
        seed: u64,
    ) -> Self {
        rom.resize(layout.image_size);
        Rewriter {
            rom,
            layout,
            matcher: ImageMatcher::new(pool, seed),
            constraints,
            alloc: SpriteAllocator::new(layout),
            rng: StdRng::seed_from_u64(seed),
            seed,
            sprites: Vec::new(),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        self.read_sprites()?;
        self.relocate_tables()?;
        // Selection and allocation share one shuffled order so the output is
        // reproducible for a given seed.
        let mut order: Vec<usize> = (0..self.layout.sprite_count).collect();
        order.shuffle(&mut self.rng);
        for index in order {
            let keep_original = self.layout.is_protected(index) || self.sprites[index].unseen;
            if !keep_original {
                self.select_replacement(index)?;
            }
            self.allocate_sprite(index)?;
        }
        self.patch_stencil_pointers()?;
        Ok(())
    }

    // Decode every original sprite up front. This validates the source image
    // before anything is overwritten and keeps the pixel data of sprites that
    // will be written back unchanged.
    fn read_sprites(&mut self) -> Result<()> {
        let layout = self.layout;
        for index in 0..layout.sprite_count {
            let record_bytes = self
                .rom
                .read_n(layout.sprite_table + index * RECORD_BYTES, RECORD_BYTES)?;
            let record = SpriteRecord::from_bytes(record_bytes)?;
            let unseen = record.pointer_bits() == 0 && index != 0;
            let size = record.size();
            let depth = record.depth();

            let (table, count) = match size {
                SpriteSize::Small => (layout.comp8_table, layout.comp8_count),
                SpriteSize::Big => (layout.comp16_table, layout.comp16_count),
            };
            let stencil_index = record.stencil_index as usize;
            ensure!(
                stencil_index < count,
                "sprite {:03X}: stencil index {} exceeds the {}-entry table for its size class",
                index,
                stencil_index,
                count
            );
            let stencil_bytes = self.rom.read_n(
                table + stencil_index * size.stencil_bytes(),
                size.stencil_bytes(),
            )?;
            let stencil = Stencil::from_bytes(size, stencil_bytes)?;

            // Original pointers count 8-byte units from the old window.
            let graphics_addr = layout.monster_graphics + record.pointer_bits() as usize * 8;
            let graphics_len = stencil.tile_count() * depth.tile_bytes();
            ensure!(
                graphics_addr + graphics_len <= layout.end_monster_graphics,
                "sprite {:03X}: tile data runs past the graphics window",
                index
            );
            let mut tiles = Vec::with_capacity(stencil.tile_count());
            for i in 0..stencil.tile_count() {
                let bytes = self
                    .rom
                    .read_n(graphics_addr + i * depth.tile_bytes(), depth.tile_bytes())?;
                let tile = decode_tile(bytes, depth)
                    .with_context(|| format!("sprite {:03X}, tile {}", index, i))?;
                tiles.push(tile);
            }

            let palette_index = record.palette_index() as usize;
            let slots_needed = depth.color_count() / 8;
            ensure!(
                palette_index + slots_needed <= layout.palette_count,
                "sprite {:03X}: palette index {} exceeds the {}-slot table",
                index,
                palette_index,
                layout.palette_count
            );
            let mut colors = Vec::with_capacity(depth.color_count());
            for i in 0..depth.color_count() {
                let word = self
                    .rom
                    .read_u16(layout.palette_table + palette_index * 16 + i * 2)?;
                let color = unpack_color(word)
                    .with_context(|| format!("sprite {:03X}, palette color {}", index, i))?;
                colors.push(color);
            }

            self.sprites.push(MonsterSprite {
                index,
                record,
                unseen,
                stencil,
                tiles,
                palette: colors,
                replacement: None,
            });
        }
        Ok(())
    }

    // Copy the original stencil and palette tables into the expanded regions
    // so pre-existing indices keep resolving, then zero the old graphics
    // window. Everything live gets rewritten into the new heap.
    fn relocate_tables(&mut self) -> Result<()> {
        let layout = self.layout;
        let comp8_len = layout.comp8_count * SpriteSize::Small.stencil_bytes();
        ensure!(
            layout.new_comp8_table + comp8_len <= layout.end_new_comp8_table,
            "original 8-color stencil table does not fit its expanded region"
        );
        let comp8 = self.rom.read_n(layout.comp8_table, comp8_len)?.to_vec();
        self.rom.write_n(layout.new_comp8_table, &comp8)?;

        let comp16_len = layout.comp16_count * SpriteSize::Big.stencil_bytes();
        ensure!(
            layout.new_comp16_table + comp16_len <= layout.end_new_comp16_table,
            "original 16-color stencil table does not fit its expanded region"
        );
        let comp16 = self.rom.read_n(layout.comp16_table, comp16_len)?.to_vec();
        self.rom.write_n(layout.new_comp16_table, &comp16)?;

        ensure!(
            layout.palette_count <= layout.new_palette_slots,
            "original palette table does not fit its expanded region"
        );
        let palettes = self
            .rom
            .read_n(layout.palette_table, layout.palette_count * 16)?
            .to_vec();
        self.rom.write_n(layout.new_palette_table, &palettes)?;

        self.rom.fill(
            layout.monster_graphics,
            layout.end_monster_graphics - layout.monster_graphics,
            0,
        )?;
        Ok(())
    }

    // Draw candidates until one encodes, marking every draw as used. Leaving
    // the sprite untouched (no candidate left) is not an error.
    fn select_replacement(&mut self, index: usize) -> Result<()> {
        let stencil = &self.sprites[index].stencil;
        let shape = SlotShape {
            width_tiles: stencil.width_tiles(),
            height_tiles: stencil.height_tiles(),
            max_width_tiles: stencil.max_width_tiles(),
            max_height_tiles: stencil.max_height_tiles(),
        };
        loop {
            let constraints = self.constraints.get(&index);
            let Some(chosen) = self.matcher.pick(&shape, constraints, &mut self.rng) else {
                info!("no suitable replacement found for sprite {:03X}", index);
                return Ok(());
            };
            let filename = chosen.filename.clone();
            self.matcher.mark_used(&filename);
            let Some(image) = image_pool::load_candidate(Path::new(&filename))? else {
                continue; // too many colors; already logged
            };
            let (depth, size, stencil, tiles, colors) = encode_candidate(image)
                .with_context(|| format!("candidate {} for sprite {:03X}", filename, index))?;
            let sprite = &mut self.sprites[index];
            sprite.record.set_depth(depth);
            sprite.record.set_size(size);
            sprite.stencil = stencil;
            sprite.tiles = tiles;
            sprite.palette = colors;
            sprite.replacement = Some(filename);
            return Ok(());
        }
    }

    // Fixed call sequence per sprite: stencil, palette, body, record.
    fn allocate_sprite(&mut self, index: usize) -> Result<()> {
        let stencil_index =
            self.alloc
                .alloc_stencil(&mut self.rom, index, &self.sprites[index].stencil)?;
        let palette_slot =
            self.alloc
                .alloc_palette(&mut self.rom, index, &self.sprites[index].palette)?;
        let pointer = self.alloc.alloc_sprite_body(
            &mut self.rom,
            index,
            self.sprites[index].record.depth(),
            &self.sprites[index].stencil,
            &self.sprites[index].tiles,
        )?;

        let record = {
            let sprite = &mut self.sprites[index];
            sprite.record.set_pointer_bits(pointer);
            sprite.record.set_palette_index(palette_slot);
            sprite.record.stencil_index = stencil_index;
            sprite.record
        };
        self.rom.write_n(
            self.layout.sprite_table + index * RECORD_BYTES,
            &record.to_bytes(),
        )?;
        self.alloc.record_written(WrittenSprite {
            size: record.size(),
            depth: record.depth(),
            stencil: self.sprites[index].stencil.clone(),
            tiles: self.sprites[index].tiles.clone(),
            pointer_bits: pointer,
            stencil_index,
        });
        Ok(())
    }

    fn patch_stencil_pointers(&mut self) -> Result<()> {
        let layout = self.layout;
        self.rom.write_u16(
            layout.comp8_pointer_field,
            (layout.new_comp8_table & 0xFFFF) as u16,
        )?;
        self.rom.write_u16(
            layout.comp16_pointer_field,
            (layout.new_comp16_table & 0xFFFF) as u16,
        )?;
        Ok(())
    }

    pub fn report(&self, image_path: &Path) -> String {
        let mut out = String::new();
        out.push_str(&format!("ROM: {}\n", image_path.display()));
        out.push_str(&format!("Seed: {}\n", self.seed));
        for sprite in &self.sprites {
            match &sprite.replacement {
                Some(filename) => out.push_str(&format!("{:03X} {}\n", sprite.index, filename)),
                None => out.push_str(&format!("{:03X} ---\n", sprite.index)),
            }
        }
        out
    }

    // Compose every sprite back into a viewable indexed PNG, index 0
    // transparent.
    pub fn write_previews(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create preview directory {}", dir.display()))?;
        for sprite in &self.sprites {
            let bitmap = sprite::compose(&sprite.stencil, &sprite.tiles)?;
            let mut palette_bytes = Vec::with_capacity(sprite.palette.len() * 3);
            for &(r, g, b) in &sprite.palette {
                palette_bytes.extend([r, g, b]);
            }
            let path = dir.join(format!("{:03X}.png", sprite.index));
            let file = File::create(&path)
                .with_context(|| format!("Unable to create {}", path.display()))?;
            let mut encoder =
                png::Encoder::new(BufWriter::new(file), bitmap.width as u32, bitmap.height as u32);
            encoder.set_color(png::ColorType::Indexed);
            encoder.set_depth(png::BitDepth::Eight);
            encoder.set_palette(palette_bytes);
            encoder.set_trns(&[0u8][..]);
            encoder.write_header()?.write_image_data(&bitmap.data)?;
        }
        Ok(())
    }
}

fn encode_candidate(
    image: NormalizedImage,
) -> Result<(ColorDepth, SpriteSize, Stencil, Vec<TilePixels>, Vec<ColorRGB>)> {
    let NormalizedImage {
        depth,
        size,
        mut bitmap,
        palette,
    } = image;
    bitmap.trim_top_blank_bands()?;
    let colors = palette::remap_palette(&mut bitmap.data, &palette)?;
    let (stencil, tiles) = sprite::decompose(&bitmap, size)?;
    Ok((depth, size, stencil, tiles, colors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::encode_tile;
    use std::path::PathBuf;

    fn tiny_layout() -> Layout {
        Layout {
            sprite_table: 0x000,
            sprite_count: 3,
            palette_table: 0x100,
            palette_count: 4,
            comp16_table: 0x200,
            comp16_count: 1,
            comp8_table: 0x300,
            comp8_count: 2,
            monster_graphics: 0x400,
            end_monster_graphics: 0x800,
            new_monster_graphics: 0x1000,
            end_new_monster_graphics: 0x1800,
            comp8_pointer_field: 0x2000,
            comp16_pointer_field: 0x2002,
            new_comp8_table: 0x2004,
            end_new_comp8_table: 0x2100,
            new_comp16_table: 0x2100,
            end_new_comp16_table: 0x2200,
            new_palette_table: 0x2300,
            new_palette_slots: 16,
            image_size: 0x3000,
            protected: vec![],
        }
    }

    fn record_bytes(pointer: u16, eight_color: bool, palette: u8, stencil: u8) -> [u8; 5] {
        let misc = pointer | if eight_color { 0x8000 } else { 0 };
        [
            (misc & 0xFF) as u8,
            (misc >> 8) as u8,
            palette,
            0x00, // small, palette high bits zero
            stencil,
        ]
    }

    fn build_source_rom(layout: &Layout) -> Rom {
        let mut rom = Rom::new(vec![0; layout.image_size]);
        // Three small 8-color sprites; sprite 1 has pointer 0 => unseen.
        rom.write_n(layout.sprite_table, &record_bytes(0, true, 0, 0))
            .unwrap();
        rom.write_n(
            layout.sprite_table + RECORD_BYTES,
            &record_bytes(0, true, 1, 0),
        )
        .unwrap();
        rom.write_n(
            layout.sprite_table + 2 * RECORD_BYTES,
            &record_bytes(3, true, 0, 1),
        )
        .unwrap();
        // comp8 stencils: entry 0 = one tile, entry 1 = two tiles.
        rom.write_u8(layout.comp8_table, 0b1000_0000).unwrap();
        rom.write_u8(layout.comp8_table + 8, 0b1100_0000).unwrap();
        // Tile data: sprite 0/1 at pointer 0, sprite 2 at pointer 3 (24 bytes).
        let tile_a = encode_tile(&[[1u8; 8]; 8], ColorDepth::Eight).unwrap();
        let tile_b = encode_tile(&[[2u8; 8]; 8], ColorDepth::Eight).unwrap();
        rom.write_n(layout.monster_graphics, &tile_a).unwrap();
        rom.write_n(layout.monster_graphics + 24, &tile_b).unwrap();
        rom.write_n(layout.monster_graphics + 48, &tile_b).unwrap();
        // Palettes: slot 0 and slot 1 hold valid words (alpha bits clear).
        rom.write_u16(layout.palette_table + 2, 0x001F).unwrap();
        rom.write_u16(layout.palette_table + 16 + 2, 0x03E0).unwrap();
        rom
    }

    fn write_candidate(path: &Path, body_index: u8) {
        // 16x16, black border, body color at index `body_index`.
        let mut data = vec![0u8; 256];
        for y in 4..12 {
            for x in 4..12 {
                data[y * 16 + x] = body_index;
            }
        }
        let palette = [0u8, 0, 0, 200, 40, 40, 40, 200, 40];
        let file = File::create(path).unwrap();
        let mut encoder = png::Encoder::new(BufWriter::new(file), 16, 16);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(&palette[..]);
        encoder
            .write_header()
            .unwrap()
            .write_image_data(&data)
            .unwrap();
    }

    fn run_once(
        layout: &Layout,
        pool_dir: &Path,
        seed: u64,
    ) -> (Vec<u8>, String, Vec<SpriteRecord>) {
        let rom = build_source_rom(layout);
        let list_path = pool_dir.join("images.txt");
        let pool = image_pool::parse_image_list(&list_path).unwrap();
        let mut rewriter = Rewriter::new(rom, layout, pool, HashMap::new(), seed);
        rewriter.run().unwrap();
        let report = rewriter.report(&PathBuf::from("out.sfc"));
        let records = (0..layout.sprite_count)
            .map(|i| {
                SpriteRecord::from_bytes(
                    rewriter
                        .rom
                        .read_n(layout.sprite_table + i * RECORD_BYTES, RECORD_BYTES)
                        .unwrap(),
                )
                .unwrap()
            })
            .collect();
        (rewriter.rom.data, report, records)
    }

    #[test]
    fn identical_runs_are_byte_identical() {
        let layout = tiny_layout();
        let dir = tempfile::tempdir().unwrap();
        write_candidate(&dir.path().join("a.png"), 1);
        write_candidate(&dir.path().join("b.png"), 2);
        std::fs::write(
            dir.path().join("images.txt"),
            format!(
                "{}\n{}\n",
                dir.path().join("a.png").display(),
                dir.path().join("b.png").display()
            ),
        )
        .unwrap();

        let (data1, report1, _) = run_once(&layout, dir.path(), 42);
        let (data2, report2, _) = run_once(&layout, dir.path(), 42);
        assert_eq!(data1, data2);
        assert_eq!(report1, report2);
        assert!(report1.contains("Seed: 42"));
        // Three sprite lines; the unseen sprite 1 keeps its original image.
        assert!(report1.contains("001 ---\n"));
        let replaced = report1.lines().filter(|l| l.ends_with(".png")).count();
        assert_eq!(replaced, 2);
    }

    #[test]
    fn identical_artwork_shares_tiles_and_stencil() {
        let layout = tiny_layout();
        let dir = tempfile::tempdir().unwrap();
        // Same pixel content under two filenames.
        write_candidate(&dir.path().join("a.png"), 1);
        write_candidate(&dir.path().join("b.png"), 1);
        std::fs::write(
            dir.path().join("images.txt"),
            format!(
                "{}\n{}\n",
                dir.path().join("a.png").display(),
                dir.path().join("b.png").display()
            ),
        )
        .unwrap();

        let (data, report, records) = run_once(&layout, dir.path(), 7);
        let replaced = report.lines().filter(|l| l.ends_with(".png")).count();
        assert_eq!(replaced, 2);
        // Sprites 0 and 2 were both replaced with identical artwork: one
        // stored tile run, one stored stencil entry.
        assert_eq!(records[0].pointer_bits(), records[2].pointer_bits());
        assert_eq!(records[0].stencil_index, records[2].stencil_index);
        // Stencil table pointer fields are patched little-endian.
        let rom = Rom::new(data);
        assert_eq!(
            rom.read_u16(layout.comp8_pointer_field).unwrap(),
            (layout.new_comp8_table & 0xFFFF) as u16
        );
        assert_eq!(
            rom.read_u16(layout.comp16_pointer_field).unwrap(),
            (layout.new_comp16_table & 0xFFFF) as u16
        );
    }

    #[test]
    fn original_window_is_zeroed_and_graphics_relocated() {
        let layout = tiny_layout();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("images.txt"), "").unwrap();

        let (data, report, records) = run_once(&layout, dir.path(), 3);
        // Empty pool: every sprite keeps its original artwork.
        assert_eq!(report.lines().filter(|l| l.ends_with("---")).count(), 3);
        let rom = Rom::new(data);
        let window = rom
            .read_n(
                layout.monster_graphics,
                layout.end_monster_graphics - layout.monster_graphics,
            )
            .unwrap();
        assert!(window.iter().all(|&b| b == 0));
        // Sprites 0 and 1 had identical stencil+tiles and now share storage.
        assert_eq!(records[0].pointer_bits(), records[1].pointer_bits());
        assert_ne!(records[0].pointer_bits(), records[2].pointer_bits());
        // The relocated tile bytes decode back to the original pixels.
        let addr = layout.new_monster_graphics + records[2].pointer_bits() as usize * 16;
        let bytes = rom.read_n(addr, 24).unwrap();
        assert_eq!(decode_tile(bytes, ColorDepth::Eight).unwrap(), [[2u8; 8]; 8]);
    }
}
