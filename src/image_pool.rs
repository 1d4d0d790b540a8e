use anyhow::{bail, ensure, Context, Result};
use hashbrown::{HashMap, HashSet};
use log::{info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::palette::ColorRGB;
use crate::sprite::Bitmap;
use crate::stencil::SpriteSize;
use crate::tile::ColorDepth;

// One entry of the image list: a replacement asset that has not been decoded
// yet. Dimensions come from the PNG header so the matcher can score every
// candidate without holding pixel data for the whole pool.
#[derive(Clone, Debug)]
pub struct CandidateImage {
    pub filename: String,
    pub tags: HashSet<String>,
    pub width: usize,
    pub height: usize,
}

#[derive(Clone, Debug, Default)]
pub struct TagConstraints {
    pub whitelist: HashSet<String>,
    pub blacklist: HashSet<String>,
}

fn strip_comment(line: &str) -> &str {
    match line.split_once('#') {
        Some((head, _)) => head,
        None => line,
    }
    .trim()
}

fn parse_tags(text: &str) -> HashSet<String> {
    text.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// `path` or `path:tag1,tag2,...`, `#` comments, blank lines ignored. The pool
// comes back sorted by filename so runs see a stable base order.
pub fn parse_image_list(path: &Path) -> Result<Vec<CandidateImage>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read image list at {}", path.display()))?;
    let mut pool = Vec::new();
    for line in text.lines() {
        let line = strip_comment(line);
        if line.is_empty() {
            continue;
        }
        let (filename, tags) = match line.split_once(':') {
            Some((filename, tags)) => (filename.trim(), parse_tags(tags)),
            None => (line, HashSet::new()),
        };
        let (width, height) = read_png_dimensions(Path::new(filename))
            .with_context(|| format!("image list entry {}", filename))?;
        pool.push(CandidateImage {
            filename: filename.to_string(),
            tags,
            width,
            height,
        });
    }
    pool.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(pool)
}

// `hexIndex:tag1,!tag2,...`; a leading `!` moves the tag to the blacklist.
pub fn parse_monster_tags(path: &Path) -> Result<HashMap<usize, TagConstraints>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read sprite tag file at {}", path.display()))?;
    let mut constraints: HashMap<usize, TagConstraints> = HashMap::new();
    for line in text.lines() {
        let line = strip_comment(line);
        let Some((index, tags)) = line.split_once(':') else {
            continue;
        };
        let index = usize::from_str_radix(index.trim(), 16)
            .with_context(|| format!("bad sprite index in tag file: {:?}", index))?;
        let entry = constraints.entry(index).or_default();
        for tag in parse_tags(tags) {
            match tag.strip_prefix('!') {
                Some(stripped) => {
                    entry.blacklist.insert(stripped.to_string());
                }
                None => {
                    entry.whitelist.insert(tag);
                }
            }
        }
    }
    Ok(constraints)
}

fn read_png_dimensions(path: &Path) -> Result<(usize, usize)> {
    let file = File::open(path).with_context(|| format!("Unable to open {}", path.display()))?;
    let reader = png::Decoder::new(BufReader::new(file)).read_info()?;
    let info = reader.info();
    Ok((info.width as usize, info.height as usize))
}

// A candidate decoded and normalized, ready for the encode pipeline: depth
// and size classified, background color swapped into index 0.
pub struct NormalizedImage {
    pub depth: ColorDepth,
    pub size: SpriteSize,
    pub bitmap: Bitmap,
    pub palette: Vec<ColorRGB>,
}

fn decode_indexed_png(path: &Path) -> Result<(Bitmap, Vec<ColorRGB>)> {
    let file = File::open(path).with_context(|| format!("Unable to open {}", path.display()))?;
    let mut reader = png::Decoder::new(BufReader::new(file)).read_info()?;
    let mut buf = vec![0; reader.output_buffer_size()];
    let frame = reader.next_frame(&mut buf)?;
    buf.truncate(frame.buffer_size());
    let info = reader.info();
    ensure!(
        info.color_type == png::ColorType::Indexed,
        "{}: only indexed-color PNG images are supported",
        path.display()
    );
    let width = info.width as usize;
    let height = info.height as usize;
    let palette_bytes = info
        .palette
        .as_ref()
        .with_context(|| format!("{}: indexed PNG without a palette", path.display()))?;
    let palette: Vec<ColorRGB> = palette_bytes
        .chunks_exact(3)
        .map(|c| (c[0], c[1], c[2]))
        .collect();

    let bits = match info.bit_depth {
        png::BitDepth::One => 1,
        png::BitDepth::Two => 2,
        png::BitDepth::Four => 4,
        png::BitDepth::Eight => 8,
        png::BitDepth::Sixteen => bail!("{}: 16-bit indexed PNG", path.display()),
    };
    let data = if bits == 8 {
        buf
    } else {
        // Sub-byte rows are packed big-endian and padded to a byte boundary.
        let row_bytes = (width * bits).div_ceil(8);
        let mask = (1u8 << bits) - 1;
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let row = &buf[y * row_bytes..(y + 1) * row_bytes];
            for x in 0..width {
                let bit_offset = x * bits;
                let shift = 8 - bits - (bit_offset % 8);
                data.push((row[bit_offset / 8] >> shift) & mask);
            }
        }
        data
    };
    Ok((Bitmap::new(width, height, data)?, palette))
}

// The background color is whichever palette index dominates the image border
// (ties go to the index seen first, scanning left edge, right edge, top,
// bottom). It is swapped into index 0 and forced to black.
fn normalize_background(bitmap: &mut Bitmap, palette: &mut [ColorRGB]) {
    let (w, h) = (bitmap.width, bitmap.height);
    let mut counts = [0usize; 16];
    let mut first_seen = [usize::MAX; 16];
    let mut order = 0;
    let mut visit = |p: u8, counts: &mut [usize; 16], first_seen: &mut [usize; 16]| {
        counts[p as usize] += 1;
        if first_seen[p as usize] == usize::MAX {
            first_seen[p as usize] = order;
        }
        order += 1;
    };
    for y in 0..h {
        visit(bitmap.data[y * w], &mut counts, &mut first_seen);
    }
    for y in 0..h {
        visit(bitmap.data[y * w + w - 1], &mut counts, &mut first_seen);
    }
    for x in 0..w {
        visit(bitmap.data[x], &mut counts, &mut first_seen);
    }
    for x in 0..w {
        visit(bitmap.data[(h - 1) * w + x], &mut counts, &mut first_seen);
    }
    let background = (0..16u8)
        .filter(|&i| counts[i as usize] > 0)
        .min_by_key(|&i| (std::cmp::Reverse(counts[i as usize]), first_seen[i as usize]))
        .unwrap_or(0);

    if background != 0 {
        for p in bitmap.data.iter_mut() {
            *p = match *p {
                0 => background,
                b if b == background => 0,
                other => other,
            };
        }
        palette.swap(0, background as usize);
    }
    palette[0] = (0, 0, 0);
}

// Decode and normalize one candidate. Ok(None) means the image uses more than
// 16 palette indices, which only disqualifies this candidate, not the run.
pub fn load_candidate(path: &Path) -> Result<Option<NormalizedImage>> {
    let (mut bitmap, mut palette) = decode_indexed_png(path)?;
    ensure!(
        bitmap.width >= 1 && bitmap.height >= 1,
        "{}: empty image",
        path.display()
    );
    ensure!(
        bitmap.width <= 128 && bitmap.height <= 128,
        "{}: {}x{} exceeds the 128x128 sprite limit",
        path.display(),
        bitmap.width,
        bitmap.height
    );

    let max_index = bitmap.data.iter().copied().max().unwrap_or(0);
    if max_index > 0xF {
        info!("{} has too many colors", path.display());
        return Ok(None);
    }
    let depth = if max_index <= 7 {
        ColorDepth::Eight
    } else {
        ColorDepth::Sixteen
    };
    if depth == ColorDepth::Sixteen {
        let distinct: HashSet<u8> = bitmap.data.iter().copied().collect();
        if distinct.len() <= 8 {
            warn!("wasteful palette: {}", path.display());
        }
    }
    let size = if bitmap.width > 64 || bitmap.height > 64 {
        SpriteSize::Big
    } else {
        SpriteSize::Small
    };

    // Keep the palette addressable for every representable index while the
    // background swap happens, then cut it down to the sprite's color count.
    palette.resize(palette.len().max(16), (0, 0, 0));
    normalize_background(&mut bitmap, &mut palette);
    palette.truncate(depth.color_count());
    palette.resize(depth.color_count(), (0, 0, 0));

    Ok(Some(NormalizedImage {
        depth,
        size,
        bitmap,
        palette,
    }))
}
