use anyhow::Result;
use clap::Parser;
use hashbrown::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

mod alloc;
mod image_pool;
mod layout;
mod matcher;
mod palette;
mod rewrite;
mod rom;
mod sprite;
mod stencil;
mod tile;

use layout::Layout;
use rewrite::Rewriter;
use rom::Rom;

#[derive(Parser, Debug)]
#[command(about = "Rewrite the monster sprites of an expanded game image")]
struct Args {
    /// Image to rewrite in place
    image: PathBuf,

    /// Image list file: one `path` or `path:tag1,tag2,...` per line
    #[arg(long)]
    images: PathBuf,

    /// Run seed; defaults to the current UNIX time
    #[arg(long)]
    seed: Option<u64>,

    /// Optional per-sprite tag constraints: `hexIndex:tag1,!tag2,...`
    #[arg(long)]
    monster_tags: Option<PathBuf>,

    /// Where to write the run report (default: remonster.<seed>.txt next to
    /// the image)
    #[arg(long)]
    report: Option<PathBuf>,

    /// If set, write every rewritten sprite as an indexed PNG here
    #[arg(long)]
    preview_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let seed = match args.seed {
        Some(seed) => seed,
        None => SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
    };

    let layout = Layout::ff6();
    let rom = Rom::load(&args.image)?;
    let pool = image_pool::parse_image_list(&args.images)?;
    let constraints = match &args.monster_tags {
        Some(path) => image_pool::parse_monster_tags(path)?,
        None => HashMap::new(),
    };

    let mut rewriter = Rewriter::new(rom, &layout, pool, constraints, seed);
    rewriter.run()?;
    rewriter.rom.save(&args.image)?;
    if let Some(dir) = &args.preview_dir {
        rewriter.write_previews(dir)?;
    }

    let report_path = args
        .report
        .unwrap_or_else(|| args.image.with_file_name(format!("remonster.{}.txt", seed)));
    std::fs::write(&report_path, rewriter.report(&args.image))?;
    Ok(())
}
