// Render the Cornell box on the CPU backend and write a PNG.
// Run with: cargo run --release --bin ember_offline -- <out.png> [width] [height] [frames]

use anyhow::{bail, Context, Result};
use ember_core::{FrameOutcome, RendererConfig, Scene};
use ember_renderer::{cpu_scheduler, save_png};
use std::env;
use std::time::Instant;

fn arg_or(args: &[String], index: usize, default: u32) -> Result<u32> {
    match args.get(index) {
        Some(value) => value
            .parse()
            .with_context(|| format!("Invalid numeric argument '{}'", value)),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <out.png> [width] [height] [frames]", args[0]);
        std::process::exit(1);
    }
    let output = &args[1];
    let width = arg_or(&args, 2, 400)?;
    let height = arg_or(&args, 3, 400)?;
    let frames = arg_or(&args, 4, 64)?;

    let scene = Scene::cornell_box()?;
    let mut scheduler = cpu_scheduler(&scene, RendererConfig::default())?;
    scheduler.resize(width, height)?;

    let start = Instant::now();
    for _ in 0..frames {
        if let FrameOutcome::Skipped(err) = scheduler.draw_frame()? {
            log::warn!("Frame skipped: {}", err);
        }
    }
    scheduler.drain();
    log::info!("Rendered {} frames in {:.2?}", frames, start.elapsed());

    let Some((pixels, _)) = scheduler.backend().read_surface() else {
        bail!("No frame was presented");
    };
    save_png(output, width, height, &pixels)?;
    Ok(())
}
