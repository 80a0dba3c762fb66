use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use loopgrid_engine::{CpalBackend, EngineConfig, FileSource, LoopEngine, ManualBackend};
use loopgrid_shared::Composition;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  loopgrid render <project.json> <samples_dir> <out.wav>
  loopgrid play <project.json> <samples_dir> <seconds>

Set LOOPGRID_CONFIG to a JSON engine config to override the defaults.";

const RENDER_RATE: u32 = 44_100;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["render", project, samples, out] => render(Path::new(project), Path::new(samples), Path::new(out)),
        ["play", project, samples, seconds] => {
            let seconds: f64 = seconds
                .parse()
                .with_context(|| format!("invalid duration {seconds:?}"))?;
            play(Path::new(project), Path::new(samples), seconds)
        }
        _ => {
            eprintln!("{USAGE}");
            bail!("unrecognised arguments: {args:?}");
        }
    }
}

fn config() -> anyhow::Result<EngineConfig> {
    match std::env::var_os("LOOPGRID_CONFIG") {
        Some(path) => EngineConfig::load(Path::new(&path)),
        None => Ok(EngineConfig::default()),
    }
}

fn load_project(path: &Path) -> anyhow::Result<Arc<Composition>> {
    let composition = Composition::load_json(path)
        .with_context(|| format!("loading project {}", path.display()))?;
    info!(
        name = %composition.name,
        tracks = composition.tracks.len(),
        placements = composition.placement_count(),
        total = composition.total_duration(),
        "project loaded"
    );
    Ok(Arc::new(composition))
}

fn render(project: &Path, samples: &Path, out: &Path) -> anyhow::Result<()> {
    let composition = load_project(project)?;
    let source = Arc::new(FileSource::new(samples));
    let mut engine = LoopEngine::new(ManualBackend::new(RENDER_RATE), source, config()?);
    engine.apply(composition);

    let report = engine.preload();
    for (reference, reason) in &report.failed {
        warn!(reference = %reference, reason = %reason, "sample unavailable");
    }

    let bytes = engine.export().context("rendering loop")?;
    std::fs::write(out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    println!("wrote {} ({} bytes)", out.display(), bytes.len());
    Ok(())
}

fn play(project: &Path, samples: &Path, seconds: f64) -> anyhow::Result<()> {
    let composition = load_project(project)?;
    let config = config()?;
    let backend = CpalBackend::new(config.command_queue).context("opening output device")?;
    let source = Arc::new(FileSource::new(samples));
    let mut engine = LoopEngine::new(backend, source, config);
    engine.apply(composition);

    let report = engine.preload();
    info!(
        loaded = report.loaded.len(),
        failed = report.failed.len(),
        timed_out = report.timed_out.len(),
        "preload finished"
    );

    engine.play().context("starting playback")?;
    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    let mut last_print = Instant::now();
    while Instant::now() < deadline {
        let status = engine.poll();
        if last_print.elapsed() >= Duration::from_millis(500) {
            println!(
                "{:>7.2}s / {:.2}s  [{:>3.0}%]",
                status.position,
                status.total,
                status.progress * 100.0
            );
            last_print = Instant::now();
        }
        thread::sleep(Duration::from_millis(16));
    }

    engine.stop();
    thread::sleep(Duration::from_millis(100));
    println!("done");
    Ok(())
}
