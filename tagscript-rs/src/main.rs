use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tagscript::cli::{self, ConfigFile};
use tagscript::config::{self, EngineConfig};
use tagscript::{Engine, MessageType, OutputFn};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(spec: &ConfigFile) -> EngineConfig {
    let path = match spec {
        ConfigFile::Skip => return EngineConfig::default(),
        ConfigFile::Explicit(path) => path.clone(),
        ConfigFile::Default => match config::default_config_path() {
            Some(path) if path.exists() => path,
            _ => return EngineConfig::default(),
        },
    };
    match EngineConfig::load_file(&path) {
        Ok((config, errors)) => {
            for e in &errors {
                warn!(file = %path.display(), "config {e}");
            }
            config
        }
        Err(e) => {
            eprintln!("tagscript: {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

/// Names of the script files in `dir` with the given extension.
fn script_names(dir: &Path, extension: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some(extension))
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_owned))
        .collect();
    names.sort();
    names
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("tagscript: {e}");
            eprintln!("{}", cli::USAGE);
            std::process::exit(1);
        }
    };

    let mut config = load_config(&args.config);
    if let Some(dir) = args.script_dir {
        config.script_dir = dir;
    }
    if let Some(v) = args.verbosity {
        config.verbosity = v;
    }
    if let Some(ms) = args.tick_ms {
        config.tick_interval = time::Duration::from_millis(ms);
    }

    let output: OutputFn = Arc::new(|message: &str, kind| match kind {
        MessageType::Bad => eprintln!("{message}"),
        MessageType::Info | MessageType::Good => println!("{message}"),
    });
    let mut engine = Engine::new(output);
    engine.set_extension(&config.script_extension);
    engine.set_verbosity(config.verbosity);
    engine.set_loader(Engine::fs_loader(config.script_dir.clone()));

    // ── Autorun scripts ───────────────────────────────────────────────────────
    if config.autorun {
        let mut scheduled = 0;
        for name in script_names(&config.script_dir, &config.script_extension) {
            if let Some(script) = engine.get_script_file(&name) {
                if engine.precalc_script(script) {
                    scheduled += 1;
                }
            }
        }
        info!(dir = %config.script_dir.display(), scheduled, "autorun scripts");
        engine.run_precalculated();
    }

    // ── Startup commands and named scripts ────────────────────────────────────
    for (i, cmd) in args.commands.iter().enumerate() {
        let script = engine.script_from_source(&format!("command{}", i + 1), cmd);
        engine.start_script(&script, HashMap::new(), None);
    }
    for name in &args.scripts {
        match engine.get_script_file(name) {
            Some(script) => {
                engine.start_script(&script, HashMap::new(), None);
            }
            None => eprintln!("tagscript: no script '{name}' in {}", config.script_dir.display()),
        }
    }

    // ── Tick loop ─────────────────────────────────────────────────────────────
    let mut interval = time::interval(config.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    while engine.active_queues() > 0 {
        tokio::select! {
            now = interval.tick() => {
                let delta = now.duration_since(last).as_secs_f64();
                last = now;
                engine.tick(delta);
            }
            _ = tokio::signal::ctrl_c() => {
                info!(queues = engine.active_queues(), "interrupted, stopping queues");
                engine.stop_all();
            }
        }
    }
}
