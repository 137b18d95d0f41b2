use anyhow::{anyhow, Result};
use clap::Parser;
use img_caption::core::config::{load_settings, save_settings};
use img_caption::core::model::Settings;
use img_caption::core::pipeline::{caption_single, run_job, StartJobInput};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Offline image captioning (ONNX encoder-decoder)", long_about = None)]
struct Args {
    /// Image file or directory of images to caption.
    source: PathBuf,

    /// Output directory for sidecar captions and the JSON report
    /// (directory mode only). Defaults to `<source>/captions`.
    #[arg(long, value_name = "PATH")]
    export: Option<PathBuf>,

    /// Settings file (JSON). Missing file means defaults.
    #[arg(long, value_name = "PATH", default_value = "settings.json")]
    config: PathBuf,

    /// Model directory override (expects the ONNX export plus vocab.json).
    #[arg(long, value_name = "PATH")]
    model_dir: Option<PathBuf>,

    /// Decode step budget override.
    #[arg(long, value_name = "N")]
    max_steps: Option<usize>,

    /// Print the full per-image status log.
    #[arg(long)]
    verbose: bool,

    /// Write the effective settings back to the config path and exit.
    #[arg(long)]
    write_config: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn effective_settings(args: &Args) -> Settings {
    let mut settings = load_settings(&args.config);
    if let Some(dir) = &args.model_dir {
        settings.model_dir = Some(dir.to_string_lossy().to_string());
    }
    if let Some(steps) = args.max_steps {
        settings.max_steps = steps.max(1);
    }
    settings
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let settings = effective_settings(&args);

    if args.write_config {
        save_settings(&args.config, &settings)?;
        println!("wrote {}", args.config.display());
        return Ok(());
    }

    if args.source.is_file() {
        let outcome = caption_single(&settings, &args.source)?;
        if args.verbose {
            eprintln!("{}", outcome.log.trim_end());
        }
        if outcome.caption.is_empty() {
            println!("<empty>");
        } else {
            println!("{}", outcome.caption);
        }
        if !outcome.ready {
            return Err(anyhow!("captioning pipeline not ready; rerun with --verbose"));
        }
        Ok(())
    } else if args.source.is_dir() {
        let export_root = args
            .export
            .clone()
            .unwrap_or_else(|| args.source.join("captions"));
        let summary = run_job(
            &settings,
            &StartJobInput {
                source_root: args.source.clone(),
                export_root,
            },
        )?;
        println!(
            "captioned {} image(s), {} error(s), {} partial, {:.2}s",
            summary.processed, summary.errors, summary.partial, summary.elapsed_secs
        );
        Ok(())
    } else {
        Err(anyhow!("source not found: {}", args.source.display()))
    }
}
