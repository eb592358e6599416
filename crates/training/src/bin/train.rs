use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use training::{SessionOptions, Trainer, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Reversible image classifier training CLI", long_about = None)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Directory of serialized dataset records")]
    data_dir: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        help = "Directory for checkpoints and summaries; omitting it disables both"
    )]
    train_dir: Option<PathBuf>,

    #[arg(long, help = "Restore the latest checkpoint from train_dir before training")]
    restore: bool,

    #[arg(long, help = "Hold out a validation split and report it during evaluation")]
    validate: bool,

    #[arg(long, help = "Use the activation-reconstruction gradient path instead of autodiff")]
    manual_grad: bool,

    #[arg(long, value_name = "PATH", help = "Optional hyperparameter file (TOML or JSON)")]
    config: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TrainingConfig::from_path(path)?,
        None => TrainingConfig::default(),
    };
    config.validate()?;

    let session = SessionOptions {
        data_dir: args.data_dir,
        train_dir: args.train_dir,
        restore: args.restore,
        validate: args.validate,
        manual_grad: args.manual_grad,
    };

    let mut trainer = Trainer::new(config, session)?;

    if args.restore {
        if let Some(descriptor) = trainer.resume_from_latest()? {
            println!(
                "resumed from checkpoint {} (global_step {})",
                descriptor.directory.display(),
                descriptor.manifest.progress.global_step
            );
        }
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;

    Ok(())
}
