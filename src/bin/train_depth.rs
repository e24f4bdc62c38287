/// Depth training entry point
///
/// Usage: `train_depth <config.json> [resume.safetensors]`
use std::path::Path;

use anyhow::Context;
use monodepth::data::{BatchStream, DepthDataLoader, NpyDepthDataset};
use monodepth::training::{build_scheduler, JsonlScalarWriter, LrScheduler, TrainerBuilder};
use monodepth::utils::parse_device;
use monodepth::TrainConfig;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .context("usage: train_depth <config.json> [resume.safetensors]")?;
    let resume = args.next();

    log::info!("=== Monocular depth training ===");

    // Validation happens here, before any data or parameters are allocated
    let config = TrainConfig::load(&config_path)
        .with_context(|| format!("loading config {}", config_path))?;
    log::info!("Configuration: {:#?}", config);

    let device = parse_device(&config.device)?;
    log::info!("Using device: {:?}", device);

    let root = Path::new(&config.dataset_path);
    let train_set = NpyDepthDataset::from_directory(root.join(&config.train_split))?;
    let val_set = NpyDepthDataset::from_directory(root.join(&config.val_split))?;

    let mut train_loader =
        DepthDataLoader::new(train_set, config.batch_size, config.shuffle, config.random_seed)?;
    let mut val_loader = DepthDataLoader::new(val_set, config.batch_size, false, None)?;

    log::info!("Data loaders created:");
    log::info!("  - Batch size: {}", config.batch_size);
    log::info!("  - Train batches: {}", train_loader.num_batches());
    log::info!("  - Val batches: {}", val_loader.num_batches());

    let sink = JsonlScalarWriter::new(&config.checkpoints_dir)?;
    let mut trainer = TrainerBuilder::from_config(&config)?
        .sink(Box::new(sink))
        .build(&device)?;

    if let Some(path) = resume {
        log::info!("Resuming from {}", path);
        trainer
            .load_checkpoint(&path)
            .with_context(|| format!("loading checkpoint {}", path))?;
    }

    let mut scheduler = build_scheduler(&config.scheduler, config.learning_rate);
    let scheduler: &mut dyn LrScheduler = scheduler.as_mut();
    trainer.train(
        config.num_epochs,
        &mut train_loader,
        &mut val_loader,
        Some(scheduler),
        config.verbose,
        config.save_checkpoint_per_num_epochs,
        &config.checkpoints_dir,
    )?;

    if let Some(last) = trainer.history().last() {
        log::info!("Final epoch: {}", last.summary());
    }
    log::info!("Artifacts written to {}", config.checkpoints_dir);
    Ok(())
}
