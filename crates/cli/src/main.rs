use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use tracing::info;

use xnor_common::{SyntheticDigits, XnorConfig};
use xnor_core::{compression_stats, BinarizeController, LayeredModel, XnorNet};
use xnor_train::{LrDecay, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "xnor", about = "Train and inspect XNOR-binarized networks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the reference network on synthetic digits.
    Train(TrainArgs),
    /// Print tracked layers and compression stats for a config.
    Inspect(InspectArgs),
    /// Write a default config.json.
    InitConfig(InitConfigArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[arg(long, default_value = "64")]
    batch_size: usize,
    #[arg(long, default_value = "2000")]
    max_steps: usize,
    #[arg(long, default_value = "0")]
    max_epochs: usize,
    #[arg(long, default_value = "0")]
    save_every: usize,
    #[arg(long, default_value = "1e-3")]
    lr: f64,
    #[arg(long, default_value = "0.0")]
    weight_decay: f64,
    /// Global gradient-norm cap; 0 disables clipping.
    #[arg(long, default_value = "0.0")]
    grad_clip_max_norm: f64,
    #[arg(long, default_value = "0")]
    lr_warmup_steps: usize,
    #[arg(long, default_value = "step", value_parser = ["step", "none"])]
    lr_decay: String,
    #[arg(long, default_value = "1000")]
    lr_step_size: usize,
    #[arg(long, default_value = "0.1")]
    lr_gamma: f64,
    #[arg(long, default_value = "50")]
    log_every: usize,
    #[arg(long, default_value = "200")]
    eval_every: usize,
    #[arg(long, default_value = "10")]
    eval_batches: usize,
    /// Training samples per epoch.
    #[arg(long, default_value = "12800")]
    train_samples: usize,
    #[arg(long, default_value = "2560")]
    val_samples: usize,
    /// Uniform noise amplitude added to every pixel.
    #[arg(long, default_value = "0.5")]
    noise: f32,
    #[arg(long, default_value = "42")]
    seed: u64,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Inspect(args) => cmd_inspect(args),
        Command::InitConfig(args) => cmd_init_config(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn load_or_default(path: &Path) -> Result<XnorConfig> {
    if path.exists() {
        XnorConfig::load(path)
    } else {
        let default = XnorConfig::default();
        default.save(path)?;
        eprintln!("Created default config at {}", path.display());
        Ok(default)
    }
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let model_config = load_or_default(&args.config)?;

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        max_steps: args.max_steps,
        max_epochs: args.max_epochs,
        lr: args.lr,
        lr_warmup_steps: args.lr_warmup_steps,
        lr_decay: LrDecay::from_str(&args.lr_decay, args.lr_step_size, args.lr_gamma),
        weight_decay: args.weight_decay,
        grad_clip_max_norm: args.grad_clip_max_norm,
        save_every: args.save_every,
        log_every: args.log_every,
        eval_every: args.eval_every,
        eval_batches: args.eval_batches,
        output_dir: args.output_dir.clone(),
    };

    let mut trainer = Trainer::new(model_config.clone(), trainer_config, Device::Cpu)?;

    // Same templates, different noise and label draws.
    let template_seed = args.seed;
    let train_set = SyntheticDigits::new(
        model_config.num_classes,
        model_config.in_channels,
        model_config.image_size,
        args.train_samples,
        args.noise,
        template_seed,
        args.seed.wrapping_add(1),
    );
    let val_set = SyntheticDigits::new(
        model_config.num_classes,
        model_config.in_channels,
        model_config.image_size,
        args.val_samples,
        args.noise,
        template_seed,
        args.seed.wrapping_add(2),
    );

    let summary = trainer.train(&train_set, Some(&val_set))?;
    if let Some(loss) = summary.last_loss {
        info!(
            step = trainer.global_step,
            epochs = summary.epochs,
            loss = format!("{loss:.4}"),
            "final"
        );
    }
    let eval = trainer.evaluate(&val_set)?;
    info!(
        val_loss = format!("{:.4}", eval.loss),
        val_accuracy = format!("{:.3}", eval.accuracy),
        "final evaluation (binarized weights)"
    );

    let path = trainer.save_final()?;
    eprintln!("Training done. Saved to {}", path.display());
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    use candle_nn::{VarBuilder, VarMap};

    let config = XnorConfig::load(&args.config)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = XnorNet::new(vb, &config)?;
    let controller = BinarizeController::new(&model, &config.binarize)?;

    println!(
        "{:<4} {:<8} {:<10} {:<18} {:>8}  binarized",
        "idx", "name", "kind", "shape", "params"
    );
    for (i, layer) in model.layers().iter().enumerate() {
        let shape = layer
            .weight
            .as_ref()
            .map(|w| format!("{:?}", w.dims()))
            .unwrap_or_else(|| "-".to_string());
        let tracked = controller.targets().iter().any(|t| t.layer_index() == i);
        println!(
            "{:<4} {:<8} {:<10} {:<18} {:>8}  {}",
            i,
            layer.name,
            format!("{:?}", layer.kind),
            shape,
            layer.num_params(),
            if tracked { "yes" } else { "no" }
        );
    }

    let stats = compression_stats(&model, &controller);
    println!();
    println!("Total params:     {}", stats.total_params);
    println!("Binarized params: {}", stats.binarized_params);
    println!("Effective bits:   {:.2}", stats.effective_bits_per_param);
    println!("Compression:      {:.2}x vs f32", stats.compression_ratio_vs_f32);
    Ok(())
}

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!("{} exists; pass --force to overwrite", args.output.display());
    }
    XnorConfig::default().save(&args.output)?;
    eprintln!("Wrote default config to {}", args.output.display());
    Ok(())
}
