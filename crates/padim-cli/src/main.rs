//! padim CLI — train and apply PaDiM anomaly detection models.

use clap::{Args, Parser, Subcommand, ValueEnum};
use padim::{
    BackboneArch, FeatureDumpExtractor, FeatureExtractor, GaussianModel, InferenceOutput, Padim,
    PadimConfig, PooledPyramid,
};
use std::path::{Path, PathBuf};
use std::time::Instant;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "bmp"];

#[derive(Parser)]
#[command(name = "padim")]
#[command(about = "Patch distribution modeling: per-location Gaussian anomaly detection")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model on a directory of normal images.
    Train(CliTrainArgs),

    /// Score images against a model.
    Infer(CliInferArgs),

    /// Print the header of a saved model.
    ModelInfo {
        /// Model file written by `padim train`.
        #[arg(long)]
        model: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ArchArg {
    #[value(name = "resnet18")]
    Resnet18,
    #[value(name = "wide_resnet50_2")]
    WideResnet50_2,
    #[value(name = "pooled")]
    Pooled,
}

impl ArchArg {
    fn to_core(self) -> BackboneArch {
        match self {
            Self::Resnet18 => BackboneArch::Resnet18,
            Self::WideResnet50_2 => BackboneArch::WideResnet50_2,
            Self::Pooled => BackboneArch::Pooled,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct CliCommonArgs {
    /// Backbone whose layers feed the embedding.
    #[arg(long, value_enum)]
    arch: Option<ArchArg>,

    /// JSON config file; flags given on the command line take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Images per extractor call.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seed for channel selection and augmentation.
    #[arg(long)]
    seed: Option<u64>,

    /// Random rotation + random crop instead of the center crop.
    #[arg(long)]
    aug: bool,

    /// Augmentation passes over the image set.
    #[arg(long)]
    aug_laps: Option<usize>,

    /// Directory of `<stem>.safetensors` backbone activations.
    #[arg(long)]
    features_dir: Option<PathBuf>,

    /// Time repeated inference runs.
    #[arg(long)]
    benchmark: bool,

    /// Number of timed runs in benchmark mode.
    #[arg(long, default_value_t = 5)]
    benchmark_count: usize,
}

#[derive(Debug, Clone, Args)]
struct CliTrainArgs {
    /// Directory of normal training images.
    #[arg(long)]
    train_dir: PathBuf,

    /// Model output path (default: `<train dir name>.safetensors`).
    #[arg(long)]
    out: Option<PathBuf>,

    #[command(flatten)]
    common: CliCommonArgs,
}

#[derive(Debug, Clone, Args)]
struct CliInferArgs {
    /// Test images or directories of images.
    #[arg(long, num_args = 1.., required = true)]
    input: Vec<PathBuf>,

    /// Trained model file.
    #[arg(long, conflicts_with = "train_dir")]
    model: Option<PathBuf>,

    /// Train on this directory first; the model is also saved as
    /// `<train dir name>.safetensors`.
    #[arg(long)]
    train_dir: Option<PathBuf>,

    /// Directory of `<stem>_mask.png` ground-truth masks.
    #[arg(long)]
    gt_dir: Option<PathBuf>,

    /// Fixed threshold on normalized scores; searched for F1 when omitted.
    #[arg(long)]
    threshold: Option<f32>,

    /// Where to write result panels (directory, or name template with extension).
    #[arg(long)]
    savepath: Option<PathBuf>,

    /// Path to write the inference report (JSON).
    #[arg(long)]
    report: Option<PathBuf>,

    #[command(flatten)]
    common: CliCommonArgs,
}

fn build_config(common: &CliCommonArgs, threshold: Option<f32>) -> CliResult<PadimConfig> {
    let mut config = match &common.config {
        Some(path) => {
            tracing::info!("Loading config: {}", path.display());
            PadimConfig::from_json_file(path)?
        }
        None => PadimConfig::default(),
    };

    if let Some(arch) = common.arch {
        config.arch = arch.to_core();
    }
    if let Some(batch_size) = common.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(seed) = common.seed {
        config.seed = seed;
    }
    if common.aug {
        config.augment.enable = true;
    }
    if let Some(laps) = common.aug_laps {
        config.augment.laps = laps;
    }
    if threshold.is_some() {
        config.scoring.threshold = threshold;
    }

    config.validate()?;
    Ok(config)
}

fn make_extractor(
    common: &CliCommonArgs,
    arch: BackboneArch,
) -> CliResult<Box<dyn FeatureExtractor>> {
    match (&common.features_dir, arch) {
        (Some(dir), _) => {
            tracing::info!("Reading {} features from {}", arch.name(), dir.display());
            Ok(Box::new(FeatureDumpExtractor::new(
                dir.clone(),
                arch.layer_channels(),
            )))
        }
        (None, BackboneArch::Pooled) => Ok(Box::new(PooledPyramid::new())),
        (None, _) => Err(format!(
            "arch {} needs --features-dir with exported activations (or use --arch pooled)",
            arch.name()
        )
        .into()),
    }
}

/// Image files among `inputs`; directories are expanded one level.
fn discover_images(inputs: &[PathBuf]) -> CliResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(input)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image(p))
                .collect();
            found.sort();
            out.extend(found);
        } else {
            out.push(input.clone());
        }
    }
    Ok(out)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e))
}

fn default_model_path(train_dir: &Path) -> PathBuf {
    let name = train_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "padim".to_string());
    PathBuf::from(format!("{}.safetensors", name))
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => run_train(&args),
        Commands::Infer(args) => run_infer(&args),
        Commands::ModelInfo { model } => run_model_info(&model),
    }
}

// ── model-info ─────────────────────────────────────────────────────────

fn run_model_info(path: &Path) -> CliResult<()> {
    let model = GaussianModel::load(path)?;
    let s = model.summary();

    println!("padim model {}", path.display());
    println!("  schema:          {}", s.schema);
    println!("  arch:            {}", s.arch.name());
    println!("  grid:            {}x{}", s.grid[1], s.grid[0]);
    println!("  channels:        {}", s.dim);
    println!("  samples:         {}", s.n_samples);
    println!("  regularization:  {}", s.regularization);
    if let (Some(first), Some(last)) = (model.channel_idx().first(), model.channel_idx().last()) {
        println!("  channel range:   {}..={}", first, last);
    }

    Ok(())
}

// ── train ──────────────────────────────────────────────────────────────

fn fit_and_save(
    config: &PadimConfig,
    common: &CliCommonArgs,
    train_dir: &Path,
    out: &Path,
) -> CliResult<GaussianModel> {
    let train = discover_images(&[train_dir.to_path_buf()])?;
    if train.is_empty() {
        return Err(format!("no images found in {}", train_dir.display()).into());
    }
    tracing::info!("Training on {} images from {}", train.len(), train_dir.display());

    let mut extractor = make_extractor(common, config.arch)?;
    let padim = Padim::with_config(config.clone());
    let start = Instant::now();
    let model = padim.fit(extractor.as_mut(), &train)?;
    tracing::info!("Training finished in {} ms", start.elapsed().as_millis());

    model.save(out)?;
    tracing::info!("Model written to {}", out.display());
    Ok(model)
}

fn run_train(args: &CliTrainArgs) -> CliResult<()> {
    let config = build_config(&args.common, None)?;
    let out = args
        .out
        .clone()
        .unwrap_or_else(|| default_model_path(&args.train_dir));
    fit_and_save(&config, &args.common, &args.train_dir, &out)?;
    Ok(())
}

// ── infer ──────────────────────────────────────────────────────────────

fn obtain_model(args: &CliInferArgs, config: &PadimConfig) -> CliResult<GaussianModel> {
    if let Some(path) = &args.model {
        tracing::info!("Loading model: {}", path.display());
        return Ok(GaussianModel::load(path)?);
    }
    let Some(train_dir) = &args.train_dir else {
        return Err("one of --model or --train-dir is required".into());
    };
    fit_and_save(config, &args.common, train_dir, &default_model_path(train_dir))
}

/// Align the configured arch with the model's.
///
/// An explicit `--arch` that disagrees with the model is an error; an arch
/// that only came from defaults or a config file follows the model.
fn reconcile_arch(
    config: &mut PadimConfig,
    explicit: Option<ArchArg>,
    model: &GaussianModel,
) -> CliResult<()> {
    if model.arch() == config.arch {
        return Ok(());
    }
    if explicit.is_some() {
        return Err(format!(
            "model was trained with {} but --arch {} was requested",
            model.arch().name(),
            config.arch.name()
        )
        .into());
    }
    tracing::warn!(
        "model was trained with {}; overriding configured {}",
        model.arch().name(),
        config.arch.name()
    );
    config.arch = model.arch();
    Ok(())
}

fn run_benchmark(
    padim: &Padim,
    model: &GaussianModel,
    extractor: &mut dyn FeatureExtractor,
    tests: &[PathBuf],
    gt_dir: Option<&Path>,
    count: usize,
) -> CliResult<InferenceOutput> {
    tracing::info!("BENCHMARK mode");
    let mut total_ms = 0u128;
    let mut last = None;
    for i in 0..count.max(1) {
        let start = Instant::now();
        let out = padim.infer(model, extractor, tests, gt_dir)?;
        let ms = start.elapsed().as_millis();
        tracing::info!("\tprocessing time {} ms", ms);
        // First run warms caches.
        if i != 0 {
            total_ms += ms;
        }
        last = Some(out);
    }
    if count > 1 {
        tracing::info!("\taverage time {} ms", total_ms / (count as u128 - 1));
    }
    last.ok_or_else(|| "benchmark produced no run".into())
}

fn run_infer(args: &CliInferArgs) -> CliResult<()> {
    let mut config = build_config(&args.common, args.threshold)?;
    let model = obtain_model(args, &config)?;
    reconcile_arch(&mut config, args.common.arch, &model)?;

    let tests = discover_images(&args.input)?;
    if tests.is_empty() {
        return Err("no input images".into());
    }
    tracing::info!("Scoring {} images", tests.len());

    let mut extractor = make_extractor(&args.common, model.arch())?;
    let padim = Padim::with_config(config);
    let gt_dir = args.gt_dir.as_deref();
    let out = if args.common.benchmark {
        run_benchmark(
            &padim,
            &model,
            extractor.as_mut(),
            &tests,
            gt_dir,
            args.common.benchmark_count,
        )?
    } else {
        padim.infer(&model, extractor.as_mut(), &tests, gt_dir)?
    };

    if let Some(t) = out.report.threshold {
        tracing::info!("Threshold: {:.6}", t);
    }
    if let Some(m) = &out.report.pixel_metrics {
        tracing::info!(
            "Pixel metrics: precision={:.4} recall={:.4} F1={:.4}",
            m.precision,
            m.recall,
            m.f1
        );
    }

    if let Some(report_path) = &args.report {
        let json = serde_json::to_string_pretty(&out.report)?;
        std::fs::write(report_path, &json)?;
        tracing::info!("Report written to {}", report_path.display());
    }

    if let Some(savepath) = &args.savepath {
        let written = padim::render::save_panels(&out, savepath)?;
        tracing::info!("Wrote {} result panels", written.len());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common() -> CliCommonArgs {
        CliCommonArgs {
            arch: None,
            config: None,
            batch_size: None,
            seed: None,
            aug: false,
            aug_laps: None,
            features_dir: None,
            benchmark: false,
            benchmark_count: 5,
        }
    }

    #[test]
    fn flags_override_config_defaults() {
        let mut c = common();
        c.arch = Some(ArchArg::Pooled);
        c.batch_size = Some(4);
        c.aug = true;
        c.aug_laps = Some(3);
        let cfg = build_config(&c, Some(0.4)).expect("config");
        assert_eq!(cfg.arch, BackboneArch::Pooled);
        assert_eq!(cfg.batch_size, 4);
        assert!(cfg.augment.enable);
        assert_eq!(cfg.augment.laps, 3);
        assert_eq!(cfg.scoring.threshold, Some(0.4));
        assert_eq!(cfg.seed, 1024);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let mut c = common();
        c.batch_size = Some(0);
        assert!(build_config(&c, None).is_err());
    }

    #[test]
    fn network_arch_without_features_is_rejected() {
        assert!(make_extractor(&common(), BackboneArch::Resnet18).is_err());
        assert!(make_extractor(&common(), BackboneArch::Pooled).is_ok());
        let mut c = common();
        c.features_dir = Some(PathBuf::from("feats"));
        let ex = make_extractor(&c, BackboneArch::Resnet18).expect("dump extractor");
        assert_eq!(ex.layer_channels(), vec![64, 128, 256]);
    }

    #[test]
    fn discovery_filters_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.png", "a.jpg", "d.JPG", "c.bmp", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }
        let found = discover_images(&[dir.path().to_path_buf()]).expect("discover");
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png", "c.bmp"]);
    }

    #[test]
    fn default_model_path_uses_directory_name() {
        assert_eq!(
            default_model_path(Path::new("/data/bottle/train/good")),
            PathBuf::from("good.safetensors")
        );
    }

    #[test]
    fn cli_parses_infer_arguments() {
        let cli = Cli::try_parse_from([
            "padim",
            "infer",
            "--input",
            "a.png",
            "b.png",
            "--model",
            "m.safetensors",
            "--arch",
            "wide_resnet50_2",
            "--threshold",
            "0.5",
        ])
        .expect("parse");
        match cli.command {
            Commands::Infer(args) => {
                assert_eq!(args.input.len(), 2);
                assert_eq!(args.common.arch, Some(ArchArg::WideResnet50_2));
                assert_eq!(args.threshold, Some(0.5));
            }
            _ => panic!("expected infer"),
        }
    }

    #[test]
    fn model_and_train_dir_conflict() {
        let res = Cli::try_parse_from([
            "padim",
            "infer",
            "--input",
            "a.png",
            "--model",
            "m.safetensors",
            "--train-dir",
            "train",
        ]);
        assert!(res.is_err());
    }

    fn write_textures(dir: &Path, prefix: &str, count: u64) {
        std::fs::create_dir_all(dir).expect("mkdir");
        for i in 0..count {
            let img = image::RgbImage::from_fn(64, 64, |x, y| {
                let base = if (x / 4 + y / 4) % 2 == 0 { 90u8 } else { 150 };
                let jitter = ((x * 7 + y * 13 + i as u32 * 31) % 17) as u8;
                image::Rgb([base + jitter, base + jitter, base + jitter])
            });
            img.save(dir.join(format!("{}_{:03}.png", prefix, i)))
                .expect("save image");
        }
    }

    fn small_common(root: &Path) -> CliCommonArgs {
        let cfg = root.join("config.json");
        std::fs::write(
            &cfg,
            r#"{ "arch": "pooled", "batch_size": 3, "preprocess": { "resize": 64, "crop": 64 } }"#,
        )
        .expect("write config");
        let mut c = common();
        c.config = Some(cfg);
        c
    }

    #[test]
    fn train_then_infer_writes_model_report_and_panels() {
        let root = tempfile::tempdir().expect("tempdir");
        let train_dir = root.path().join("good");
        let test_dir = root.path().join("test");
        write_textures(&train_dir, "good", 6);
        write_textures(&test_dir, "case", 2);

        let model_path = root.path().join("model.safetensors");
        run_train(&CliTrainArgs {
            train_dir: train_dir.clone(),
            out: Some(model_path.clone()),
            common: small_common(root.path()),
        })
        .expect("train");
        assert!(model_path.is_file());
        run_model_info(&model_path).expect("model-info");

        let report_path = root.path().join("report.json");
        let panels = root.path().join("panels");
        run_infer(&CliInferArgs {
            input: vec![test_dir],
            model: Some(model_path),
            train_dir: None,
            gt_dir: None,
            threshold: Some(0.5),
            savepath: Some(panels.clone()),
            report: Some(report_path.clone()),
            common: small_common(root.path()),
        })
        .expect("infer");

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report_path).expect("read report"))
                .expect("parse report");
        assert_eq!(report["schema"], "padim.report.v1");
        assert_eq!(report["images"].as_array().expect("images").len(), 2);
        assert!(panels.join("case_000.png").is_file());
        assert!(panels.join("case_001.png").is_file());
    }

    #[test]
    fn explicit_arch_must_match_model() {
        let root = tempfile::tempdir().expect("tempdir");
        let train_dir = root.path().join("good");
        write_textures(&train_dir, "good", 6);
        let model_path = root.path().join("model.safetensors");
        let model = fit_and_save(
            &build_config(&small_common(root.path()), None).expect("config"),
            &small_common(root.path()),
            &train_dir,
            &model_path,
        )
        .expect("fit");

        let mut config = PadimConfig::for_arch(BackboneArch::Resnet18);
        assert!(reconcile_arch(&mut config, Some(ArchArg::Resnet18), &model).is_err());
        reconcile_arch(&mut config, None, &model).expect("follow model");
        assert_eq!(config.arch, BackboneArch::Pooled);
    }
}
