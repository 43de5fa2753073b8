use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use localgen::core::tokenizer::{DecodeOptions, EncodeOptions};
use localgen::infra::{extract_vision_tower, pools};
use localgen::model::{vit_config, Architecture, ModelInfo};
use localgen::{BlobReader, Engine, EngineEnv, Image, ImageTokens, RuntimeConfig, TimingInfo, Tristate, WeightRepr};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "localgen")]
#[command(version = "0.5.0")]
#[command(about = "Run compressed transformer and vision-language models locally", long_about = None)]
struct Cli {
    /// Clusters in the thread pool (LOCALGEN_CLUSTERS)
    #[arg(long, global = true)]
    clusters: Option<usize>,

    /// Worker threads per cluster (LOCALGEN_THREADS_PER_CLUSTER)
    #[arg(long, global = true)]
    threads_per_cluster: Option<usize>,

    /// Spin-wait during generation: on, off or auto (LOCALGEN_SPIN)
    #[arg(long, global = true)]
    spin: Option<Tristate>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode an image with the vision tower and write the raw f32 tokens
    ImageTokens {
        #[arg(long)]
        tokenizer: PathBuf,
        #[arg(long)]
        weights: PathBuf,
        /// Binary PPM (P6) image
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "paligemma-224")]
        model: Architecture,
        #[arg(long, default_value = "f32")]
        weight_type: WeightRepr,
    },
    /// Copy only the vision-tower tensors into a new weight container
    ExtractVit {
        #[arg(long)]
        weights: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "paligemma-224")]
        model: Architecture,
    },
    /// Generate text from a prompt
    Generate {
        #[arg(long)]
        tokenizer: PathBuf,
        #[arg(long)]
        weights: PathBuf,
        #[arg(long)]
        model: Architecture,
        #[arg(long, default_value = "f32")]
        weight_type: WeightRepr,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "128")]
        max_tokens: usize,
        #[arg(long, default_value = "1.0")]
        temperature: f32,
        #[arg(long, default_value = "1")]
        top_k: usize,
        #[arg(long, default_value = "42")]
        seed: u64,
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },
    /// List the entries of a weight container
    Inspect {
        #[arg(long)]
        weights: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = EngineEnv::from_env()
        .context("reading LOCALGEN_* environment")
        .and_then(|env| run(cli, env));

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli, mut env: EngineEnv) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&env.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Some(clusters) = cli.clusters {
        env.clusters = clusters;
    }
    if let Some(threads) = cli.threads_per_cluster {
        env.threads_per_cluster = threads;
    }
    if let Some(spin) = cli.spin {
        env.spin = spin;
    }

    match cli.command {
        Commands::ImageTokens {
            tokenizer,
            weights,
            image,
            output,
            model,
            weight_type,
        } => image_tokens(&env, &tokenizer, &weights, &image, &output, ModelInfo::new(model, weight_type)),
        Commands::ExtractVit { weights, output, model } => extract_vit(&env, &weights, &output, model),
        Commands::Generate {
            tokenizer,
            weights,
            model,
            weight_type,
            prompt,
            max_tokens,
            temperature,
            top_k,
            seed,
            verbose,
        } => {
            require_file("tokenizer", &tokenizer)?;
            require_file("weights", &weights)?;
            let engine = Engine::new(&tokenizer, &weights, ModelInfo::new(model, weight_type), global_pools(&env)?)?;
            let tokenizer = engine.tokenizer();
            let prompt = tokenizer.encode_with_options(&prompt, &EncodeOptions::new().with_bos())?;

            let mut stdout = std::io::stdout();
            let mut runtime = RuntimeConfig::new(seed)
                .max_generated_tokens(max_tokens)
                .temperature(temperature)
                .top_k(top_k)
                .eos_id(tokenizer.eos_token())
                .verbosity(verbose)
                .use_spinning(env.spin)
                .stream(|_, _, token, _| {
                    if let Ok(piece) = tokenizer.decode_with_options(&[token], &DecodeOptions::new().skip_special()) {
                        let _ = write!(stdout, "{piece}");
                        let _ = stdout.flush();
                    }
                    true
                });
            let mut cache = engine.new_cache();
            let mut timing = TimingInfo::default();
            engine.generate(&mut runtime, &prompt, 0, 0, &mut cache, &mut timing)?;
            println!();
            tracing::info!(
                prefill_tok_s = timing.prefill_tokens_per_sec(),
                decode_tok_s = timing.generate_tokens_per_sec(),
                tokens = timing.generated_tokens,
                "done"
            );
            Ok(())
        }
        Commands::Inspect { weights } => {
            require_file("weights", &weights)?;
            let reader = BlobReader::open(&weights)?;
            println!("{} entries in {}", reader.len(), weights.display());
            for &key in reader.keys() {
                println!("{:<18} {:>12}", key.to_string(), reader.blob_size(key).unwrap_or(0));
            }
            Ok(())
        }
    }
}

fn global_pools(env: &EngineEnv) -> Result<Arc<pools::NestedPools>> {
    Ok(pools::init_global(env.clusters, env.threads_per_cluster)?)
}

fn require_file(what: &str, path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("{what} file {} does not exist or is not readable", path.display());
    }
    Ok(())
}

fn image_tokens(
    env: &EngineEnv,
    tokenizer: &Path,
    weights: &Path,
    image: &Path,
    output: &Path,
    info: ModelInfo,
) -> Result<()> {
    require_file("tokenizer", tokenizer)?;
    require_file("weights", weights)?;
    require_file("image", image)?;
    let vit = vit_config(info.model)
        .with_context(|| format!("model {} has no vision tower", info.model))?;

    let engine = Engine::new(tokenizer, weights, info, global_pools(env)?)?;
    let image = Image::read_ppm(image)?.resize(vit.image_size, vit.image_size);
    let mut tokens = ImageTokens::for_config(&engine.model_config());
    let runtime = RuntimeConfig::new(0).use_spinning(env.spin).verbosity(1);
    engine.generate_image_tokens(&runtime, &image, &mut tokens, &mut TimingInfo::default())?;

    std::fs::write(output, tokens.as_bytes()).with_context(|| format!("writing {}", output.display()))?;
    tracing::info!(
        output = %output.display(),
        rows = tokens.rows(),
        cols = tokens.cols(),
        "wrote image tokens"
    );
    Ok(())
}

fn extract_vit(env: &EngineEnv, weights: &Path, output: &Path, model: Architecture) -> Result<()> {
    require_file("weights", weights)?;
    if vit_config(model).is_none() {
        bail!("model {model} has no vision tower");
    }
    let pools = global_pools(env)?;
    let count = extract_vision_tower(weights, model, &pools, output)?;
    tracing::info!(entries = count, output = %output.display(), "extracted vision tower");
    Ok(())
}
