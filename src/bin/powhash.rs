use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hybrid_pow::ethash::{find_epoch_number, EpochParams};
use hybrid_pow::pow::seed::{epoch_seed, SeedChain};
use hybrid_pow::pow::{hex32_strict, U256};
use hybrid_pow::randomx::RxBackend;
use hybrid_pow::{
    epoch_number, less_equal, metrics, seed_height, target_from_difficulty, PowAlgorithm, PowConfig,
    PowHasher, RxBackendKind, SeedHash,
};

#[derive(Parser, Debug)]
#[command(name = "powhash", version, about = "Hybrid Ethash / RandomX PoW helper")]
struct Cli {
    /// TOML config file (env overrides still apply)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use tiny devnet epoch sizing instead of mainnet
    #[arg(long, global = true, default_value_t = false)]
    devnet: bool,

    /// Print Prometheus metrics after the command
    #[arg(long, global = true, default_value_t = false)]
    metrics: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute the PoW digest for a header at a height
    Hash {
        #[arg(long)]
        height: u64,

        /// 32-byte header hash (hex)
        #[arg(long)]
        header: String,

        #[arg(long, default_value_t = 0)]
        nonce: u64,

        /// Hash of the block at the seed height (hex); required for odd heights
        #[arg(long)]
        seed: Option<String>,
    },

    /// Compute the digest and compare it against a target
    Check {
        #[arg(long)]
        height: u64,

        #[arg(long)]
        header: String,

        #[arg(long, default_value_t = 0)]
        nonce: u64,

        #[arg(long)]
        seed: Option<String>,

        /// Big-endian 32-byte target (hex)
        #[arg(long, conflicts_with = "difficulty")]
        target: Option<String>,

        /// Scalar difficulty, converted to a target
        #[arg(long)]
        difficulty: Option<u64>,
    },

    /// Show the seed height and Ethash epoch for a height
    SeedHeight { height: u64 },

    /// Canonical Ethash seed for an epoch, or the epoch of a seed
    EpochSeed {
        #[arg(long, required_unless_present = "find")]
        epoch: Option<u64>,

        /// Reverse lookup: seed hex
        #[arg(long)]
        find: Option<String>,
    },

    /// Print the resolved configuration
    Config,
}

fn init_tracing() {
    // HYBRID_POW_LOG, then RUST_LOG, then info
    let filter = std::env::var("HYBRID_POW_LOG")
        .unwrap_or_else(|_| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_seed(height: u64, seed: Option<&str>) -> Result<SeedHash> {
    match (PowAlgorithm::for_height(height), seed) {
        (PowAlgorithm::Ethash, _) => Ok(SeedHash::ZERO),
        (PowAlgorithm::RandomX, Some(s)) => Ok(SeedHash::from_hex(s)?),
        (PowAlgorithm::RandomX, None) => bail!(
            "height {height} uses randomx: pass --seed with the hash of block {}",
            seed_height(height)
        ),
    }
}

fn digest<B: RxBackend>(
    hasher: &PowHasher<B>,
    height: u64,
    header: &str,
    nonce: u64,
    seed: Option<&str>,
) -> Result<(U256, serde_json::Value)> {
    let header = hex32_strict("header", header)?;
    let seed = parse_seed(height, seed)?;
    let algorithm = PowAlgorithm::for_height(height);
    let out = hasher
        .pow_hash(height, &header, nonce, |_| seed)
        .with_context(|| format!("pow hash at height {height}"))?;

    let mut report = json!({
        "height": height,
        "algorithm": algorithm,
        "digest": hex::encode(out),
    });
    match algorithm {
        PowAlgorithm::Ethash => {
            report["epoch"] = json!(hasher.epochs().params().epoch_number(height));
            report["nonce"] = json!(nonce);
        }
        PowAlgorithm::RandomX => {
            report["seed_height"] = json!(seed_height(height));
            report["seed"] = json!(seed.to_hex());
        }
    }
    Ok((out, report))
}

/// Runs a hashing command. `Ok(false)` means the digest missed its target.
fn run<B: RxBackend>(cmd: &Commands, hasher: &PowHasher<B>) -> Result<bool> {
    match cmd {
        Commands::Hash {
            height,
            header,
            nonce,
            seed,
        } => {
            let (_, report) = digest(hasher, *height, header, *nonce, seed.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Check {
            height,
            header,
            nonce,
            seed,
            target,
            difficulty,
        } => {
            let target = match (target, difficulty) {
                (Some(t), _) => hex32_strict("target", t)?,
                (None, Some(d)) => target_from_difficulty(*d),
                (None, None) => bail!("pass --target or --difficulty"),
            };
            let (out, mut report) = digest(hasher, *height, header, *nonce, seed.as_deref())?;
            let valid = less_equal(&out, &target);
            report["target"] = json!(hex::encode(target));
            report["valid"] = json!(valid);
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(valid);
        }
        other => bail!("{other:?} does not hash"),
    }
    Ok(true)
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let mut cfg = PowConfig::resolve(cli.config.as_deref()).context("loading config")?;
    if cli.devnet {
        cfg.ethash.sizing = EpochParams::devnet();
    }

    let mut passed = true;
    match &cli.cmd {
        Commands::SeedHeight { height } => {
            let report = json!({
                "height": height,
                "algorithm": PowAlgorithm::for_height(*height),
                "seed_height": seed_height(*height),
                "epoch": epoch_number(*height),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::EpochSeed { epoch, find } => {
            if let Some(s) = find {
                let seed = SeedHash::from_hex(s)?;
                match find_epoch_number(&SeedChain::new(), &seed) {
                    Some(e) => println!("{}", json!({ "seed": seed.to_hex(), "epoch": e })),
                    None => bail!("seed {seed} is not a known epoch seed"),
                }
            } else if let Some(e) = epoch {
                println!("{}", json!({ "epoch": e, "seed": epoch_seed(*e).to_hex() }));
            }
        }
        Commands::Config => {
            print!("{}", cfg.to_toml_string()?);
        }
        cmd => {
            info!(backend = %cfg.randomx.backend, devnet = cli.devnet, "building hasher");
            match cfg.randomx.backend {
                RxBackendKind::Soft => passed = run(cmd, &PowHasher::from_config(&cfg)?)?,
                #[cfg(feature = "randomx")]
                RxBackendKind::Native => {
                    passed = run(
                        cmd,
                        &PowHasher::with_backend(&cfg, hybrid_pow::randomx::NativeBackend::new())?,
                    )?
                }
                #[cfg(not(feature = "randomx"))]
                RxBackendKind::Native => bail!("the native backend needs the `randomx` feature"),
            }
        }
    }

    if cli.metrics {
        print!("{}", metrics::gather_text());
    }
    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
