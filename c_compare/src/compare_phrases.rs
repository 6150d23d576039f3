/*
cargo run \
    --manifest-path c_compare/Cargo.toml \
    --release -- \
    --prefix "The best-selling smartphone this year is the" \
    "Samsung Galaxy S 25" \
    "Apple iPhone 24"
*/

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log::info;
use phrase_prob::gpt2::Gpt2Scorer;
use phrase_prob::{compare_phrases, PhraseScore};
use std::fs::{create_dir_all, File};
use std::path::PathBuf;
use tch::Device;

// command-line args
#[derive(Parser, Debug)]
#[command(version, about = "Compare the GPT-2 log-probability of two candidate phrases under a shared prefix")]
struct Opts {
    // First candidate phrase
    phrase_a: String,

    // Second candidate phrase
    phrase_b: String,

    // Context the phrases are scored after (may be empty)
    #[arg(long, default_value = "")]
    prefix: String,

    // Local directory with config.json + vocab.json + merges.txt + rust_model.ot;
    // defaults to the pretrained GPT-2 hub resources
    #[arg(long)]
    model_path: Option<PathBuf>,

    // Maximum sequence length (tokens)
    #[arg(long, default_value_t = 1024)]
    max_len: usize,

    // Evaluate on GPU if built with CUDA
    #[arg(long, default_value_t = false)]
    cuda: bool,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    // logging setup
    create_dir_all(&opts.log_dir)?;
    let ts = Local::now().format("%Y%m%d_%H%M%S");
    let log_path = opts.log_dir.join(format!("compare_phrases_{ts}.log"));
    simplelog::WriteLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        File::create(&log_path)?,
    )?;

    // Device
    let device = if opts.cuda && tch::Cuda::is_available() {
        Device::Cuda(0)
    } else {
        Device::Cpu
    };

    let scorer = Gpt2Scorer::new(opts.model_path.as_deref(), device, opts.max_len)
        .context("failed to load GPT-2")?;
    info!("Model loaded on {device:?}");

    let prefix_ids = scorer.encode(&opts.prefix);
    let a_ids = scorer.encode(&opts.phrase_a);
    let b_ids = scorer.encode(&opts.phrase_b);
    info!(
        "Token counts: prefix={} a={} b={}",
        prefix_ids.len(),
        a_ids.len(),
        b_ids.len()
    );

    let cmp = compare_phrases(&scorer, &prefix_ids, &a_ids, &b_ids)?;

    print_score("A", &opts.phrase_a, &cmp.first);
    print_score("B", &opts.phrase_b, &cmp.second);

    match cmp.prob_ratio {
        Some(ratio) => {
            println!("A/B probability ratio: {ratio}");
            println!("A advantage (log): {}", cmp.log_prob_diff);
        }
        None => {
            // at least one probability underflowed; the log difference is
            // still exact
            println!(
                "probabilities too small for a ratio, log difference: {}",
                cmp.log_prob_diff
            );
        }
    }
    Ok(())
}

fn print_score(label: &str, phrase: &str, score: &PhraseScore) {
    println!(
        "{label}: {phrase} logprob: {} prob: {}",
        score.log_prob, score.prob
    );
}
