/*
cargo run \
    --manifest-path a_data/reviews_dl/Cargo.toml \
    --release -- \
    --out-dir data_2023 \
    --num-samples 1000
*/

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use hf_hub::{api::tokio::ApiBuilder, Repo, RepoType};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde_json::Value;
use std::fs::{create_dir_all, File};
use std::path::PathBuf;

// Short key -> official 2023 category name in the dataset repo
static CATEGORY_MAP: phf::Map<&'static str, &'static str> = phf::phf_map! {
    // Spec / fact driven
    "Cell_Phones" => "Cell_Phones_and_Accessories",
    "Automotive"  => "Automotive",
    "Tools"       => "Tools_and_Home_Improvement",

    // Review / subjective driven
    "Fashion" => "Clothing_Shoes_and_Jewelry",
    "Beauty"  => "All_Beauty",
    "Movies"  => "Movies_and_TV",
};

const REPO_ID: &str = "McAuley-Lab/Amazon-Reviews-2023";

// Columns kept in the per-category CSVs
const REVIEW_COLUMNS: &[&str] = &[
    "rating", "title", "text", "images", "asin", "parent_asin",
    "user_id", "timestamp", "helpful_vote", "verified_purchase",
];
const META_COLUMNS: &[&str] = &[
    "main_category", "title", "average_rating", "rating_number", "features",
    "description", "price", "images", "videos", "store", "categories",
    "details", "parent_asin",
];

// command-line args
#[derive(Parser, Debug)]
#[command(version, about = "Stream Amazon Reviews 2023 categories from the HF hub into per-category CSVs")]
struct Opts {
    // Destination directory, one subdirectory per category key
    #[arg(long, default_value = "data_2023")]
    out_dir: PathBuf,

    // Rows to stream per file (reviews and metadata alike)
    #[arg(long, default_value_t = 1000)]
    num_samples: usize,

    // HF access token (anonymous works for this public dataset)
    #[arg(long, env = "HF_TOKEN")]
    token: Option<String>,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    // logging setup
    create_dir_all(&opts.log_dir)?;
    let ts = Local::now().format("%Y%m%d_%H%M%S");
    let log_path = opts.log_dir.join(format!("download_reviews_{ts}.log"));
    simplelog::WriteLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        File::create(&log_path)?,
    )?;
    info!("Starting dataset download to {}", opts.out_dir.display());

    // list the dataset repo once, then probe candidate paths against it
    let api = ApiBuilder::new().with_token(opts.token.clone()).build()?;
    let repo = Repo::with_revision(REPO_ID.to_string(), RepoType::Dataset, "main".to_string());
    let handle = api.repo(repo);
    let repo_files: Vec<String> = handle
        .info()
        .await
        .context("failed to list dataset repo files")?
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .collect();
    info!("Dataset repo lists {} files", repo_files.len());

    let client = reqwest::Client::new();

    let bar = ProgressBar::new(CATEGORY_MAP.len() as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )
        .unwrap(),
    );

    // category loop
    for (key, hf_category) in CATEGORY_MAP.entries() {
        println!("Processing category: {key}");

        let review_file = find_review_file(&repo_files, hf_category);
        let meta_file = find_meta_file(&repo_files, hf_category);

        let Some(review_file) = review_file else {
            warn!("No review file found for {hf_category}, skipping");
            eprintln!("[warn] cannot find review file for {hf_category}");
            bar.inc(1);
            continue;
        };

        let category_dir = opts.out_dir.join(key);
        create_dir_all(&category_dir)?;

        let streamed = stream_jsonl(&client, &review_file, opts.num_samples).await;
        let Some(reviews) = rows_or_skip(key, &review_file, streamed) else {
            bar.inc(1);
            continue;
        };
        let review_path = category_dir.join(format!("{key}_reviews.csv"));
        write_csv(&review_path, REVIEW_COLUMNS, &reviews)?;
        info!("{key}: wrote {} reviews to {}", reviews.len(), review_path.display());
        println!("  -> saved {} reviews to {}", reviews.len(), review_path.display());

        if let Some(meta_file) = meta_file {
            let streamed = stream_jsonl(&client, &meta_file, opts.num_samples).await;
            if let Some(meta) = rows_or_skip(key, &meta_file, streamed) {
                if !meta.is_empty() {
                    let meta_path = category_dir.join(format!("{key}_meta.csv"));
                    write_csv(&meta_path, META_COLUMNS, &meta)?;
                    info!("{key}: wrote {} meta rows to {}", meta.len(), meta_path.display());
                    println!("  -> saved {} meta rows to {}", meta.len(), meta_path.display());
                }
            }
        } else {
            warn!("No metadata file found for {hf_category}");
        }

        bar.inc(1);
    }
    bar.finish_with_message("done");

    println!("Output written to {}", opts.out_dir.display());
    Ok(())
}

// The repo layout has shifted between releases, so probe a few known paths.
fn find_review_file(repo_files: &[String], hf_category: &str) -> Option<String> {
    let candidates = [
        format!("raw/review_categories/{hf_category}.jsonl"),
        format!("raw/review_categories/{hf_category}.jsonl.gz"),
        format!("raw/review/{hf_category}.jsonl"),
    ];
    pick_candidate(repo_files, &candidates)
}

fn find_meta_file(repo_files: &[String], hf_category: &str) -> Option<String> {
    let candidates = [
        format!("raw/meta_categories/meta_{hf_category}.jsonl"),
        format!("raw/meta_categories/{hf_category}.jsonl"),
        format!("raw/meta/meta_{hf_category}.jsonl"),
    ];
    pick_candidate(repo_files, &candidates)
}

fn pick_candidate(repo_files: &[String], candidates: &[String]) -> Option<String> {
    for cand in candidates {
        if repo_files.iter().any(|f| f == cand) {
            if cand.ends_with(".gz") {
                // gz variants exist in older revisions; the plain .jsonl is
                // published for 2023 and is the only one we stream
                warn!("{cand} is gzipped, skipping in favour of plain JSONL");
                continue;
            }
            return Some(cand.clone());
        }
    }
    None
}

// A failed stream costs that file only; the remaining categories still run.
fn rows_or_skip(key: &str, file_path: &str, result: Result<Vec<Value>>) -> Option<Vec<Value>> {
    match result {
        Ok(rows) => Some(rows),
        Err(e) => {
            warn!("{key}: error reading {file_path}: {e:#}");
            eprintln!("[warn] {key}: error reading {file_path}: {e:#}");
            None
        }
    }
}

// Stream a JSONL file from the hub, stopping after `limit` parsed rows.
// Bad lines are skipped, not fatal.
async fn stream_jsonl(
    client: &reqwest::Client,
    file_path: &str,
    limit: usize,
) -> Result<Vec<Value>> {
    let url = format!("https://huggingface.co/datasets/{REPO_ID}/resolve/main/{file_path}");
    println!("  streaming first {limit} rows from {file_path}...");

    let mut resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("request for {file_path} failed"))?;
    if !resp.status().is_success() {
        return Err(anyhow!("{} — {}", resp.status(), url));
    }

    let mut rows: Vec<Value> = Vec::with_capacity(limit);
    let mut buf: Vec<u8> = Vec::new();
    let mut skipped = 0usize;

    'outer: while let Some(chunk) = resp.chunk().await? {
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Value>(line) {
                Ok(v) => rows.push(v),
                Err(e) => {
                    skipped += 1;
                    warn!("{file_path}: skipping unparseable line: {e}");
                }
            }
            if rows.len() >= limit {
                break 'outer;
            }
        }
    }

    // a trailing row without a newline still counts
    if rows.len() < limit && !buf.is_empty() {
        if let Ok(v) = serde_json::from_slice::<Value>(&buf) {
            rows.push(v);
        }
    }

    if skipped > 0 {
        warn!("{file_path}: skipped {skipped} unparseable lines");
    }
    Ok(rows)
}

// Fixed column set; nested values land in their cell as compact JSON.
fn write_csv(path: &PathBuf, columns: &[&str], rows: &[Value]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    wtr.write_record(columns)?;
    for row in rows {
        let record: Vec<String> = columns.iter().map(|c| cell(row, c)).collect();
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

fn cell(row: &Value, column: &str) -> String {
    match row.get(column) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_stream_skips_the_file_instead_of_aborting() {
        let err: Result<Vec<Value>> = Err(anyhow!("503 Service Unavailable"));
        assert!(rows_or_skip("Movies", "raw/review_categories/Movies_and_TV.jsonl", err).is_none());

        let rows = vec![json!({ "rating": 5.0, "title": "great" })];
        assert_eq!(
            rows_or_skip("Movies", "raw/review_categories/Movies_and_TV.jsonl", Ok(rows.clone())),
            Some(rows)
        );
    }
}
