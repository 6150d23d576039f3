/*
First run builds batch_input.jsonl from Fake_data.json and submits it as an
OpenAI batch job; later runs poll the job and write the returned specs.

cargo run \
    --manifest-path b_specgen/Cargo.toml \
    --release -- \
    --fake-data Fake_data.json \
    --out-dir Base_Specs
*/

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::{self, create_dir_all, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

const OPENAI_API: &str = "https://api.openai.com/v1";
const MODEL: &str = "gpt-4o";

const DEFAULT_SYSTEM_TEMPLATE: &str = "You are an expert in {DOMAIN}. Output JSON only.";

// domain -> details; only the category list matters here
#[derive(Debug, Deserialize)]
struct DomainDetails {
    #[serde(rename = "Product Category", default)]
    product_category: Vec<String>,
}

// persisted between the submit run and the collect run
#[derive(Debug, Serialize, Deserialize)]
struct BatchInfo {
    batch_id: String,
    file_id: String,
    status: String,
    created_at: String,
}

// command-line args
#[derive(Parser, Debug)]
#[command(version, about = "Submit per-category spec prompts as an OpenAI batch job and collect the results")]
struct Cli {
    // Domain/category input map
    #[arg(long, default_value = "Fake_data.json")]
    fake_data: PathBuf,

    // Prompt template with {DOMAIN} and {CATEGORY} placeholders
    #[arg(long, default_value = "system_prompt.txt")]
    system_prompt: PathBuf,

    // Where the parsed spec JSONs land, one subdirectory per domain
    #[arg(long, default_value = "Base_Specs")]
    out_dir: PathBuf,

    #[arg(long, default_value = "batch_info.json")]
    batch_info: PathBuf,

    #[arg(long, default_value = "batch_input.jsonl")]
    batch_input: PathBuf,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // logging setup
    create_dir_all(&cli.log_dir)?;
    let ts = Local::now().format("%Y%m%d_%H%M%S");
    let log_path = cli.log_dir.join(format!("generate_specs_{ts}.log"));
    simplelog::WriteLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        File::create(&log_path)?,
    )?;

    let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY not set")?;
    let client = reqwest::Client::new();

    if cli.batch_info.exists() {
        println!("Found existing batch job info.");
        check_and_retrieve(&client, &api_key, &cli).await
    } else {
        println!("Starting new batch process...");
        submit_new_batch(&client, &api_key, &cli).await
    }
}

// submit phase

async fn submit_new_batch(client: &reqwest::Client, api_key: &str, cli: &Cli) -> Result<()> {
    let raw = fs::read_to_string(&cli.fake_data)
        .with_context(|| format!("failed to read {}", cli.fake_data.display()))?;
    // BTreeMap keeps the task order stable across runs
    let fake_data: BTreeMap<String, DomainDetails> = serde_json::from_str(&raw)?;

    let system_template = load_system_template(&cli.system_prompt);

    let count = create_batch_file(&cli.batch_input, &fake_data, &system_template)?;
    if count == 0 {
        println!("No tasks to process.");
        return Ok(());
    }
    println!("Created batch input file with {count} tasks: {}", cli.batch_input.display());
    info!("Built {count} batch tasks");

    // 1. upload the JSONL
    let file_id = upload_batch_file(client, api_key, &cli.batch_input).await?;
    println!("Uploaded file ID: {file_id}");

    // 2. create the batch
    let batch_id = create_batch(client, api_key, &file_id).await?;
    println!("Batch job created! ID: {batch_id}");
    println!("  (completion window is 24h, small batches usually finish sooner)");
    info!("Submitted batch {batch_id} (input file {file_id})");

    let batch_info = BatchInfo {
        batch_id,
        file_id,
        status: "submitted".to_string(),
        created_at: Local::now().to_rfc3339(),
    };
    fs::write(&cli.batch_info, serde_json::to_string_pretty(&batch_info)?)?;
    Ok(())
}

fn load_system_template(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => {
            warn!("{} not found, using built-in template", path.display());
            DEFAULT_SYSTEM_TEMPLATE.to_string()
        }
    }
}

// One chat-completions task per (domain, category) pair; the pair is
// round-tripped through the custom id.
fn create_batch_file(
    out_path: &Path,
    fake_data: &BTreeMap<String, DomainDetails>,
    system_template: &str,
) -> Result<usize> {
    let mut out = File::create(out_path)
        .with_context(|| format!("cannot create {}", out_path.display()))?;
    let mut count = 0usize;

    for (domain, details) in fake_data {
        for category in &details.product_category {
            let prompt_content = system_template
                .replace("{DOMAIN}", domain)
                .replace("{CATEGORY}", category);

            let task = json!({
                "custom_id": custom_id(domain, category),
                "method": "POST",
                "url": "/v1/chat/completions",
                "body": {
                    "model": MODEL,
                    "messages": [
                        { "role": "system", "content": "You are a JSON generator. Output only valid JSON." },
                        { "role": "user", "content": prompt_content }
                    ],
                    "temperature": 0.7
                }
            });
            writeln!(out, "{task}")?;
            count += 1;
        }
    }
    Ok(count)
}

fn custom_id(domain: &str, category: &str) -> String {
    format!("{domain}::{category}")
}

fn split_custom_id(id: &str) -> Result<(&str, &str)> {
    id.split_once("::")
        .ok_or_else(|| anyhow!("malformed custom_id {id}"))
}

async fn upload_batch_file(
    client: &reqwest::Client,
    api_key: &str,
    path: &Path,
) -> Result<String> {
    let bytes = fs::read(path)?;
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(path.file_name().unwrap_or_default().to_string_lossy().into_owned())
        .mime_str("application/jsonl")?;
    let form = reqwest::multipart::Form::new()
        .text("purpose", "batch")
        .part("file", part);

    let resp = client
        .post(format!("{OPENAI_API}/files"))
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .await?;
    let body = ok_json(resp).await?;
    body["id"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("file upload response missing id"))
}

async fn create_batch(
    client: &reqwest::Client,
    api_key: &str,
    input_file_id: &str,
) -> Result<String> {
    let resp = client
        .post(format!("{OPENAI_API}/batches"))
        .bearer_auth(api_key)
        .json(&json!({
            "input_file_id": input_file_id,
            "endpoint": "/v1/chat/completions",
            "completion_window": "24h"
        }))
        .send()
        .await?;
    let body = ok_json(resp).await?;
    body["id"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("batch create response missing id"))
}

async fn ok_json(resp: reqwest::Response) -> Result<Value> {
    if !resp.status().is_success() {
        let status = resp.status();
        let msg = resp.text().await?;
        return Err(anyhow!("{} — {}", status, msg));
    }
    Ok(resp.json().await?)
}

// collect phase

async fn check_and_retrieve(client: &reqwest::Client, api_key: &str, cli: &Cli) -> Result<()> {
    let raw = fs::read_to_string(&cli.batch_info)
        .with_context(|| format!("failed to read {}", cli.batch_info.display()))?;
    let batch_info: BatchInfo = serde_json::from_str(&raw)?;

    let resp = client
        .get(format!("{OPENAI_API}/batches/{}", batch_info.batch_id))
        .bearer_auth(api_key)
        .send()
        .await?;
    let batch = ok_json(resp).await?;
    let status = batch["status"].as_str().unwrap_or("unknown");
    println!("Batch status: {status}");
    info!("Batch {} status {status}", batch_info.batch_id);

    match status {
        "completed" => {
            let output_file_id = batch["output_file_id"]
                .as_str()
                .ok_or_else(|| anyhow!("completed batch has no output_file_id"))?;
            println!("Downloading results...");
            let content = download_file_content(client, api_key, output_file_id).await?;

            save_results(&content, &cli.out_dir)?;
            println!("All files saved successfully!");

            // done, drop the state file so the next run starts fresh
            fs::remove_file(&cli.batch_info)?;
        }
        "failed" | "expired" | "cancelled" => {
            eprintln!("Batch {status}: {}", batch["errors"]);
        }
        _ => {
            println!("Batch is still processing. Please try again later.");
        }
    }
    Ok(())
}

async fn download_file_content(
    client: &reqwest::Client,
    api_key: &str,
    file_id: &str,
) -> Result<String> {
    let resp = client
        .get(format!("{OPENAI_API}/files/{file_id}/content"))
        .bearer_auth(api_key)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(anyhow!("{} — {}", resp.status(), resp.text().await?));
    }
    Ok(resp.text().await?)
}

// Parse the result JSONL and write one spec file per (domain, category).
// Bad lines are logged and skipped so one malformed answer cannot sink the
// whole batch.
fn save_results(result_content: &str, out_dir: &Path) -> Result<()> {
    let lines: Vec<&str> = result_content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();

    let bar = ProgressBar::new(lines.len() as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )
        .unwrap(),
    );

    for line in lines {
        let res: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("skipping unparseable result line: {e}");
                bar.inc(1);
                continue;
            }
        };
        let Some(id) = res["custom_id"].as_str() else {
            warn!("result line without custom_id");
            bar.inc(1);
            continue;
        };
        let (domain, category) = match split_custom_id(id) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("{e}, skipping");
                bar.inc(1);
                continue;
            }
        };

        let response_body = &res["response"]["body"];
        let Some(content) = response_body["choices"][0]["message"]["content"].as_str() else {
            warn!("error in response for {id}");
            eprintln!("[warn] error in response for {id}");
            bar.inc(1);
            continue;
        };

        match serde_json::from_str::<Value>(&strip_code_fences(content)) {
            Ok(spec_data) => {
                let domain_dir = out_dir.join(domain);
                create_dir_all(&domain_dir)?;
                let filename = format!("{}_base_spec.json", category.replace(' ', "_"));
                let filepath = domain_dir.join(filename);
                fs::write(&filepath, serde_json::to_string_pretty(&spec_data)?)?;
                info!("saved {}", filepath.display());
            }
            Err(e) => {
                warn!("JSON decode error for {id}: {e}");
                eprintln!("[warn] JSON decode error for {id}");
            }
        }
        bar.inc(1);
    }
    bar.finish_with_message("done");
    Ok(())
}

// Models like to wrap JSON in Markdown fences even when told not to.
fn strip_code_fences(content: &str) -> String {
    content
        .replace("```json", "")
        .replace("```", "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_id_round_trips() {
        let id = custom_id("Electronics", "Wireless Earbuds");
        assert_eq!(
            split_custom_id(&id).unwrap(),
            ("Electronics", "Wireless Earbuds")
        );
    }

    #[test]
    fn custom_id_splits_on_first_separator_only() {
        assert_eq!(
            split_custom_id("Home::Kitchen::Gadgets").unwrap(),
            ("Home", "Kitchen::Gadgets")
        );
        assert!(split_custom_id("no-separator").is_err());
    }

    #[test]
    fn malformed_custom_id_skips_that_line_only() {
        let dir = tempfile::tempdir().unwrap();
        let bad = json!({
            "custom_id": "no-separator",
            "response": { "body": { "choices": [
                { "message": { "content": "{}" } }
            ] } }
        });
        let good = json!({
            "custom_id": "Electronics::Wireless Earbuds",
            "response": { "body": { "choices": [
                { "message": { "content": "```json\n{\"spec\": 1}\n```" } }
            ] } }
        });
        // the bad line comes first so the pass has to survive it
        let content = format!("{bad}\n{good}\n");

        save_results(&content, dir.path()).unwrap();

        let written = dir
            .path()
            .join("Electronics")
            .join("Wireless_Earbuds_base_spec.json");
        let spec: Value = serde_json::from_str(&fs::read_to_string(written).unwrap()).unwrap();
        assert_eq!(spec["spec"], 1);
    }

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(
            strip_code_fences("```json\n{\"a\": 1}\n```"),
            "{\"a\": 1}"
        );
        assert_eq!(strip_code_fences("{\"a\": 1}"), "{\"a\": 1}");
    }
}
