//! Commands that talk to a running API server.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use url::Url;

fn endpoint(api_url: &str, path: &str) -> Result<Url> {
    let base = Url::parse(api_url).with_context(|| format!("Invalid API URL: {}", api_url))?;
    Ok(base.join(path)?)
}

async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        anyhow::bail!("{}: {}", status, message);
    }
    Ok(body)
}

pub async fn trigger(api_url: &str, revision: Option<String>, branch: Option<String>) -> Result<()> {
    let url = endpoint(api_url, "/api/v1/runs")?;
    let response = reqwest::Client::new()
        .post(url)
        .json(&json!({ "revision": revision, "branch": branch }))
        .send()
        .await
        .context("Failed to reach the API server")?;
    let body = read_json(response).await?;

    let run_id = body["run_id"].as_str().unwrap_or_default();
    match body["outcome"].as_str() {
        Some("coalesced") => println!("Revision already queued as run {}", run_id),
        _ => {
            println!("Queued run {}", run_id);
            if let Some(superseded) = body["superseded"].as_str() {
                println!("Superseded pending run {}", superseded);
            }
        }
    }
    Ok(())
}

pub async fn status(api_url: &str) -> Result<()> {
    let url = endpoint(api_url, "/api/v1/runs/current")?;
    let response = reqwest::get(url)
        .await
        .context("Failed to reach the API server")?;
    let body = read_json(response).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn cancel(api_url: &str) -> Result<()> {
    let url = endpoint(api_url, "/api/v1/runs/cancel")?;
    let response = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .context("Failed to reach the API server")?;
    let body = read_json(response).await?;
    println!("Cancelling run {}", body["run_id"].as_str().unwrap_or_default());
    Ok(())
}
