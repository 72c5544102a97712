//! Local pipeline execution command.

use anyhow::{Context, Result, bail};
use conveyor_config::system::TargetConfig;
use conveyor_config::{load_pipeline, load_system_config};
use conveyor_core::ResourceId;
use conveyor_core::pipeline::{PipelineEvent, StageStatus, Trigger};
use conveyor_scheduler::{CancelSignal, EventBus, RunOverrides, RunReport, build_orchestrator};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;

use crate::TargetArg;

pub struct RunOptions {
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub target: Option<TargetArg>,
    pub env: HashMap<String, String>,
}

/// Run the pipeline once in this process, printing stage events.
pub async fn run_local(
    config_path: &Path,
    system_config: Option<&Path>,
    options: RunOptions,
) -> Result<()> {
    let pipeline = load_pipeline(config_path)
        .with_context(|| format!("Failed to load pipeline config: {}", config_path.display()))?;
    let config = load_system_config(system_config).context("Failed to load system config")?;

    let target = match options.target {
        None => None,
        Some(TargetArg::Memory) => Some(TargetConfig::Memory),
        Some(TargetArg::Command) => match &config.target {
            TargetConfig::Command { .. } => None,
            TargetConfig::Memory => bail!("--target command needs a command target in the system config"),
        },
    };

    let mut env = HashMap::from([("CI".to_string(), "true".to_string())]);
    env.extend(options.env);

    let branch = options
        .branch
        .unwrap_or_else(|| pipeline.source.branch.clone());
    let trigger = Trigger::manual(options.revision, Some(branch));

    println!("Running pipeline: {}", pipeline.name);
    println!("Stacks: {}", pipeline.stacks.len());

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let orchestrator = build_orchestrator(
        pipeline,
        &config,
        RunOverrides {
            source_dir: options.source_dir,
            target,
            env,
        },
        events,
    )?;

    println!("\n--- Starting pipeline execution ---\n");

    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    println!("{}", format_event(&event));
                    if event.is_run_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => println!("  ({} events dropped)", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = orchestrator
        .execute(ResourceId::new(), trigger, CancelSignal::new())
        .await;
    let _ = printer.await;

    print_summary(&report);
    if !report.succeeded() {
        bail!("Pipeline {}", report.state);
    }
    Ok(())
}

fn format_event(event: &PipelineEvent) -> String {
    let marker = match event.status {
        StageStatus::Started => "▶",
        StageStatus::Succeeded => "✓",
        StageStatus::Failed => "✗",
        StageStatus::Skipped => "-",
        StageStatus::Cancelled => "⊘",
    };
    match &event.error {
        Some(error) => format!("{} {} {:?}: {}", marker, event.stage, event.status, error),
        None => format!("{} {} {:?}", marker, event.stage, event.status),
    }
}

fn print_summary(report: &RunReport) {
    println!("\n--- Pipeline {} ---", report.state);
    if let Some(image) = &report.image {
        println!("Image: {}", image);
    }
    if !report.deployed.is_empty() {
        println!("Deployed: {}", report.deployed.join(", "));
    }
    for (stack, outputs) in &report.outputs {
        for (name, value) in outputs {
            println!("  {}.{} = {}", stack, name, value);
        }
    }
    if !report.skipped.is_empty() {
        println!("Skipped: {}", report.skipped.join(", "));
    }
    if let Some(output) = &report.output {
        println!("\n{}", output);
    }
    if let Some(error) = &report.error {
        println!("Error: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_event() {
        let run_id = ResourceId::new();
        assert_eq!(
            format_event(&PipelineEvent::new(run_id, "deploy:auth", StageStatus::Started)),
            "▶ deploy:auth Started"
        );
        assert_eq!(
            format_event(&PipelineEvent::failed(run_id, "build", "exit 2")),
            "✗ build Failed: exit 2"
        );
    }

    #[tokio::test]
    async fn test_run_local_against_memory_target() {
        let dir = std::env::temp_dir().join(format!("conveyor-cli-{}", ResourceId::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("conveyor.kdl");
        std::fs::write(
            &config_path,
            r#"
pipeline "shop"
build {
    image-repository "registry.local/shop"
    build {
        run "echo built > out.txt"
    }
}
stack "auth"
"#,
        )
        .unwrap();
        let system_path = dir.join("system.kdl");
        std::fs::write(&system_path, format!("work-dir \"{}\"\n", dir.join("work").display()))
            .unwrap();

        let options = RunOptions {
            revision: Some("abcdef123456".to_string()),
            branch: None,
            source_dir: Some(dir.clone()),
            target: Some(TargetArg::Memory),
            env: HashMap::new(),
        };
        run_local(&config_path, Some(&system_path), options)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("out.txt")).unwrap().trim(),
            "built"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
