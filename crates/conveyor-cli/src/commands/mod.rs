//! CLI command implementations.

pub mod remote;
pub mod run;

use anyhow::{Context, Result};
use conveyor_config::load_pipeline;
use conveyor_core::graph::{resolve_order, waves};
use conveyor_core::pipeline::{DeployMode, ExecutionPlan, PipelineDefinition};
use std::fmt::Write;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    let pipeline = load_pipeline(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    println!(
        "Configuration is valid: pipeline '{}' with {} stacks",
        pipeline.name,
        pipeline.stacks.len()
    );
    Ok(())
}

pub fn plan(path: &Path) -> Result<()> {
    let pipeline = load_pipeline(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    print!("{}", describe_plan(&pipeline)?);
    Ok(())
}

/// Render the execution plan of `pipeline` for display.
fn describe_plan(pipeline: &PipelineDefinition) -> Result<String> {
    let order = resolve_order(&pipeline.stacks)?;
    let plan = ExecutionPlan::for_stacks(&order);
    plan.validate()?;

    let mut out = String::new();
    writeln!(out, "Pipeline: {}", pipeline.name)?;
    writeln!(out, "Environment: {}", pipeline.deploy.environment)?;
    writeln!(out, "Stages:")?;
    for (i, stage) in plan.stages.iter().enumerate() {
        write!(out, "  {}. {}", i + 1, stage.name)?;
        if !stage.inputs.is_empty() {
            write!(out, " <- {}", stage.inputs.join(", "))?;
        }
        writeln!(out)?;
    }

    match pipeline.deploy.mode {
        DeployMode::Sequential => {
            writeln!(out, "Deploy order: {}", plan.stack_order().join(" -> "))?;
        }
        DeployMode::Waves => {
            writeln!(out, "Deploy waves:")?;
            for (i, wave) in waves(&order).iter().enumerate() {
                let names: Vec<&str> = wave.iter().map(|s| s.name.as_str()).collect();
                writeln!(out, "  {}. {}", i + 1, names.join(", "))?;
            }
        }
    }
    Ok(out)
}

/// Parse a `KEY=VALUE` argument.
pub fn parse_key_value(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", arg)),
    }
}
