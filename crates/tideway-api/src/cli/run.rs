//! `tide run` and `tide validate`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::Value;

use tideway_core::workflow::RunOutcome;
use tideway_types::execution::{ExecutionPhase, ValidationResult, WorkflowExecution};

use crate::state::AppState;

/// Workflow input from `--input` or `--input-file`, `{}` when neither is given.
pub async fn read_input(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    let raw = match (inline, file) {
        (Some(inline), _) => inline.to_string(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading input file {}", path.display()))?,
        (None, None) => return Ok(serde_json::json!({})),
    };
    serde_json::from_str(&raw).context("workflow input is not valid JSON")
}

async fn read_document(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading workflow document {}", file.display()))
}

fn phase_style(phase: ExecutionPhase) -> console::StyledObject<&'static str> {
    let label = phase.as_str();
    match phase {
        ExecutionPhase::Completed => style(label).green(),
        ExecutionPhase::Failed => style(label).red(),
        ExecutionPhase::Cancelled => style(label).yellow(),
        ExecutionPhase::InProgress => style(label).cyan(),
        _ => style(label).dim(),
    }
}

/// Print tasks whose phase changed since the last update.
fn print_progress(update: &WorkflowExecution, seen: &mut HashMap<String, ExecutionPhase>) {
    for task in &update.status.tasks {
        if seen.get(&task.task_id) == Some(&task.status) {
            continue;
        }
        seen.insert(task.task_id.clone(), task.status);
        let marker = match task.status {
            ExecutionPhase::Completed => style("✓").green(),
            ExecutionPhase::Failed => style("✗").red(),
            _ => style("›").dim(),
        };
        println!("  {marker} {} {}", task.task_name, phase_style(task.status));
    }
}

/// Execute a workflow document in-process and wait for it to finish.
pub async fn run_workflow(
    state: &AppState,
    file: &Path,
    input: Value,
    org_id: Option<String>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let document = read_document(file).await?;

    let validation = state.runner.validate(&document).await;
    if !validation.is_valid() {
        print_validation(&validation, json, false)?;
        bail!("workflow document is invalid");
    }

    let execution = state.submit(document, input, org_id).await?;
    let id = execution.id.to_string();
    let interactive = !json && !quiet;
    if interactive {
        println!();
        println!("  {} Running execution {}", style("▶").bold(), style(&id).cyan());
    }

    let mut subscription = state.broker.subscribe(&id);
    let run = state.run(&execution);
    tokio::pin!(run);
    let mut seen = HashMap::new();
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            Some(update) = subscription.receiver.recv() => {
                if interactive {
                    print_progress(&update, &mut seen);
                }
            }
        }
    };
    while let Ok(update) = subscription.receiver.try_recv() {
        if interactive {
            print_progress(&update, &mut seen);
        }
    }
    state.broker.unsubscribe(&id, subscription.id);

    let finished = state
        .executions
        .get(&execution.id)
        .await?
        .with_context(|| format!("execution {id} disappeared from the store"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    } else if !quiet {
        println!();
        println!("  Status: {}", phase_style(finished.status.phase));
        if let Some(output) = &finished.status.output {
            println!("  Output:");
            for line in serde_json::to_string_pretty(output)?.lines() {
                println!("    {line}");
            }
        }
        if let Some(error) = &finished.status.error {
            println!("  Error:  {}", style(error).red());
        }
        println!();
    }

    match outcome {
        RunOutcome::Completed { .. } => Ok(()),
        RunOutcome::Failed { error_type, message } => bail!("execution failed ({error_type}): {message}"),
        RunOutcome::Cancelled => bail!("execution was cancelled"),
        RunOutcome::ContinueAsNew(_) => bail!("execution stopped while continuing as new"),
    }
}

fn print_validation(result: &ValidationResult, json: bool, canonical: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!();
    if result.is_valid() {
        println!("  {} Workflow document is valid", style("✓").green().bold());
    } else {
        println!("  {} Workflow document is not valid", style("✗").red().bold());
    }
    for error in &result.errors {
        println!("    {} {error}", style("error:").red());
    }
    for warning in &result.warnings {
        println!("    {} {warning}", style("warning:").yellow());
    }
    if canonical && let Some(doc) = &result.canonical_document {
        println!();
        println!("{doc}");
    }
    println!();
    Ok(())
}

/// Validate a document on the validation lane.
pub async fn validate_workflow(state: &AppState, file: &Path, canonical: bool, json: bool) -> Result<()> {
    let document = read_document(file).await?;
    let result = state.runner.validate(&document).await;
    print_validation(&result, json, canonical)?;
    if !result.is_valid() {
        bail!("workflow document is invalid");
    }
    Ok(())
}
