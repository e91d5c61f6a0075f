//! `tide status`: list executions or show one in detail.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use tideway_core::workflow::loader::load_definition;
use tideway_types::execution::{ExecutionPhase, WorkflowExecution};

use crate::state::AppState;

fn phase_cell(phase: ExecutionPhase) -> Cell {
    match phase {
        ExecutionPhase::Completed => Cell::new("● completed").fg(Color::Green),
        ExecutionPhase::Failed => Cell::new("✗ failed").fg(Color::Red),
        ExecutionPhase::Cancelled => Cell::new("○ cancelled").fg(Color::Yellow),
        ExecutionPhase::InProgress => Cell::new("◐ in progress").fg(Color::Cyan),
        ExecutionPhase::Pending => Cell::new("◌ pending").fg(Color::DarkGrey),
        ExecutionPhase::Unspecified => Cell::new("?").fg(Color::DarkGrey),
    }
}

/// `namespace/name@version` of the workflow an execution runs.
fn workflow_label(execution: &WorkflowExecution) -> String {
    match load_definition(execution.spec.workflow.as_bytes()) {
        Ok(def) => format!("{}/{}@{}", def.document.namespace, def.document.name, def.document.version),
        Err(_) => "(unreadable)".to_string(),
    }
}

fn timestamp(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub async fn status(state: &AppState, id: Option<&str>, limit: usize, json: bool) -> Result<()> {
    match id {
        Some(id) => show_execution(state, id, json).await,
        None => list_executions(state, limit, json).await,
    }
}

async fn list_executions(state: &AppState, limit: usize, json: bool) -> Result<()> {
    let mut executions = state.executions.list().await?;
    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    executions.truncate(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions yet. Start one with {}", style("tide run <file>").cyan());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Execution").fg(Color::White),
        Cell::new("Workflow").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Tasks").fg(Color::White),
        Cell::new("Created").fg(Color::White),
    ]);
    for execution in &executions {
        table.add_row(vec![
            Cell::new(execution.id).fg(Color::Cyan),
            Cell::new(workflow_label(execution)),
            phase_cell(execution.status.phase),
            Cell::new(execution.status.tasks.len()),
            Cell::new(timestamp(Some(execution.created_at))).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn show_execution(state: &AppState, id: &str, json: bool) -> Result<()> {
    let uuid = Uuid::parse_str(id).with_context(|| format!("'{id}' is not an execution id"))?;
    let execution = state
        .executions
        .get(&uuid)
        .await?
        .with_context(|| format!("execution '{id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    let status = &execution.status;
    println!();
    println!("  {} {}", style("Execution").bold(), style(execution.id).cyan());
    println!("  Workflow:  {}", workflow_label(&execution));
    println!("  Phase:     {}", status.phase);
    println!("  Started:   {}", timestamp(status.started_at));
    println!("  Completed: {}", timestamp(status.completed_at));
    if let Some(org) = &execution.spec.org_id {
        println!("  Org:       {org}");
    }
    if let Some(error) = &status.error {
        println!("  Error:     {}", style(error).red());
    }

    if !status.tasks.is_empty() {
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Task").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Started").fg(Color::White),
            Cell::new("Completed").fg(Color::White),
            Cell::new("Error").fg(Color::White),
        ]);
        for task in &status.tasks {
            table.add_row(vec![
                Cell::new(&task.task_name).fg(Color::Cyan),
                phase_cell(task.status),
                Cell::new(timestamp(task.started_at)).fg(Color::DarkGrey),
                Cell::new(timestamp(task.completed_at)).fg(Color::DarkGrey),
                Cell::new(task.error.as_deref().unwrap_or("")).fg(Color::Red),
            ]);
        }
        println!();
        println!("{table}");
    }

    if let Some(output) = &status.output {
        println!();
        println!("  {}", style("── Output ──").dim());
        for line in serde_json::to_string_pretty(output)?.lines() {
            println!("  {line}");
        }
    }
    println!();
    Ok(())
}
