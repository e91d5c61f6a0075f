//! `tide purge`: bulk deletion of stored resources.

use anyhow::{Result, bail};
use console::style;
use dialoguer::Confirm;

use tideway_core::repository::ResourceKind;

use crate::state::AppState;

pub async fn purge(
    state: &AppState,
    kind: Option<ResourceKind>,
    all: bool,
    blobs: bool,
    force: bool,
    json: bool,
) -> Result<()> {
    if kind.is_none() && !all && !blobs {
        bail!("nothing to purge: pass --kind, --all or --blobs");
    }

    let target = match (kind, all) {
        (Some(kind), _) => Some(format!("every stored {kind}")),
        (None, true) => Some("every stored resource".to_string()),
        (None, false) => None,
    };

    if let Some(target) = &target
        && !force
        && !json
    {
        let confirmed = Confirm::new()
            .with_prompt(format!("Permanently delete {}?", style(target).red().bold()))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let deleted = match (kind, all) {
        (Some(kind), _) => Some(state.store.delete_by_kind(kind).await?),
        (None, true) => Some(state.store.delete_all().await?),
        (None, false) => None,
    };
    let swept = if blobs { Some(state.claim_check.sweep_expired().await?) } else { None };

    if let Some(count) = deleted {
        tracing::info!(count, kind = ?kind, "purged resources");
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "deleted": deleted, "swept_blobs": swept })
        );
    } else {
        if let Some(count) = deleted {
            println!("  {} Deleted {count} resource(s).", style("✓").red().bold());
        }
        if let Some(count) = swept {
            println!("  {} Swept {count} expired claim-check payload(s).", style("✓").green().bold());
        }
    }
    Ok(())
}
