//! Remove containers left behind by a run that did not shut down.
//!
//! Every container poolrun creates carries the managed label, so anything
//! still labelled once no run is active is an orphan.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;

use crate::sandbox::DockerProvider;

/// Format the clean results as a displayable string
pub fn format_results(removed: &[String]) -> String {
    let mut out = String::new();
    if removed.is_empty() {
        let _ = writeln!(
            &mut out,
            "\n{} No orphaned poolrun containers found.",
            "ℹ".blue()
        );
    } else {
        let _ = writeln!(
            &mut out,
            "\n{} Removed {} orphaned container{}:",
            "✓".green(),
            removed.len(),
            if removed.len() == 1 { "" } else { "s" }
        );
        for name in removed {
            let _ = writeln!(&mut out, "  {} {}", "✗".red(), name.dimmed());
        }
    }
    out
}

/// Entry point: removes labelled containers from the local daemon
pub async fn run() -> Result<()> {
    let docker = DockerProvider::connect()?;
    docker.ping().await?;

    let removed = docker
        .remove_orphaned()
        .await
        .context("Failed to remove orphaned containers")?;

    print!("{}", format_results(&removed));
    Ok(())
}
