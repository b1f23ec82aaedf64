//! Body of the pre-emptible unit for a Docker exec.
//!
//! Starts the exec attached, buffers everything it prints and writes the
//! bytes to stdout, which the parent reads as the command's output. Killing
//! this process is how the parent abandons an exec that never finishes.

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::sandbox::{DockerProvider, EnvironmentProvider, ExecId};

pub async fn run(exec_id: String) -> Result<()> {
    let docker = DockerProvider::connect()?;
    let output = docker
        .exec_start(&ExecId(exec_id))
        .await
        .context("Attached exec failed")?;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(&output)
        .await
        .context("Failed to write exec output")?;
    stdout.flush().await.context("Failed to flush exec output")?;
    Ok(())
}
