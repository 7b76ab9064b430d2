// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{env, path::PathBuf};

use anyhow::anyhow;
use clap::CommandFactory;

const TASKS: [&str; 2] = ["manual", "example-config"];

fn main() -> anyhow::Result<()> {
    match env::args()
        .nth(1)
        .ok_or(anyhow!("Must provide a task"))?
        .as_str()
    {
        "manual" => generate_manual(),
        "example-config" => generate_example_config(),
        _ => Err(anyhow!("Unknown task, use one of {:?}", TASKS)),
    }
}

fn docs_dir() -> anyhow::Result<PathBuf> {
    let outdir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../ct-publisher/docs/");
    std::fs::create_dir_all(&outdir)?;
    Ok(outdir)
}

fn generate_manual() -> anyhow::Result<()> {
    let outdir = docs_dir()?;
    let command = ct_publisher::cli::Cli::command();
    let manual = clap_mangen::Man::new(command);
    manual.generate_to(&outdir)?;
    println!("Generated the manual page in {}", outdir.display());

    Ok(())
}

// The defaults, rendered as a commented starting point for new deployments.
fn generate_example_config() -> anyhow::Result<()> {
    let path = docs_dir()?.join("ct-publisher.toml");
    let config = ct_publisher::config::Config::default();
    config.validate()?;
    std::fs::write(
        &path,
        format!("# Example ct-publisher configuration; see ct-publisher(1).\n\n{config}"),
    )?;
    println!("Wrote {}", path.display());

    Ok(())
}
