// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use clap::{CommandFactory, Parser};
use ct_publisher::{bootstrap, cli::Cli};

fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    let Some(config) = opts.config.as_deref() else {
        eprintln!("{}", Cli::command().render_help());
        std::process::exit(1);
    };

    bootstrap::run(config, &opts.overrides())
}
