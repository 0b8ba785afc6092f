//! wpseed - CLI tool that provisions a new WordPress project directory.
//! Downloads the latest WordPress source, clones selected themes and plugins
//! into wp-content, and writes a .gitignore that tracks only those.

use anyhow::{Context, Result};
use clap::Parser;
use std::{env, process};
use wpseed::{init_tracing, load_config, run_create_project, Cli, Commands};

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::CreateProject(args) => {
            let config = load_config()?;
            let cwd = env::current_dir().context("Failed to determine current directory")?;
            let project_dir = run_create_project(&args, &config, &cwd)?;
            println!("Done! WordPress project created at {}", project_dir.display());
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
