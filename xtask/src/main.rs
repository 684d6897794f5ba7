use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Workspace tasks for the TCM tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every workspace member
    Build {
        #[arg(long)]
        release: bool,
    },
    /// Run the core test suite, optionally filtered
    Test { filter: Option<String> },
    /// Run the `tcm` tool against the simulated controller
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { release } => {
            println!("Building workspace...");
            let mut args = vec!["build", "--workspace"];
            if *release {
                args.push("--release");
            }
            cargo(&args, "Build")?;
        }
        Commands::Test { filter } => {
            println!("Testing tcm-core...");
            let mut args = vec!["test", "-p", "tcm-core"];
            if let Some(filter) = filter {
                args.push(filter);
            }
            cargo(&args, "Tests")?;
        }
        Commands::Run { args } => {
            let mut cmd = vec!["run", "-p", "tcm-cli", "--"];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd, "Run")?;
        }
    }

    Ok(())
}
