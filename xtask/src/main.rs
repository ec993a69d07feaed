//! Build automation tasks for THUNDER
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

const FUZZ_TARGETS: &[&str] = &["fuzz_wire_message", "fuzz_onion_packet", "fuzz_peer_session", "fuzz_config_parse"];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "THUNDER build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run the benchmarks
    Bench,

    /// Run each fuzz target for a while (requires cargo-fuzz and nightly)
    Fuzz {
        /// Seconds per target
        #[arg(long, default_value_t = 60)]
        seconds: u32,

        /// Only this target
        target: Option<String>,
    },

    /// Run the two-node payment demo
    Demo,

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
            run_command("cargo", &["test", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Bench => {
            run_command("cargo", &["bench", "--workspace"])?;
        }
        Commands::Fuzz { seconds, target } => {
            let targets: Vec<&str> = match &target {
                Some(name) => {
                    if !FUZZ_TARGETS.contains(&name.as_str()) {
                        anyhow::bail!("unknown fuzz target {name}, expected one of {FUZZ_TARGETS:?}");
                    }
                    vec![name.as_str()]
                }
                None => FUZZ_TARGETS.to_vec(),
            };
            let max_time = format!("-max_total_time={seconds}");
            for target in targets {
                println!("Fuzzing {target} for {seconds}s...");
                run_command("cargo", &["+nightly", "fuzz", "run", target, "--", &max_time])?;
            }
        }
        Commands::Demo => {
            run_command("cargo", &["run", "--release", "-p", "thunder-cli", "--", "demo"])?;
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program).args(args).status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
