//! threadhook CLI - run a program with thread creation logged.

mod modules;
mod spawn;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "threadhook")]
#[command(version, about = "Log the caller stack of every thread a program creates", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program with the agent preloaded
    Run {
        /// Caller modules to leave unhooked (glob, repeatable)
        #[arg(short = 'e', long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Caller frames to log per thread creation
        #[arg(long, value_name = "N")]
        frames: Option<usize>,

        /// Also hook modules loaded with dlopen after startup. The program's
        /// dlopen calls then resolve $ORIGIN and RUNPATH relative to the agent
        #[arg(long)]
        follow_dlopen: bool,

        /// Agent library to preload
        #[arg(long, value_name = "PATH")]
        agent: Option<PathBuf>,

        /// Program to run and its arguments
        #[arg(trailing_var_arg = true, required = true)]
        program: Vec<String>,
    },

    /// List loaded modules and the slots that reference a symbol
    Modules {
        #[arg(short, long, value_name = "NAME")]
        symbol: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Run {
            exclude,
            frames,
            follow_dlopen,
            agent,
            program,
        } => {
            let options = spawn::RunOptions {
                agent: spawn::find_agent_library(agent.as_deref())?,
                exclude,
                max_frames: frames,
                follow_dlopen,
                verbose: cli.verbose,
            };
            let code = spawn::run(&options, &program)?;
            std::process::exit(code);
        }
        Commands::Modules { symbol } => modules::print(symbol.as_deref())?,
    }

    Ok(())
}
