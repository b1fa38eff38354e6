use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use prefork_server::config::{self, ServerConfig};
use prefork_server::Server;

#[derive(Parser)]
#[command(name = "prefork-server")]
#[command(about = "Prefork worker HTTP server", version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the worker count
    #[arg(short, long)]
    workers: Option<usize>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match config::load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };

    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    // Overrides can invalidate a previously valid file; check the final form.
    if let Err(errors) = config::validate_config(&config) {
        for e in errors {
            eprintln!("configuration error: {}", e);
        }
        return ExitCode::FAILURE;
    }

    if cli.check_config {
        println!("configuration OK");
        return ExitCode::SUCCESS;
    }

    match Server::new(config).run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
