use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use simnet::{config::ConfigArgs, harness::ExitReason, scenarios};

#[derive(clap::Parser, Debug)]
#[command(name = "simnet", version, about = "Deterministic network simulation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run one of the built-in scenarios and print its report.
    Run {
        /// Scenario name, see `simnet list`.
        scenario: String,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// List the built-in scenarios.
    List,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::List => {
            for scenario in scenarios::SCENARIOS {
                println!("{:<16} {}", scenario.name, scenario.description);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { scenario, config } => {
            simnet::config::set_logger(config.log_level);
            let sim_config = config.build().context("failed to load configuration")?;
            let scenario = scenarios::find(&scenario)
                .with_context(|| format!("unknown scenario `{scenario}`, try `simnet list`"))?;

            let report = (scenario.run)(sim_config);
            print!("{report}");
            if report.exit == ExitReason::MaxTimeExceeded {
                return Ok(ExitCode::from(2));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
