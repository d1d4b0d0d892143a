mod cli;
mod dataset;
mod duration;
mod error;
mod machine;
mod orchestrator;
mod replicate;
mod retention;

use clap::Parser;
use cli::{Cli, Command};
use error::AppError;
use log::error;
use machine::Machine;
use std::process::exit;

fn main() {
    let cli = Cli::parse();

    let level = if cli.app_verbose { log::LevelFilter::Debug } else { log::LevelFilter::Warn };
    env_logger::Builder::new().filter_level(level).init();

    if let Err(e) = run(&cli) {
        error!("{e}");
        exit(e.exit_code());
    }
}

fn run(cli: &Cli) -> Result<(), AppError> {
    match &cli.command {
        Command::Version => {
            orchestrator::version();
            Ok(())
        }

        Command::List => {
            let machine = Machine::Local;
            orchestrator::list(&machine, cli.dataset.as_deref(), cli.recursive)
        }

        Command::Create { name, tags } => {
            let dataset = require_dataset(cli)?;
            let machine = Machine::Local;
            orchestrator::create(&machine, &dataset, cli.recursive, name.clone(), tags.clone())
        }

        Command::Tag { op } => {
            let dataset = require_dataset(cli)?;
            let machine = Machine::Local;
            orchestrator::tag(&machine, &dataset, op)
        }

        Command::Prune {
            last,
            hourly,
            daily,
            weekly,
            monthly,
            yearly,
            within,
            within_hourly,
            within_daily,
            within_weekly,
            within_monthly,
            within_yearly,
            keep_name,
            keep_tag,
            tag_group,
            group_by,
        } => {
            let dataset = require_dataset(cli)?;
            let machine = Machine::Local;
            let args = orchestrator::PruneArgs {
                last: *last,
                hourly: *hourly,
                daily: *daily,
                weekly: *weekly,
                monthly: *monthly,
                yearly: *yearly,
                within: within.clone(),
                within_hourly: within_hourly.clone(),
                within_daily: within_daily.clone(),
                within_weekly: within_weekly.clone(),
                within_monthly: within_monthly.clone(),
                within_yearly: within_yearly.clone(),
                keep_name: keep_name.clone(),
                keep_tag: keep_tag.clone(),
                tag_group: tag_group.clone(),
                group_by: *group_by,
            };
            orchestrator::prune(&machine, &dataset, cli.recursive, cli.dry_run, args)
        }

        Command::Push { target, port, init } => {
            let dataset = require_dataset(cli)?;
            orchestrator::push(&dataset, target, *port, *init, cli.recursive, cli.dry_run)
        }

        Command::Pull { target, port, init } => {
            let dataset = require_dataset(cli)?;
            orchestrator::pull(&dataset, target, *port, *init, cli.recursive, cli.dry_run)
        }
    }
}

fn require_dataset(cli: &Cli) -> Result<String, AppError> {
    cli.dataset
        .clone()
        .ok_or_else(|| AppError::InputError("this subcommand requires -d/--dataset".into()))
}
