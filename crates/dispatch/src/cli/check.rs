//! `check-config`: validate and print the effective settings.

use alerter::Operation;
use anyhow::Result;
use colored::Colorize;
use dispatch::OperationSettings;
use std::path::Path;

use super::ui;

pub fn run(path: Option<&Path>) -> Result<()> {
    let config = super::load_config(path)?;
    ui::print_success("Configuration is valid");

    ui::print_section("General");
    println!("  include_traceback  {}", config.include_traceback);
    println!("  chain_delay_secs   {}", config.chain_delay_secs);
    println!("  concurrency        {}", config.concurrency);

    ui::print_section("Operations");
    print_header();
    for operation in Operation::ALL {
        print_row(operation, config.operations.get(operation));
    }

    for alerter in config.alerters.keys() {
        ui::print_section(&format!("Alerter {alerter}"));
        print_header();
        for operation in Operation::ALL {
            print_row(operation, &config.resolve(alerter, operation));
        }
    }
    Ok(())
}

fn print_header() {
    println!(
        "  {}",
        format!(
            "{:<10} {:<10} {:>4} {:>7} {:>7} {:<11} {:>7} {:>7} {:>7}",
            "operation", "queue", "prio", "delay", "retries", "backoff", "first", "step", "max"
        )
        .bright_black()
    );
}

fn print_row(operation: Operation, settings: &OperationSettings) {
    let policy = &settings.backoff;
    let kind = match (policy.exponential, policy.jitter) {
        (true, true) => "exp+jitter",
        (true, false) => "exponential",
        (false, true) => "lin+jitter",
        (false, false) => "linear",
    };
    println!(
        "  {} {:<10} {:>4} {:>7.1} {:>7} {:<11} {:>7.1} {:>7.1} {:>7.1}",
        format!("{:<10}", operation.as_str()).cyan(),
        settings.queue,
        settings.priority,
        settings.delay_secs,
        policy.max_retries,
        kind,
        policy.first_interval,
        policy.step,
        policy.max_interval,
    );
}
