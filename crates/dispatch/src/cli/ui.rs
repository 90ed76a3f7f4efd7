//! Console formatting helpers.

use colored::{ColoredString, Colorize};
use dispatch::Status;

pub fn print_section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
    println!("{}", "─".repeat(72).bright_black());
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Status name colored by how settled it is.
pub fn status(status: Status) -> ColoredString {
    let name = status.as_str();
    match status {
        Status::Processed => name.green(),
        Status::Recovered => name.blue(),
        Status::New | Status::Scheduled => name.bright_black(),
        Status::Processing | Status::Recovering | Status::Repeating | Status::Actioning => {
            name.yellow()
        }
    }
}
