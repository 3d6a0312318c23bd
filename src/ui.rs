//! Operator-facing output for runs, reports and doctor checks

use colored::Colorize;

pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Errors go to stderr so a redirected report stays clean
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Secondary detail under a line
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Report title, underlined
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Report section (pipeline stage, health layer, doctor category)
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// One manual restore step: `#` notes highlighted, commands shown as a prompt
pub fn restore_step(step: &str) {
    match step.strip_prefix('#') {
        Some(note) => println!("    {}", format!("#{note}").yellow()),
        None => println!("    {} {step}", "$".dimmed()),
    }
}

const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// Snapshot and dump sizes in binary units
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
