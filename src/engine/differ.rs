//! Plan preview for `--dry-run`

use colored::Colorize;
use declarative::{DiffSummary, ResourceDiff, ResourceState};
use std::collections::BTreeMap;
use std::fs;

use super::planner::{Plan, PlannedFile};

/// Probe every planned resource and return the ones that would change
pub fn compute(plan: &Plan) -> Vec<ResourceDiff> {
    declarative::compute_diffs(plan.resources.resources.iter().map(|r| r.as_ref()))
}

/// Display a list of diffs grouped by kind
pub fn display_diff(diffs: &[ResourceDiff]) {
    if diffs.is_empty() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    let mut by_kind: BTreeMap<&str, Vec<&ResourceDiff>> = BTreeMap::new();
    for diff in diffs {
        by_kind.entry(diff.kind.label()).or_default().push(diff);
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Reconciliation Plan".bold()
    );
    println!("│");

    for (kind, kind_diffs) in &by_kind {
        println!("│ {}", kind.bold());
        for diff in kind_diffs {
            let symbol = if diff.is_addition() {
                "+".green()
            } else {
                "~".yellow()
            };
            println!(
                "│   {} {:<40} {}",
                symbol,
                diff.resource_id,
                describe(&diff.current, &diff.desired).dimmed()
            );
        }
        println!("│");
    }

    let summary = DiffSummary::from_diffs(diffs);
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} changes ({} to create, {} to update)",
        summary.total().to_string().bold(),
        summary.additions.to_string().green(),
        summary.modifications.to_string().yellow()
    );
    println!("└─────────────────────────────────────────────────────┘");
}

fn describe(current: &ResourceState, desired: &ResourceState) -> String {
    match (current, desired) {
        (ResourceState::Absent, ResourceState::Present { details }) => format!(
            "(missing){}",
            details
                .as_ref()
                .map(|d| format!(" → {d}"))
                .unwrap_or_default()
        ),
        (ResourceState::Present { details: from }, ResourceState::Present { details: to }) => {
            format!(
                "{} → {}",
                from.as_deref().unwrap_or("current"),
                to.as_deref().unwrap_or("desired")
            )
        }
        (ResourceState::Modified { from, to }, _) => format!("{from} → {to}"),
        (ResourceState::Present { .. }, ResourceState::Absent) => "(will remove)".to_string(),
        (ResourceState::Unknown, _) => "(state unknown)".to_string(),
        _ => String::new(),
    }
}

/// Line diff of a managed file against what is on disk
///
/// Secret files show keys only.
pub fn file_diff(file: &PlannedFile) -> Vec<(char, String)> {
    let current = fs::read_to_string(&file.path).unwrap_or_default();
    let (old, new) = if file.secret {
        (mask_values(&current), mask_values(&file.content))
    } else {
        (current, file.content.clone())
    };

    similar::TextDiff::from_lines(&old, &new)
        .iter_all_changes()
        .filter_map(|change| {
            let sign = match change.tag() {
                similar::ChangeTag::Delete => '-',
                similar::ChangeTag::Insert => '+',
                similar::ChangeTag::Equal => return None,
            };
            Some((sign, change.value().trim_end().to_string()))
        })
        .collect()
}

/// Print the file diffs of a plan
pub fn display_file_diffs(plan: &Plan) {
    for file in &plan.files {
        let lines = file_diff(file);
        if lines.is_empty() {
            continue;
        }
        println!();
        println!("  {}", file.path.display().to_string().bold());
        for (sign, line) in lines {
            let text = format!("{sign} {line}");
            if sign == '-' {
                println!("    {}", text.red());
            } else {
                println!("    {}", text.green());
            }
        }
    }
}

/// Replace `KEY=value` values with a fixed mask
///
/// A changed value still shows up as a changed line because the mask
/// carries a short content hash.
fn mask_values(content: &str) -> String {
    content
        .lines()
        .map(|line| match line.split_once('=') {
            Some((key, value)) if !line.trim_start().starts_with('#') => {
                let hash = blake3::hash(value.as_bytes()).to_hex();
                format!("{key}=*** ({})\n", &hash.as_str()[..6])
            }
            _ => format!("{line}\n"),
        })
        .collect()
}
