use anyhow::{Result, bail};
use colored::Colorize;

use crate::Context;
use crate::cli::SnapshotsCommand;
use crate::config::StackConfig;
use crate::paths;
use crate::report;
use crate::runner::{Shell, SystemRunner};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::ui;

pub fn run(ctx: &Context, cmd: SnapshotsCommand) -> Result<bool> {
    let config = ctx.load_config()?;
    let manager = manager(&config);

    match cmd {
        SnapshotsCommand::List => list(&manager),
        SnapshotsCommand::Show { id } => show(&manager, &config, &id),
        SnapshotsCommand::Prune { retain } => prune(&manager, retain.unwrap_or(config.snapshots.retain)),
    }?;
    Ok(true)
}

fn manager(config: &StackConfig) -> SnapshotManager {
    SnapshotManager::new(
        paths::expand(&config.snapshots.dir),
        Shell::new(SystemRunner::new()),
        &config.database.superuser,
    )
}

fn list(manager: &SnapshotManager) -> Result<()> {
    ui::header("Snapshots");
    let snapshots = manager.list()?;
    if snapshots.is_empty() {
        ui::dim(&format!("No snapshots in {}", manager.root().display()));
        return Ok(());
    }

    for snapshot in &snapshots {
        println!("  {}", summary_line(snapshot));
    }
    println!();
    ui::dim(&format!("{} snapshot(s) in {}", snapshots.len(), manager.root().display()));
    Ok(())
}

fn summary_line(snapshot: &Snapshot) -> String {
    let labels: Vec<&str> = snapshot.contents.iter().map(|c| c.label.as_str()).collect();
    format!(
        "{}  {}  {:>9}  {}",
        snapshot.id.bold(),
        snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
        ui::format_size(snapshot.size()),
        labels.join(", ").dimmed()
    )
}

fn show(manager: &SnapshotManager, config: &StackConfig, id: &str) -> Result<()> {
    let Some(snapshot) = find(manager, id)? else {
        bail!("No snapshot '{id}' in {}", manager.root().display());
    };

    ui::header(&format!("Snapshot {}", snapshot.id));
    ui::kv("Created", &snapshot.created_at.format("%Y-%m-%d %H:%M:%S").to_string());
    ui::kv("Location", &snapshot.dir.display().to_string());
    ui::kv("Size", &ui::format_size(snapshot.size()));

    ui::section("Contents");
    for item in &snapshot.contents {
        println!(
            "  {:<12} {:>9}  {}",
            item.label,
            ui::format_size(item.bytes),
            item.source.dimmed()
        );
    }
    for skipped in &snapshot.skipped {
        println!("  {:<12} {}", skipped.label, format!("skipped: {}", skipped.reason).yellow());
    }

    ui::section("Restore");
    for step in report::restore_steps(&snapshot, config) {
        ui::restore_step(&step);
    }
    Ok(())
}

fn find(manager: &SnapshotManager, id: &str) -> Result<Option<Snapshot>> {
    Ok(manager.list()?.into_iter().find(|s| s.id == id))
}

fn prune(manager: &SnapshotManager, retain: usize) -> Result<()> {
    if retain == 0 {
        bail!("--retain must be at least 1");
    }
    let removed = manager.prune(retain)?;
    if removed.is_empty() {
        ui::success(&format!("Nothing to prune (keeping {retain})"));
    } else {
        for id in &removed {
            ui::dim(&format!("removed {id}"));
        }
        ui::success(&format!("Pruned {} snapshot(s), kept {retain}", removed.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use crate::snapshot::CaptureTarget;
    use std::fs;
    use std::sync::Arc;

    fn seeded(root: &std::path::Path, count: usize) -> (SnapshotManager, Vec<String>) {
        let manager = SnapshotManager::new(
            root.join("snapshots"),
            Shell::shared(Arc::new(FakeRunner::new())),
            "postgres",
        );
        let source = root.join("site");
        fs::write(&source, "server {}\n").unwrap();
        let ids = (0..count)
            .map(|_| {
                manager
                    .snapshot(&[CaptureTarget::path("vhost", &source)])
                    .unwrap()
                    .id
            })
            .collect();
        (manager, ids)
    }

    #[test]
    fn test_find_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, ids) = seeded(dir.path(), 2);

        let found = find(&manager, &ids[0]).unwrap().unwrap();
        assert_eq!(found.contents[0].label, "vhost");
        assert!(find(&manager, "19990101_000000").unwrap().is_none());
    }

    #[test]
    fn test_prune_rejects_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = seeded(dir.path(), 1);
        assert!(prune(&manager, 0).is_err());
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, ids) = seeded(dir.path(), 3);

        prune(&manager, 1).unwrap();

        let left: Vec<String> = manager.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(left, vec![ids[2].clone()]);
    }

    #[test]
    fn test_summary_line_lists_contents() {
        colored::control::set_override(false);
        let dir = tempfile::tempdir().unwrap();
        let (manager, ids) = seeded(dir.path(), 1);
        let snapshot = find(&manager, &ids[0]).unwrap().unwrap();
        let line = summary_line(&snapshot);
        assert!(line.starts_with(&ids[0]));
        assert!(line.ends_with("vhost"));
    }
}
