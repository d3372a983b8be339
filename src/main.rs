use anyhow::{bail, Context, Result};
use modstage::{
    backup::{BackupStore, DEFAULT_STORE_DIR_NAME},
    config::{base_data_dir, AppConfig},
    conflict::ConflictAnalyzer,
    deploy::{DeployEngine, DeployProgress},
    fsutil::extension_lower,
    game::{ConfiguredLocator, PathLocator},
    load_order::OrderOrganizer,
    logging,
    scanner::{Category, ScanResult, Scanner},
    ModError,
};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use walkdir::WalkDir;

enum Command {
    Scan(PathBuf),
    Stage { incoming: PathBuf, staging: PathBuf },
    Conflicts(PathBuf),
    Order(PathBuf),
    Deploy {
        staging: PathBuf,
        live: Option<PathBuf>,
        no_close: bool,
    },
    Backup { source: PathBuf, store: Option<PathBuf> },
    Restore { snapshot: PathBuf, target: PathBuf },
    VerifyBackup(PathBuf),
    ListBackups(PathBuf),
    Help,
    Version,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ModError>() {
                Some(mod_err) => eprintln!("{}", mod_err.report()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("modstage v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let config = AppConfig::load_or_create()?;
    let log_dir = base_data_dir()?.join("logs");
    let _guard = logging::setup_logging(&log_dir, "modstage.log", &config.log_level, false)?;
    run_command(command, &config)
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some((name, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    let mut positional = Vec::new();
    let mut live = None;
    let mut store = None;
    let mut no_close = false;
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--live" => match iter.next() {
                Some(value) => live = Some(PathBuf::from(value)),
                None => bail!("--live requires a path"),
            },
            "--store" => match iter.next() {
                Some(value) => store = Some(PathBuf::from(value)),
                None => bail!("--store requires a path"),
            },
            "--no-close" => no_close = true,
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            value => positional.push(PathBuf::from(value)),
        }
    }

    let command = match name.as_str() {
        "--help" | "-h" | "help" => Command::Help,
        "--version" | "-V" | "version" => Command::Version,
        "scan" => Command::Scan(take_one(name, positional)?),
        "stage" => {
            let [incoming, staging] = take_two(name, positional)?;
            Command::Stage { incoming, staging }
        }
        "conflicts" => Command::Conflicts(take_one(name, positional)?),
        "order" => Command::Order(take_one(name, positional)?),
        "deploy" => Command::Deploy {
            staging: take_one(name, positional)?,
            live,
            no_close,
        },
        "backup" => Command::Backup {
            source: take_one(name, positional)?,
            store,
        },
        "restore" => {
            let [snapshot, target] = take_two(name, positional)?;
            Command::Restore { snapshot, target }
        }
        "verify-backup" => Command::VerifyBackup(take_one(name, positional)?),
        "list-backups" => Command::ListBackups(take_one(name, positional)?),
        other => bail!("unknown command '{other}' (try --help)"),
    };
    Ok(command)
}

fn take_one(command: &str, mut positional: Vec<PathBuf>) -> Result<PathBuf> {
    if positional.len() != 1 {
        bail!("{command} expects exactly one path argument");
    }
    positional.pop().context("missing path")
}

fn take_two(command: &str, positional: Vec<PathBuf>) -> Result<[PathBuf; 2]> {
    positional
        .try_into()
        .map_err(|_| anyhow::anyhow!("{command} expects exactly two path arguments"))
}

fn run_command(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::Scan(dir) => {
            let scan = Scanner::new(config.scanner_settings()).scan_directory(&dir)?;
            print_scan(&scan);
        }
        Command::Stage { incoming, staging } => {
            let scan = Scanner::new(config.scanner_settings()).scan_directory(&incoming)?;
            print_scan(&scan);
            let organizer = OrderOrganizer::new();
            let grouped = organizer.group_by_slot(&scan);
            let tree = organizer.generate_structure(&grouped, &staging)?;
            for placement in &tree.placements {
                println!("{:<14} {}", placement.slot, placement.target.display());
            }
            println!("Staged {} file(s) into {}", tree.placements.len(), tree.root.display());
        }
        Command::Conflicts(dir) => {
            let mods = package_files(&dir);
            let map = ConflictAnalyzer::new().build_conflict_map(&mods);
            let conflicts = map.get_conflicts();
            for (resource, owners) in &conflicts {
                let owners: Vec<&str> = owners.iter().map(String::as_str).collect();
                println!("{resource}: {}", owners.join(", "));
            }
            for skipped in map.skipped() {
                println!("skipped {}: {}", skipped.name, skipped.reason);
            }
            println!(
                "{} resource(s) across {} mod(s), {} conflict(s)",
                map.resource_count(),
                mods.len(),
                conflicts.len()
            );
        }
        Command::Order(staging) => {
            let organizer = OrderOrganizer::new();
            let (valid, issues) = organizer.validate_structure(&staging);
            for issue in &issues {
                println!("warning: {issue}");
            }
            for (index, entry) in organizer.export_order(&staging).iter().enumerate() {
                println!("{:03}. {entry}", index + 1);
            }
            if !valid {
                bail!("load order layout has {} issue(s)", issues.len());
            }
        }
        Command::Deploy {
            staging,
            live,
            no_close,
        } => {
            let live = live
                .or_else(|| ConfiguredLocator::new(config.paths.live_dir.clone()).live_dir())
                .context("no live directory: pass --live or set paths.live_dir in the config")?;
            let close = config.deploy.close_game && !no_close;
            let mut engine = DeployEngine::new(
                config.deploy_settings(),
                BackupStore::new(config.backup_settings()),
            );
            let progress = |update: DeployProgress| println!("[{:>3}%] {}", update.percent, update.step);
            let report = engine.transaction(|scope| scope.deploy(&staging, &live, Some(&progress), close))?;
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            println!(
                "Deployed {} file(s) via {} to {} (backup: {})",
                report.verified_files,
                report.strategy.label(),
                report.published.display(),
                report.backup.display()
            );
        }
        Command::Backup { source, store } => {
            let store = store
                .or_else(|| config.backup.store_dir.clone())
                .unwrap_or_else(|| default_store(&source));
            let progress = |percent: f32| println!("[{percent:>5.1}%]");
            let snapshot = BackupStore::new(config.backup_settings()).create_backup(&source, &store, Some(&progress))?;
            println!("Backup created: {}", snapshot.display());
        }
        Command::Restore { snapshot, target } => {
            let restored = BackupStore::new(config.backup_settings()).restore_backup(&snapshot, &target, true, None)?;
            println!("Restored {restored} file(s) into {}", target.display());
        }
        Command::VerifyBackup(snapshot) => {
            let check = BackupStore::new(config.backup_settings()).verify_backup(&snapshot);
            println!("{}: {check}", snapshot.display());
            if !check.is_valid() {
                bail!("backup failed verification");
            }
        }
        Command::ListBackups(store) => {
            let backups = BackupStore::new(config.backup_settings()).list_backups(&store);
            if backups.is_empty() {
                println!("No backups in {}", store.display());
            }
            for info in backups {
                println!(
                    "{}  {:>9.2} MB  {:>6} files  {}",
                    info.path.display(),
                    info.size_mb(),
                    info.file_count,
                    if info.is_valid { "valid" } else { "INVALID" }
                );
            }
        }
        Command::Help | Command::Version => {}
    }
    Ok(())
}

fn print_scan(scan: &ScanResult) {
    for category in Category::ALL {
        let Some(files) = scan.get(&category) else {
            continue;
        };
        println!("{} ({})", category.label(), files.len());
        for file in files {
            if file.errors.is_empty() {
                println!("  {}", file.file_name());
            } else {
                println!("  {} - {}", file.file_name(), file.errors.join("; "));
            }
        }
    }
}

fn package_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| extension_lower(entry.path()).as_deref() == Some("package"))
        .map(|entry| entry.into_path())
        .collect()
}

fn default_store(source: &Path) -> PathBuf {
    source
        .parent()
        .unwrap_or(source)
        .join(DEFAULT_STORE_DIR_NAME)
}

fn print_help() {
    println!("modstage v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: modstage <command> [args]");
    println!();
    println!("Commands:");
    println!("  scan <dir>                            Screen and categorise mod files");
    println!("  stage <incoming> <staging>            Scan and lay out a numbered load order");
    println!("  conflicts <dir>                       Report resources defined by more than one mod");
    println!("  order <staging>                       Print the effective load order");
    println!("  deploy <staging> [--live <dir>] [--no-close]");
    println!("                                        Back up, publish and verify the staging tree");
    println!("  backup <source> [--store <dir>]       Snapshot a directory");
    println!("  restore <snapshot> <target>           Restore a snapshot with checksum checks");
    println!("  verify-backup <snapshot>              Check a snapshot's manifest and contents");
    println!("  list-backups <store>                  List snapshots, newest first");
}
