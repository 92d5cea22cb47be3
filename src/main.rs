use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use stash::areas::repository::Repository;
use stash::artifacts::checkout::{CheckoutError, CheckoutOptions, CheckoutStats};
use stash::artifacts::core::default_jobs;
use stash::artifacts::diff::Change;
use stash::artifacts::gc::{GcOptions, GcScope};
use stash::artifacts::index::index_entry::key_to_string;

#[derive(Parser)]
#[command(
    name = "stash",
    version = "0.1.0",
    author = "Sami Barbut-Dica",
    about = "A content-addressed data cache and checkout tool",
    long_about = "Tracks large files and directories outside your VCS: content is \
    hashed, stored once in a local cache and linked back into the workspace, \
    so switching between versions never re-copies unchanged data.",
    help_template = r"
{name} {version} - {about}

USAGE:
    {usage}

OPTIONS:
    {all-args}
",
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(
        short,
        long,
        global = true,
        help = "Number of worker threads (defaults to the CPU count)"
    )]
    jobs: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
        name = "init",
        about = "Initialize a new repository",
        long_about = "This command initializes a new repository in the current directory or at the specified path."
    )]
    Init {
        #[arg(index = 1, help = "The path to the repository")]
        path: Option<String>,
        #[arg(long, help = "Root of a filesystem remote store")]
        remote: Option<String>,
    },
    #[command(
        name = "add",
        about = "Track files or directories",
        long_about = "This command hashes the given paths, stores their content in the \
        local cache and records them in the index."
    )]
    Add {
        #[arg(index = 1, required = true, help = "Paths to track")]
        paths: Vec<String>,
    },
    #[command(
        name = "status",
        about = "Show workspace drift against the tracked index",
        long_about = "This command compares the live workspace with the tracked index \
        and prints one line per changed output."
    )]
    Status {
        #[arg(long, help = "Print the changes as JSON")]
        json: bool,
    },
    #[command(
        name = "checkout",
        about = "Restore the workspace from the cache",
        long_about = "This command reconciles the workspace with the tracked index, \
        deleting untracked copies and linking cached content back into place."
    )]
    Checkout {
        #[arg(short, long, help = "Discard workspace content even when it is not cached anywhere")]
        force: bool,
        #[arg(long, help = "Re-link unchanged entries too")]
        relink: bool,
        #[arg(long, help = "Print the summary as JSON")]
        json: bool,
    },
    #[command(
        name = "snapshot",
        about = "Save the current index under a name",
        long_about = "This command persists the current tracked index as a named \
        snapshot, protecting its objects from workspace-scoped garbage collection."
    )]
    Snapshot {
        #[arg(index = 1, help = "The snapshot name")]
        name: String,
    },
    #[command(
        name = "gc",
        about = "Remove unreferenced objects from the cache",
        long_about = "This command deletes every cached object not referenced by the \
        requested scope. At least one scope flag is required."
    )]
    Gc {
        #[arg(short, long, help = "Keep objects referenced by the live workspace")]
        workspace: bool,
        #[arg(long, help = "Keep objects referenced by any snapshot")]
        all_snapshots: bool,
        #[arg(long = "rev", help = "Keep objects referenced by this snapshot (repeatable)")]
        revs: Vec<String>,
        #[arg(long, help = "Keep snapshots created at or after this RFC 3339 instant")]
        after_date: Option<String>,
        #[arg(long, help = "Skip revisions that fail to load instead of aborting")]
        skip_failed: bool,
        #[arg(long, help = "Also collect the configured remote store")]
        cloud: bool,
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let jobs = cli.jobs.unwrap_or_else(default_jobs);

    match &cli.command {
        Commands::Init { path, remote } => {
            let root = match path {
                Some(path) => std::path::PathBuf::from(path),
                None => std::env::current_dir()?,
            };
            let repository = Repository::init(&root, remote.as_ref().map(Into::into))?;
            println!(
                "Initialized empty repository in {}",
                repository.root().display()
            );
        }
        Commands::Add { paths } => {
            let repository = open_repository()?;
            let paths: Vec<_> = paths.iter().map(std::path::PathBuf::from).collect();
            let roots = repository.add(&paths, jobs)?;
            for root in roots {
                println!("{} {}", "added".green(), root);
            }
        }
        Commands::Status { json } => {
            let repository = open_repository()?;
            let changes = repository.status(jobs)?;
            print_status(&changes, *json)?;
        }
        Commands::Checkout {
            force,
            relink,
            json,
        } => {
            let repository = open_repository()?;
            let opts = CheckoutOptions {
                force: *force,
                relink: *relink,
                jobs,
            };
            match repository.checkout(&opts) {
                Ok(stats) => print_checkout(&stats, *json)?,
                Err(err) => {
                    // report partial progress before failing
                    if let Some(checkout_err) = err.downcast_ref::<CheckoutError>() {
                        print_checkout(&checkout_err.stats, *json)?;
                    }
                    return Err(err);
                }
            }
        }
        Commands::Snapshot { name } => {
            let repository = open_repository()?;
            repository.snapshot(name)?;
            println!("{} {}", "snapshot".green(), name);
        }
        Commands::Gc {
            workspace,
            all_snapshots,
            revs,
            after_date,
            skip_failed,
            cloud,
            json,
        } => {
            let repository = open_repository()?;
            let mut scope = GcScope::empty();
            if *workspace {
                scope |= GcScope::WORKSPACE;
            }
            if *all_snapshots {
                scope |= GcScope::ALL_SNAPSHOTS;
            }
            let after = after_date
                .as_ref()
                .map(|date| {
                    chrono::DateTime::parse_from_rfc3339(date)
                        .map(|parsed| parsed.with_timezone(&chrono::Utc))
                })
                .transpose()
                .map_err(|err| anyhow::anyhow!("Invalid --after-date: {}", err))?;
            let opts = GcOptions {
                scope,
                revs: revs.clone(),
                after,
                skip_failed: *skip_failed,
                jobs,
            };

            let report = repository.gc(&opts, *cloud)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} {} object(s) from the local cache",
                    "removed".red(),
                    report.removed_local
                );
                if let Some(removed_remote) = report.removed_remote {
                    println!(
                        "{} {} object(s) from the remote store",
                        "removed".red(),
                        removed_remote
                    );
                }
            }
        }
    }

    Ok(())
}

fn open_repository() -> Result<Repository> {
    Repository::open(&std::env::current_dir()?)
}

fn print_status(changes: &[Change], json: bool) -> Result<()> {
    if json {
        let rows: Vec<serde_json::Value> = changes
            .iter()
            .map(|change| {
                serde_json::json!({
                    "path": key_to_string(&change.key),
                    "change": change.kind,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if changes.is_empty() {
        println!("{}", "workspace is up to date".green());
        return Ok(());
    }
    for change in changes {
        let line = format!(
            "{} {}",
            change.kind.status_char(),
            key_to_string(&change.key)
        );
        println!("{}", line.yellow());
    }

    Ok(())
}

fn print_checkout(stats: &CheckoutStats, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    if stats.is_noop() {
        println!("{}", "workspace is up to date".green());
        return Ok(());
    }
    for path in &stats.added {
        println!("{} {}", "A".green(), path);
    }
    for path in &stats.modified {
        println!("{} {}", "M".yellow(), path);
    }
    for path in &stats.deleted {
        println!("{} {}", "D".red(), path);
    }
    for path in &stats.failed {
        println!("{} {}", "failed".red(), path);
    }
    for path in &stats.unrecoverable {
        println!("{} {}", "not saved anywhere".red(), path);
    }

    Ok(())
}
