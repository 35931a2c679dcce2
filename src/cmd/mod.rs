mod baseline;
mod config;
mod diff;
mod discover;
mod fixtures;
mod init;
mod migrate;
mod snapshot;
mod update;

use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

use crate::config::RegressConfig;
use crate::report::ReportFormat;
use crate::snapshot::DumpFormat;
use crate::suite::Suite;

const AFTER_HELP: &str = "\x1b[1mCommon workflows:\x1b[0m
  Set up a project and seed plan files:
    regresql init && regresql add

  Build a reproducible snapshot and materialise expected outputs:
    regresql snapshot build --schema schema.sql
    regresql update

  Verify on every change:
    regresql test

  Watch for query-plan drift:
    regresql baseline && regresql check-baselines

\x1b[1mMore info:\x1b[0m
  Run 'regresql <command> --help' for command-specific options.";

#[derive(Parser)]
#[command(name = "regresql")]
#[command(version)]
#[command(about = "Regression testing for hand-written SQL queries against PostgreSQL")]
#[command(after_help = AFTER_HELP)]
#[command(arg_required_else_help = true)]
#[command(max_term_width = 100)]
pub struct Cli {
    /// Project root (the directory holding the SQL files and regresql/)
    #[arg(short = 'C', long = "dir", global = true, default_value = ".", value_hint = ValueHint::DirPath)]
    pub dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

// Help heading constants for consistency
const EXECUTION: &str = "Execution";
const FILTERING: &str = "Filtering";
const BEHAVIOR: &str = "Behavior";
const OUTPUT: &str = "Output";

#[derive(Subcommand)]
pub enum Commands {
    /// Create the regresql/ scaffold for a project
    Init {
        /// Also create fixtures/ and enable fixture application
        #[arg(long, help_heading = BEHAVIOR)]
        use_fixtures: bool,
    },

    /// Seed plan files for parameterised statements
    Add {
        /// Overwrite existing plan files
        #[arg(long, help_heading = BEHAVIOR)]
        force: bool,
    },

    /// List SQL files and their plan coverage
    Discover {
        /// Also list every statement with its parameters
        #[arg(long, help_heading = OUTPUT)]
        queries: bool,
    },

    /// Materialise expected outputs for every binding
    Update {
        /// Only run files whose path matches this regex
        #[arg(long, help_heading = FILTERING)]
        run: Option<String>,

        /// Print what would be written without writing
        #[arg(long, help_heading = BEHAVIOR)]
        dry_run: bool,

        /// Show a diff and confirm each write
        #[arg(long, conflicts_with = "dry_run", help_heading = BEHAVIOR)]
        interactive: bool,

        /// Only write missing expected files
        #[arg(long, help_heading = BEHAVIOR)]
        pending: bool,

        /// Commit each file's transaction instead of rolling back
        #[arg(long, help_heading = EXECUTION)]
        commit: bool,

        /// Do not restore the snapshot first
        #[arg(long, help_heading = EXECUTION)]
        no_restore: bool,

        /// Restore a specific snapshot (tag or hash prefix)
        #[arg(long, conflicts_with = "no_restore", help_heading = EXECUTION)]
        snapshot: Option<String>,

        /// Per-query statement timeout in seconds
        #[arg(long, help_heading = EXECUTION)]
        timeout: Option<u64>,
    },

    /// Verify query outputs against the expected files
    Test {
        /// Report format: console, junit, json, github-actions, pgtap
        #[arg(short, long, default_value = "console", help_heading = OUTPUT)]
        format: ReportFormat,

        /// Write the report to a file instead of stdout
        #[arg(short, long, value_hint = ValueHint::FilePath, help_heading = OUTPUT)]
        output: Option<PathBuf>,

        /// Only run files whose path matches this regex
        #[arg(long, help_heading = FILTERING)]
        run: Option<String>,

        /// Commit each file's transaction instead of rolling back
        #[arg(long, help_heading = EXECUTION)]
        commit: bool,

        /// Per-query statement timeout in seconds
        #[arg(long, help_heading = EXECUTION)]
        timeout: Option<u64>,
    },

    /// Capture EXPLAIN baselines for every binding
    Baseline {
        /// Use EXPLAIN (ANALYZE, BUFFERS) instead of plain EXPLAIN
        #[arg(long, help_heading = EXECUTION)]
        analyze: bool,

        /// Only run files whose path matches this regex
        #[arg(long, help_heading = FILTERING)]
        run: Option<String>,

        /// Per-query statement timeout in seconds
        #[arg(long, help_heading = EXECUTION)]
        timeout: Option<u64>,
    },

    /// Correlate stored baselines with the current snapshot
    CheckBaselines,

    /// Snapshot lifecycle: capture, restore, build, info, tag, list
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Fixture lifecycle: list, validate, show, apply, deps, scaffold
    #[command(subcommand)]
    Fixtures(FixtureCommands),

    /// Run all bindings before and after a migration and diff
    Migrate {
        /// Migration SQL script applied through psql
        #[arg(long, value_hint = ValueHint::FilePath, help_heading = EXECUTION)]
        script: Option<PathBuf>,

        /// Migration command run with PGURI in the environment
        #[arg(long, conflicts_with = "script", help_heading = EXECUTION)]
        command: Option<String>,

        /// Keep the before/after output trees on disk
        #[arg(long, help_heading = BEHAVIOR)]
        keep_temp: bool,

        /// Per-query statement timeout in seconds
        #[arg(long, help_heading = EXECUTION)]
        timeout: Option<u64>,
    },

    /// Compare query outputs between two snapshots
    Diff {
        /// Snapshot to restore first (tag or hash prefix)
        #[arg(long, help_heading = EXECUTION)]
        from: String,

        /// Snapshot to compare against (tag or hash prefix)
        #[arg(long, help_heading = EXECUTION)]
        to: String,

        /// Only run files whose path matches this regex
        #[arg(long, help_heading = FILTERING)]
        query: Option<String>,

        /// Per-query statement timeout in seconds
        #[arg(long, help_heading = EXECUTION)]
        timeout: Option<u64>,
    },

    /// Inspect or update regress.yaml
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,

        /// Connect to the database and report the server version
        #[arg(long, help_heading = BEHAVIOR)]
        test: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Dump the live database and record it
    Capture {
        /// Dump format: custom, plain, directory
        #[arg(long, help_heading = OUTPUT)]
        format: Option<DumpFormat>,

        /// Dump schema only, no data
        #[arg(long, help_heading = BEHAVIOR)]
        schema_only: bool,

        /// Dump only this section: pre-data, data, post-data
        #[arg(long, help_heading = BEHAVIOR)]
        section: Option<String>,

        /// Dump target path (default: configured or timestamped)
        #[arg(short, long, value_hint = ValueHint::FilePath, help_heading = OUTPUT)]
        output: Option<PathBuf>,

        /// Free-form note stored in the metadata record
        #[arg(long, help_heading = OUTPUT)]
        note: Option<String>,
    },

    /// Restore a snapshot into the configured database
    Restore {
        /// Tag, hash prefix, or dump path (default: current snapshot)
        target: Option<String>,

        /// Drop and recreate the public schema first
        #[arg(long, help_heading = BEHAVIOR)]
        clean: bool,

        /// Override format auto-detection
        #[arg(long, help_heading = BEHAVIOR)]
        format: Option<DumpFormat>,
    },

    /// Compose a snapshot from schema, migrations, and fixtures
    Build {
        /// Schema file applied first
        #[arg(long, value_hint = ValueHint::FilePath, help_heading = EXECUTION)]
        schema: Option<PathBuf>,

        /// Directory of migrations applied in filename order
        #[arg(long, value_hint = ValueHint::DirPath, help_heading = EXECUTION)]
        migrations: Option<PathBuf>,

        /// Fixtures to apply (comma-separated; default: configured)
        #[arg(long, help_heading = EXECUTION)]
        fixtures: Option<String>,

        /// Dump format: custom, plain, directory
        #[arg(long, help_heading = OUTPUT)]
        format: Option<DumpFormat>,

        /// Dump target path
        #[arg(short, long, value_hint = ValueHint::FilePath, help_heading = OUTPUT)]
        output: Option<PathBuf>,

        /// Free-form note stored in the metadata record
        #[arg(long, help_heading = OUTPUT)]
        note: Option<String>,
    },

    /// Show one snapshot record in full
    Info {
        /// Tag or hash prefix (default: current snapshot)
        target: Option<String>,
    },

    /// Tag or annotate a snapshot record
    Tag {
        /// Hash prefix or existing tag
        target: String,

        /// Tag to set
        #[arg(long, help_heading = BEHAVIOR)]
        tag: Option<String>,

        /// Note to set
        #[arg(long, help_heading = BEHAVIOR)]
        note: Option<String>,

        /// Copy the dump file to this path
        #[arg(long, value_hint = ValueHint::FilePath, help_heading = BEHAVIOR)]
        archive: Option<PathBuf>,
    },

    /// List snapshot history
    List,
}

#[derive(Subcommand)]
pub enum FixtureCommands {
    /// List fixtures with their tables and dependencies
    List,

    /// Validate fixtures against the live schema
    Validate,

    /// Print one fixture as YAML
    Show {
        /// Fixture name
        name: String,
    },

    /// Apply fixtures inside a single transaction
    Apply {
        /// Fixture names (default: all)
        names: Vec<String>,

        /// TRUNCATE targeted tables first, children before parents
        #[arg(long, help_heading = BEHAVIOR)]
        truncate: bool,
    },

    /// Print the fixture dependency order
    Deps,

    /// Emit a skeleton fixture guessed from schema and statistics
    Scaffold {
        /// Fixture name (default: scaffold)
        name: Option<String>,

        /// Only scaffold these tables (comma-separated)
        #[arg(long, help_heading = FILTERING)]
        tables: Option<String>,

        /// Rows per table
        #[arg(long, default_value = "10", help_heading = BEHAVIOR)]
        counts: usize,

        /// Overwrite an existing fixture file
        #[arg(long, help_heading = BEHAVIOR)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print one key, or the whole config
    Get {
        /// Dotted key, e.g. snapshot.format
        key: Option<String>,
    },

    /// Set one key and rewrite regress.yaml
    Set {
        /// Dotted key, e.g. snapshot.format
        key: String,
        value: String,
    },
}

/// Load the config and derive the suite layout for a project root.
pub(crate) fn load_project(dir: &std::path::Path) -> anyhow::Result<(Suite, RegressConfig)> {
    let bootstrap = Suite::new(dir, None);
    let config = RegressConfig::load(&bootstrap)?;
    let suite = Suite::new(dir, config.root.as_deref());
    Ok((suite, config))
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let dir = cli.dir;
    match cli.command {
        Commands::Init { use_fixtures } => init::run(dir, use_fixtures),
        Commands::Add { force } => discover::add(dir, force),
        Commands::Discover { queries } => discover::run(dir, queries),
        Commands::Update {
            run,
            dry_run,
            interactive,
            pending,
            commit,
            no_restore,
            snapshot,
            timeout,
        } => update::run(
            dir, run, dry_run, interactive, pending, commit, no_restore, snapshot, timeout,
        ),
        Commands::Test {
            format,
            output,
            run,
            commit,
            timeout,
        } => test::run(dir, format, output, run, commit, timeout),
        Commands::Baseline {
            analyze,
            run,
            timeout,
        } => baseline::run(dir, analyze, run, timeout),
        Commands::CheckBaselines => baseline::check(dir),
        Commands::Snapshot(command) => snapshot::run(dir, command),
        Commands::Fixtures(command) => fixtures::run(dir, command),
        Commands::Migrate {
            script,
            command,
            keep_temp,
            timeout,
        } => migrate::run(dir, script, command, keep_temp, timeout),
        Commands::Diff {
            from,
            to,
            query,
            timeout,
        } => diff::run(dir, from, to, query, timeout),
        Commands::Config { action, test } => config::run(dir, action, test),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "regresql", &mut io::stdout());
            Ok(())
        }
    }
}

/// Compile a `--run`/`--query` filter.
pub(crate) fn compile_filter(pattern: Option<String>) -> anyhow::Result<Option<regex::Regex>> {
    match pattern {
        Some(p) => Ok(Some(
            regex::Regex::new(&p)
                .map_err(|e| anyhow::anyhow!("invalid filter regex \"{p}\": {e}"))?,
        )),
        None => Ok(None),
    }
}
