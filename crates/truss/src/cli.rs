//! Clap derive structures for the `truss` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// truss -- tooling for the truss synchronization engine
#[derive(Debug, Parser)]
#[command(
    name = "truss",
    version,
    about = "Inspect keys, hashes and diffs, and run the sync engine against an in-memory store",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Profile to use
    #[arg(long, short = 'p', env = "TRUSS_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "TRUSS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "json", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line
    Plain,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate chronologically ordered push keys
    Key(KeyArgs),

    /// Escape a raw key for use as a path segment
    Escape {
        /// Raw key
        key: String,
    },

    /// Reverse key escaping
    Unescape {
        /// Escaped key
        key: String,
    },

    /// Canonical content hash of a JSON document
    Hash {
        /// JSON file, or `-` for stdin
        file: PathBuf,
    },

    /// Changed subpaths between two JSON documents
    Diff(DiffArgs),

    /// Run the engine against an in-memory store seeded from a JSON file
    Demo(DemoArgs),

    /// Inspect configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Args)]
pub struct KeyArgs {
    /// Number of keys to generate
    #[arg(long, short = 'n', default_value = "1")]
    pub count: usize,

    /// Server clock offset in milliseconds
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub offset_ms: i64,

    /// Generate as if the clock read this many milliseconds since the epoch
    #[arg(long)]
    pub at_ms: Option<i64>,
}

#[derive(Debug, Args)]
pub struct DiffArgs {
    /// Previous JSON document
    pub old: PathBuf,

    /// Current JSON document
    pub new: PathBuf,

    /// Path both documents are rooted at
    #[arg(long, default_value = "/")]
    pub at: String,
}

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// JSON file seeding the store (overrides the profile's `seed`)
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Path to mirror
    #[arg(long, default_value = "/")]
    pub listen: String,

    /// Write a value before printing, as PATH=JSON (repeatable)
    #[arg(long = "set", value_name = "PATH=JSON")]
    pub sets: Vec<String>,

    /// Atomically increment the number at PATH (repeatable)
    #[arg(long = "increment", value_name = "PATH")]
    pub increments: Vec<String>,

    /// Deny writes under PATH in the store's rules (repeatable)
    #[arg(long = "deny-write", value_name = "PATH")]
    pub deny_writes: Vec<String>,

    /// Forward only changed subpaths
    #[arg(long)]
    pub sync: bool,

    /// Print computed-property statistics after the run
    #[arg(long)]
    pub stats: bool,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the configuration with secrets masked
    Show,
    /// Print the config file path
    Path,
    /// Show the engine settings the active profile resolves to
    Resolve,
}
