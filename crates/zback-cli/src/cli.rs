use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "zback",
    version,
    about = "Back up ZFS datasets to cloud object stores and restore them",
    after_help = "\
Destinations are scheme://container[/prefix] URIs; a comma-separated list is
accepted wherever a single one is and every listed destination is written as
an equivalent mirror:
  aws://bucket  azure://container  gs://bucket  b2://bucket
  file:///path  ssh://user@host/path

Credentials come from per-backend environment variables, e.g.
AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY (plus AWS_S3_CUSTOM_ENDPOINT for
S3-compatible servers) and AZURE_ACCOUNT_NAME / AZURE_ACCOUNT_KEY."
)]
pub(crate) struct Cli {
    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by send and receive.
#[derive(Args)]
pub(crate) struct PipelineArgs {
    /// Object-key separator (some backends reserve '|')
    #[arg(long, default_value = "|")]
    pub separator: String,

    /// Scratch directory for volume spill files
    #[arg(long)]
    pub working_directory: Option<String>,

    /// Compressor: gzip, xz, zstd, lz4, none
    #[arg(long, default_value = "gzip")]
    pub compressor: String,

    /// Compression level (codec-specific range)
    #[arg(long)]
    pub compression_level: Option<i32>,

    /// Path to the OpenPGP public keyring
    #[arg(long)]
    pub public_keyring: Option<String>,

    /// Path to the OpenPGP secret keyring
    #[arg(long)]
    pub secret_keyring: Option<String>,

    /// Encrypt volumes to this recipient (repeatable)
    #[arg(long)]
    pub encrypt_to: Vec<String>,

    /// Sign volumes as this identity
    #[arg(long)]
    pub sign_from: Option<String>,

    /// Volume size in MiB
    #[arg(long, default_value_t = 200)]
    pub volume_size: u64,

    /// Upper bound on parallel transfers per destination
    #[arg(long, default_value_t = 4)]
    pub max_parallel: usize,

    /// Retries per transfer after the first attempt
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Backoff cap in seconds
    #[arg(long, default_value_t = 30)]
    pub max_backoff: u64,

    /// Per-request backend timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub request_timeout: u64,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Back up a snapshot (full, manual incremental, or smart incremental)
    Send {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Manual incremental source: dataset@snap or dataset#bookmark
        #[arg(short = 'i', long = "incremental", conflicts_with = "increment")]
        from: Option<String>,

        /// Smart mode: pick from/to by reconciling the destination
        #[arg(long)]
        increment: bool,

        /// On one destination failing: fail-fast or continue-others
        #[arg(long, default_value = "fail-fast")]
        failure_policy: String,

        /// dataset@snapshot to send (bare dataset with --increment)
        target: String,

        /// Comma-separated destination URIs
        destinations: String,
    },

    /// Restore a backup into `zfs receive`
    Receive {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Expected incremental source already present on the target
        #[arg(short = 'i', long = "incremental", conflicts_with = "auto")]
        from: Option<String>,

        /// Chain full and incremental manifests up to the newest
        #[arg(long)]
        auto: bool,

        /// Force rollback of the target (zfs receive -F)
        #[arg(short = 'F', long)]
        force: bool,

        /// Property overrides forwarded to zfs receive (-o prop=value)
        #[arg(short = 'o', long = "option")]
        properties: Vec<String>,

        /// dataset@snapshot to restore (bare dataset with --auto)
        source: String,

        /// Comma-separated destination URIs (mirrors tried in order)
        destinations: String,

        /// Target dataset for zfs receive
        target: String,
    },

    /// List backup manifests at a destination
    List {
        /// Glob over the volume (dataset) name
        #[arg(long)]
        volume_name: Option<String>,

        /// Only snapshots created before this time (RFC 3339, seconds)
        #[arg(long)]
        before: Option<String>,

        /// Only snapshots created after this time (RFC 3339, seconds)
        #[arg(long)]
        after: Option<String>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Destination URI(s)
        destinations: String,
    },

    /// Print version information
    Version {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
}
