mod cli_utils;
mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::{cmd_analyze, cmd_build, cmd_inspect, cmd_lookup, cmd_watch};

#[derive(Parser)]
#[command(name = "ipatlas")]
#[command(
    about = "Load, query and check MaxMind DB (MMDB) files",
    long_about = "ipatlas - Load, query and check MaxMind DB (MMDB) files\n\n\
    DATABASE is a MaxMind edition name (GeoLite2-City), an http(s) URL, \n\
    a file:// URL or a path to a local .mmdb, .mmdb.gz or .tar.gz file.\n\n\
    Examples:\n\
      ipatlas lookup ./GeoLite2-City.mmdb 192.0.2.5\n\
      ipatlas inspect GeoLite2-ASN --license-key $KEY --json\n\
      ipatlas analyze ./suspicious.mmdb\n\
      ipatlas build networks.txt -o fixture.mmdb\n\
      ipatlas watch /var/lib/geo/City.mmdb"
)]
#[command(version)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// How to fetch the database
#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// MaxMind license key for edition downloads
    #[arg(long, env = "MAXMIND_LICENSE_KEY", hide_env_values = true)]
    pub license_key: Option<String>,

    /// Directory for cached downloads
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Do not read or write the download cache
    #[arg(long)]
    pub no_cache: bool,

    /// Seconds to wait for the database to load
    #[arg(long, default_value = "60", value_name = "SECS")]
    pub timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up an IP address
    Lookup {
        /// Database origin
        #[arg(value_name = "DATABASE")]
        database: String,

        /// IPv4 or IPv6 address
        #[arg(value_name = "ADDRESS")]
        address: String,

        /// Quiet mode - no output, only exit code (0 = found, 1 = not found)
        #[arg(short, long)]
        quiet: bool,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Show database metadata
    Inspect {
        /// Database origin
        #[arg(value_name = "DATABASE")]
        database: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Check the search tree and data section for structural flaws
    Analyze {
        /// Database origin
        #[arg(value_name = "DATABASE")]
        database: String,

        /// Output flaws as JSON
        #[arg(short, long)]
        json: bool,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Build an MMDB file from "cidr,key=value,..." lines
    Build {
        /// Input file, or "-" for stdin
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output database file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Database type name for metadata
        #[arg(short = 't', long, value_name = "NAME")]
        database_type: Option<String>,

        /// Description text
        #[arg(short = 'd', long)]
        description: Option<String>,

        /// Language code for description
        #[arg(long, default_value = "en")]
        desc_lang: String,

        /// Record size in bits: 24, 28 or 32
        #[arg(long, default_value = "24")]
        record_size: u16,
    },

    /// Keep a database loaded and print loader events until Ctrl-C
    Watch {
        /// Database origin
        #[arg(value_name = "DATABASE")]
        database: String,

        /// Refresh interval in seconds (default depends on the origin)
        #[arg(long, value_name = "SECS")]
        refresh: Option<u64>,

        #[command(flatten)]
        load: LoadArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Lookup {
            database,
            address,
            quiet,
            load,
        } => cmd_lookup(database, address, quiet, load),
        Commands::Inspect {
            database,
            json,
            load,
        } => cmd_inspect(database, json, load),
        Commands::Analyze {
            database,
            json,
            load,
        } => cmd_analyze(database, json, load),
        Commands::Build {
            input,
            output,
            database_type,
            description,
            desc_lang,
            record_size,
        } => cmd_build(input, output, database_type, description, desc_lang, record_size),
        Commands::Watch {
            database,
            refresh,
            load,
        } => cmd_watch(database, refresh, load),
    }
}
