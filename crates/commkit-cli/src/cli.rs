//! Command line interface definitions

use clap::{Parser, Subcommand, ValueEnum};

use commkit_core::OverflowPolicy;

/// Commkit - component communication patterns demo
#[derive(Parser)]
#[command(name = "commkit")]
#[command(about = "Run push and query scenarios between two in-process components")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query a "ping" service and expect "pong"
    Ping {
        /// Number of queries to issue
        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,

        /// Per-query timeout in milliseconds (defaults to query.default_timeout_ms)
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// Push a stream of samples through an active queue and report its counters
    Stream {
        /// Number of samples to push
        #[arg(short = 'n', long, default_value_t = 100)]
        count: u64,

        /// Overflow policy of the consumer's queue (defaults to queue.overflow)
        #[arg(short, long, value_enum)]
        policy: Option<PolicyArg>,

        /// Simulated processing time per sample in milliseconds
        #[arg(long, default_value_t = 1)]
        work_ms: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// Command line spelling of `OverflowPolicy`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Block,
    DropOldest,
    RejectNew,
}

impl From<PolicyArg> for OverflowPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Block => OverflowPolicy::Block,
            PolicyArg::DropOldest => OverflowPolicy::DropOldest,
            PolicyArg::RejectNew => OverflowPolicy::RejectNew,
        }
    }
}
