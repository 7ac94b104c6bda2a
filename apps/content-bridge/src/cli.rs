use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bridge-sim")]
#[command(about = "Drive the content bridge against a simulated extension background")]
pub struct Cli {
    /// Page the simulated content script is injected into
    #[arg(long, default_value = "https://leetcode.com/problems/two-sum/")]
    pub url: String,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 60)]
    pub duration: u64,

    /// Evict the background worker every N seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub evict_every: u64,

    /// Invalidate the extension context at this second
    #[arg(long)]
    pub invalidate_at: Option<u64>,

    /// Seconds the context stays invalidated before the runtime returns
    #[arg(long, default_value_t = 3)]
    pub restore_after: u64,

    /// Make port sends fail for one second out of every seven
    #[arg(long)]
    pub flaky_sends: bool,

    /// Log filter used when RUST_LOG is unset (overrides BRIDGE_LOG)
    #[arg(long, env = "BRIDGE_LOG")]
    pub log_level: Option<String>,
}
