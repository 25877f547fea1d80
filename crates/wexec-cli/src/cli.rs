use clap::Parser;

fn parse_topics(input: &str) -> Result<Vec<String>, String> {
    let topics: Vec<String> = input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if topics.is_empty() {
        return Err("at least one discovery topic is required".to_string());
    }
    Ok(topics)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "wexec", version, about = "Worker-based task executor demo host")]
pub struct Cli {
    /// Executor identity, used as its reply topic. Defaults to a value saved
    /// in the identity config file, generating one on first run.
    #[arg(long, env = "WEXEC_UUID")]
    pub uuid: Option<String>,

    /// Bus exchange name. Defaults to a value saved in the identity config
    /// file, falling back to `"tasks"` on first run.
    #[arg(long, env = "WEXEC_EXCHANGE")]
    pub exchange: Option<String>,

    /// Comma-separated discovery topics to probe for workers.
    #[arg(
        long,
        env = "WEXEC_TOPICS",
        default_value = "discovery",
        value_parser = parse_topics
    )]
    pub topics: Vec<String>,

    /// Default per-request deadline, in seconds.
    #[arg(long, env = "WEXEC_TRANSITION_TIMEOUT_SECS", default_value_t = 60)]
    pub transition_timeout_secs: u64,

    /// Interval between NOTIFY discovery probes, in seconds.
    #[arg(long, env = "WEXEC_DISCOVERY_PERIOD_SECS", default_value_t = 5)]
    pub discovery_period_secs: u64,

    /// Consecutive missed probe replies before a worker is evicted.
    #[arg(long, env = "WEXEC_WORKER_STALENESS_PROBES", default_value_t = 3)]
    pub worker_staleness_probes: u32,

    /// Skip starting the bundled demo worker (useful when a real worker
    /// process is running against the same bus).
    #[arg(long, env = "WEXEC_NO_DEMO_WORKER", default_value_t = false)]
    pub no_demo_worker: bool,
}
