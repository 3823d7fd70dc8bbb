use reqtap_core::config::{default_config, load_config, RuntimeConfig};
use reqtap_core::subscription::JsonlSink;
use reqtap_core::Runtime;

mod dev_server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(about = "Passively captures HTTP transactions to cluster services")]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,

    /// BPF filter expression for the capture handle.
    #[clap(long, env = "BPF_EXPRESSION")]
    filter: Option<String>,

    /// Capture traffic regardless of service addresses.
    #[clap(long, env = "DISABLE_SERVICE_IP_FILTERING")]
    disable_service_ip_filtering: bool,

    /// Only forward transactions carrying JSON.
    #[clap(long)]
    json_only: bool,

    /// Replay a capture file instead of capturing live.
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    pcap: Option<PathBuf>,

    /// Append transactions to FILE instead of stdout.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    output: Option<PathBuf>,

    /// Development mode: debug logging.
    #[clap(long, env = "REQTAP_DEV_MODE")]
    dev: bool,

    /// Serve "Hello, <path>!" locally to generate traffic.
    #[clap(long, env = "REQTAP_DEV_SERVER_ENABLED")]
    dev_server: bool,

    #[clap(long, default_value = "80", value_name = "PORT")]
    dev_server_port: u16,
}

impl Args {
    /// Loads the configuration file, if any, and applies command line overrides.
    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => default_config(),
        };
        if let Some(filter) = &self.filter {
            config.capture.filter = filter.clone();
        }
        if self.disable_service_ip_filtering {
            config.services.enabled = false;
        }
        if self.json_only {
            config.content.json_only = true;
        }
        if let Some(pcap) = &self.pcap {
            config.capture.pcap = Some(pcap.clone());
        }
        if let Some(output) = &self.output {
            config.sink.output = Some(output.clone());
        }
        Ok(config)
    }
}

fn init_logger(dev: bool) {
    let level = if dev { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.dev);
    if args.dev {
        log::debug!("Development mode enabled");
    }

    let config = args.runtime_config()?;
    log::debug!("{:#?}", config);

    if args.dev_server {
        dev_server::start(args.dev_server_port).await?;
    }

    let sink = JsonlSink::from_output(config.sink.output.as_ref())?;
    let runtime = Runtime::new(config, sink)?;
    runtime.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_defaults() {
        let args = Args::parse_from([
            "reqtap-sensor",
            "--filter",
            "tcp port 8080",
            "--disable-service-ip-filtering",
            "--json-only",
            "--pcap",
            "trace.pcap",
        ]);
        let config = args.runtime_config().unwrap();
        assert_eq!(config.capture.filter, "tcp port 8080");
        assert!(!config.services.enabled);
        assert!(config.content.json_only);
        assert_eq!(config.capture.pcap, Some(PathBuf::from("trace.pcap")));
        assert_eq!(config.sink.output, None);
    }
}
