//! duptest - duplication test runner entry point
//!
//! Plays every spec file matching `--test` under `--path` against the proxy
//! and checks the duplicates it emits.
//!
//! Exit status: 0 all passed (or `--desc`), 1 a test failed, 2 harness or
//! setup error, 3 no spec file matched.

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use duptest_e2e::{E2eResult, FormatChoice, HarnessConfig, TestRunner};

mod output;

use output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "duptest")]
#[command(version, about = "Functional tests for HTTP-duplicating proxies")]
struct Args {
    /// Configuration file (TOML); flags override its values
    #[arg(short, long, default_value = "duptest.toml", env = "DUPTEST_CONFIG")]
    config: PathBuf,

    /// Pattern of test file(s) to run
    #[arg(long)]
    test: Option<String>,

    /// The folder containing the request files
    #[arg(long)]
    path: Option<PathBuf>,

    /// Only play the request against the proxy, no capture servers
    #[arg(long)]
    curl: bool,

    /// More verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Display the tests descriptions and exit
    #[arg(long)]
    desc: bool,

    /// The server to send the requests to
    #[arg(long)]
    server: Option<String>,

    /// The port to send the requests to
    #[arg(long)]
    port: Option<u16>,

    /// Host the capture servers bind
    #[arg(long)]
    dest_server: Option<String>,

    /// Primary duplication destination port
    #[arg(long)]
    dest_port: Option<u16>,

    /// Secondary duplication destination port
    #[arg(long)]
    secondary_port: Option<u16>,

    /// Spec file layout
    #[arg(long, value_enum)]
    format: Option<SpecLayout>,

    /// How long to wait for each duplicate (ms)
    #[arg(long)]
    wait_ms: Option<u64>,

    /// Output format
    #[arg(long, value_enum, default_value = "plain")]
    output: OutputFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum SpecLayout {
    Auto,
    Tee,
    Dup,
}

impl From<SpecLayout> for FormatChoice {
    fn from(layout: SpecLayout) -> Self {
        match layout {
            SpecLayout::Auto => FormatChoice::Auto,
            SpecLayout::Tee => FormatChoice::Tee,
            SpecLayout::Dup => FormatChoice::Dup,
        }
    }
}

impl Args {
    /// Layer the flags over the configuration file
    fn into_config(self) -> E2eResult<(HarnessConfig, OutputFormat)> {
        let mut config = HarnessConfig::load(&self.config)?;

        if let Some(test) = self.test {
            config.test_glob = test;
        }
        if let Some(path) = self.path {
            config.spec_dir = path;
        }
        if let Some(server) = self.server {
            config.proxy.host = server;
        }
        if let Some(port) = self.port {
            config.proxy.port = port;
        }
        if let Some(host) = self.dest_server {
            config.capture.host = host;
        }
        if let Some(port) = self.dest_port {
            config.capture.primary_port = port;
        }
        if let Some(port) = self.secondary_port {
            config.capture.secondary_port = port;
        }
        if let Some(layout) = self.format {
            config.format = layout.into();
        }
        if let Some(wait) = self.wait_ms {
            config.wait_timeout_ms = wait;
        }
        config.curl_only |= self.curl;
        config.verbose |= self.verbose;
        config.describe_only |= self.desc;

        Ok((config, self.output))
    }
}

fn main() {
    let args = Args::parse();
    let loaded = args.into_config();

    // Initialize logging
    let verbose = loaded.as_ref().map(|(c, _)| c.verbose).unwrap_or(false);
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            output::print_error(&format!("Failed to create tokio runtime: {}", e));
            std::process::exit(2);
        }
    };

    let result = match loaded {
        Ok((config, format)) => rt.block_on(run(config, format)),
        Err(e) => Err(e),
    };

    let code = match result {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            let code = e.exit_code();
            if code == 3 {
                output::print_warning(&e.to_string());
            } else {
                output::print_error(&e.to_string());
            }
            code
        }
    };

    // Drop the runtime before exiting so capture servers are torn down
    drop(rt);
    std::process::exit(code);
}

async fn run(config: HarnessConfig, format: OutputFormat) -> E2eResult<bool> {
    debug!("Configuration: {:?}", config);

    let mut runner = TestRunner::new(config)?;

    if runner.config().describe_only {
        let described = runner.describe()?;
        output::print_descriptions(&described, format);
        return Ok(true);
    }

    if runner.config().curl_only {
        info!("Curl-only mode: duplicates are not checked");
    }

    let results = runner.run_all().await?;
    output::print_suite(&results, format);

    Ok(results.success())
}
