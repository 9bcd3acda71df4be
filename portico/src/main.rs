use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use portico_lib::{build_core, drop_privileges, load_from_path};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP/HTTPS reverse proxy and load balancer")]
struct Cli {
    /// Check the configuration and exit
    #[arg(short = 'c', long = "check")]
    check: bool,

    /// Log errors to stderr (implies foreground)
    #[arg(short = 'e')]
    errors_to_stderr: bool,

    /// Stay in the foreground (always on; daemonizing is the
    /// supervisor's job)
    #[arg(short = 'F', long = "foreground")]
    foreground: bool,

    /// Configuration file
    #[arg(
        short = 'f',
        long = "config",
        value_name = "FILE",
        default_value = "/etc/portico/portico.toml"
    )]
    config: PathBuf,

    /// Write the process ID to this file
    #[arg(short = 'p', long = "pid-file", value_name = "FILE")]
    pid_file: Option<PathBuf>,

    /// Echo startup logs verbosely
    #[arg(short = 'v')]
    verbose: bool,

    /// Feature toggles: dns, no-dns, warn-deprecated
    #[arg(short = 'W', value_name = "FEATURE")]
    features: Vec<String>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut dns_override: Option<bool> = None;
    for feature in &cli.features {
        match feature.as_str() {
            "dns" => dns_override = Some(true),
            "no-dns" => dns_override = Some(false),
            "warn-deprecated" => {}
            f if f.starts_with("include-dir=") => {
                tracing::warn!(feature = %f, "include directories are not used by the TOML configuration");
            }
            other => {
                error!(feature = %other, "unknown -W feature");
                return ExitCode::FAILURE;
            }
        }
    }

    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "configuration error");
            return ExitCode::FAILURE;
        }
    };
    let dns_enabled = dns_override.unwrap_or(cfg.resolver.enable);

    if cli.check {
        // a full graph build catches what deserialization can't
        return match build_core(&cfg, dns_enabled) {
            Ok(_) => {
                info!(config = %cli.config.display(), "configuration OK");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(%err, "configuration error");
                ExitCode::FAILURE
            }
        };
    }

    let core = match build_core(&cfg, dns_enabled) {
        Ok(core) => core,
        Err(err) => {
            error!(%err, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    if let Some(pid_file) = &cli.pid_file {
        if let Err(err) = std::fs::write(pid_file, format!("{}\n", std::process::id())) {
            error!(%err, path = %pid_file.display(), "can't write PID file");
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "can't start runtime");
            return ExitCode::FAILURE;
        }
    };

    // bind as the startup user, then shed privileges before serving
    let bound = match portico_lib::bind(core, cli.config.clone(), dns_enabled) {
        Ok(b) => b,
        Err(err) => {
            error!(%err, "can't bind listeners");
            return ExitCode::FAILURE;
        }
    };
    if cfg.user.is_some() || cfg.group.is_some() || cfg.root_jail.is_some() {
        if let Err(err) = drop_privileges(
            cfg.user.as_deref(),
            cfg.group.as_deref(),
            cfg.root_jail.as_deref(),
        ) {
            error!(%err, "can't drop privileges");
            return ExitCode::FAILURE;
        }
    }

    let result = runtime.block_on(bound.run());

    if let Some(pid_file) = &cli.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "proxy exited with error");
            ExitCode::FAILURE
        }
    }
}
