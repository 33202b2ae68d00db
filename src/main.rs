use std::fs;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use linkprobe::cli::{Cli, Command, CommonRunArgs};
use linkprobe::config::{self, Config};
use linkprobe::error::Result;
use linkprobe::profile::SizeProfile;
use linkprobe::session::{LinkBackend, Session};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        cfg.logging.level = level.clone();
    }
    config::init_logging(&cfg.logging)?;

    match cli.command {
        Command::Run(args) => {
            if let Some(mode) = args.size_mode {
                cfg.traffic.size_mode = mode;
            }
            if let Some(mode) = args.probe_size_mode {
                cfg.probe.size_mode = Some(mode);
            }
            let session = Session::new(cfg);
            let scenario = args.scenario.to_scenario(args.bandwidth);
            let report = session.run_scenario(
                backend(&args.common),
                scenario,
                args.duration,
            )?;
            emit(&report, args.common.output.as_deref())
        }
        Command::Suite(args) => {
            let session = Session::new(cfg);
            let report = session.run_suite(backend(&args.common), args.duration)?;
            emit(&report, args.common.output.as_deref())
        }
        Command::Detailed(args) => {
            let session = Session::new(cfg);
            let report = session.run_detailed(backend(&args.common), args.count)?;
            emit(&report, args.common.output.as_deref())
        }
        Command::Profile(args) => {
            let profile = match &args.path {
                Some(path) => SizeProfile::load(path)?,
                None => SizeProfile::default_telemetry(),
            };
            print_profile(&profile);
            Ok(())
        }
        Command::Config(args) => match &args.save {
            Some(path) => {
                cfg.save(path)?;
                info!(path = %path.display(), "configuration written");
                Ok(())
            }
            None => {
                let text = toml::to_string_pretty(&cfg)
                    .map_err(|e| linkprobe::Error::Config(e.to_string()))?;
                println!("{text}");
                Ok(())
            }
        },
    }
}

fn backend(common: &CommonRunArgs) -> LinkBackend {
    if common.loopback {
        LinkBackend::Loopback {
            delay: common.loopback_delay,
        }
    } else {
        LinkBackend::Serial
    }
}

fn emit<T: Serialize>(report: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| linkprobe::Error::Internal(format!("report serialization: {e}")))?;
    match output {
        Some(path) => {
            fs::write(path, json)?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn print_profile(profile: &SizeProfile) {
    let stats = profile.statistics();
    println!("size range     : {} .. {} bytes", stats.min_size, stats.max_size);
    println!("mean / median  : {:.1} / {:.1} bytes", stats.mean_size, stats.median_size);
    println!("std dev        : {:.1} bytes", stats.std_dev);
    println!("representative : {:?}", profile.representative_sizes());
    println!(
        "est. bandwidth : {:.0} B/s from {} common messages",
        profile.estimated_bandwidth(),
        profile.common_messages().len()
    );
    println!("categories:");
    for c in profile.categories() {
        println!(
            "  {:8} p={:.4}  {:3}..{:3} bytes",
            c.name, c.probability, c.min_bytes, c.max_bytes
        );
    }
}
