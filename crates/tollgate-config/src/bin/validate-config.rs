//! Config validation CLI tool
//!
//! Validates a tollgated configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use tollgate_util::default_config_path;

fn limit(value: Option<u64>, unit: &str) -> String {
    match value {
        Some(v) if v > 0 => format!("{} {}", v, unit),
        _ => "unlimited".to_string(),
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a tollgated configuration file.");
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match tollgate_config::load_config(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", tollgate_config::CURRENT_CONFIG_VERSION);
            println!("  Socket: {}", config.service.socket_path.display());
            println!("  Data dir: {}", config.service.data_dir.display());
            println!("  Sweep every: {}s", config.service.sweep_interval.as_secs());
            println!("  Usage regression: {}", config.engine.usage_regression);
            println!("  Plans: {}", config.plans.len());

            if !config.plans.is_empty() {
                println!();
                println!("Plans:");
                for plan in &config.plans {
                    println!(
                        "  - {}: {} (data {}, time {}){}",
                        plan.plan_id,
                        plan.name,
                        limit(plan.data_limit_mb, "MB"),
                        limit(plan.time_limit_minutes, "min"),
                        if plan.is_active { "" } else { " [inactive]" }
                    );
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                tollgate_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                tollgate_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                tollgate_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                tollgate_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        tollgate_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
