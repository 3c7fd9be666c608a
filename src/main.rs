use std::process::ExitCode;

use frameroute::{cli::config_path_from_args, config::Config, logging, runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = match config_path_from_args() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("frameroute: {err:#}");
            return ExitCode::from(1);
        }
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "frameroute: failed to load config from {}: {err:#}",
                config_path.display()
            );
            return ExitCode::from(1);
        }
    };

    let _logging_guard = match logging::init_tracing(&config.logging, &config.telemetry) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("frameroute: failed to initialize logging: {err:#}");
            return ExitCode::from(1);
        }
    };

    match runtime::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "runtime", error = %err, "frameroute stopped with error");
            eprintln!("frameroute: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
