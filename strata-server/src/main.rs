use clap::Parser;
use tracing_subscriber::EnvFilter;

use strata::Config;

/// Multi-tenant database schema migration service.
#[derive(Parser)]
#[command(name = "strata", version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "strata.yaml")]
    config: String,

    /// What to run.
    #[arg(default_value = "serve")]
    action: String,
}

fn init_tracing(log_level: &str) {
    // config levels DEBUG|INFO|ERROR|PANIC; PANIC keeps only errors too
    let level = match log_level {
        "DEBUG" => "debug",
        "ERROR" | "PANIC" => "error",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let (coordinator, router) = strata_server::build_app(&config).await?;

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    coordinator.dispose().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(&config.log_level);

    match args.action.as_str() {
        "serve" => {
            if let Err(e) = serve(config).await {
                tracing::error!(error = %e, "server failed");
                std::process::exit(1);
            }
        }
        other => {
            eprintln!("unknown action `{other}`");
            std::process::exit(1);
        }
    }
}
