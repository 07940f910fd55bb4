use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use hookrelay::{
    api, cli, config,
    jobs::reconcile::{self, Reconciler},
    models::record::Entry,
    open_stores,
    service::token::{RevokeResult, TokenService},
    slack::SlackClient,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let args = cli::Cli::parse();

    let result = dispatch(args.command).await;

    if let Err(ref e) = result {
        tracing::error!("{:#}", e);
    }
    opentelemetry::global::shutdown_tracer_provider();
    result
}

/// Slack settings are loaded only for the commands that talk to Slack.
async fn dispatch(command: Option<cli::Commands>) -> anyhow::Result<()> {
    match command {
        Some(cli::Commands::Serve { port }) => {
            let cfg = config::load()?;
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Reconcile) => run_reconcile(config::load()?).await,
        Some(cli::Commands::Token { command }) => handle_token_command(command).await,
        None => {
            let cfg = config::load()?;
            let port = cfg.port;
            run_server(cfg, port).await
        }
    }
}

/// EnvFilter + fmt (text or JSON), plus OTLP export when
/// OTEL_EXPORTER_OTLP_ENDPOINT is set.
fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "hookrelay"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let json_logs = std::env::var("HOOKRELAY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hookrelay=info,tower_http=info".into()),
        ))
        .with(fmt_layer)
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let stores = open_stores(cfg.database_url.as_deref()).await?;
    let slack = SlackClient::new(&cfg.slack_token, &cfg.slack_api_base_url, &cfg.retry)?;

    if let Some(every) = cfg.reconcile_interval {
        let reconciler = Reconciler::new(
            stores.reconcile.clone(),
            Arc::new(slack.clone()),
            cfg.ops_channel.clone(),
        );
        reconcile::spawn(Arc::new(reconciler), every);
        tracing::info!(interval_secs = every.as_secs(), "Background reconciliation started");
    }

    let state = Arc::new(AppState {
        tokens: TokenService::new(stores.tokens),
        slack,
        config: cfg,
    });
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("hookrelay listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// One pass for external schedulers. A failure exits non-zero.
async fn run_reconcile(cfg: config::Config) -> anyhow::Result<()> {
    let stores = open_stores(cfg.database_url.as_deref()).await?;
    let slack = SlackClient::new(&cfg.slack_token, &cfg.slack_api_base_url, &cfg.retry)?;
    let reconciler = Reconciler::new(stores.reconcile, Arc::new(slack), cfg.ops_channel);

    let report = reconciler.run().await?;
    println!(
        "reconciled: archived={}, migrations={}, renames={}",
        report.archived, report.migrations, report.renames
    );
    Ok(())
}

async fn handle_token_command(cmd: cli::TokenCommands) -> anyhow::Result<()> {
    let database_url = config::database_url()?;
    let stores = open_stores(database_url.as_deref()).await?;
    let tokens = TokenService::new(stores.tokens);

    match cmd {
        cli::TokenCommands::List { channel_name } => {
            let entries: Vec<Entry> = tokens.get_tokens(&channel_name).await?;
            if entries.is_empty() {
                println!("No tokens registered for {}", channel_name);
            }
            for entry in entries {
                println!("v{}\t{}\t{}", entry.version, entry.created_at.to_rfc3339(), entry.token);
            }
        }
        cli::TokenCommands::Revoke {
            channel_name,
            token,
        } => match tokens.revoke_token(&channel_name, &token).await? {
            RevokeResult::Revoked => println!("Token revoked: channel_name={}", channel_name),
            RevokeResult::NotFound => {
                anyhow::bail!("no token matched: channel_name={}", channel_name)
            }
        },
    }
    Ok(())
}
