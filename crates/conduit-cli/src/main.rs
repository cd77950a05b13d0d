use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use conduit_core::app::{App, GatewayBuilder, GatewayConfig, RequestContext, SecurityContext};
use conduit_core::domain::{CallerId, FeedbackSubmission, HandlerName};
use conduit_core::observability::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "conduit", about = "Gateway orchestration kernel")]
struct Cli {
    /// TOML config file. Missing sections fall back to defaults.
    #[arg(long, env = "CONDUIT_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `storage.sqlite_path`.
    #[arg(long, env = "CONDUIT_SQLITE_PATH")]
    sqlite_path: Option<PathBuf>,

    /// Enables the content bridge against this base url.
    #[arg(long, env = "CONDUIT_BRIDGE_URL")]
    bridge_url: Option<String>,

    #[arg(long, env = "CONDUIT_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process one envelope `{handler, action, caller_id, payload}`.
    Handle {
        /// Envelope JSON; `-` reads stdin.
        envelope: String,
        /// Caller identity asserted by the transport. Defaults to the envelope's caller.
        #[arg(long)]
        caller_header: Option<String>,
        /// Signature material as JSON `{signature, timestamp, nonce, public_key}`.
        #[arg(long)]
        security: Option<String>,
    },
    /// Show the most recent interactions of a caller.
    History {
        caller_id: String,
        #[arg(long)]
        handler: Option<String>,
    },
    /// Submit feedback for a generation.
    Feedback {
        generation_id: i64,
        command: String,
        #[arg(long)]
        caller_id: String,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long)]
        timestamp: Option<String>,
    },
    Readiness,
    Diagnostics,
    /// Keep the nonce reaper running and log readiness until Ctrl-C.
    Run {
        #[arg(long, default_value_t = 30)]
        readiness_interval_secs: u64,
    },
}

fn load_config(cli: &Cli) -> Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(path) = &cli.sqlite_path {
        config.storage.sqlite_path = path.clone();
    }
    if let Some(url) = &cli.bridge_url {
        config.bridge.enabled = true;
        config.bridge.base_url = Some(url.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_envelope(raw: &str) -> Result<Value> {
    let text = if raw == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading envelope from stdin")?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text).context("envelope is not valid JSON")
}

fn context_for(caller_id: &str) -> Result<RequestContext> {
    let caller_id = CallerId::new(caller_id).map_err(anyhow::Error::msg)?;
    Ok(RequestContext::for_caller(&caller_id))
}

async fn run(app: App, command: Command) -> Result<()> {
    match command {
        Command::Handle {
            envelope,
            caller_header,
            security,
        } => {
            let value = read_envelope(&envelope)?;
            let caller_header = caller_header.or_else(|| {
                value
                    .get("caller_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
            let security: Option<SecurityContext> = security
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("security context is not valid JSON")?;
            let ctx = RequestContext {
                caller_header,
                security,
            };
            match app.gateway.handle_value(value, &ctx).await {
                Ok(response) => print_json(&response),
                Err(rejection) => {
                    print_json(&rejection)?;
                    bail!("request rejected ({})", rejection.code());
                }
            }
        }
        Command::History { caller_id, handler } => {
            let handler = handler
                .map(|h| HandlerName::parse(&h).with_context(|| format!("unknown handler '{h}'")))
                .transpose()?;
            let ctx = context_for(&caller_id)?;
            let caller_id = CallerId::new(caller_id).map_err(anyhow::Error::msg)?;
            let records = app.gateway.history(&caller_id, handler, &ctx).await?;
            print_json(&records)
        }
        Command::Feedback {
            generation_id,
            command,
            caller_id,
            comment,
            timestamp,
        } => {
            let ctx = context_for(&caller_id)?;
            let submission = FeedbackSubmission {
                generation_id,
                command,
                caller_id,
                comment,
                timestamp,
            };
            let receipt = app.gateway.record_feedback(&submission, &ctx).await?;
            print_json(&receipt)
        }
        Command::Readiness => {
            let readiness = app.readiness.readiness().await;
            print_json(&readiness)?;
            if !readiness.ready {
                bail!("not ready: {}", readiness.reason);
            }
            Ok(())
        }
        Command::Diagnostics => print_json(&app.readiness.diagnostics().await),
        Command::Run {
            readiness_interval_secs,
        } => {
            let reaper = app.spawn_reaper();
            let mut ticker = tokio::time::interval(Duration::from_secs(readiness_interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        let r = app.readiness.readiness().await;
                        tracing::info!(ready = r.ready, reason = %r.reason, score = r.score, "readiness");
                    }
                }
            }
            tracing::info!("shutting down");
            reaper.shutdown_and_join().await;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let config = load_config(&cli)?;
    let app = GatewayBuilder::new(config)
        .with_builtin_handlers()
        .expect_handlers(&[HandlerName::Sample, HandlerName::Math, HandlerName::Creator])
        .build()
        .context("failed to build gateway")?;

    run(app, cli.command).await
}
