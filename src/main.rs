//! Command line interface for placing, browsing and verifying P2P orders on a
//! Nostr relay.

use std::{fs, time::Duration};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nostr_orders::{
    config::Settings, signer, Event, NewOrder, OrderClient, OrderSide, SessionState,
};
use tracing::info;

/// How long to wait for stored events or an `OK`.
const QUERY_WAIT: Duration = Duration::from_secs(10);

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "nostr-orders",
    author,
    version,
    about = "Publish and track P2P orders over a Nostr relay"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Sign and publish an order, then wait for its confirmation.
    Order {
        /// `buy` or `sell`.
        #[arg(long)]
        side: OrderSide,
        /// Fiat amount.
        #[arg(long)]
        amount: u64,
        /// ISO 4217 currency code, e.g. `ARS`.
        #[arg(long)]
        fiat: String,
        /// Payment method, e.g. `MercadoPago`.
        #[arg(long)]
        method: String,
        /// Premium over market price, in percent.
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        premium: f64,
    },
    /// List stored orders, newest first.
    Orders {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one order by its id (`d` tag).
    Show { order_id: String },
    /// Publish a plain text note.
    Note { text: String },
    /// Check id and signature of event JSON files without connecting.
    Verify {
        /// Paths to JSON event files.
        #[arg(required = true)]
        files: Vec<String>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Verify { files } => verify_files(&files),
        command => {
            let cfg = Settings::from_env(&cli.env)?;
            info!(relay = %cfg.relay_url, "connecting");
            let client = OrderClient::connect(
                &cfg.relay_url,
                cfg.connect_options(),
                cfg.manager_options(),
                cfg.keys()?,
                cfg.session_options(),
            )
            .await
            .with_context(|| format!("connecting to {}", cfg.relay_url))?;
            let result = execute(&client, command).await;
            client.close();
            result
        }
    }
}

async fn execute(client: &OrderClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Order {
            side,
            amount,
            fiat,
            method,
            premium,
        } => {
            let session = client.place_order(NewOrder {
                side,
                amount,
                fiat_code: fiat,
                payment_method: method,
                premium,
            })?;
            println!(
                "order {} published as event {}",
                session.local_id(),
                session.event().map(|e| e.id.as_str()).unwrap_or_default()
            );
            let outcome = session.wait().await;
            match (outcome.state, outcome.confirmation) {
                (SessionState::Confirmed, Some(confirmation)) => {
                    println!("confirmed by event {}", confirmation.event_id);
                    println!("{}", serde_json::to_string_pretty(&confirmation.payload)?);
                }
                (state, _) => match outcome.error {
                    Some(err) => bail!("order {} ended {state:?}: {err}", session.local_id()),
                    None => bail!("order {} ended {state:?}", session.local_id()),
                },
            }
        }
        Commands::Orders { limit } => {
            let listings = client.list_orders(limit, QUERY_WAIT).await?;
            if listings.is_empty() {
                println!("no orders");
            }
            for listing in listings {
                let id = listing.order_id.as_deref().unwrap_or("-");
                match listing.order {
                    Some(order) => println!(
                        "{id}  {}  {} {}  via {}  premium {}%  ({})",
                        order.kind,
                        order.fiat_amount,
                        order.fiat_code,
                        order.payment_method,
                        order.premium,
                        order.status
                    ),
                    None => println!("{id}  event {} by {}", listing.event_id, listing.author),
                }
            }
        }
        Commands::Show { order_id } => match client.fetch_order(&order_id, QUERY_WAIT).await? {
            Some(ev) => println!("{}", serde_json::to_string_pretty(&ev)?),
            None => bail!("order not found: {order_id}"),
        },
        Commands::Note { text } => {
            let ev = client.publish_note(&text, QUERY_WAIT).await?;
            println!("{}", ev.id);
        }
        Commands::Verify { .. } => unreachable!(),
    }
    Ok(())
}

/// Verify every file and fail if any of them is invalid.
fn verify_files(files: &[String]) -> anyhow::Result<()> {
    let mut invalid = 0usize;
    for path in files {
        let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let ev: Event = serde_json::from_str(&data).with_context(|| format!("parsing {path}"))?;
        match signer::verify_event(&ev) {
            Ok(()) => println!("ok {} {}", ev.id, path),
            Err(e) => {
                invalid += 1;
                eprintln!("invalid {path}: {e}");
            }
        }
    }
    if invalid > 0 {
        bail!("{invalid} of {} events failed verification", files.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nostr_orders=debug")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
