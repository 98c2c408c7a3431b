use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use storefront_core::{
    config::{self, AppConfig},
    db::{self, DbPool},
    entities::stock_history::JournalType,
    events::{Event, EventSender},
    jobs::{run_auto_confirm_pass, run_expiry_pass, JobReport},
    services::{
        factory::ServiceFactory,
        stock_ledger::{AdjustStock, StockLedger},
    },
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::ExpireOrders => {
            let report = run_expiry_pass(
                &context.db,
                &context.config.retry_policy(),
                &context.event_sender,
                Utc::now(),
            )
            .await
            .context("order expiry pass failed")?;
            render_report("expire-orders", &report, cli.json)?;
        }
        Commands::ConfirmDeliveries => {
            let report = run_auto_confirm_pass(
                &context.db,
                &context.event_sender,
                Utc::now(),
                context.config.auto_confirm_after(),
            )
            .await
            .context("auto-confirm pass failed")?;
            render_report("confirm-deliveries", &report, cli.json)?;
        }
        Commands::Stock(command) => handle_stock_command(&context, command, cli.json).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "storefront", about = "Storefront maintenance CLI", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Cancel unpaid bank-transfer orders past their payment window
    ExpireOrders,
    /// Confirm delivered orders past the acknowledgement grace period
    ConfirmDeliveries,
    #[command(subcommand)]
    Stock(StockCommands),
}

#[derive(Subcommand)]
enum StockCommands {
    /// Apply a relative correction to a stock row
    Adjust(AdjustArgs),
    /// Overwrite a stock row's quantity
    Set(SetArgs),
    /// Move units of a product between stores
    Transfer(TransferArgs),
    /// Show the ledger for a stock row
    History(HistoryArgs),
}

#[derive(Args)]
struct AdjustArgs {
    #[arg(long)]
    stock_id: Uuid,
    #[arg(long, allow_hyphen_values = true)]
    delta: i32,
    #[arg(long, default_value = "cli")]
    actor: String,
    #[arg(long)]
    note: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    allow_negative: bool,
}

#[derive(Args)]
struct SetArgs {
    #[arg(long)]
    stock_id: Uuid,
    #[arg(long)]
    quantity: i32,
    #[arg(long, default_value = "cli")]
    actor: String,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Args)]
struct TransferArgs {
    #[arg(long)]
    product_id: Uuid,
    #[arg(long)]
    from_store: Uuid,
    #[arg(long)]
    to_store: Uuid,
    #[arg(long)]
    quantity: i32,
    #[arg(long, default_value = "cli")]
    actor: String,
}

#[derive(Args)]
struct HistoryArgs {
    #[arg(long)]
    stock_id: Uuid,
}

async fn handle_stock_command(context: &CliContext, command: StockCommands, json: bool) -> Result<()> {
    let ledger = context.stock_ledger();

    match command {
        StockCommands::Adjust(args) => {
            let mut input = AdjustStock::new(args.delta, args.actor, JournalType::Adjustment);
            if let Some(note) = args.note {
                input = input.with_note(note);
            }
            if args.allow_negative {
                input = input.allowing_negative();
            }
            let stock = ledger
                .adjust_stock(args.stock_id, input)
                .await
                .context("failed to adjust stock")?;
            if json {
                print_json(&stock)?;
            } else {
                println!("Stock {} now at {}", stock.id, stock.quantity);
            }
        }
        StockCommands::Set(args) => {
            let stock = ledger
                .set_absolute(args.stock_id, args.quantity, &args.actor, args.note)
                .await
                .context("failed to set stock quantity")?;
            if json {
                print_json(&stock)?;
            } else {
                println!("Stock {} set to {}", stock.id, stock.quantity);
            }
        }
        StockCommands::Transfer(args) => {
            let transfer = ledger
                .transfer_stock(
                    args.product_id,
                    args.from_store,
                    args.to_store,
                    args.quantity,
                    &args.actor,
                )
                .await
                .context("failed to transfer stock")?;
            if json {
                print_json(&transfer)?;
            } else {
                println!(
                    "Transfer {}: store {} now {}, store {} now {}",
                    transfer.transfer_id,
                    transfer.from.store_id,
                    transfer.from.quantity,
                    transfer.to.store_id,
                    transfer.to.quantity
                );
            }
        }
        StockCommands::History(args) => {
            let rows = ledger
                .history(args.stock_id)
                .await
                .context("failed to load stock history")?;
            if json {
                print_json(&rows)?;
            } else if rows.is_empty() {
                println!("No history for stock {}", args.stock_id);
            } else {
                for row in rows {
                    println!(
                        "- {} {:>6} {} -> {} ({:?}/{:?}) by {}",
                        row.created_at.format("%Y-%m-%d %H:%M:%S"),
                        row.quantity_diff,
                        row.quantity_old,
                        row.quantity_new,
                        row.change_type,
                        row.journal_type,
                        row.created_by
                    );
                }
            }
        }
    }

    Ok(())
}

struct CliContext {
    config: AppConfig,
    db: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(&config.log_level, config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(32);
        let event_sender = Arc::new(EventSender::new(event_tx));

        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                debug!(target: "storefront_cli", event = ?event, "received async event");
            }
        });

        Ok(Self {
            config,
            db,
            event_sender,
        })
    }

    fn stock_ledger(&self) -> StockLedger {
        ServiceFactory::new(
            self.db.clone(),
            self.event_sender.as_ref().clone(),
            self.config.retry_policy(),
            self.config.payment_window(),
        )
        .stock_ledger()
    }
}

fn render_report(job: &str, report: &JobReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!(
        "{}: {} selected, {} succeeded, {} skipped, {} failed",
        job, report.selected, report.succeeded, report.skipped, report.failed
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
