use anyhow::Result;
use rabbitmq_app_builder::utils;
use rabbitmq_app_builder::{AppBuilder, Config, HandlerError, MessageContext, QueueDefinition};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

#[derive(Debug, Deserialize)]
struct OrderPlaced {
    order_id: String,
    amount_cents: u64,
}

#[derive(Debug, Deserialize)]
struct InvoiceRequested {
    invoice_id: String,
}

// Shared across all handlers
#[derive(Default)]
struct Metrics {
    orders: AtomicUsize,
    invoices: AtomicUsize,
}

async fn handle_order(order: OrderPlaced, ctx: MessageContext<Metrics>) -> Result<(), HandlerError> {
    info!(parent: ctx.span(), order_id = %order.order_id, amount_cents = order.amount_cents, "🛒 Processing order");
    if order.amount_cents == 0 {
        return Err(HandlerError::permanent(anyhow::anyhow!(
            "Order {} has no amount",
            order.order_id
        )));
    }
    // Simulate some processing time
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    ctx.context.orders.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

async fn handle_invoice(
    invoice: InvoiceRequested,
    ctx: MessageContext<Metrics>,
) -> Result<(), HandlerError> {
    info!(parent: ctx.span(), invoice_id = %invoice.invoice_id, "🧾 Generating invoice");
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    ctx.context.invoices.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = Config::load(&path)?;
    utils::init_logging(&config.logging)?;
    info!(service = %config.service.name, config = %path, "🚀 Starting");

    let builder = AppBuilder::new(|_config: &Config| {
        vec![
            QueueDefinition::new("orders", handle_order),
            QueueDefinition::new("invoices", handle_invoice),
        ]
    });

    let app = builder.build(&config, Metrics::default()).await?;
    app.run_until_signal().await
}
