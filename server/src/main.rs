use axum::Router;
use chrono::Utc;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use tibillet_server::config::{Config, TenantRegistry};
use tibillet_server::routes::{create_routes, AppState};
use tibillet_server::sales::Sales;
use tibillet_server::services::{
    FedowClient, GhostPublisher, HttpCashlessClient, HttpInvoiceMailer, HttpWebhookSender, LedgerBridge, Notifiers,
    StripeClient, TaskQueue, TaskWorker,
};
use tibillet_server::store::{PgStore, Store};

const TASK_RETRY_BASE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    let store = PgStore::connect(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Successfully connected to database");

    let tenants = match &config.tenants_file {
        Some(path) => TenantRegistry::load(path, config.root_payment_api_key.as_deref())
            .expect("Failed to load tenant configurations"),
        None => {
            tracing::warn!("TENANTS_FILE not set, starting without tenants");
            TenantRegistry::default()
        }
    };
    for tenant in tenants.iter() {
        store
            .ensure_schema(tenant)
            .await
            .expect("Failed to prepare tenant schema");
    }
    let store: Arc<dyn Store> = Arc::new(store);

    let bridge = LedgerBridge::new(
        Arc::new(FedowClient::new(config.timeouts.ledger)),
        Arc::new(HttpCashlessClient::new(config.timeouts.cashless)),
        config.timeouts.ledger,
        config.timeouts.cashless,
    );
    let (queue, rx) = TaskQueue::channel();
    let worker = TaskWorker::new(
        store.clone(),
        bridge.clone(),
        Notifiers {
            content: Arc::new(GhostPublisher::new(config.timeouts.notify)),
            invoices: Arc::new(HttpInvoiceMailer::new(config.timeouts.notify)),
            webhooks: Arc::new(HttpWebhookSender::new(config.timeouts.notify)),
            timeout: config.timeouts.notify,
        },
        config.webhook_max_attempts,
        TASK_RETRY_BASE,
    );
    tokio::spawn(worker.run(rx));

    let provider = Arc::new(StripeClient::new(config.provider_api_base.clone(), config.timeouts.provider));
    let sales = Sales::new(store, provider, bridge, queue, config.public_url.clone());
    let tenants = Arc::new(tenants);

    tokio::spawn(reconcile_loop(
        sales.clone(),
        tenants.clone(),
        config.reconcile_interval,
        config.reconcile_stale_after,
    ));

    let state = AppState {
        sales,
        tenants,
        webhook_secret: config.webhook_secret.clone(),
    };
    let app: Router = create_routes(state, &config);

    tracing::info!("Server running at http://{}", config.bind_addr);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server failed");
}

/// Picks up PAID attempts whose pipeline was interrupted.
async fn reconcile_loop(sales: Sales, tenants: Arc<TenantRegistry>, every: Duration, stale_after: Duration) {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::minutes(5));
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        for tenant in tenants.iter() {
            match sales.reconcile(tenant, Utc::now() - stale_after).await {
                Ok(0) => {}
                Ok(resumed) => tracing::info!(tenant = %tenant.slug(), resumed, "Reconciliation sweep done"),
                Err(e) => tracing::error!(tenant = %tenant.slug(), error = %e, "Reconciliation sweep failed"),
            }
        }
    }
}
