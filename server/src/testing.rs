//! In-process fakes for the remote collaborators and fixture builders.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::config::tenant::RemoteService;
use crate::config::{ApiKey, ApiPermission, TenantConfig, TenantContext};
use crate::models::{
    CategoryCode, Event, LedgerAction, Price, PriceSold, Product, ProductSold, TransactionReceipt, User,
};
use crate::sales::Sales;
use crate::services::{
    CashlessClient, CashlessError, CheckoutSession, ContentPublisher, InvoiceMailer, InvoiceNotice, LedgerBridge,
    LedgerClient, LedgerError, MembershipTransaction, NewCheckout, NewPrice, Notifiers, NotifyError,
    PaymentProvider, ProviderError, ProviderSubscription, SaleRecord, SessionPaymentStatus, Subscriber, Task,
    TaskQueue, TaskWorker, WebhookSender,
};
use crate::store::{MemoryStore, Store};

/// Operator key allowed to scan tickets.
pub(crate) const DOOR_KEY: &str = "door-secret";
/// Operator key allowed to publish events and manage payments.
pub(crate) const OFFICE_KEY: &str = "office-secret";

pub(crate) fn tenant_named(slug: &str) -> TenantContext {
    let mut config = TenantConfig::new(slug, "La Raffinerie");
    config.payment.test_api_key = Some("sk_test_demo".into());
    config.ledger = Some(RemoteService {
        url: "https://fedow.example.org".into(),
        key: "ledger-key".into(),
    });
    config.cashless = Some(RemoteService {
        url: "https://cashless.example.org".into(),
        key: "cashless-key".into(),
    });
    config.api_keys = vec![
        ApiKey::new("door", DOOR_KEY, vec![ApiPermission::Ticket]),
        ApiKey::new("office", OFFICE_KEY, vec![ApiPermission::Event, ApiPermission::Reservation]),
    ];
    TenantContext::new(Arc::new(config), Some("sk_root")).unwrap()
}

pub(crate) fn tenant() -> TenantContext {
    tenant_named("demo")
}

#[derive(Default)]
struct ProviderState {
    sessions: HashMap<String, CheckoutSession>,
    subscriptions: HashMap<String, ProviderSubscription>,
    products: HashSet<String>,
    created_products: Vec<String>,
    created_prices: Vec<NewPrice>,
    checkouts: Vec<NewCheckout>,
    session_reads: usize,
    fail_checkout: bool,
    counter: usize,
}

#[derive(Default)]
pub(crate) struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn pay(&self, session_id: &str, amount_total: i64) {
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.get_mut(session_id).unwrap();
        session.payment_status = SessionPaymentStatus::Paid;
        session.amount_total = Some(amount_total);
        session.payment_intent = Some(format!("pi_{session_id}"));
    }

    pub fn subscribe(&self, session_id: &str, subscription: &str, invoice: &str) {
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.get_mut(session_id).unwrap();
        session.mode = Some("subscription".into());
        session.subscription = Some(subscription.into());
        state.subscriptions.insert(
            subscription.to_string(),
            ProviderSubscription {
                id: subscription.into(),
                status: Some("active".into()),
                latest_invoice: Some(invoice.into()),
            },
        );
    }

    pub fn expire(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.get_mut(session_id).unwrap();
        session.expires_at = Some((Utc::now() - ChronoDuration::minutes(5)).timestamp());
    }

    /// The next checkout creation fails as if the provider were down.
    pub fn fail_next_checkout(&self) {
        self.state.lock().unwrap().fail_checkout = true;
    }

    pub fn forget_product(&self, product_id: &str) {
        self.state.lock().unwrap().products.remove(product_id);
    }

    pub fn created_products(&self) -> Vec<String> {
        self.state.lock().unwrap().created_products.clone()
    }

    pub fn created_prices(&self) -> Vec<NewPrice> {
        self.state.lock().unwrap().created_prices.clone()
    }

    pub fn checkouts(&self) -> Vec<NewCheckout> {
        self.state.lock().unwrap().checkouts.clone()
    }

    pub fn session_reads(&self) -> usize {
        self.state.lock().unwrap().session_reads
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn retrieve_checkout_session(
        &self,
        _tenant: &TenantContext,
        session_id: &str,
    ) -> Result<CheckoutSession, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.session_reads += 1;
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))
    }

    async fn retrieve_subscription(
        &self,
        _tenant: &TenantContext,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(subscription_id.to_string()))
    }

    async fn create_product(
        &self,
        _tenant: &TenantContext,
        name: &str,
        _image: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let id = format!("prod_{}", state.counter);
        state.products.insert(id.clone());
        state.created_products.push(name.to_string());
        Ok(id)
    }

    async fn product_exists(&self, _tenant: &TenantContext, product_id: &str) -> Result<bool, ProviderError> {
        Ok(self.state.lock().unwrap().products.contains(product_id))
    }

    async fn create_price(&self, _tenant: &TenantContext, price: &NewPrice) -> Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let id = format!("price_{}", state.counter);
        state.created_prices.push(price.clone());
        Ok(id)
    }

    async fn create_checkout_session(
        &self,
        _tenant: &TenantContext,
        checkout: &NewCheckout,
    ) -> Result<CheckoutSession, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_checkout {
            state.fail_checkout = false;
            return Err(ProviderError::Timeout);
        }
        state.counter += 1;
        let id = format!("cs_test_{}", state.counter);
        let session = CheckoutSession {
            id: id.clone(),
            payment_status: SessionPaymentStatus::Unpaid,
            mode: Some(if checkout.subscription { "subscription" } else { "payment" }.into()),
            amount_total: None,
            expires_at: Some((Utc::now() + ChronoDuration::hours(1)).timestamp()),
            subscription: None,
            payment_intent: None,
            customer: None,
            invoice: None,
            url: Some(format!("https://checkout.example.org/{id}")),
            metadata: checkout.metadata.clone(),
        };
        state.sessions.insert(id, session.clone());
        state.checkouts.push(checkout.clone());
        Ok(session)
    }
}

#[derive(Default)]
struct LedgerState {
    delay: Option<Duration>,
    failures: u32,
    reject: bool,
    attempts: usize,
    pushes: Vec<MembershipTransaction>,
}

#[derive(Default)]
pub(crate) struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// The next `n` pushes fail with a network error.
    pub fn fail_times(&self, n: u32) {
        self.state.lock().unwrap().failures = n;
    }

    pub fn reject_next(&self) {
        self.state.lock().unwrap().reject = true;
    }

    /// Accepted pushes.
    pub fn pushes(&self) -> Vec<MembershipTransaction> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn push_membership(
        &self,
        _tenant: &TenantContext,
        transaction: &MembershipTransaction,
    ) -> Result<TransactionReceipt, LedgerError> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(LedgerError::Network("connection reset".into()));
        }
        if state.reject {
            state.reject = false;
            return Err(LedgerError::Rejected {
                status: 400,
                body: "invalid membership".into(),
            });
        }
        state.pushes.push(transaction.clone());
        Ok(TransactionReceipt {
            uuid: Uuid::new_v4(),
            hash: hex::encode(Sha256::digest(transaction.reference.as_bytes())),
            datetime: Utc::now(),
            subscription_start_datetime: Some(transaction.subscription_start_datetime),
            sender: Uuid::new_v4(),
            receiver: transaction.membership,
            asset: Uuid::new_v4(),
            amount: transaction.amount,
            action: LedgerAction::Subscribe,
            previous_transaction: Uuid::new_v4(),
            comment: None,
            metadata: None,
            verify_hash: true,
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeCashless {
    sales: Mutex<Vec<SaleRecord>>,
}

impl FakeCashless {
    pub fn sales(&self) -> Vec<SaleRecord> {
        self.sales.lock().unwrap().clone()
    }
}

#[async_trait]
impl CashlessClient for FakeCashless {
    async fn record_sale(&self, _tenant: &TenantContext, sale: &SaleRecord) -> Result<(), CashlessError> {
        self.sales.lock().unwrap().push(sale.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeContent {
    published: Mutex<Vec<Subscriber>>,
}

impl FakeContent {
    pub fn published(&self) -> Vec<Subscriber> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentPublisher for FakeContent {
    async fn publish_member(&self, _tenant: &TenantContext, subscriber: &Subscriber) -> Result<(), NotifyError> {
        self.published.lock().unwrap().push(subscriber.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeInvoices {
    sent: Mutex<Vec<InvoiceNotice>>,
}

impl FakeInvoices {
    pub fn sent(&self) -> Vec<InvoiceNotice> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl InvoiceMailer for FakeInvoices {
    async fn send_invoice(&self, _tenant: &TenantContext, notice: &InvoiceNotice) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeWebhooks {
    failures: Mutex<u32>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeWebhooks {
    pub fn fail_times(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookSender for FakeWebhooks {
    async fn post(&self, url: &str, payload: &Value) -> Result<String, NotifyError> {
        self.calls.lock().unwrap().push((url.to_string(), payload.clone()));
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(NotifyError::Rejected {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok("ok".into())
    }
}

/// A [`Sales`] wired to the memory store and the fakes above.
pub(crate) struct TestServices {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub ledger: Arc<FakeLedger>,
    pub cashless: Arc<FakeCashless>,
    pub content: Arc<FakeContent>,
    pub invoices: Arc<FakeInvoices>,
    pub webhooks: Arc<FakeWebhooks>,
    pub sales: Sales,
    rx: Mutex<UnboundedReceiver<Task>>,
}

impl TestServices {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::default());
        let ledger = Arc::new(FakeLedger::default());
        let cashless = Arc::new(FakeCashless::default());
        let (queue, rx) = TaskQueue::channel();
        let bridge = LedgerBridge::new(
            ledger.clone(),
            cashless.clone(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let sales = Sales::new(store.clone(), provider.clone(), bridge, queue, "https://billetterie.example.org");
        Self {
            store,
            provider,
            ledger,
            cashless,
            content: Arc::new(FakeContent::default()),
            invoices: Arc::new(FakeInvoices::default()),
            webhooks: Arc::new(FakeWebhooks::default()),
            sales,
            rx: Mutex::new(rx),
        }
    }

    pub fn worker(&self) -> TaskWorker {
        let bridge = LedgerBridge::new(
            self.ledger.clone(),
            self.cashless.clone(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        TaskWorker::new(
            self.store.clone(),
            bridge,
            Notifiers {
                content: self.content.clone(),
                invoices: self.invoices.clone(),
                webhooks: self.webhooks.clone(),
                timeout: Duration::from_millis(200),
            },
            3,
            Duration::from_millis(1),
        )
    }

    /// Tasks queued so far.
    pub fn drain_tasks(&self) -> Vec<Task> {
        let mut rx = self.rx.lock().unwrap();
        let mut tasks = Vec::new();
        while let Ok(task) = rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    /// Runs every queued task to completion.
    pub async fn run_tasks(&self) -> usize {
        let tasks = self.drain_tasks();
        let worker = self.worker();
        let count = tasks.len();
        for task in tasks {
            worker.handle(task).await;
        }
        count
    }

    pub async fn user(&self, tenant: &TenantContext, email: &str) -> User {
        let mut user = User::new(email);
        user.first_name = Some("Ada".into());
        user.last_name = Some("Lovelace".into());
        self.store.insert_user(tenant, &user).await.unwrap();
        user
    }

    pub async fn product(
        &self,
        tenant: &TenantContext,
        name: &str,
        category: CategoryCode,
        amount: Decimal,
    ) -> (Product, Price) {
        let product = Product::new(name, category);
        self.store.insert_product(tenant, &product).await.unwrap();
        let price = Price::new(&product, format!("{name} tarif"), amount).unwrap();
        self.store.insert_price(tenant, &price).await.unwrap();
        (product, price)
    }

    /// Stores `price` after the caller adjusted it.
    pub async fn save_price(&self, tenant: &TenantContext, product: &Product, mutate: impl FnOnce(&mut Price)) -> Price {
        let mut price = Price::new(product, format!("{} variante", product.name), Decimal::ZERO).unwrap();
        mutate(&mut price);
        self.store.insert_price(tenant, &price).await.unwrap();
        price
    }

    pub async fn event(&self, tenant: &TenantContext, products: &[&Product], capacity: i32) -> Event {
        let mut event = Event::new("Concert de soutien", Utc::now() + ChronoDuration::days(7), capacity);
        event.product_ids = products.iter().map(|p| p.uuid).collect();
        self.store.insert_event(tenant, &event).await.unwrap();
        event
    }

    /// Snapshots without publishing to the provider.
    pub async fn snapshot(
        &self,
        tenant: &TenantContext,
        product: &Product,
        price: &Price,
        event_id: Option<Uuid>,
    ) -> PriceSold {
        let (product_sold, _) = self
            .store
            .get_or_insert_product_sold(tenant, ProductSold::snapshot(product, event_id))
            .await
            .unwrap();
        let (price_sold, _) = self
            .store
            .get_or_insert_price_sold(tenant, PriceSold::snapshot(&product_sold, price))
            .await
            .unwrap();
        price_sold
    }
}
