use chrono::Utc;
use rust_decimal::Decimal;

use super::*;
use crate::config::TenantContext;
use crate::models::ticket::ScanRejection;
use crate::models::{
    CategoryCode, Event, LineItemStatus, MembershipStatus, PaymentSource, PaymentStatus, Price, ProcessingSource, Product,
    ReservationStatus, SubscriptionType, TicketStatus, User, Webhook, WebhookEvent,
};
use crate::services::Task;
use crate::store::Store;
use crate::testing::{tenant, TestServices};

fn single(price_sold_id: Uuid, qty: i32) -> Vec<OrderLine> {
    vec![OrderLine {
        price_sold_id,
        qty,
        holders: Vec::new(),
    }]
}

async fn open(
    s: &TestServices,
    t: &TenantContext,
    user: &User,
    event_id: Option<Uuid>,
    lines: Vec<OrderLine>,
) -> OpenedOrder {
    s.sales
        .open_order(
            t,
            OrderRequest {
                user_id: user.uuid,
                event_id,
                lines,
                source: PaymentSource::Ticketing,
            },
        )
        .await
        .unwrap()
}

fn session_of(order: &OpenedOrder) -> String {
    order.payment.checkout_session_id.clone().unwrap()
}

/// Membership cart on a pay-what-you-want price.
async fn free_price_membership(s: &TestServices, t: &TenantContext) -> (User, Product, Price, OpenedOrder) {
    let user = s.user(t, "ada@example.org").await;
    let (product, _) = s.product(t, "Adhésion", CategoryCode::Adhesion, Decimal::new(1500, 2)).await;
    let price = s
        .save_price(t, &product, |p| {
            p.free_price = true;
            p.subscription_type = SubscriptionType::Year;
        })
        .await;
    let sold = s.snapshot(t, &product, &price, None).await;
    let order = open(s, t, &user, None, single(sold.uuid, 1)).await;
    (user, product, price, order)
}

fn count_invoice_tasks(tasks: &[Task]) -> usize {
    tasks
        .iter()
        .filter(|task| matches!(task, Task::InvoiceEmail { .. }))
        .count()
}

#[tokio::test]
async fn test_free_price_membership_resolves_charged_amount() {
    let s = TestServices::new();
    let t = tenant();
    let (user, _, price, order) = free_price_membership(&s, &t).await;
    assert_eq!(order.payment.status, PaymentStatus::Open);
    assert_eq!(order.line_items[0].status, LineItemStatus::Unpaid);

    s.provider.pay(&session_of(&order), 2500);
    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    assert!(!payment.processing);

    let membership = s.store.find_membership(&t, user.uuid, price.uuid).await.unwrap().unwrap();
    assert_eq!(membership.contribution_value, Some(Decimal::new(2500, 2)));
    assert_eq!(membership.contribution_value.unwrap().to_string(), "25.00");
    assert_eq!(membership.last_contribution, Some(Utc::now().date_naive()));
    assert_eq!(membership.payment_ids, vec![payment.uuid]);

    let item = s.store.get_line_item(&t, order.line_items[0].uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Valid);
    assert_eq!(item.amount, Some(2500));

    let pushes = s.ledger.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].membership, membership.uuid);
    assert_eq!(pushes[0].reference, item.uuid);
    assert_eq!(pushes[0].amount, 2500);
    assert_eq!(membership.ledger_reference, Some(item.uuid));
}

#[tokio::test]
async fn test_duplicate_paid_webhook_is_a_no_op() {
    let s = TestServices::new();
    let t = tenant();
    let (user, _, price, order) = free_price_membership(&s, &t).await;
    s.provider.pay(&session_of(&order), 2500);

    let first = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    let second = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(first.status, PaymentStatus::Valid);
    assert_eq!(second.status, PaymentStatus::Valid);
    assert_eq!(second.revision, first.revision);

    let membership = s.store.find_membership(&t, user.uuid, price.uuid).await.unwrap().unwrap();
    assert_eq!(membership.payment_ids.len(), 1);
    assert_eq!(s.ledger.pushes().len(), 1);
    assert_eq!(count_invoice_tasks(&s.drain_tasks()), 1);
}

#[tokio::test]
async fn test_second_delivery_while_processing_is_not_claimed() {
    let s = TestServices::new();
    let t = tenant();
    let (_, _, _, order) = free_price_membership(&s, &t).await;
    s.provider.pay(&session_of(&order), 2500);

    let first = s
        .sales
        .update_checkout_status(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    let second = s
        .sales
        .update_checkout_status(&t, order.payment.uuid, ProcessingSource::Get)
        .await
        .unwrap();
    assert!(first.claimed);
    assert!(first.payment.processing);
    assert!(!second.claimed);
    assert_eq!(second.payment.status, PaymentStatus::Paid);
    assert_eq!(s.ledger.attempts(), 0);
}

#[tokio::test]
async fn test_concurrent_confirmations_complete_once() {
    let s = TestServices::new();
    let t = tenant();
    let (user, _, price, order) = free_price_membership(&s, &t).await;
    s.provider.pay(&session_of(&order), 2500);

    let (a, b) = tokio::join!(
        s.sales.confirm(&t, order.payment.uuid, ProcessingSource::Webhook),
        s.sales.confirm(&t, order.payment.uuid, ProcessingSource::Get),
    );
    a.unwrap();
    b.unwrap();

    let payment = s.store.get_payment(&t, order.payment.uuid).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    let membership = s.store.find_membership(&t, user.uuid, price.uuid).await.unwrap().unwrap();
    assert_eq!(membership.payment_ids.len(), 1);
    assert_eq!(s.ledger.pushes().len(), 1);
}

#[tokio::test]
async fn test_ledger_failure_leaves_not_sync_then_resync_applies_once() {
    let s = TestServices::new();
    let t = tenant();
    let (user, _, price, order) = free_price_membership(&s, &t).await;
    s.provider.pay(&session_of(&order), 2500);
    s.ledger.fail_times(1);

    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::NotSync);
    assert!(!payment.processing);
    let item = s.store.get_line_item(&t, order.line_items[0].uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Paid);
    assert!(s.ledger.pushes().is_empty());

    let before = s.store.find_membership(&t, user.uuid, price.uuid).await.unwrap().unwrap();
    assert_eq!(before.payment_ids.len(), 1);
    assert_eq!(before.ledger_reference, None);

    let payment = s.sales.resync(&t, payment.uuid).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    let item = s.store.get_line_item(&t, item.uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Valid);

    let after = s.store.find_membership(&t, user.uuid, price.uuid).await.unwrap().unwrap();
    assert_eq!(after.payment_ids.len(), 1);
    assert_eq!(after.contribution_value, before.contribution_value);
    assert_eq!(after.ledger_reference, Some(item.uuid));
    assert_eq!(s.ledger.pushes().len(), 1);
    assert_eq!(count_invoice_tasks(&s.drain_tasks()), 1);

    assert!(matches!(
        s.sales.resync(&t, payment.uuid).await,
        Err(CheckoutError::Transition(_))
    ));
}

#[tokio::test]
async fn test_donation_validates_without_external_calls() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(1000, 2)).await;
    let sold = s.snapshot(&t, &product, &price, None).await;
    let order = open(&s, &t, &user, None, single(sold.uuid, 1)).await;
    s.provider.pay(&session_of(&order), 1000);
    let reads_before = s.provider.session_reads();

    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    let item = s.store.get_line_item(&t, order.line_items[0].uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Valid);
    assert_eq!(s.ledger.attempts(), 0);
    assert_eq!(s.provider.session_reads(), reads_before + 1);
    assert!(s.drain_tasks().is_empty());
}

#[tokio::test]
async fn test_ticket_sale_activates_tickets_and_notifies_webhooks() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Billet", CategoryCode::Billet, Decimal::new(1200, 2)).await;
    let event = s.event(&t, &[&product], 100).await;
    let sold = s.snapshot(&t, &product, &price, Some(event.uuid)).await;
    let webhook = Webhook::new("https://hooks.example.org/rv", WebhookEvent::ReservationValidated);
    s.store.insert_webhook(&t, webhook.clone()).await;

    let lines = vec![OrderLine {
        price_sold_id: sold.uuid,
        qty: 2,
        holders: vec![("Grace".into(), "Hopper".into())],
    }];
    let order = open(&s, &t, &user, Some(event.uuid), lines).await;
    assert_eq!(order.tickets.len(), 2);
    assert_eq!(order.tickets[0].first_name, "Grace");
    assert_eq!(order.tickets[1].first_name, "Ada");
    assert_eq!(order.payment.total, Decimal::new(2400, 2));
    assert_eq!(order.reservation.as_ref().unwrap().status, ReservationStatus::Unpaid);

    s.provider.pay(&session_of(&order), 2400);
    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);

    let reservation_id = order.reservation.as_ref().unwrap().uuid;
    let tickets = s.store.tickets_for_reservation(&t, reservation_id).await.unwrap();
    assert!(tickets.iter().all(|ticket| ticket.status == TicketStatus::NotScanned));
    let reservation = s.store.get_reservation(&t, reservation_id).await.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Valid);

    // tickets have no completion handler: the line item stays PAID
    let item = s.store.get_line_item(&t, order.line_items[0].uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Paid);
    let sold = s.store.get_price_sold(&t, sold.uuid).await.unwrap();
    assert_eq!(sold.qty_sold, 2);

    assert_eq!(s.run_tasks().await, 1);
    let calls = s.webhooks.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["event"], "reservation_validated");
    let stored = s.store.webhook(&t, webhook.uuid).await.unwrap();
    assert_eq!(stored.last_response.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_scan_succeeds_once() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Billet", CategoryCode::Billet, Decimal::new(1200, 2)).await;
    let event = s.event(&t, &[&product], 100).await;
    let sold = s.snapshot(&t, &product, &price, Some(event.uuid)).await;
    let order = open(&s, &t, &user, Some(event.uuid), single(sold.uuid, 1)).await;
    let ticket_id = order.tickets[0].uuid;

    assert!(matches!(
        s.sales.scan_ticket(&t, ticket_id).await,
        Err(ScanError::Rejected(ScanRejection::NotActive { .. }))
    ));

    s.provider.pay(&session_of(&order), 1200);
    s.sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();

    let scanned = s.sales.scan_ticket(&t, ticket_id).await.unwrap();
    assert_eq!(scanned.status, TicketStatus::Scanned);
    let err = s.sales.scan_ticket(&t, ticket_id).await.unwrap_err();
    assert!(matches!(err, ScanError::Rejected(ScanRejection::AlreadyScanned(id)) if id == ticket_id));

    let stored = s.store.get_ticket(&t, ticket_id).await.unwrap();
    assert_eq!(stored.scanned_at, scanned.scanned_at);
}

#[tokio::test]
async fn test_unpaid_session_moves_to_pending() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(500, 2)).await;
    let sold = s.snapshot(&t, &product, &price, None).await;
    let order = open(&s, &t, &user, None, single(sold.uuid, 1)).await;

    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Get)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    let again = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Get)
        .await
        .unwrap();
    assert_eq!(again.status, PaymentStatus::Pending);
    assert_eq!(again.revision, payment.revision);
}

#[tokio::test]
async fn test_expired_session_releases_order() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Billet", CategoryCode::Billet, Decimal::new(1200, 2)).await;
    let event = s.event(&t, &[&product], 100).await;
    let sold = s.snapshot(&t, &product, &price, Some(event.uuid)).await;
    let order = open(&s, &t, &user, Some(event.uuid), single(sold.uuid, 1)).await;
    s.provider.expire(&session_of(&order));

    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Get)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Expired);

    let item = s.store.get_line_item(&t, order.line_items[0].uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Canceled);
    let ticket = s.store.get_ticket(&t, order.tickets[0].uuid).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::NotActive);
    let reservation = s.store.get_reservation(&t, order.reservation.as_ref().unwrap().uuid).await.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Unpaid);

    // a late payment on an expired attempt changes nothing
    s.provider.pay(&session_of(&order), 1200);
    let late = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(late.status, PaymentStatus::Expired);
}

#[tokio::test]
async fn test_paid_session_wins_over_expiry() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(500, 2)).await;
    let sold = s.snapshot(&t, &product, &price, None).await;
    let order = open(&s, &t, &user, None, single(sold.uuid, 1)).await;
    s.provider.pay(&session_of(&order), 500);
    s.provider.expire(&session_of(&order));

    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
}

#[tokio::test]
async fn test_subscription_ids_are_captured() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, _) = s.product(&t, "Adhésion", CategoryCode::Adhesion, Decimal::new(1500, 2)).await;
    let price = s
        .save_price(&t, &product, |p| {
            p.amount = Decimal::new(2000, 2);
            p.subscription_type = SubscriptionType::Year;
            p.recurring_payment = true;
        })
        .await;
    let sold = s.snapshot(&t, &product, &price, None).await;
    let order = open(&s, &t, &user, None, single(sold.uuid, 1)).await;
    assert!(s.provider.checkouts()[0].subscription);
    assert_eq!(s.provider.created_prices()[0].recurring_interval, Some("year"));

    s.provider.subscribe(&session_of(&order), "sub_1", "in_1");
    s.provider.pay(&session_of(&order), 2000);
    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    assert_eq!(payment.subscription_id.as_deref(), Some("sub_1"));
    assert_eq!(payment.invoice_id.as_deref(), Some("in_1"));

    let membership = s.store.find_membership(&t, user.uuid, price.uuid).await.unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Auto);
    assert_eq!(membership.subscription_id.as_deref(), Some("sub_1"));
    assert_eq!(membership.last_invoice_id.as_deref(), Some("in_1"));
    assert_eq!(membership.contribution_value, Some(Decimal::new(2000, 2)));
    assert!(membership.is_valid(SubscriptionType::Year, Utc::now().date_naive()));
}

#[tokio::test]
async fn test_recurring_price_cannot_share_a_cart() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (adhesion, _) = s.product(&t, "Adhésion", CategoryCode::Adhesion, Decimal::new(1500, 2)).await;
    let recurring = s
        .save_price(&t, &adhesion, |p| {
            p.amount = Decimal::new(1500, 2);
            p.subscription_type = SubscriptionType::Month;
            p.recurring_payment = true;
        })
        .await;
    let (don, don_price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(500, 2)).await;
    let a = s.snapshot(&t, &adhesion, &recurring, None).await;
    let b = s.snapshot(&t, &don, &don_price, None).await;

    let mut lines = single(a.uuid, 1);
    lines.extend(single(b.uuid, 1));
    let err = s
        .sales
        .open_order(
            &t,
            OrderRequest {
                user_id: user.uuid,
                event_id: None,
                lines,
                source: PaymentSource::Ticketing,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::RecurringMixed));
}

#[tokio::test]
async fn test_order_limits() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Billet", CategoryCode::Billet, Decimal::new(1200, 2)).await;
    let event = s.event(&t, &[&product], 1).await;
    let sold = s.snapshot(&t, &product, &price, Some(event.uuid)).await;

    let request = |lines| OrderRequest {
        user_id: user.uuid,
        event_id: Some(event.uuid),
        lines,
        source: PaymentSource::Ticketing,
    };
    assert!(matches!(
        s.sales.open_order(&t, request(Vec::new())).await,
        Err(CheckoutError::EmptyCart)
    ));
    assert!(matches!(
        s.sales.open_order(&t, request(single(sold.uuid, 11))).await,
        Err(CheckoutError::OverLimit { max: 10, .. })
    ));
    assert!(matches!(
        s.sales.open_order(&t, request(single(sold.uuid, 2))).await,
        Err(CheckoutError::EventFull(_))
    ));
    assert!(s.sales.open_order(&t, request(single(sold.uuid, 1))).await.is_ok());
}

#[tokio::test]
async fn test_free_order_skips_the_provider() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Entrée libre", CategoryCode::Billet, Decimal::ZERO).await;
    let event = s.event(&t, &[&product], 100).await;
    let sold = s.snapshot(&t, &product, &price, Some(event.uuid)).await;

    let order = open(&s, &t, &user, Some(event.uuid), single(sold.uuid, 1)).await;
    assert!(order.checkout_url.is_none());
    assert!(s.provider.checkouts().is_empty());
    assert_eq!(order.line_items[0].status, LineItemStatus::FreeReservation);
    assert_eq!(order.tickets[0].status, TicketStatus::NotScanned);
    assert_eq!(order.reservation.as_ref().unwrap().status, ReservationStatus::FreeReservation);
    assert!(s.sales.event_is_full(&t, event.uuid).await.is_ok_and(|full| !full));
}

#[tokio::test]
async fn test_cancel_only_before_payment() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Billet", CategoryCode::Billet, Decimal::new(1200, 2)).await;
    let event = s.event(&t, &[&product], 100).await;
    let sold = s.snapshot(&t, &product, &price, Some(event.uuid)).await;

    let order = open(&s, &t, &user, Some(event.uuid), single(sold.uuid, 1)).await;
    let canceled = s.sales.cancel(&t, order.payment.uuid).await.unwrap();
    assert_eq!(canceled.status, PaymentStatus::Canceled);
    let reservation = s.store.get_reservation(&t, order.reservation.as_ref().unwrap().uuid).await.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Canceled);
    let ticket = s.store.get_ticket(&t, order.tickets[0].uuid).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::NotActive);

    let paid = open(&s, &t, &user, Some(event.uuid), single(sold.uuid, 1)).await;
    s.provider.pay(&session_of(&paid), 1200);
    s.sales
        .confirm(&t, paid.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert!(matches!(
        s.sales.cancel(&t, paid.payment.uuid).await,
        Err(CheckoutError::Transition(_))
    ));
}

#[tokio::test]
async fn test_reconcile_resumes_interrupted_payment() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(500, 2)).await;
    let sold = s.snapshot(&t, &product, &price, None).await;
    let order = open(&s, &t, &user, None, single(sold.uuid, 1)).await;
    s.provider.pay(&session_of(&order), 500);

    // PAID written, then the process stops before dispatch
    let update = s
        .sales
        .update_checkout_status(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert!(update.claimed);

    assert_eq!(s.sales.reconcile(&t, Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 0);
    let resumed = s
        .sales
        .reconcile(&t, Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(resumed, 1);

    let payment = s.store.get_payment(&t, order.payment.uuid).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    assert!(!payment.processing);
    let item = s.store.get_line_item(&t, order.line_items[0].uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Valid);
}

#[tokio::test]
async fn test_dispatch_entry_point_by_line_item_id() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(500, 2)).await;
    let sold = s.snapshot(&t, &product, &price, None).await;
    let order = open(&s, &t, &user, None, single(sold.uuid, 1)).await;

    let mut item = order.line_items[0].clone();
    item.status = LineItemStatus::Paid;
    s.store.update_line_item(&t, &item).await.unwrap();

    s.sales.dispatch_line_item(&t, item.uuid).await;
    let item = s.store.get_line_item(&t, item.uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Valid);

    // unknown ids are logged, not raised
    s.sales.dispatch_line_item(&t, Uuid::new_v4()).await;
}

#[tokio::test]
async fn test_snapshot_category_falls_back_to_product() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(500, 2)).await;
    let sold = s.snapshot(&t, &product, &price, None).await;
    let mut product_sold = s.store.get_product_sold(&t, sold.product_sold_id).await.unwrap();
    product_sold.category = CategoryCode::None;
    s.store.update_product_sold(&t, &product_sold).await.unwrap();

    let order = open(&s, &t, &user, None, single(sold.uuid, 1)).await;
    s.provider.pay(&session_of(&order), 500);
    s.sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    let item = s.store.get_line_item(&t, order.line_items[0].uuid).await.unwrap();
    assert_eq!(item.status, LineItemStatus::Valid);
}

#[tokio::test]
async fn test_materialize_event_publishes_each_snapshot_once() {
    let s = TestServices::new();
    let t = tenant();
    let (product, _) = s.product(&t, "Billet", CategoryCode::Billet, Decimal::new(1200, 2)).await;
    s.save_price(&t, &product, |p| p.amount = Decimal::new(800, 2)).await;
    let event = s.event(&t, &[&product], 100).await;

    let first = s.sales.materialize_event(&t, event.uuid).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|p| p.external_price_id.is_some()));
    assert_eq!(s.provider.created_products().len(), 1);
    assert!(s.provider.created_products()[0].starts_with(&event.name));

    let second = s.sales.materialize_event(&t, event.uuid).await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(s.provider.created_products().len(), 1);
    let mut amounts: Vec<i64> = s.provider.created_prices().iter().map(|p| p.unit_amount).collect();
    amounts.sort();
    assert_eq!(amounts, vec![800, 1200]);
}

#[tokio::test]
async fn test_missing_provider_product_is_recreated_after_reset() {
    let s = TestServices::new();
    let t = tenant();
    let (product, price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(500, 2)).await;
    let mut sold = s.snapshot(&t, &product, &price, None).await;
    let first = s.sales.ensure_price_id(&t, &mut sold, false).await.unwrap();
    assert_eq!(s.sales.ensure_price_id(&t, &mut sold, false).await.unwrap(), first);

    assert!(matches!(
        s.sales.reprice(&t, sold.uuid, Decimal::new(700, 2)).await,
        Err(CatalogError::Frozen(_))
    ));

    let product_sold = s.store.get_product_sold(&t, sold.product_sold_id).await.unwrap();
    s.provider.forget_product(product_sold.external_product_id.as_deref().unwrap());
    let mut sold = s.sales.reset_price_id(&t, sold.uuid).await.unwrap();
    let repriced = s.sales.reprice(&t, sold.uuid, Decimal::new(700, 2)).await.unwrap();
    assert_eq!(repriced.amount, Decimal::new(700, 2));
    sold.amount = repriced.amount;

    let second = s.sales.ensure_price_id(&t, &mut sold, false).await.unwrap();
    assert_ne!(second, first);
    assert_eq!(s.provider.created_products().len(), 2);
    assert_eq!(s.provider.created_prices().last().unwrap().unit_amount, 700);
}

#[tokio::test]
async fn test_membership_side_effects_reach_collaborators() {
    let s = TestServices::new();
    let t = tenant();
    let (_, _, _, order) = free_price_membership(&s, &t).await;
    s.provider.pay(&session_of(&order), 2500);
    s.sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();

    assert_eq!(s.run_tasks().await, 3);
    let sent = s.invoices.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].amount, Decimal::new(2500, 2));
    assert_eq!(sent[0].invoice_number, order.payment.invoice_number());
    let sales = s.cashless.sales();
    assert_eq!(sales.len(), 1);
    assert_eq!(sales[0].reference, order.line_items[0].uuid);
    assert_eq!(sales[0].amount, 2500);
    assert_eq!(s.content.published().len(), 1);
}

#[tokio::test]
async fn test_failed_handler_does_not_block_sibling_line_items() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (adhesion, adhesion_price) = s.product(&t, "Adhésion", CategoryCode::Adhesion, Decimal::new(1500, 2)).await;
    let (don, don_price) = s.product(&t, "Soutien", CategoryCode::Don, Decimal::new(500, 2)).await;
    let event = s.event(&t, &[&adhesion, &don], 100).await;
    let adhesion_sold = s.snapshot(&t, &adhesion, &adhesion_price, Some(event.uuid)).await;
    let don_sold = s.snapshot(&t, &don, &don_price, Some(event.uuid)).await;

    let mut lines = single(adhesion_sold.uuid, 1);
    lines.extend(single(don_sold.uuid, 1));
    let order = open(&s, &t, &user, Some(event.uuid), lines).await;
    s.provider.pay(&session_of(&order), 2000);
    s.ledger.fail_times(1);

    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::NotSync);
    assert!(!payment.processing);

    let items = s.store.line_items_for_payment(&t, payment.uuid).await.unwrap();
    let status_of = |sold: Uuid| items.iter().find(|i| i.price_sold_id == sold).unwrap().status;
    assert_eq!(status_of(adhesion_sold.uuid), LineItemStatus::Paid);
    assert_eq!(status_of(don_sold.uuid), LineItemStatus::Valid);

    let reservation = s.store.get_reservation(&t, order.reservation.as_ref().unwrap().uuid).await.unwrap();
    assert_eq!(reservation.status, ReservationStatus::PaidError);

    // the retry only touches the line item that failed
    let payment = s.sales.resync(&t, payment.uuid).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    let reservation = s.store.get_reservation(&t, reservation.uuid).await.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Valid);
    assert_eq!(s.ledger.pushes().len(), 1);
}

#[tokio::test]
async fn test_resync_interrupted_by_store_error_can_be_retried() {
    let s = TestServices::new();
    let t = tenant();
    let (_, _, _, order) = free_price_membership(&s, &t).await;
    s.provider.pay(&session_of(&order), 2500);
    s.ledger.fail_times(1);
    let payment = s
        .sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::NotSync);

    s.store.fail_line_item_reads(1);
    assert!(matches!(
        s.sales.resync(&t, payment.uuid).await,
        Err(CheckoutError::Store(_))
    ));
    let stuck = s.store.get_payment(&t, payment.uuid).await.unwrap();
    assert_eq!(stuck.status, PaymentStatus::NotSync);
    assert!(!stuck.processing);

    let payment = s.sales.resync(&t, payment.uuid).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    assert_eq!(s.ledger.pushes().len(), 1);
}

#[tokio::test]
async fn test_abandoned_resync_is_taken_over_after_lease() {
    let s = TestServices::new();
    let t = tenant();
    let (_, _, _, order) = free_price_membership(&s, &t).await;
    s.provider.pay(&session_of(&order), 2500);
    s.ledger.fail_times(1);
    s.sales
        .confirm(&t, order.payment.uuid, ProcessingSource::Webhook)
        .await
        .unwrap();

    let flag = |age: chrono::Duration| {
        let s = &s;
        let t = &t;
        let id = order.payment.uuid;
        async move {
            let mut payment = s.store.get_payment(t, id).await.unwrap();
            payment.processing = true;
            payment.last_action = Utc::now() - age;
            assert!(s.store.compare_and_swap_payment(t, &payment).await.unwrap());
        }
    };

    // a re-sync still running is left alone
    flag(chrono::Duration::seconds(5)).await;
    assert!(matches!(
        s.sales.resync(&t, order.payment.uuid).await,
        Err(CheckoutError::Transition(_))
    ));

    flag(chrono::Duration::seconds(pipeline::RESYNC_LEASE_SECS + 60)).await;
    let payment = s.sales.resync(&t, order.payment.uuid).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Valid);
    assert!(!payment.processing);
}

#[tokio::test]
async fn test_failed_checkout_cancels_the_order() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Billet", CategoryCode::Billet, Decimal::new(1200, 2)).await;
    let event = s.event(&t, &[&product], 100).await;
    let sold = s.snapshot(&t, &product, &price, Some(event.uuid)).await;
    s.provider.fail_next_checkout();

    let result = s
        .sales
        .open_order(
            &t,
            OrderRequest {
                user_id: user.uuid,
                event_id: Some(event.uuid),
                lines: single(sold.uuid, 2),
                source: PaymentSource::Ticketing,
            },
        )
        .await;
    assert!(matches!(result, Err(CheckoutError::Provider(_))));

    let payments = s.store.payments(&t).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Canceled);
    assert!(s
        .store
        .reservations(&t)
        .await
        .iter()
        .all(|r| r.status == ReservationStatus::Canceled));
    assert!(s
        .store
        .line_items(&t)
        .await
        .iter()
        .all(|i| i.status == LineItemStatus::Canceled));
    let tickets = s.store.tickets(&t).await;
    assert_eq!(tickets.len(), 2);
    assert!(tickets.iter().all(|ticket| ticket.status == TicketStatus::NotActive));

    // the next attempt goes through
    let order = open(&s, &t, &user, Some(event.uuid), single(sold.uuid, 1)).await;
    assert_eq!(order.payment.status, PaymentStatus::Open);
}

#[tokio::test]
async fn test_tickets_per_reservation_are_capped_by_event() {
    let s = TestServices::new();
    let t = tenant();
    let user = s.user(&t, "ada@example.org").await;
    let (product, price) = s.product(&t, "Billet", CategoryCode::Billet, Decimal::new(1200, 2)).await;
    let mut event = Event::new("Bal folk", Utc::now() + chrono::Duration::days(3), 100);
    event.product_ids = vec![product.uuid];
    event.max_per_user = 2;
    s.store.insert_event(&t, &event).await.unwrap();
    let sold = s.snapshot(&t, &product, &price, Some(event.uuid)).await;

    let request = |qty| OrderRequest {
        user_id: user.uuid,
        event_id: Some(event.uuid),
        lines: single(sold.uuid, qty),
        source: PaymentSource::Ticketing,
    };
    assert!(matches!(
        s.sales.open_order(&t, request(3)).await,
        Err(CheckoutError::TooManyTickets { max: 2, .. })
    ));
    assert_eq!(s.sales.open_order(&t, request(2)).await.unwrap().tickets.len(), 2);
}
