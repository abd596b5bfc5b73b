//! Payment coordination integration tests: immediate and due charges,
//! settlement, customer records and gateway failures.

mod common;

use chrono::Duration;
use common::{dec, FakeGateway, TestHarness};
use rust_decimal::Decimal;
use std::sync::Arc;
use subscription_service::config::PaymentSettings;
use subscription_service::error::{Rejection, SubscriptionError};
use subscription_service::models::{PaymentMethod, Term};
use subscription_service::services::{ChargeKind, PaymentCoordinator, SubscriptionEvent};

fn rejection(err: SubscriptionError) -> Rejection {
    match err {
        SubscriptionError::Rejected(rejection) => rejection,
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn successful_immediate_charge_marks_record_paid() {
    let h = TestHarness::new();
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments().with_source_token("tok_visa"));

    let sub = account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();

    assert!(sub.is_paid);
    assert_eq!(sub.payment_method.as_deref(), Some("stripe"));
    assert!(account.has_active_subscription().await.unwrap());
    assert_eq!(h.gateway.charge_count(), 1);

    let request = h.gateway.last_request().unwrap();
    assert_eq!(request.method, PaymentMethod::Stripe);
    assert_eq!(request.amount, Decimal::new(999, 2));
    assert_eq!(request.minor_units, 999);
    assert_eq!(request.currency, "USD");
    assert_eq!(request.source_token.as_deref(), Some("tok_visa"));
    assert_eq!(request.customer_id.as_deref(), Some("cus_1"));

    assert_eq!(
        h.events.names(),
        vec!["charge.succeeded", "subscription.created"]
    );
}

#[tokio::test]
async fn failed_immediate_charge_leaves_a_due_subscription() {
    let h = TestHarness::new();
    h.gateway.set_declining(true);
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments());

    let sub = account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();

    assert!(!sub.is_paid);
    assert!(!account.has_active_subscription().await.unwrap());
    assert!(account.has_due_subscription().await.unwrap());
    assert_eq!(
        account.last_due_subscription().await.unwrap().unwrap().subscription_id,
        sub.subscription_id
    );
    assert_eq!(h.events.names(), vec!["charge.failed", "subscription.created"]);
}

#[tokio::test]
async fn new_subscription_replaces_the_due_one() {
    let h = TestHarness::new();
    h.gateway.set_declining(true);
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments());

    let first = account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();
    let second = account
        .subscribe_to(&h.plans.pro, Term::Days(30), true)
        .await
        .unwrap();

    let records = account.subscriptions().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subscription_id, second.subscription_id);
    assert_ne!(first.subscription_id, second.subscription_id);
}

#[tokio::test]
async fn charging_the_due_subscription_restarts_its_period() {
    let h = TestHarness::new();
    h.gateway.set_declining(true);
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments());
    let due = account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();

    h.advance_days(3);
    let err = account.charge_for_last_due_subscription().await.unwrap_err();
    assert!(matches!(rejection(err), Rejection::PaymentFailed(reason) if reason.contains("declined")));
    assert!(account.has_due_subscription().await.unwrap());
    assert_eq!(h.events.names().last(), Some(&"charge.due_failed"));

    h.gateway.set_declining(false);
    let paid = account.charge_for_last_due_subscription().await.unwrap();

    assert_eq!(paid.subscription_id, due.subscription_id);
    assert!(paid.is_paid);
    assert_eq!(paid.starts_on, h.now());
    assert_eq!(paid.expires_on, h.now() + Duration::days(30));
    assert!(!account.has_due_subscription().await.unwrap());
    assert!(account.has_active_subscription().await.unwrap());
    assert_eq!(h.events.names().last(), Some(&"charge.due_succeeded"));

    let err = account.charge_for_last_due_subscription().await.unwrap_err();
    assert_eq!(rejection(err), Rejection::NoDueSubscription);
}

#[tokio::test]
async fn due_charge_needs_a_payment_coordinator() {
    let h = TestHarness::new();
    h.gateway.set_declining(true);
    let subscriber = TestHarness::subscriber("1");
    h.manager
        .account(subscriber.clone())
        .with_payments(h.payments())
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();

    let err = h
        .manager
        .account(subscriber)
        .charge_for_last_due_subscription()
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::PaymentUnavailable("user:1".to_string()));
}

#[tokio::test]
async fn due_charge_uses_the_charging_override() {
    let h = TestHarness::new();
    h.gateway.set_declining(true);
    let subscriber = TestHarness::subscriber("1");
    h.manager
        .account(subscriber.clone())
        .with_payments(h.payments())
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();

    h.gateway.set_declining(false);
    h.manager
        .account(subscriber)
        .with_payments(h.payments().with_charging_price(dec(1500), "JPY"))
        .charge_for_last_due_subscription()
        .await
        .unwrap();

    let request = h.gateway.last_request().unwrap();
    assert_eq!(request.amount, dec(1500));
    assert_eq!(request.currency, "JPY");
    assert_eq!(request.minor_units, 1500);
}

#[tokio::test]
async fn charging_override_is_snapshotted_on_new_records() {
    let h = TestHarness::new();
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments().with_charging_price(dec(5), "EUR"));

    let sub = account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();

    assert_eq!(sub.charging_price, dec(5));
    assert_eq!(sub.charging_currency, "EUR");
    let request = h.gateway.last_request().unwrap();
    assert_eq!(request.minor_units, 500);
    assert_eq!(request.currency, "EUR");
}

#[tokio::test]
async fn settling_out_of_band_marks_due_paid() {
    let h = TestHarness::new();
    h.gateway.set_declining(true);
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments());
    account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();
    let charges_before = h.gateway.requests().len();

    let settled = account.settle_last_due_subscription("wire-42").await.unwrap();

    assert!(settled.is_paid);
    assert_eq!(settled.starts_on, h.now());
    assert!(account.has_active_subscription().await.unwrap());
    assert_eq!(h.gateway.requests().len(), charges_before);
    match h.events.events().last().unwrap() {
        SubscriptionEvent::ChargeSucceeded {
            kind, charge_id, ..
        } => {
            assert_eq!(*kind, ChargeKind::Due);
            assert_eq!(charge_id, "wire-42");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let err = account.settle_last_due_subscription("wire-43").await.unwrap_err();
    assert_eq!(rejection(err), Rejection::NoDueSubscription);
}

#[tokio::test]
async fn renew_charges_the_due_subscription_with_a_fresh_token() {
    let h = TestHarness::new();
    h.gateway.set_declining(true);
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments().with_source_token("tok_expired"));
    let due = account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();

    h.gateway.set_declining(false);
    let renewed = account
        .renew_subscription(Some("tok_fresh".to_string()))
        .await
        .unwrap();

    assert_eq!(renewed.subscription_id, due.subscription_id);
    assert!(renewed.is_paid);
    assert_eq!(
        h.gateway.last_request().unwrap().source_token.as_deref(),
        Some("tok_fresh")
    );
}

#[tokio::test]
async fn renew_of_paid_subscription_requires_the_same_method() {
    let h = TestHarness::new();
    let subscriber = TestHarness::subscriber("1");
    let account = h
        .manager
        .account(subscriber.clone())
        .with_payments(h.payments());
    account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();
    h.advance_days(31);

    let err = h
        .manager
        .account(subscriber)
        .renew_subscription(None)
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::PaymentUnavailable("stripe".to_string()));

    let renewed = account.renew_subscription(None).await.unwrap();
    assert!(renewed.is_paid);
    assert_eq!(renewed.recurring_each_days, 30);
    assert_eq!(h.gateway.charge_count(), 2);
}

#[tokio::test]
async fn gateway_timeout_is_reported_as_failed_charge() {
    let h = TestHarness::new();
    h.gateway.set_hanging(true);
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments_with_timeout(1));

    let sub = account
        .subscribe_to(&h.plans.basic, Term::Days(30), true)
        .await
        .unwrap();

    assert!(!sub.is_paid);
    let failure = h
        .events
        .events()
        .into_iter()
        .find_map(|event| match event {
            SubscriptionEvent::ChargeFailed { reason, .. } => Some(reason),
            _ => None,
        })
        .unwrap();
    assert!(failure.contains("timed out"));
}

#[tokio::test]
async fn customer_records_are_created_once() {
    let h = TestHarness::new();
    let account = h
        .manager
        .account(TestHarness::subscriber("1"))
        .with_payments(h.payments());

    assert!(!account.is_customer().await.unwrap());
    let first = account.create_customer().await.unwrap();
    let second = account.create_customer().await.unwrap();

    assert_eq!(first.customer_id, "cus_1");
    assert_eq!(first.customer_record_id, second.customer_record_id);
    assert_eq!(h.gateway.customers_created(), 1);
    assert!(account.is_customer().await.unwrap());

    assert!(account.delete_customer().await.unwrap());
    assert!(!account.is_customer().await.unwrap());
    assert!(!account.delete_customer().await.unwrap());
    assert_eq!(h.gateway.customers_deleted(), 1);
}

#[tokio::test]
async fn customer_operations_need_a_payment_coordinator() {
    let h = TestHarness::new();
    let account = h.manager.account(TestHarness::subscriber("1"));

    let err = account.create_customer().await.unwrap_err();
    assert_eq!(rejection(err), Rejection::PaymentUnavailable("user:1".to_string()));
    let err = account.delete_customer().await.unwrap_err();
    assert_eq!(rejection(err), Rejection::PaymentUnavailable("user:1".to_string()));
}

#[tokio::test]
async fn unsupported_payment_methods_are_refused() {
    let gateway = Arc::new(FakeGateway::default());

    let err = PaymentCoordinator::new(
        gateway.clone(),
        PaymentMethod::Razorpay,
        &PaymentSettings::default(),
    )
    .unwrap_err();
    assert!(matches!(err, SubscriptionError::UnsupportedPaymentMethod(m) if m == "razorpay"));

    let settings = PaymentSettings {
        supported_methods: vec!["stripe".to_string(), "razorpay".to_string()],
        ..PaymentSettings::default()
    };
    let coordinator = PaymentCoordinator::new(gateway, PaymentMethod::Razorpay, &settings).unwrap();
    assert_eq!(coordinator.method(), PaymentMethod::Razorpay);
}
