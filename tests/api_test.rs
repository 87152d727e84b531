mod common;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use common::Harness;
use settlement_core::domain::{Currency, TransactionState, UserAccount};
use settlement_core::health::{DependencyChecker, DependencyStatus, HealthChecks};
use settlement_core::providers::stripe::{signature_header, StripeWebhookVerifier};
use settlement_core::{create_app, AppState, HttpSettings};

const WEBHOOK_SECRET: &str = "whsec_api_test";

struct Fixed(bool);

#[async_trait]
impl DependencyChecker for Fixed {
    async fn check(&self) -> DependencyStatus {
        if self.0 {
            DependencyStatus::Healthy {
                status: "healthy".to_string(),
                latency_ms: 1,
            }
        } else {
            DependencyStatus::Unhealthy {
                status: "unhealthy".to_string(),
                error: "down".to_string(),
            }
        }
    }
}

fn app_with(h: &Harness, postgres_up: bool) -> Router {
    let health = HealthChecks {
        postgres: Arc::new(Fixed(postgres_up)),
        redis: Arc::new(Fixed(true)),
        rpc: Arc::new(Fixed(true)),
    };
    let state = AppState::new(
        &h.services,
        h.repositories.accounts.clone(),
        StripeWebhookVerifier::new(WEBHOOK_SECRET.to_string()),
        health,
        HttpSettings {
            cors_allowed_origins: Some("https://matters.town".to_string()),
            log_request_body: true,
        },
    );
    create_app(state)
}

fn app(h: &Harness) -> Router {
    app_with(h, true)
}

fn request(method: &str, uri: &str, caller: Option<Uuid>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(caller) = caller {
        builder = builder.header("x-user-id", caller.to_string());
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_dependencies() {
    let h = Harness::new().await;

    let response = app(&h).oneshot(request("GET", "/health", None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert!(body["dependencies"]["rpc"].is_object());

    let response = app_with(&h, false)
        .oneshot(request("GET", "/health", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn requests_carry_a_request_id() {
    let h = Harness::new().await;

    let mut req = request("GET", "/health", None, None);
    req.headers_mut()
        .insert("x-request-id", "trace-123".parse().unwrap());
    let response = app(&h).oneshot(req).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "trace-123");

    let response = app(&h).oneshot(request("GET", "/health", None, None)).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn caller_header_is_required() {
    let h = Harness::new().await;

    let response = app(&h)
        .oneshot(request("GET", "/balances/HKD", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["status"], 401);

    let mut req = request("GET", "/balances/HKD", None, None);
    req.headers_mut()
        .insert("x-user-id", "not-a-uuid".parse().unwrap());
    let response = app(&h).oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn credit_is_settled_by_signed_webhook() {
    let h = Harness::new().await;
    let user = h.user();
    let router = app(&h);

    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/credits",
            Some(user),
            Some(json!({ "amount": "25", "currency": "HKD" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let credit = json_body(response).await;
    assert_eq!(credit["clientSecret"], "secret_test");
    let tx_id: Uuid = credit["transaction"]["id"].as_str().unwrap().parse().unwrap();
    let provider_ref = credit["transaction"]["providerTxId"].as_str().unwrap().to_string();

    let event = serde_json::to_vec(&json!({
        "id": "evt_1",
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": provider_ref, "metadata": { "correlation_id": tx_id.to_string() } } }
    }))
    .unwrap();
    let signature = signature_header(WEBHOOK_SECRET, Utc::now().timestamp(), &event).unwrap();
    let webhook = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("stripe-signature", signature.clone())
        .body(Body::from(event.clone()))
        .unwrap();
    let response = router.clone().oneshot(webhook).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let tx = h.services.ledger.get_transaction(tx_id).await.unwrap();
    assert_eq!(tx.state, TransactionState::Succeeded);

    // Redelivery is acknowledged without changing anything.
    let redelivered = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("stripe-signature", signature)
        .body(Body::from(event))
        .unwrap();
    assert_eq!(router.clone().oneshot(redelivered).await.unwrap().status(), StatusCode::OK);

    let response = router
        .oneshot(request("GET", "/balances/HKD", Some(user), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let balance = json_body(response).await;
    assert_eq!(balance["currency"], "HKD");
    let amount: bigdecimal::BigDecimal = balance["balance"].as_str().unwrap().parse().unwrap();
    assert_eq!(amount, common::dec("25"));
}

#[tokio::test]
async fn forged_webhook_is_rejected() {
    let h = Harness::new().await;
    let event = br#"{"id":"evt_2","type":"payment_intent.succeeded","data":{"object":{"id":"pi_x"}}}"#;
    let signature = signature_header("whsec_wrong", Utc::now().timestamp(), event).unwrap();

    let webhook = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("stripe-signature", signature)
        .body(Body::from(event.to_vec()))
        .unwrap();
    let response = app(&h).oneshot(webhook).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .body(Body::from(event.to_vec()))
        .unwrap();
    let response = app(&h).oneshot(unsigned).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn overdraft_donation_is_unprocessable() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());
    h.fund(sender, 5).await;

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/donations",
            Some(sender),
            Some(json!({
                "recipientId": recipient,
                "articleId": Uuid::new_v4(),
                "amount": "6",
                "currency": "HKD"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/donations",
            Some(sender),
            Some(json!({
                "recipientId": recipient,
                "articleId": Uuid::new_v4(),
                "amount": "5",
                "currency": "HKD"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn transactions_are_visible_to_participants_only() {
    let h = Harness::new().await;
    let (owner, stranger) = (h.user(), h.user());
    let admin = Uuid::new_v4();
    h.store.add_account(UserAccount {
        id: admin,
        has_password: true,
        currency: Currency::Hkd,
        is_admin: true,
    });
    h.fund(owner, 10).await;
    let tx = h.store.transactions().remove(0);
    let uri = format!("/transactions/{}", tx.id);

    let status = |caller| {
        let router = app(&h);
        let uri = uri.clone();
        async move {
            router
                .oneshot(request("GET", &uri, Some(caller), None))
                .await
                .unwrap()
                .status()
        }
    };
    assert_eq!(status(owner).await, StatusCode::OK);
    assert_eq!(status(stranger).await, StatusCode::NOT_FOUND);
    assert_eq!(status(admin).await, StatusCode::OK);
}

#[tokio::test]
async fn refunds_and_flags_are_admin_only() {
    let h = Harness::new().await;
    let user = h.user();
    let admin = Uuid::new_v4();
    h.store.add_account(UserAccount {
        id: admin,
        has_password: true,
        currency: Currency::Hkd,
        is_admin: true,
    });

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/refunds",
            Some(user),
            Some(json!({ "transactionId": Uuid::new_v4() })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(&h)
        .oneshot(request("GET", "/admin/feature-flags", Some(user), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(&h)
        .oneshot(request(
            "PUT",
            "/admin/feature-flags/payment",
            Some(admin),
            Some(json!({ "mode": "off" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/credits",
            Some(user),
            Some(json!({ "amount": "5", "currency": "HKD" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn appreciations_are_recorded_for_the_recipient() {
    let h = Harness::new().await;
    let (reader, author) = (h.user(), h.user());
    let article = Uuid::new_v4();

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/appreciations",
            Some(reader),
            Some(json!({
                "recipientId": author,
                "amount": 3,
                "purpose": "appreciate",
                "referenceId": article
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/appreciations",
            Some(author),
            Some(json!({
                "recipientId": author,
                "amount": 1,
                "purpose": "appreciate",
                "referenceId": article
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/appreciations",
            Some(reader),
            Some(json!({
                "recipientId": author,
                "amount": 50,
                "purpose": "appreciateSubsidy"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(&h)
        .oneshot(request("GET", "/appreciations", Some(author), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let received = body.as_array().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["senderId"], json!(reader));
    assert_eq!(received[0]["amount"], json!(3));
    assert_eq!(received[0]["referenceId"], json!(article));
}

#[tokio::test]
async fn anonymous_login_challenge_is_issued() {
    let h = Harness::new().await;

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/wallet/challenge",
            None,
            Some(json!({
                "address": "0x5555555555555555555555555555555555555555",
                "purpose": "login"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let challenge = json_body(response).await;
    assert!(challenge["signedMessage"]
        .as_str()
        .unwrap()
        .contains(challenge["nonce"].as_str().unwrap()));

    let response = app(&h)
        .oneshot(request(
            "POST",
            "/wallet/challenge",
            None,
            Some(json!({
                "address": "0x5555555555555555555555555555555555555555",
                "purpose": "connect"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
