//! Order lifecycle through chain logs and the HTTP API.

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use axum::http::StatusCode;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use super::{order_id, Harness};
use venue_router::types::{EventResult, EventStatus, OrderStatus};

fn wallet() -> Address {
    "0x00000000000000000000000000000000000000a1".parse().unwrap()
}

async fn priced_harness() -> Harness {
    let h = Harness::new().await;
    h.ingest().await;
    h.poly.set_prices("p1", &[("Lakers", 0.58), ("Celtics", 0.42)]);
    h.kalshi.set_prices("K1", &[("YES", 0.55), ("NO", 0.45)]);
    h
}

fn place_body(coid: &str, option: &str) -> serde_json::Value {
    json!({ "contract_order_id": coid, "event_uuid": "1_p1", "bet_option": option, "amount": 10.0 })
}

#[tokio::test]
async fn test_place_requires_prior_deposit() {
    let h = priced_harness().await;
    let bet = B256::repeat_byte(0x11);
    let coid = order_id(bet);

    let (status, body) = h.request("POST", "/api/orders/place", Some(place_body(&coid, "YES"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    assert_ok!(h.deliver_deposit(bet, wallet(), 10_000_000, 0xd1).await);
    let (status, body) = h.request("POST", "/api/orders/place", Some(place_body(&coid, "YES"))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["order_uuid"], coid.as_str());
    assert_eq!(body["platform_id"], 1);
    assert_eq!(body["status"], "placed");

    // YES routed to the venue's win outcome at the higher price.
    let sent = h.poly.placed();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bet_option, "Lakers");
    assert_eq!(sent[0].platform_event_id, "p1");
    assert!((sent[0].locked_odds - 0.58).abs() < 1e-9);
    assert!(h.kalshi.placed().is_empty());

    let deposit = h.store.find_deposit(&coid).await.unwrap().unwrap();
    assert!(deposit.processed);
    let order = h.store.get_order(&coid).await.unwrap().unwrap();
    assert!((order.bet_amount - deposit.deposit_amount).abs() <= 0.01);
    assert_eq!(order.user_wallet.to_lowercase(), format!("{:#x}", wallet()));

    let (status, body) = h
        .request("GET", &format!("/api/orders?wallet={:#x}", wallet()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
}

#[tokio::test]
async fn test_duplicate_deposit_log_is_recorded_once() {
    let h = priced_harness().await;
    let bet = B256::repeat_byte(0x12);
    assert_ok!(h.deliver_deposit(bet, wallet(), 5_000_000, 0xd2).await);
    assert_ok!(h.deliver_deposit(bet, wallet(), 5_000_000, 0xd2).await);
    assert_eq!(h.count("contract_events").await, 1);
}

#[tokio::test]
async fn test_prepare_routes_to_best_price_and_clamps() {
    let h = priced_harness().await;
    let bet = B256::repeat_byte(0x13);
    let coid = order_id(bet);
    assert_ok!(h.deliver_deposit(bet, wallet(), 10_000_000, 0xd3).await);

    h.kalshi.set_prices("K1", &[("YES", 0.62), ("NO", 0.38)]);
    let prepare = json!({ "contract_order_id": coid, "event_uuid": "1_p1", "bet_option": "YES" });
    let (status, body) = h.request("POST", "/api/orders/prepare", Some(prepare.clone())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["platform_id"], 2);
    assert_eq!(body["option_name"], "YES");
    assert_eq!(body["best_price"], 0.62);

    h.kalshi.set_prices("K1", &[("YES", 1.0), ("NO", 0.0)]);
    let (_, body) = h.request("POST", "/api/orders/prepare", Some(prepare)).await;
    assert_eq!(body["best_price"], 1.0);
    assert_eq!(body["locked_odds"], 0.99);
    let message = body["message_to_sign"].as_str().unwrap();
    assert!(message.starts_with(&format!("PlaceOrder:{coid}:1_p1:YES:0.990000:")));
    let expires_ms = body["expires_at"].as_i64().unwrap();
    assert!(message.ends_with(&format!(":{}", expires_ms / 1000)));
}

#[tokio::test]
async fn test_signed_place_round_trip() {
    let h = priced_harness().await;
    let signer = PrivateKeySigner::random();
    let bet = B256::repeat_byte(0x14);
    let coid = order_id(bet);
    assert_ok!(h.deliver_deposit(bet, signer.address(), 10_000_000, 0xd4).await);

    let (_, prepared) = h
        .request(
            "POST",
            "/api/orders/prepare",
            Some(json!({ "contract_order_id": coid, "event_uuid": "1_p1", "bet_option": "YES" })),
        )
        .await;
    let message = prepared["message_to_sign"].as_str().unwrap().to_string();

    // Someone else's signature is refused.
    let stranger = PrivateKeySigner::random();
    let forged = format!("0x{}", hex::encode(stranger.sign_message_sync(message.as_bytes()).unwrap().as_bytes()));
    let mut body = place_body(&coid, "YES");
    body["message_to_sign"] = json!(message);
    body["signature"] = json!(forged);
    let (status, err) = h.request("POST", "/api/orders/place", Some(body.clone())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("does not match"));

    let signature = format!("0x{}", hex::encode(signer.sign_message_sync(message.as_bytes()).unwrap().as_bytes()));
    body["signature"] = json!(signature);
    let (status, placed) = h.request("POST", "/api/orders/place", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{placed}");
    assert_eq!(placed["platform_id"], 1);
}

#[tokio::test]
async fn test_venue_failure_leaves_deposit_usable() {
    let h = priced_harness().await;
    let bet = B256::repeat_byte(0x15);
    let coid = order_id(bet);
    assert_ok!(h.deliver_deposit(bet, wallet(), 10_000_000, 0xd5).await);

    h.poly.set_error("HTTP 400: market closed");
    h.kalshi.set_error("HTTP 503");
    let (status, body) = h.request("POST", "/api/orders/place", Some(place_body(&coid, "YES"))).await;
    // Stored ingest prices still route; the chosen venue then rejects the order.
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("venue error"));
    assert!(h.store.get_order(&coid).await.unwrap().is_none());
    assert!(!h.store.find_deposit(&coid).await.unwrap().unwrap().processed);

    h.poly.clear_error();
    h.kalshi.clear_error();
    let (status, _) = h.request("POST", "/api/orders/place", Some(place_body(&coid, "YES"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_amount_mismatch_is_rejected() {
    let h = priced_harness().await;
    let bet = B256::repeat_byte(0x16);
    let coid = order_id(bet);
    assert_ok!(h.deliver_deposit(bet, wallet(), 10_000_000, 0xd6).await);
    let mut body = place_body(&coid, "YES");
    body["amount"] = json!(10.02);
    let (status, _) = h.request("POST", "/api/orders/place", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_duplicate_settlement_is_idempotent() {
    let h = priced_harness().await;
    let bet = B256::repeat_byte(0x17);
    let coid = order_id(bet);
    assert_ok!(h.deliver_deposit(bet, wallet(), 10_000_000, 0xd7).await);
    let (status, _) = h.request("POST", "/api/orders/place", Some(place_body(&coid, "YES"))).await;
    assert_eq!(status, StatusCode::OK);

    assert_ok!(h.deliver_settled(bet, 12_000_000, 120_000, 0xe7).await);
    assert_ok!(h.deliver_settled(bet, 12_000_000, 120_000, 0xe7).await);

    let order = h.store.get_order(&coid).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Settled);
    assert_eq!(order.settlement_tx_hash, Some(format!("{:#x}", B256::repeat_byte(0xe7))));
    assert!((order.actual_profit - 2.0).abs() < 1e-9);
    assert_eq!(h.count("settlement_records").await, 1);

    let records = h.store.settlement_records_for(&coid).await.unwrap();
    assert!((records[0].manage_fee - 0.12).abs() < 1e-9);
}

#[tokio::test]
async fn test_settlement_for_unknown_bet_fails() {
    let h = priced_harness().await;
    assert_err!(h.deliver_settled(B256::repeat_byte(0x99), 1_000_000, 0, 0xe9).await);
}

#[tokio::test]
async fn test_withdraw_after_settlement() {
    let h = priced_harness().await;
    let bet = B256::repeat_byte(0x18);
    let coid = order_id(bet);
    assert_ok!(h.deliver_deposit(bet, wallet(), 10_000_000, 0xd8).await);
    h.request("POST", "/api/orders/place", Some(place_body(&coid, "YES"))).await;

    let (status, _) = h.request("POST", &format!("/api/orders/{coid}/withdraw"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_ok!(h.deliver_settled(bet, 17_240_000, 0, 0xe8).await);
    let (status, info) = h.request("GET", &format!("/api/orders/{coid}/withdraw-info"), None).await;
    assert_eq!(status, StatusCode::OK, "{info}");
    assert_eq!(info["method"], "onchain");
    assert_eq!(info["bet_id"], format!("0x{coid}"));
    assert_eq!(info["amount_units"], "17240000");
    assert_eq!(info["contract"], "0x00000000000000000000000000000000000000e6");

    let (status, out) = h.request("POST", &format!("/api/orders/{coid}/withdraw"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["status"], "withdraw_requested");
    let (status, _) = h.request("POST", &format!("/api/orders/{coid}/withdraw"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unfreeze_and_place_are_mutually_exclusive() {
    let h = priced_harness().await;

    // Placed first: the refund is refused without a chain call.
    let placed_bet = B256::repeat_byte(0x19);
    let placed_coid = order_id(placed_bet);
    assert_ok!(h.deliver_deposit(placed_bet, wallet(), 10_000_000, 0xd9).await);
    h.request("POST", "/api/orders/place", Some(place_body(&placed_coid, "YES"))).await;
    let (status, body) = h
        .request("POST", "/api/orders/unfreeze", Some(json!({ "contract_order_id": placed_coid })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("already processed"));
    assert!(h.releaser.calls.lock().unwrap().is_empty());

    // Refunded first: placing is refused.
    let refund_bet = B256::repeat_byte(0x1a);
    let refund_coid = order_id(refund_bet);
    assert_ok!(h.deliver_deposit(refund_bet, wallet(), 7_500_000, 0xda).await);
    let (status, receipt) = h
        .request(
            "POST",
            "/api/orders/unfreeze",
            Some(json!({ "contract_order_id": format!("0x{refund_coid}"), "wallet": format!("{:#x}", wallet()) })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{receipt}");
    assert!(receipt["refunded_at"].is_i64());
    {
        let calls = h.releaser.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (refund_bet, wallet(), U256::from(7_500_000u64)));
    }

    let (status, body) = h.request("POST", "/api/orders/place", Some(place_body(&refund_coid, "YES"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("already refunded"));

    let deposit = h.store.find_deposit(&refund_coid).await.unwrap().unwrap();
    assert!(deposit.is_refunded() && !deposit.processed);
}

#[tokio::test]
async fn test_result_sync_opens_settlement() {
    let h = priced_harness().await;
    let bet = B256::repeat_byte(0x1b);
    let coid = order_id(bet);
    assert_ok!(h.deliver_deposit(bet, wallet(), 10_000_000, 0xdb).await);
    h.request("POST", "/api/orders/place", Some(place_body(&coid, "YES"))).await;

    // Past end time makes the event due for a result check.
    let event = h.store.get_event_by_uuid("1_p1").await.unwrap().unwrap();
    sqlx::query("UPDATE events SET end_time = ? WHERE id = ?")
        .bind(chrono::Utc::now() - chrono::Duration::hours(1))
        .bind(event.id)
        .execute(h.store.pool())
        .await
        .unwrap();
    h.poly.set_result(
        "p1",
        EventResult {
            status: EventStatus::Resolved,
            result: Some("Lakers".into()),
            result_source: "polymarket:p1".into(),
        },
    );

    let report = h.sync.sync_results(&Default::default()).await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.settlable_orders, 1);
    assert_eq!(h.store.get_order(&coid).await.unwrap().unwrap().status, OrderStatus::Settlable);

    assert_ok!(h.deliver_settled(bet, 17_240_000, 0, 0xeb).await);
    assert_eq!(h.store.get_order(&coid).await.unwrap().unwrap().status, OrderStatus::Settled);
}
