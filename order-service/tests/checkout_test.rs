//! Checkout integration tests: pricing, vouchers, stock and order numbers.

mod common;

use common::{order_body, TestApp, VoucherSeed, OTHER_USER_ID, TEST_USER_ID};
use order_service::models::OrderDetails;
use serde_json::{json, Value};

#[tokio::test]
async fn small_order_pays_standard_shipping() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(200_000, 10).await;

    let order = app.place_order(&order_body(product, 2), None).await;

    assert_eq!(order["subtotal"], 400_000);
    assert_eq!(order["discount_amount"], 0);
    assert_eq!(order["shipping_fee"], 30_000);
    assert_eq!(order["total"], 430_000);
    assert_eq!(order["status"], "PENDING");
    assert_eq!(order["payment_status"], "PENDING");
    assert_eq!(order["payment_method"], "COD");
    assert_eq!(order["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(order["items"][0]["unit_price"], 200_000);
    assert_eq!(order["items"][0]["line_total"], 400_000);
    assert_eq!(order["timeline"][0]["status"], "PENDING");

    assert_eq!(app.product_stock(product).await, (8, 2));

    app.cleanup().await;
}

#[tokio::test]
async fn threshold_order_ships_free() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(300_000, 10).await;

    let order = app.place_order(&order_body(product, 2), None).await;

    assert_eq!(order["subtotal"], 600_000);
    assert_eq!(order["shipping_fee"], 0);
    assert_eq!(order["total"], 600_000);

    app.cleanup().await;
}

#[tokio::test]
async fn sale_price_wins_over_base_price() {
    let app = TestApp::spawn().await;
    let product = app
        .seed_product_with_sale(250_000, Some(199_000), 5)
        .await;

    let order = app.place_order(&order_body(product, 1), None).await;

    assert_eq!(order["items"][0]["unit_price"], 199_000);
    assert_eq!(order["subtotal"], 199_000);

    app.cleanup().await;
}

#[tokio::test]
async fn variant_line_uses_variant_price_and_stock() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 50).await;
    let variant = app.seed_variant(product, 150_000, 3).await;

    let body = json!({
        "items": [{ "product_id": product, "variant_id": variant, "quantity": 2 }],
        "customer_name": "Tran Van Minh",
        "customer_phone": "0912345678",
        "shipping_address": "8 Nguyen Hue, TP HCM"
    });
    let order = app.place_order(&body, None).await;

    assert_eq!(order["items"][0]["unit_price"], 150_000);
    assert_eq!(order["items"][0]["variant_id"], json!(variant));
    assert_eq!(app.variant_stock(variant).await, 1);
    // Product-level stock is untouched; only the sales counter moves.
    assert_eq!(app.product_stock(product).await, (50, 2));

    app.cleanup().await;
}

#[tokio::test]
async fn order_numbers_follow_a_daily_sequence() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 10).await;

    let first = app.place_order(&order_body(product, 1), None).await;
    let second = app.place_order(&order_body(product, 1), None).await;

    let first = first["order_number"].as_str().unwrap_or_default().to_string();
    let second = second["order_number"].as_str().unwrap_or_default().to_string();
    assert!(first.starts_with("ENZ-"), "unexpected number {}", first);
    assert!(first.ends_with("-0001"), "unexpected number {}", first);
    assert!(second.ends_with("-0002"), "unexpected number {}", second);
    assert_eq!(first[..12], second[..12]);

    app.cleanup().await;
}

#[tokio::test]
async fn daily_sequence_stops_at_four_digits() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 10).await;
    app.place_order(&order_body(product, 1), None).await;

    sqlx::query("UPDATE order_number_sequences SET last_value = 9998")
        .execute(app.db.pool())
        .await
        .expect("Failed to move sequence");

    let last = app.place_order(&order_body(product, 1), None).await;
    let last = last["order_number"].as_str().unwrap_or_default().to_string();
    assert!(last.ends_with("-9999"), "unexpected number {}", last);

    let response = app.create_order(&order_body(product, 1), None).await;
    assert_eq!(response.status(), 409);
    assert_eq!(app.order_count().await, 2);
    assert_eq!(app.product_stock(product).await, (8, 2));

    app.cleanup().await;
}

#[tokio::test]
async fn percentage_voucher_is_capped() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(500_000, 10).await;
    let voucher = app
        .seed_voucher(VoucherSeed {
            max_discount: Some(50_000),
            ..VoucherSeed::new("SALE10", "PERCENTAGE", 10)
        })
        .await;

    let mut body = order_body(product, 2);
    body["voucher_code"] = json!("sale10");
    let order = app.place_order(&body, Some(TEST_USER_ID)).await;

    assert_eq!(order["subtotal"], 1_000_000);
    assert_eq!(order["voucher_discount"], 50_000);
    assert_eq!(order["discount_amount"], 50_000);
    assert_eq!(order["shipping_fee"], 0);
    assert_eq!(order["total"], 950_000);
    assert_eq!(order["voucher_code"], "SALE10");
    assert_eq!(app.voucher_used_count(voucher).await, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn voucher_loyalty_and_shipping_add_up() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 10).await;
    app.seed_voucher(VoucherSeed::new("LESS20K", "FIXED_AMOUNT", 20_000))
        .await;
    app.adjust_points(TEST_USER_ID, 300).await;

    let mut body = order_body(product, 1);
    body["voucher_code"] = json!("LESS20K");
    body["loyalty_points"] = json!(300);
    let order = app.place_order(&body, Some(TEST_USER_ID)).await;
    let details: OrderDetails = serde_json::from_value(order).expect("Failed to parse order");

    assert!(details.order.amounts_consistent());
    assert_eq!(details.order.voucher_discount, 20_000);
    assert_eq!(details.order.loyalty_discount, 3_000);
    assert_eq!(details.order.shipping_fee, 30_000);
    assert_eq!(details.order.total, 107_000);

    app.cleanup().await;
}

#[tokio::test]
async fn free_shipping_voucher_waives_fee() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 10).await;
    app.seed_voucher(VoucherSeed::new("FREESHIP", "FREE_SHIPPING", 0))
        .await;

    let mut body = order_body(product, 1);
    body["voucher_code"] = json!("FREESHIP");
    let order = app.place_order(&body, None).await;

    assert_eq!(order["discount_amount"], 0);
    assert_eq!(order["shipping_fee"], 0);
    assert_eq!(order["total"], 100_000);

    app.cleanup().await;
}

#[tokio::test]
async fn voucher_below_minimum_rejects_whole_order() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 10).await;
    let voucher = app
        .seed_voucher(VoucherSeed {
            min_order_amount: Some(300_000),
            ..VoucherSeed::new("BIG50K", "FIXED_AMOUNT", 50_000)
        })
        .await;

    let mut body = order_body(product, 1);
    body["voucher_code"] = json!("BIG50K");
    let response = app.create_order(&body, None).await;

    assert_eq!(response.status(), 409);
    assert_eq!(app.order_count().await, 0);
    assert_eq!(app.product_stock(product).await, (10, 0));
    assert_eq!(app.voucher_used_count(voucher).await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_voucher_is_not_found() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 10).await;

    let mut body = order_body(product, 1);
    body["voucher_code"] = json!("NOPE");
    let response = app.create_order(&body, None).await;

    assert_eq!(response.status(), 404);
    assert_eq!(app.order_count().await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn exhausted_voucher_is_rejected() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 10).await;
    app.seed_voucher(VoucherSeed {
        usage_limit: Some(5),
        used_count: 5,
        ..VoucherSeed::new("LIMITED", "FIXED_AMOUNT", 10_000)
    })
    .await;

    let mut body = order_body(product, 1);
    body["voucher_code"] = json!("LIMITED");
    let response = app.create_order(&body, None).await;

    assert_eq!(response.status(), 409);

    app.cleanup().await;
}

#[tokio::test]
async fn per_user_limit_counts_only_that_user() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 10).await;
    app.seed_voucher(VoucherSeed {
        per_user_limit: Some(1),
        ..VoucherSeed::new("ONCE", "FIXED_AMOUNT", 10_000)
    })
    .await;

    let mut body = order_body(product, 1);
    body["voucher_code"] = json!("ONCE");

    app.place_order(&body, Some(TEST_USER_ID)).await;
    let again = app.create_order(&body, Some(TEST_USER_ID)).await;
    assert_eq!(again.status(), 409);

    let other = app.create_order(&body, Some(OTHER_USER_ID)).await;
    assert_eq!(other.status(), 201);

    app.cleanup().await;
}

#[tokio::test]
async fn voucher_preview_does_not_consume_usage() {
    let app = TestApp::spawn().await;
    let voucher = app
        .seed_voucher(VoucherSeed {
            max_discount: Some(50_000),
            ..VoucherSeed::new("SALE10", "PERCENTAGE", 10)
        })
        .await;

    let response = app
        .client
        .post(app.url("/vouchers/validate"))
        .json(&json!({ "code": "SALE10", "subtotal": 300_000 }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), 200);
    let preview: Value = response.json().await.expect("Failed to parse preview");
    assert_eq!(preview["valid"], true);
    assert_eq!(preview["discount"], 30_000);

    let missing: Value = app
        .client
        .post(app.url("/vouchers/validate"))
        .json(&json!({ "code": "MISSING", "subtotal": 300_000 }))
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Failed to parse preview");
    assert_eq!(missing["valid"], false);
    assert!(missing["reason"].is_string());

    assert_eq!(app.voucher_used_count(voucher).await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn demand_is_summed_across_lines() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 3).await;

    let body = json!({
        "items": [
            { "product_id": product, "quantity": 2 },
            { "product_id": product, "quantity": 2 }
        ],
        "customer_name": "Le Hoa",
        "customer_phone": "0987654321",
        "shipping_address": "3 Tran Phu, Da Nang"
    });
    let response = app.create_order(&body, None).await;

    assert_eq!(response.status(), 409);
    assert_eq!(app.product_stock(product).await, (3, 0));

    app.cleanup().await;
}

#[tokio::test]
async fn invalid_carts_are_bad_requests() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 3).await;

    let empty = json!({
        "items": [],
        "customer_name": "Le Hoa",
        "customer_phone": "0987654321",
        "shipping_address": "3 Tran Phu, Da Nang"
    });
    assert_eq!(app.create_order(&empty, None).await.status(), 400);

    let zero_quantity = order_body(product, 0);
    assert_eq!(app.create_order(&zero_quantity, None).await.status(), 400);

    let mut bad_email = order_body(product, 1);
    bad_email["customer_email"] = json!("not-an-email");
    assert_eq!(app.create_order(&bad_email, None).await.status(), 400);

    assert_eq!(app.order_count().await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_product_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .create_order(&order_body(uuid::Uuid::new_v4(), 1), None)
        .await;

    assert_eq!(response.status(), 404);

    app.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_never_oversell() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 1).await;
    let body = order_body(product, 1);

    let attempts = (0..5).map(|_| app.create_order(&body, None));
    let statuses: Vec<u16> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.status().as_u16())
        .collect();

    assert_eq!(statuses.iter().filter(|s| **s == 201).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == 409).count(), 4);
    assert_eq!(app.product_stock(product).await, (0, 1));
    assert_eq!(app.order_count().await, 1);

    app.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_respect_voucher_limit() {
    let app = TestApp::spawn().await;
    let product = app.seed_product(100_000, 20).await;
    let voucher = app
        .seed_voucher(VoucherSeed {
            usage_limit: Some(2),
            ..VoucherSeed::new("FIRST2", "FIXED_AMOUNT", 10_000)
        })
        .await;

    let mut body = order_body(product, 1);
    body["voucher_code"] = json!("FIRST2");

    let attempts = (0..6).map(|_| app.create_order(&body, None));
    let created = futures::future::join_all(attempts)
        .await
        .into_iter()
        .filter(|r| r.status() == 201)
        .count();

    assert_eq!(created, 2);
    assert_eq!(app.voucher_used_count(voucher).await, 2);

    app.cleanup().await;
}
