//! Cart ledger: one open cart, stock gate, checkout retries.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use tokio::sync::Barrier;
use vdiamond_core::{CartStatus, Email, OrderStatus, Price, SubjectStatus, UserId};
use vdiamond_integration_tests::TestApp;
use vdiamond_server::db::SubjectStore;
use vdiamond_server::models::NewSubject;
use vdiamond_server::services::cart::{CartError, CheckoutOutcome};

async fn active_subject(app: &TestApp) -> UserId {
    app.register_active("shopper@example.com").await.id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_yields_one_cart() {
    let app = TestApp::new();
    // Created straight in the store so no cart has been provisioned yet
    let user = app
        .store
        .create_subject(NewSubject {
            email: Email::parse("fresh@example.com").unwrap(),
            name: "Fresh".to_string(),
            picture: None,
            password_hash: None,
            external_id: None,
            status: SubjectStatus::Active,
        })
        .await
        .unwrap()
        .id;
    assert_eq!(app.store.open_cart_count(user), 0);

    let barrier = Arc::new(Barrier::new(16));
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let state = app.state.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                state.carts().get_or_create(user).await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(app.store.open_cart_count(user), 1);
}

#[tokio::test]
async fn test_stock_gate_and_merge() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 2500, 3);

    let err = app.state.carts().add_item(user, ring.id, 4).await.unwrap_err();
    assert!(matches!(
        err,
        CartError::OutOfStock {
            requested: 4,
            available: 3
        }
    ));

    app.state.carts().add_item(user, ring.id, 2).await.unwrap();
    let merged = app.state.carts().add_item(user, ring.id, 1).await.unwrap();
    assert_eq!(merged.quantity, 3);

    let view = app.state.carts().view(user).await.unwrap();
    assert_eq!(view.lines.len(), 1);
    assert_eq!(view.total, Price::from_cents(7500).unwrap());
}

#[tokio::test]
async fn test_add_rejects_bad_input() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 2500, 3);

    let err = app.state.carts().add_item(user, ring.id, 0).await.unwrap_err();
    assert!(matches!(err, CartError::InvalidQuantity));

    let missing = vdiamond_core::ProductId::new(ring.id.as_i64() + 1000);
    let err = app.state.carts().add_item(user, missing, 1).await.unwrap_err();
    assert!(matches!(err, CartError::ProductNotFound));
}

#[tokio::test]
async fn test_update_to_zero_removes_line() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 2500, 3);

    let item = app.state.carts().add_item(user, ring.id, 2).await.unwrap();
    let view = app.state.carts().update_item(user, item.id, 0).await.unwrap();
    assert!(view.lines.is_empty());

    let err = app
        .state
        .carts()
        .update_item(user, item.id, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, CartError::ItemNotFound));
}

#[tokio::test]
async fn test_items_of_other_subjects_are_invisible() {
    let app = TestApp::new();
    let owner = active_subject(&app).await;
    let other = app.register_active("other@example.com").await.id;
    let ring = app.product("Ring", 2500, 3);

    let item = app.state.carts().add_item(owner, ring.id, 1).await.unwrap();
    let err = app
        .state
        .carts()
        .update_item(other, item.id, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, CartError::ItemNotFound));
}

#[tokio::test]
async fn test_checkout_is_idempotent_per_cart() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 2500, 3);

    app.state.carts().add_item(user, ring.id, 1).await.unwrap();
    let cart_id = app.state.carts().view(user).await.unwrap().cart.id;

    let first = app
        .state
        .carts()
        .checkout(user, Some(cart_id))
        .await
        .unwrap();
    assert!(matches!(first, CheckoutOutcome::Closed(_)));
    assert_eq!(first.order().cart.status, CartStatus::Closed);
    assert_eq!(first.order().cart.order_status, Some(OrderStatus::Placed));

    let retry = app
        .state
        .carts()
        .checkout(user, Some(cart_id))
        .await
        .unwrap();
    assert!(matches!(retry, CheckoutOutcome::AlreadyClosed(_)));
    assert_eq!(retry.order().cart.id, cart_id);

    assert_eq!(app.state.carts().orders_for(user).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkout_closes_once() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 2500, 3);

    app.state.carts().add_item(user, ring.id, 1).await.unwrap();
    let cart_id = app.state.carts().view(user).await.unwrap().cart.id;

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = app.state.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                state.carts().checkout(user, Some(cart_id)).await
            })
        })
        .collect();

    let mut closed = 0;
    for handle in handles {
        if matches!(handle.await.unwrap().unwrap(), CheckoutOutcome::Closed(_)) {
            closed += 1;
        }
    }
    assert_eq!(closed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_racing_checkout_never_changes_the_order() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 1000, 5);

    for _ in 0..25 {
        app.state.carts().add_item(user, ring.id, 1).await.unwrap();
        let before = app.state.carts().view(user).await.unwrap().lines[0].quantity;
        let barrier = Arc::new(Barrier::new(2));

        let adder = {
            let state = app.state.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                state.carts().add_item(user, ring.id, 3).await
            })
        };
        let checkout = {
            let state = app.state.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                state.carts().checkout(user, None).await
            })
        };

        let item = adder.await.unwrap().unwrap();
        let outcome = checkout.await.unwrap().unwrap();
        let CheckoutOutcome::Closed(order) = outcome else {
            panic!("expected the checkout to close a cart with lines");
        };

        // The order is frozen at checkout; a late add lands in a fresh cart
        let stored = app.state.carts().order(order.cart.id).await.unwrap();
        assert_eq!(stored.total, order.total);
        let expected = if item.cart_id == order.cart.id {
            before + 3
        } else {
            before
        };
        assert_eq!(order.lines[0].quantity, expected);
    }
}

#[tokio::test]
async fn test_checkout_of_empty_cart_and_without_one() {
    let app = TestApp::new();
    let user = active_subject(&app).await;

    // Activation provisioned an empty cart and there is no earlier order
    let first = app.state.carts().checkout(user, None).await.unwrap();
    assert!(matches!(first, CheckoutOutcome::Closed(_)));
    assert!(first.order().lines.is_empty());

    let err = app.state.carts().checkout(user, None).await.unwrap_err();
    assert!(matches!(err, CartError::NoActiveCart));
}

#[tokio::test]
async fn test_checkout_after_viewing_reports_previous_order() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 2500, 5);

    app.state.carts().add_item(user, ring.id, 2).await.unwrap();
    app.state.carts().add_item(user, ring.id, 2).await.unwrap();
    let first = app.state.carts().checkout(user, None).await.unwrap();
    let CheckoutOutcome::Closed(order) = first else {
        panic!("expected first checkout to close the cart");
    };
    assert_eq!(order.total, Price::from_cents(10_000).unwrap());

    // Viewing opens a fresh empty cart
    let fresh = app.state.carts().view(user).await.unwrap();
    assert_ne!(fresh.cart.id, order.cart.id);

    let retry = app.state.carts().checkout(user, None).await.unwrap();
    assert!(matches!(retry, CheckoutOutcome::AlreadyClosed(_)));
    assert_eq!(retry.order(), &order);
    assert_eq!(app.state.carts().orders_for(user).await.unwrap().len(), 1);
    assert_eq!(app.store.open_cart_count(user), 1);
}

#[tokio::test]
async fn test_next_add_after_checkout_opens_new_cart() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 2500, 3);

    app.state.carts().add_item(user, ring.id, 1).await.unwrap();
    let closed = app.state.carts().checkout(user, None).await.unwrap();

    app.state.carts().add_item(user, ring.id, 1).await.unwrap();
    let open = app.state.carts().view(user).await.unwrap();
    assert_ne!(open.cart.id, closed.order().cart.id);
    assert_eq!(app.store.open_cart_count(user), 1);
}

#[tokio::test]
async fn test_order_status_only_on_closed_carts() {
    let app = TestApp::new();
    let user = active_subject(&app).await;
    let ring = app.product("Ring", 2500, 3);

    app.state.carts().add_item(user, ring.id, 1).await.unwrap();
    let open_id = app.state.carts().view(user).await.unwrap().cart.id;
    let err = app
        .state
        .carts()
        .update_order_status(open_id, OrderStatus::Shipped)
        .await
        .unwrap_err();
    assert!(matches!(err, CartError::OrderNotClosed));

    app.state.carts().checkout(user, None).await.unwrap();
    let shipped = app
        .state
        .carts()
        .update_order_status(open_id, OrderStatus::Shipped)
        .await
        .unwrap();
    assert_eq!(shipped.cart.order_status, Some(OrderStatus::Shipped));
}
