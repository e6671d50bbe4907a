use std::sync::Arc;

use bookshelf::clock::ManualClock;
use bookshelf::config::{FieldPolicy, StoreConfig};
use bookshelf::guard::EntryPoint;
use bookshelf::server::routes;
use bookshelf::VersionedStore;
use serde_json::{json, Value};
use warp::http::StatusCode;

fn setup(policy: FieldPolicy) -> (EntryPoint, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = Arc::new(VersionedStore::in_memory(StoreConfig::default(), clock.clone()));
    (EntryPoint::new(store, policy), clock)
}

fn body(res: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
    serde_json::from_slice(res.body()).unwrap()
}

#[tokio::test]
async fn create_ignores_client_timestamps() {
    let (entry, _) = setup(FieldPolicy::Strip);
    let api = routes(entry);

    let res = warp::test::request()
        .method("POST")
        .path("/books")
        .json(&json!({"ID": 1, "title": "X", "stock": 5, "validFrom": "2020-01-01", "validTo": "2020-01-02"}))
        .reply(&api)
        .await;

    assert_eq!(res.status(), StatusCode::CREATED);
    let created = body(&res);
    assert_eq!(created["validFrom"], 1_000_000);
    assert!(created["validTo"].is_null());

    let res = warp::test::request().path("/books/1").reply(&api).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body(&res)["title"], "X");
}

#[tokio::test]
async fn reject_policy_returns_400() {
    let (entry, _) = setup(FieldPolicy::Reject);
    let api = routes(entry);

    let res = warp::test::request()
        .method("POST")
        .path("/books")
        .json(&json!({"ID": 1, "title": "X", "validFrom": 5}))
        .reply(&api)
        .await;

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body(&res)["code"], "READ_ONLY_FIELD");
}

#[tokio::test]
async fn update_delete_and_audit_round() {
    let (entry, clock) = setup(FieldPolicy::Strip);
    let api = routes(entry);

    warp::test::request()
        .method("POST")
        .path("/books")
        .json(&json!({"ID": 7, "title": "Old", "stock": 1}))
        .reply(&api)
        .await;

    clock.set(2_000_000);
    let res = warp::test::request()
        .method("PATCH")
        .path("/books/7")
        .json(&json!({"stock": 4}))
        .reply(&api)
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body(&res)["stock"], 4);
    assert_eq!(body(&res)["title"], "Old");

    clock.set(3_000_000);
    let res = warp::test::request().method("DELETE").path("/books/7").reply(&api).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = warp::test::request().path("/books/7").reply(&api).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(body(&res)["code"], "NOT_FOUND");

    let res = warp::test::request().path("/books/7/as-of/2500000").reply(&api).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body(&res)["stock"], 4);
    assert_eq!(body(&res)["validTo"], 3_000_000);

    let res = warp::test::request().path("/audit/books/7").reply(&api).await;
    let rows = body(&res);
    assert_eq!(rows.as_array().map(|a| a.len()), Some(2));
    assert_eq!(rows[0]["validTo"], 2_000_000);
    assert_eq!(rows[1]["validFrom"], 2_000_000);

    let res = warp::test::request().path("/books").reply(&api).await;
    assert_eq!(body(&res), json!([]));

    let res = warp::test::request().path("/admin/verify").reply(&api).await;
    assert_eq!(body(&res)["ok"], true);
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let (entry, _) = setup(FieldPolicy::Strip);
    let api = routes(entry);

    let create = || {
        warp::test::request()
            .method("POST")
            .path("/books")
            .json(&json!({"ID": 1, "title": "A"}))
    };
    assert_eq!(create().reply(&api).await.status(), StatusCode::CREATED);

    let dup = create().reply(&api).await;
    assert_eq!(dup.status(), StatusCode::CONFLICT);
    assert_eq!(body(&dup)["code"], "DUPLICATE_KEY");

    let res = warp::test::request()
        .method("POST")
        .path("/books")
        .header("content-type", "application/json")
        .body("{not json")
        .reply(&api)
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body(&res)["code"], "VALIDATION");

    let res = warp::test::request().method("PUT").path("/books/99").json(&json!({"stock": 1})).reply(&api).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = warp::test::request().path("/nowhere").reply(&api).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn body_without_length_is_411() {
    let (entry, _) = setup(FieldPolicy::Strip);
    let api = routes(entry);

    let res = warp::test::request().method("POST").path("/books").reply(&api).await;
    assert_eq!(res.status(), StatusCode::LENGTH_REQUIRED);
    assert_eq!(body(&res)["code"], "VALIDATION");

    let res = warp::test::request().method("PATCH").path("/books/1").reply(&api).await;
    assert_eq!(res.status(), StatusCode::LENGTH_REQUIRED);
}

#[tokio::test]
async fn list_filters_by_query() {
    let (entry, _) = setup(FieldPolicy::Strip);
    let api = routes(entry);

    for (id, title, stock) in [(1, "Rust in Action", 2), (2, "Rust Atomics", 9), (3, "Emma", 9)] {
        warp::test::request()
            .method("POST")
            .path("/books")
            .json(&json!({"ID": id, "title": title, "stock": stock}))
            .reply(&api)
            .await;
    }

    let res = warp::test::request().path("/books?title=Rust&min_stock=5").reply(&api).await;
    let rows = body(&res);
    assert_eq!(rows.as_array().map(|a| a.len()), Some(1));
    assert_eq!(rows[0]["ID"], 2);
}
