#![cfg(test)]
//! End-to-end tests against the rpc surface. Ground rules: the db helper
//! methods are tested over in db_tests (and the coordinator in writer),
//! so over here we mostly care about dispatch behavior -- classification,
//! envelopes, error codes, and the multi-agent scenarios that only show
//! up once real concurrent requests hit the same store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use http::{Request, Response, StatusCode};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteConnection;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Service, ServiceExt}; // for `call`, `oneshot`, and `ready`

use super::state::*;
use super::*;
use crate::db::{Db, TestDb, WriteTask};
use crate::embed::TrigramEmbedder;
use crate::worker::Worker;

// SHORTCUTS FOR MAKING THINGS

async fn test_app() -> (TestDb, axum::Router, HoardState) {
    let tdb = Db::new_test_db().await;
    let inner = HoardInner {
        db: tdb.db.clone(),
        config: tdb.config.clone(),
        task_tracker: TaskTracker::new(),
        cancel_token: CancellationToken::new(),
    };
    let state: HoardState = Arc::new(inner);
    let app = hoard_app(state.clone());
    (tdb, app, state)
}

fn test_worker(state: &HoardState) -> Worker {
    Worker::new(
        state.db.clone(),
        Arc::new(TrigramEmbedder),
        &state.config.worker,
        &state.config.duplicates,
    )
}

// Since https://github.com/tokio-rs/axum/pull/1751, axum routers can't
// handle type inference for the ServiceExt methods because they're no
// longer generic over the body type. So you have to use the uniform
// function call syntax, which makes a minor mess... which I am choosing
// to corral into this thing.
async fn do_req(app: &mut axum::Router, req: Request<Body>) -> Response<Body> {
    ServiceExt::<Request<Body>>::ready(app)
        .await
        .unwrap()
        .call(req)
        .await
        .unwrap()
}

fn rpc_request(agent: &str, method: &str, params: Value) -> Request<Body> {
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json")
        .header("x-hoard-agent", agent)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: Response<Body>) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Fire a tool call and unwrap the envelope down to the result. Panics on
/// an rpc-level error, so only use it for calls that should succeed.
async fn call_ok(app: &mut axum::Router, agent: &str, method: &str, params: Value) -> Value {
    let resp = do_req(app, rpc_request(agent, method, params)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let envelope = body_json(resp).await;
    assert!(
        envelope.get("error").is_none(),
        "unexpected rpc error: {envelope}"
    );
    envelope["result"].clone()
}

/// Fire a tool call that should fail, returning the error code.
async fn call_err(app: &mut axum::Router, agent: &str, method: &str, params: Value) -> i64 {
    let resp = do_req(app, rpc_request(agent, method, params)).await;
    let envelope = body_json(resp).await;
    envelope["error"]["code"].as_i64().expect("expected an rpc error")
}

// THE TESTS

#[tokio::test]
async fn memory_round_trip() {
    let (_tdb, mut app, _state) = test_app().await;
    let put = call_ok(
        &mut app,
        "agent-a",
        "memory_put",
        json!({ "slot": "prd", "content": "PRD test memory" }),
    )
    .await;
    assert_eq!(put["memory"]["slot"], "prd");
    assert_eq!(put["superseded"], Value::Null);

    let got = call_ok(&mut app, "agent-a", "memory_get", json!({ "slot": "prd" })).await;
    assert_eq!(got["memory"]["content"], "PRD test memory");

    // A second put by the same agent supersedes the first.
    let put2 = call_ok(
        &mut app,
        "agent-a",
        "memory_put",
        json!({ "slot": "prd", "content": "PRD v2" }),
    )
    .await;
    assert_eq!(put2["superseded"], put["memory"]["id"]);
    let got2 = call_ok(&mut app, "agent-a", "memory_get", json!({ "slot": "prd" })).await;
    assert_eq!(got2["memory"]["content"], "PRD v2");
}

#[tokio::test]
async fn two_agents_write_distinct_slots_simultaneously() {
    let (_tdb, app, _state) = test_app().await;
    let mut app_a = app.clone();
    let mut app_b = app.clone();
    let (a, b) = tokio::join!(
        call_ok(
            &mut app_a,
            "agent-a",
            "memory_put",
            json!({ "slot": "prd", "content": "PRD test memory" }),
        ),
        call_ok(
            &mut app_b,
            "agent-b",
            "memory_put",
            json!({ "slot": "roadmap", "content": "Q3 plan" }),
        ),
    );
    assert_eq!(a["memory"]["slot"], "prd");
    assert_eq!(b["memory"]["slot"], "roadmap");

    let mut app = app;
    let hits = call_ok(&mut app, "agent-a", "search", json!({ "query": "PRD test" })).await;
    assert_eq!(hits["memories"].as_array().unwrap().len(), 1);
    assert_eq!(hits["memories"][0]["slot"], "prd");
    let hits = call_ok(&mut app, "agent-a", "search", json!({ "query": "Q3 plan" })).await;
    assert_eq!(hits["memories"][0]["slot"], "roadmap");
}

#[tokio::test]
async fn same_slot_writes_become_an_open_conflict() {
    let (_tdb, app, state) = test_app().await;
    let mut app_a = app.clone();
    let mut app_b = app.clone();
    let (a, b) = tokio::join!(
        call_ok(
            &mut app_a,
            "agent-a",
            "memory_put",
            json!({ "slot": "owner", "content": "Alice" }),
        ),
        call_ok(
            &mut app_b,
            "agent-b",
            "memory_put",
            json!({ "slot": "owner", "content": "Bob" }),
        ),
    );
    // Both committed; both are live under their own agents.
    let a_id = a["memory"]["id"].as_str().unwrap().to_string();
    let b_id = b["memory"]["id"].as_str().unwrap().to_string();

    // Let the detector catch up, then the conflict is listable.
    test_worker(&state).drain_queue().await.unwrap();
    let mut app = app;
    let listed = call_ok(&mut app, "agent-a", "conflicts_list", json!({})).await;
    let conflicts = listed["conflicts"].as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    let members: Vec<String> = conflicts[0]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect();
    assert!(members.contains(&a_id) && members.contains(&b_id));

    // Explicit resolution closes it; no automatic merging ever happened.
    let conflict_id = conflicts[0]["conflict"]["id"].as_i64().unwrap();
    let resolved = call_ok(
        &mut app,
        "agent-a",
        "conflict_resolve",
        json!({ "id": conflict_id }),
    )
    .await;
    assert_eq!(resolved["resolved"], true);
    let listed = call_ok(&mut app, "agent-a", "conflicts_list", json!({})).await;
    assert!(listed["conflicts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn task_claim_race_has_exactly_one_winner() {
    let (_tdb, app, _state) = test_app().await;
    let mut app_main = app.clone();
    let created = call_ok(
        &mut app_main,
        "orchestrator",
        "task_create",
        json!({ "payload": "summarize the meeting notes" }),
    )
    .await;
    let task_id = created["task"]["id"].as_i64().unwrap();

    let mut app_a = app.clone();
    let mut app_b = app.clone();
    let (a, b) = tokio::join!(
        call_ok(&mut app_a, "agent-a", "task_claim", json!({ "id": task_id })),
        call_ok(&mut app_b, "agent-b", "task_claim", json!({ "id": task_id })),
    );
    let a_won = a["claimed"].as_bool().unwrap();
    let b_won = b["claimed"].as_bool().unwrap();
    assert!(a_won ^ b_won, "exactly one claim must win: {a} / {b}");
    let (winner, loser) = if a_won { (&a, &b) } else { (&b, &a) };
    assert_eq!(loser["task"], Value::Null);

    let fetched = call_ok(&mut app_main, "orchestrator", "task_get", json!({ "id": task_id })).await;
    assert_eq!(fetched["task"]["assignee"], winner["task"]["assignee"]);
    assert_eq!(fetched["task"]["status"], "claimed");
}

#[tokio::test]
async fn ttl_zero_memory_prunes_away() {
    let (_tdb, mut app, _state) = test_app().await;
    call_ok(
        &mut app,
        "agent-a",
        "memory_put",
        json!({ "slot": "ttl_immediate", "content": "expire now", "ttl_days": 0 }),
    )
    .await;
    let pruned = call_ok(&mut app, "agent-a", "memory_prune", json!({})).await;
    assert_eq!(pruned["pruned"], 1);
    let got = call_ok(&mut app, "agent-a", "memory_get", json!({ "slot": "ttl_immediate" })).await;
    assert_eq!(got["memory"], Value::Null);

    // Prune is idempotent: running it again changes nothing.
    let again = call_ok(&mut app, "agent-a", "memory_prune", json!({})).await;
    assert_eq!(again["pruned"], 0);
}

#[tokio::test]
async fn guard_misses_are_results_not_errors() {
    let (_tdb, mut app, _state) = test_app().await;
    let put = call_ok(
        &mut app,
        "agent-a",
        "memory_put",
        json!({ "slot": "s", "content": "v" }),
    )
    .await;
    let id = put["memory"]["id"].as_str().unwrap().to_string();

    let first = call_ok(&mut app, "agent-a", "memory_retract", json!({ "id": id })).await;
    assert_eq!(first["retracted"], true);
    // Second retract misses the guard: a clean false, not an error.
    let second = call_ok(&mut app, "agent-a", "memory_retract", json!({ "id": id })).await;
    assert_eq!(second["retracted"], false);

    // Superseding something that isn't live, ditto.
    let sup = call_ok(
        &mut app,
        "agent-a",
        "memory_supersede",
        json!({ "id": id, "content": "new" }),
    )
    .await;
    assert_eq!(sup["superseded"], false);
}

#[tokio::test]
async fn reads_come_back_while_a_write_is_in_flight() {
    let (_tdb, mut app, state) = test_app().await;
    call_ok(
        &mut app,
        "agent-a",
        "memory_put",
        json!({ "slot": "k", "content": "v" }),
    )
    .await;

    // Park the writer in a long transaction.
    let slow: WriteTask<()> = Box::new(|conn: &mut SqliteConnection| {
        Box::pin(async move {
            sqlx::query("INSERT INTO documents (id, title, content, agent_id) VALUES ('slow', 't', 'c', 'a')")
                .execute(conn)
                .await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
    });
    let writer = state.db.writer.clone();
    let parked = tokio::spawn(async move { writer.submit("slow", slow).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The read doesn't wait for the writer.
    let started = Instant::now();
    let got = call_ok(&mut app, "agent-a", "memory_get", json!({ "slot": "k" })).await;
    assert_eq!(got["memory"]["content"], "v");
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "read should not have queued behind the writer"
    );
    parked.await.unwrap().unwrap();
}

#[tokio::test]
async fn rpc_error_codes() {
    let (_tdb, mut app, _state) = test_app().await;
    assert_eq!(
        call_err(&mut app, "agent-a", "frobnicate", json!({})).await,
        -32601
    );
    assert_eq!(
        call_err(&mut app, "agent-a", "memory_put", json!({ "slot": "x" })).await,
        -32602
    );
    assert_eq!(
        call_err(
            &mut app,
            "agent-a",
            "memory_put",
            json!({ "slot": "x", "content": "y", "ttl_days": -2 }),
        )
        .await,
        -32602
    );
}

#[tokio::test]
async fn bearer_tokens_gate_writes_by_scope() {
    let (_tdb, mut app, _state) = test_app().await;
    let made = call_ok(
        &mut app,
        "admin",
        "token_create",
        json!({ "scope": "read", "comment": "reporting" }),
    )
    .await;
    let cleartext = made["cleartext"].as_str().unwrap().to_string();

    let authed = |token: &str, method: &str, params: Value| {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        Request::builder()
            .method("POST")
            .uri("/rpc")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    // Read scope can read...
    let resp = do_req(&mut app, authed(&cleartext, "memory_list", json!({}))).await;
    let envelope = body_json(resp).await;
    assert!(envelope.get("error").is_none(), "{envelope}");

    // ...but not write.
    let resp = do_req(
        &mut app,
        authed(&cleartext, "memory_put", json!({ "slot": "s", "content": "c" })),
    )
    .await;
    let envelope = body_json(resp).await;
    assert_eq!(envelope["error"]["code"], -32001);

    // And garbage tokens don't get in at all.
    let resp = do_req(&mut app, authed("hoardv1.not-a-token", "memory_list", json!({}))).await;
    let envelope = body_json(resp).await;
    assert_eq!(envelope["error"]["code"], -32001);
}

#[tokio::test]
async fn worker_status_reports_the_lease() {
    let (_tdb, mut app, state) = test_app().await;
    let before = call_ok(&mut app, "agent-a", "worker_status", json!({})).await;
    assert_eq!(before["lease"], Value::Null);

    let worker = test_worker(&state);
    worker.acquire_or_renew_lease().await.unwrap();
    let after = call_ok(&mut app, "agent-a", "worker_status", json!({})).await;
    assert!(after["lease"]["holder"].as_str().unwrap().starts_with("pid"));
}
