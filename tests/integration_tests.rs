// Integration tests for the matchmaker

use actix_web::{test, web, App};
use matchmaker::core::scenarios::{backfill_delete_condition, backfill_match_function, OPEN_SLOTS};
use matchmaker::core::{Backend, BackendOptions, CyclePhase, GreedyEvaluator, RetryConfig};
use matchmaker::models::{
    Assignment, Backfill, BackfillRecord, MatchProfile, Pool, SearchFields, TagPresentFilter, Ticket,
};
use matchmaker::routes::{self, handle_json_payload_error, AppState};
use matchmaker::statestore::{
    backfill_lock_key, BackfillMutation, InMemoryStateStore, LockOptions, Mutex, StateStore,
};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 2.0,
        max_attempts: 3,
    }
}

fn lock_options() -> LockOptions {
    LockOptions {
        lease: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(2),
    }
}

fn tagged(tag: &str) -> Ticket {
    Ticket::new(SearchFields {
        tags: vec![tag.to_string()],
        ..Default::default()
    })
}

fn tag_profile(name: &str, tag: &str) -> MatchProfile {
    MatchProfile {
        name: name.to_string(),
        pools: vec![Pool {
            name: tag.to_string(),
            tag_present_filters: vec![TagPresentFilter { tag: tag.to_string() }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn scenario_backend(store: Arc<dyn StateStore>, tickets_per_match: usize) -> Backend {
    Backend::new(
        store,
        Arc::new(backfill_match_function(tickets_per_match)),
        Arc::new(GreedyEvaluator),
        BackendOptions {
            delete_backfills: true,
            delete_predicate: Arc::new(backfill_delete_condition),
            retry: fast_retry(),
            lock: lock_options(),
            ..Default::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_serialize() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let backfill = store
        .create_backfill(Backfill::new(SearchFields::default()), Vec::new(), None)
        .await
        .unwrap();

    let workers = 8;
    let updates_per_worker = 5;
    let mut handles = Vec::new();

    for worker in 0..workers {
        let store = store.clone();
        let id = backfill.id.clone();
        handles.push(tokio::spawn(async move {
            let mutex = Mutex::new(store.clone(), backfill_lock_key(&id), lock_options());
            for _ in 0..updates_per_worker {
                let guard = mutex.lock(&CancellationToken::new()).await.unwrap();
                let mutation: BackfillMutation = Box::new(move |record: &mut BackfillRecord| {
                    let counter = record
                        .backfill
                        .search_fields
                        .double_args
                        .entry("writes".to_string())
                        .or_insert(0.0);
                    *counter += 1.0;
                    record.ticket_ids.push(format!("w{}", worker));
                });
                store.update_backfill(&guard, &id, mutation).await.unwrap();
                assert!(guard.unlock().await.unwrap());
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let record = store.get_backfill(&backfill.id).await.unwrap();
    let total = (workers * updates_per_worker) as i64;
    assert_eq!(record.backfill.generation, 1 + total);
    assert_eq!(record.backfill.search_fields.double_args["writes"], total as f64);
    assert_eq!(record.ticket_ids.len() as i64, total);
}

#[tokio::test]
async fn test_second_locker_waits_for_release() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let b1 = store
        .create_backfill(Backfill::new(SearchFields::default()), Vec::new(), None)
        .await
        .unwrap();
    let key = backfill_lock_key(&b1.id);

    let first = Mutex::new(store.clone(), key.clone(), lock_options());
    let guard = first.lock(&CancellationToken::new()).await.unwrap();
    let mutation: BackfillMutation = Box::new(|_: &mut BackfillRecord| {});
    store.update_backfill(&guard, &b1.id, mutation).await.unwrap();

    let second = Mutex::new(store.clone(), key, lock_options());
    let waiter = tokio::spawn(async move {
        let guard = second.lock(&CancellationToken::new()).await?;
        guard.unlock().await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    assert!(guard.unlock().await.unwrap());
    let released = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("second locker should acquire after release")
        .unwrap()
        .unwrap();
    assert!(released);
}

#[tokio::test]
async fn test_delete_twice_is_not_found() {
    let store = InMemoryStateStore::new();
    let ticket = store.create_ticket(tagged("casual")).await.unwrap();
    let backfill = store
        .create_backfill(Backfill::new(SearchFields::default()), Vec::new(), None)
        .await
        .unwrap();

    store.delete_ticket(&ticket.id).await.unwrap();
    store.delete_backfill(&backfill.id).await.unwrap();
    assert!(store.delete_ticket(&ticket.id).await.unwrap_err().is_not_found());
    assert!(store.delete_backfill(&backfill.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_assignment_after_delete_is_not_found() {
    let store = InMemoryStateStore::new();
    let ticket = store.create_ticket(tagged("casual")).await.unwrap();
    store.delete_ticket(&ticket.id).await.unwrap();

    let err = store
        .assign_ticket(&ticket.id, &Assignment::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_scenario_cycles_fill_and_close_backfills() {
    let store = Arc::new(InMemoryStateStore::new());
    for _ in 0..3 {
        store.create_ticket(tagged("casual")).await.unwrap();
    }

    let backend = scenario_backend(store.clone(), 4);
    let profiles = vec![tag_profile("casual", "casual")];

    // Three tickets, groups of four: one short match opening a backfill
    let first = backend.run_cycle(&profiles, &CancellationToken::new()).await;
    assert_eq!(first.phase, CyclePhase::Done);
    assert_eq!(first.matches_applied, 1);
    assert_eq!(first.tickets_assigned, 3);
    assert_eq!(first.backfills_created, 1);
    assert_eq!(store.backfill_count(), 1);

    // One late player tops the backfill up; it is acknowledged and closed
    let late = store.create_ticket(tagged("casual")).await.unwrap();
    let second = backend.run_cycle(&profiles, &CancellationToken::new()).await;
    assert_eq!(second.phase, CyclePhase::Done);
    // The three players from the first cycle already had their assignment
    assert_eq!(second.tickets_assigned, 1);
    assert_eq!(second.backfills_acknowledged, 1);
    assert_eq!(second.backfills_deleted, 1);
    assert_eq!(store.backfill_count(), 0);
    assert!(store.get_ticket(&late.id).await.unwrap().is_assigned());

    // Nothing left to match
    let third = backend.run_cycle(&profiles, &CancellationToken::new()).await;
    assert_eq!(third.matches_proposed, 0);
}

#[tokio::test]
async fn test_late_player_joins_the_game_that_opened_the_backfill() {
    let store = Arc::new(InMemoryStateStore::new());
    for _ in 0..5 {
        store.create_ticket(tagged("casual")).await.unwrap();
    }

    let backend = scenario_backend(store.clone(), 4);
    let profiles = vec![tag_profile("casual", "casual")];

    // One full game of four and one game of one that opens a backfill
    let first = backend.run_cycle(&profiles, &CancellationToken::new()).await;
    assert_eq!(first.matches_applied, 2);
    assert_eq!(first.tickets_assigned, 5);
    assert_eq!(first.backfills_created, 1);

    let backfills: Vec<Backfill> = store
        .query_pool_backfills(&Pool::named("everything"))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(backfills.len(), 1);
    let record = store.get_backfill(&backfills[0].id).await.unwrap();
    let opener = store.get_ticket(&record.ticket_ids[0]).await.unwrap();
    let game = opener.assignment.clone().unwrap();
    assert_eq!(record.assignment.as_ref(), Some(&game));

    let late = store.create_ticket(tagged("casual")).await.unwrap();
    let second = backend.run_cycle(&profiles, &CancellationToken::new()).await;
    assert_eq!(second.phase, CyclePhase::Done);
    assert_eq!(second.tickets_assigned, 1);
    assert_eq!(second.backfills_acknowledged, 1);
    assert_eq!(second.backfills_deleted, 0);

    let late = store.get_ticket(&late.id).await.unwrap();
    assert_eq!(late.assignment, Some(game));

    let record = store.get_backfill(&backfills[0].id).await.unwrap();
    assert_eq!(record.backfill.search_fields.double_args[OPEN_SLOTS], 2.0);
}

#[tokio::test]
async fn test_backfill_with_open_slots_is_kept() {
    let store = Arc::new(InMemoryStateStore::new());
    let mut backfill = Backfill::new(SearchFields::default());
    backfill.search_fields.double_args.insert(OPEN_SLOTS.to_string(), 3.0);
    let backfill = store.create_backfill(backfill, Vec::new(), None).await.unwrap();
    store.create_ticket(tagged("casual")).await.unwrap();

    let profiles = vec![MatchProfile {
        name: "everything".to_string(),
        pools: vec![Pool::named("all")],
        ..Default::default()
    }];
    let report = scenario_backend(store.clone(), 4)
        .run_cycle(&profiles, &CancellationToken::new())
        .await;

    assert_eq!(report.backfills_acknowledged, 1);
    assert_eq!(report.backfills_deleted, 0);

    let record = store.get_backfill(&backfill.id).await.unwrap();
    assert_eq!(record.backfill.generation, 2);
    assert_eq!(record.backfill.search_fields.double_args[OPEN_SLOTS], 2.0);
    assert!(record.last_acknowledged.is_some());
}

fn app_state(store: Arc<InMemoryStateStore>) -> AppState {
    AppState {
        store: store.clone(),
        backend: scenario_backend(store, 2),
        profiles: Arc::new(vec![tag_profile("casual", "casual")]),
    }
}

#[actix_web::test]
async fn test_http_ticket_lifecycle() {
    let store = Arc::new(InMemoryStateStore::new());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(app_state(store.clone())))
            .app_data(web::JsonConfig::default().error_handler(handle_json_payload_error))
            .configure(routes::configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/tickets")
        .set_json(serde_json::json!({ "searchFields": { "tags": ["casual"] } }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 201);
    let created: Ticket = test::read_body_json(resp).await;
    assert!(!created.id.is_empty());

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/tickets/{}", created.id))
        .to_request();
    let fetched: Ticket = test::call_and_read_body_json(&app, req).await;
    assert_eq!(fetched.search_fields.tags, vec!["casual"]);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/tickets/{}", created.id))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/tickets/{}", created.id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 404);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["statusCode"], 404);
    assert_eq!(body["error"], "Not found");
}

#[actix_web::test]
async fn test_http_invalid_json_is_bad_request() {
    let store = Arc::new(InMemoryStateStore::new());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(app_state(store)))
            .app_data(web::JsonConfig::default().error_handler(handle_json_payload_error))
            .configure(routes::configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/tickets")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["statusCode"], 400);
    assert!(body.get("status_code").is_none());
}

#[actix_web::test]
async fn test_http_backfill_and_cycle() {
    let store = Arc::new(InMemoryStateStore::new());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(app_state(store.clone())))
            .configure(routes::configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/backfills")
        .set_json(serde_json::json!({ "ticketIds": [" "] }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 400);

    for _ in 0..2 {
        store.create_ticket(tagged("casual")).await.unwrap();
    }

    let req = test::TestRequest::post().uri("/api/v1/cycles").to_request();
    let report: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(report["phase"], "Done");
    assert_eq!(report["matchesApplied"], 1);
    assert_eq!(report["ticketsAssigned"], 2);

    let req = test::TestRequest::get().uri("/api/v1/health").to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::get().uri("/api/v1/backfills/missing").to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 404);
}
