// Unit tests for the matchmaker pipeline building blocks

use chrono::{Duration, Utc};
use matchmaker::core::evaluator::greedy_select;
use matchmaker::core::filters::{pool_matches_backfill, pool_matches_ticket};
use matchmaker::core::scenarios::{backfill_delete_condition, OPEN_SLOTS};
use matchmaker::core::PipelineError;
use matchmaker::models::{
    Assignment, Backfill, BackfillRecord, DoubleRangeFilter, Match, Pool, RangeExclusion,
    SearchFields, StringEqualsFilter, TagPresentFilter, Ticket,
};
use matchmaker::statestore::StoreError;

fn ticket_with(fields: SearchFields) -> Ticket {
    Ticket::new(fields)
}

fn mmr(value: f64) -> SearchFields {
    SearchFields {
        double_args: [("mmr".to_string(), value)].into_iter().collect(),
        ..Default::default()
    }
}

fn mmr_pool(min: f64, max: f64, exclude: RangeExclusion) -> Pool {
    Pool {
        name: "mmr".to_string(),
        double_range_filters: vec![DoubleRangeFilter {
            double_arg: "mmr".to_string(),
            min,
            max,
            exclude,
        }],
        ..Default::default()
    }
}

#[test]
fn test_empty_pool_matches_everything() {
    let pool = Pool::named("all");
    assert!(pool_matches_ticket(&pool, &ticket_with(SearchFields::default())));
    assert!(pool_matches_ticket(&pool, &ticket_with(mmr(1200.0))));
}

#[test]
fn test_double_range_bounds() {
    let inclusive = mmr_pool(1000.0, 2000.0, RangeExclusion::None);
    assert!(pool_matches_ticket(&inclusive, &ticket_with(mmr(1000.0))));
    assert!(pool_matches_ticket(&inclusive, &ticket_with(mmr(2000.0))));
    assert!(!pool_matches_ticket(&inclusive, &ticket_with(mmr(2000.5))));

    let exclusive = mmr_pool(1000.0, 2000.0, RangeExclusion::Both);
    assert!(!pool_matches_ticket(&exclusive, &ticket_with(mmr(1000.0))));
    assert!(!pool_matches_ticket(&exclusive, &ticket_with(mmr(2000.0))));
    assert!(pool_matches_ticket(&exclusive, &ticket_with(mmr(1500.0))));
}

#[test]
fn test_missing_field_does_not_match() {
    let pool = mmr_pool(f64::NEG_INFINITY, f64::INFINITY, RangeExclusion::None);
    assert!(!pool_matches_ticket(&pool, &ticket_with(SearchFields::default())));
}

#[test]
fn test_string_and_tag_filters() {
    let pool = Pool {
        name: "eu-ranked".to_string(),
        string_equals_filters: vec![StringEqualsFilter {
            string_arg: "region".to_string(),
            value: "eu".to_string(),
        }],
        tag_present_filters: vec![TagPresentFilter { tag: "ranked".to_string() }],
        ..Default::default()
    };

    let mut fields = SearchFields {
        tags: vec!["ranked".to_string()],
        ..Default::default()
    };
    fields.string_args.insert("region".to_string(), "eu".to_string());
    assert!(pool_matches_ticket(&pool, &ticket_with(fields.clone())));

    fields.string_args.insert("region".to_string(), "na".to_string());
    assert!(!pool_matches_ticket(&pool, &ticket_with(fields.clone())));

    fields.string_args.insert("region".to_string(), "eu".to_string());
    fields.tags.clear();
    assert!(!pool_matches_ticket(&pool, &ticket_with(fields)));
}

#[test]
fn test_created_window() {
    let mut backfill = Backfill::new(SearchFields::default());
    backfill.create_time = Utc::now() - Duration::minutes(10);

    let recent_only = Pool {
        name: "recent".to_string(),
        created_after: Some(Utc::now() - Duration::minutes(5)),
        ..Default::default()
    };
    let old_only = Pool {
        name: "old".to_string(),
        created_before: Some(Utc::now() - Duration::minutes(5)),
        ..Default::default()
    };

    assert!(!pool_matches_backfill(&recent_only, &backfill));
    assert!(pool_matches_backfill(&old_only, &backfill));
}

#[test]
fn test_assigned_ticket_never_matches() {
    let mut ticket = ticket_with(SearchFields::default());
    ticket.assignment = Some(Assignment {
        connection: "server://1".to_string(),
        ..Default::default()
    });

    assert!(!pool_matches_ticket(&Pool::named("all"), &ticket));
}

fn proposal(id: &str, score: f64, tickets: &[&str]) -> Match {
    Match {
        match_id: id.to_string(),
        tickets: tickets
            .iter()
            .map(|t| Ticket {
                id: t.to_string(),
                ..Ticket::new(SearchFields::default())
            })
            .collect(),
        score,
        ..Default::default()
    }
}

#[test]
fn test_greedy_select_prefers_higher_score() {
    let accepted = greedy_select(vec![
        proposal("a", 1.0, &["t1", "t2"]),
        proposal("b", 3.0, &["t2", "t3"]),
        proposal("c", 2.0, &["t4"]),
    ]);

    let ids: Vec<&str> = accepted.iter().map(|m| m.match_id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);
}

#[test]
fn test_greedy_select_nan_score_does_not_panic() {
    let accepted = greedy_select(vec![
        proposal("a", f64::NAN, &["t1"]),
        proposal("b", 1.0, &["t2"]),
    ]);
    assert_eq!(accepted.len(), 2);
}

#[test]
fn test_backfill_delete_condition() {
    let mut backfill = Backfill::new(SearchFields::default());
    backfill.search_fields.double_args.insert(OPEN_SLOTS.to_string(), 1.0);
    let mut record = BackfillRecord {
        backfill,
        ticket_ids: Vec::new(),
        last_acknowledged: None,
        assignment: None,
    };
    assert!(!backfill_delete_condition(&record));

    record.backfill.search_fields.double_args.insert(OPEN_SLOTS.to_string(), 0.0);
    assert!(backfill_delete_condition(&record));
}

#[test]
fn test_error_messages() {
    let err = PipelineError::from(StoreError::Conflict("ticket t1 already assigned".to_string()));
    assert_eq!(err.to_string(), "Conflict: ticket t1 already assigned");
    assert!(!err.is_cycle_fatal());

    assert!(StoreError::StoreUnavailable("down".to_string()).is_retryable());
    assert!(!StoreError::Canceled.is_retryable());
}

#[test]
fn test_match_serializes_camel_case() {
    let json = serde_json::to_value(proposal("m1", 1.5, &["t1"])).unwrap();
    assert_eq!(json["matchId"], "m1");
    assert_eq!(json["tickets"][0]["id"], "t1");
    assert!(json.get("match_id").is_none());
}
