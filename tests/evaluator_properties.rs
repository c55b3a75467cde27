// Property tests for proposal evaluation

use matchmaker::core::evaluator::{evaluate_proposals, greedy_select};
use matchmaker::core::GreedyEvaluator;
use matchmaker::models::{Backfill, Match, SearchFields, Ticket};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};

fn build(index: usize, score: u8, tickets: BTreeSet<u8>, backfill: Option<u8>) -> Match {
    Match {
        match_id: format!("m{:03}", index),
        tickets: tickets
            .into_iter()
            .map(|t| Ticket {
                id: format!("t{}", t),
                ..Ticket::new(SearchFields::default())
            })
            .collect(),
        backfill: backfill.map(|b| {
            let mut backfill = Backfill::new(SearchFields::default());
            backfill.id = format!("b{}", b);
            backfill
        }),
        // Few distinct scores so ties are common
        score: f64::from(score),
        ..Default::default()
    }
}

fn proposals() -> impl Strategy<Value = Vec<Match>> {
    prop::collection::vec(
        (
            0u8..4,
            prop::collection::btree_set(0u8..12, 1..4),
            prop::option::of(0u8..3),
        ),
        0..24,
    )
    .prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (score, tickets, backfill))| build(i, score, tickets, backfill))
            .collect()
    })
}

fn assert_exclusive(accepted: &[Match]) -> Result<(), TestCaseError> {
    let mut tickets = HashSet::new();
    let mut backfills = HashSet::new();
    for m in accepted {
        for id in m.ticket_ids() {
            prop_assert!(tickets.insert(id.to_string()), "ticket {} accepted twice", id);
        }
        if let Some(id) = m.backfill_id() {
            prop_assert!(backfills.insert(id.to_string()), "backfill {} accepted twice", id);
        }
    }
    Ok(())
}

fn ids(matches: &[Match]) -> BTreeSet<String> {
    matches.iter().map(|m| m.match_id.clone()).collect()
}

proptest! {
    #[test]
    fn prop_accepted_matches_are_exclusive(proposals in proposals()) {
        let accepted = tokio_test::block_on(evaluate_proposals(&GreedyEvaluator, proposals)).unwrap();
        assert_exclusive(&accepted)?;
    }

    #[test]
    fn prop_acceptance_ignores_submission_order(
        (original, shuffled) in proposals().prop_flat_map(|p| (Just(p.clone()), Just(p).prop_shuffle()))
    ) {
        let first = greedy_select(original);
        let second = greedy_select(shuffled);
        prop_assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn prop_accepted_are_unmodified_submissions(proposals in proposals()) {
        let submitted = proposals.clone();
        let accepted = tokio_test::block_on(evaluate_proposals(&GreedyEvaluator, proposals)).unwrap();
        for m in &accepted {
            prop_assert!(submitted.contains(m));
        }
    }

    #[test]
    fn prop_greedy_is_maximal(proposals in proposals()) {
        // Every rejected proposal overlaps something that was accepted
        let accepted = greedy_select(proposals.clone());
        let taken_tickets: HashSet<String> =
            accepted.iter().flat_map(|m| m.ticket_ids().map(str::to_string)).collect();
        let taken_backfills: HashSet<String> =
            accepted.iter().filter_map(|m| m.backfill_id().map(str::to_string)).collect();
        let accepted_ids = ids(&accepted);

        for m in proposals.iter().filter(|m| !accepted_ids.contains(&m.match_id)) {
            let overlaps = m.ticket_ids().any(|t| taken_tickets.contains(t))
                || m.backfill_id().map_or(false, |b| taken_backfills.contains(b));
            prop_assert!(overlaps, "proposal {} rejected without conflict", m.match_id);
        }
    }
}
