//! Reference matchmaking scenario: fill open backfills first, then group the
//! remaining tickets first-come first-served.

use std::collections::HashSet;

use crate::core::mmf::PoolMatchFunction;
use crate::core::query::PoolContents;
use crate::models::{Backfill, BackfillRecord, Match, MatchProfile, SearchFields, Ticket};

/// Double arg holding how many tickets a backfill can still take
pub const OPEN_SLOTS: &str = "open_slots";

const BACKFILL_SCORE: f64 = 2.0;
const NEW_MATCH_SCORE: f64 = 1.0;

/// Match function of the scenario; groups are `tickets_per_match` tickets
pub fn backfill_match_function(tickets_per_match: usize) -> PoolMatchFunction {
    PoolMatchFunction::new("backfill", move |profile, pools| {
        make_matches(profile, pools, tickets_per_match)
    })
}

/// Delete predicate of the scenario: a backfill is done once it has no open slots
///
/// A backfill without the field counts as full.
pub fn backfill_delete_condition(record: &BackfillRecord) -> bool {
    open_slots(&record.backfill) == 0
}

fn open_slots(backfill: &Backfill) -> usize {
    backfill
        .search_fields
        .double_args
        .get(OPEN_SLOTS)
        .copied()
        .filter(|slots| slots.is_finite() && *slots > 0.0)
        .map(|slots| slots.floor() as usize)
        .unwrap_or(0)
}

fn set_open_slots(backfill: &mut Backfill, slots: usize) {
    backfill
        .search_fields
        .double_args
        .insert(OPEN_SLOTS.to_string(), slots as f64);
}

/// Unique across cycles, so an assignment names one game
fn match_id(profile: &MatchProfile, pool: &str) -> String {
    format!("{}-{}-{}", profile.name, pool, uuid::Uuid::new_v4().simple())
}

fn make_matches(
    profile: &MatchProfile,
    pools: &PoolContents,
    tickets_per_match: usize,
) -> Result<Vec<Match>, String> {
    if tickets_per_match == 0 {
        return Err("tickets_per_match must be at least 1".to_string());
    }

    let mut used_tickets: HashSet<String> = HashSet::new();
    let mut used_backfills: HashSet<String> = HashSet::new();
    let mut matches = Vec::new();

    for pool in &profile.pools {
        let mut waiting: Vec<Ticket> = pools
            .tickets
            .get(&pool.name)
            .into_iter()
            .flatten()
            .filter(|t| !used_tickets.contains(&t.id))
            .cloned()
            .collect();
        waiting.reverse();

        let backfills = pools.backfills.get(&pool.name).into_iter().flatten();
        for backfill in backfills {
            if waiting.is_empty() {
                break;
            }
            if used_backfills.contains(&backfill.id) {
                continue;
            }

            let slots = open_slots(backfill);
            let take = slots.min(waiting.len());
            if take == 0 {
                continue;
            }

            let tickets: Vec<Ticket> = (0..take).filter_map(|_| waiting.pop()).collect();
            let mut proposed = backfill.clone();
            set_open_slots(&mut proposed, slots - take);

            used_backfills.insert(backfill.id.clone());
            used_tickets.extend(tickets.iter().map(|t| t.id.clone()));
            matches.push(Match {
                match_id: match_id(profile, &pool.name),
                tickets,
                backfill: Some(proposed),
                score: BACKFILL_SCORE,
                ..Default::default()
            });
        }

        while !waiting.is_empty() {
            let take = tickets_per_match.min(waiting.len());
            let tickets: Vec<Ticket> = (0..take).filter_map(|_| waiting.pop()).collect();
            used_tickets.extend(tickets.iter().map(|t| t.id.clone()));

            // A short group opens a new backfill for the missing players,
            // searchable the same way as its first ticket
            let backfill = (take < tickets_per_match).then(|| {
                let fields = tickets
                    .first()
                    .map(|t| t.search_fields.clone())
                    .unwrap_or_default();
                let mut backfill = Backfill::new(fields);
                set_open_slots(&mut backfill, tickets_per_match - take);
                backfill
            });

            matches.push(Match {
                match_id: match_id(profile, &pool.name),
                tickets,
                backfill,
                score: NEW_MATCH_SCORE,
                ..Default::default()
            });
        }
    }

    Ok(matches)
}
