use chrono::{DateTime, Utc};
use crate::models::{Backfill, DoubleRangeFilter, Pool, RangeExclusion, SearchFields, Ticket};

/// Check if a ticket belongs to a pool
///
/// Assigned tickets never belong to any pool.
#[inline]
pub fn pool_matches_ticket(pool: &Pool, ticket: &Ticket) -> bool {
    if ticket.is_assigned() {
        return false;
    }

    matches_search_fields(pool, &ticket.search_fields, ticket.create_time)
}

/// Check if a backfill belongs to a pool
#[inline]
pub fn pool_matches_backfill(pool: &Pool, backfill: &Backfill) -> bool {
    matches_search_fields(pool, &backfill.search_fields, backfill.create_time)
}

/// Apply every filter of the pool; a pool with no filters matches everything
pub fn matches_search_fields(
    pool: &Pool,
    fields: &SearchFields,
    created: DateTime<Utc>,
) -> bool {
    if let Some(before) = pool.created_before {
        if created >= before {
            return false;
        }
    }

    if let Some(after) = pool.created_after {
        if created <= after {
            return false;
        }
    }

    // Missing fields never match
    for filter in &pool.double_range_filters {
        match fields.double_args.get(&filter.double_arg) {
            Some(value) if in_range(*value, filter) => {}
            _ => return false,
        }
    }

    for filter in &pool.string_equals_filters {
        if fields.string_args.get(&filter.string_arg) != Some(&filter.value) {
            return false;
        }
    }

    for filter in &pool.tag_present_filters {
        if !fields.tags.contains(&filter.tag) {
            return false;
        }
    }

    true
}

#[inline]
fn in_range(value: f64, filter: &DoubleRangeFilter) -> bool {
    if value.is_nan() {
        return false;
    }

    let above_min = match filter.exclude {
        RangeExclusion::Min | RangeExclusion::Both => value > filter.min,
        _ => value >= filter.min,
    };
    let below_max = match filter.exclude {
        RangeExclusion::Max | RangeExclusion::Both => value < filter.max,
        _ => value <= filter.max,
    };

    above_min && below_max
}
