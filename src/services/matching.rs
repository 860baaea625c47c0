use std::cmp::Ordering;

use chrono::Duration;
use rusqlite::Connection;

use crate::db::queries;
use crate::models::{BookingMode, Coordinates, MatchCandidate, MatchRequest, Therapist};

/// Ranked candidates for a request. Read-only; an empty list means nothing
/// matched and the caller should broaden the criteria.
///
/// For MOBILE requests `origin` must already be resolved. `None` there means the
/// geocoder could not place the user, which also yields no candidates.
pub fn find_candidates(
    conn: &Connection,
    request: &MatchRequest,
    origin: Option<Coordinates>,
    limit: usize,
) -> anyhow::Result<Vec<MatchCandidate>> {
    if request.duration_minutes <= 0 {
        return Ok(vec![]);
    }
    if request.mode == BookingMode::Mobile && origin.is_none() {
        tracing::info!("no origin for mobile match request, returning no candidates");
        return Ok(vec![]);
    }

    let start = request.start();
    let end = start + Duration::minutes(request.duration_minutes as i64);

    let mut candidates = vec![];
    for therapist in queries::list_therapists(conn)? {
        if let Some(min) = request.min_rating {
            if therapist.rating < min {
                continue;
            }
        }
        if let Some(area) = request.area.as_deref() {
            if !therapist.serves_area(area) {
                continue;
            }
        }

        let Some(availability) = queries::get_availability(conn, &therapist.id)? else {
            continue;
        };
        if !availability.covers(&start, request.duration_minutes)
            || !availability.serves_mode(request.mode, &start, request.duration_minutes)
        {
            continue;
        }
        if !queries::find_overlapping(conn, &therapist.id, &start, &end, None)?.is_empty() {
            continue;
        }

        let placement = match request.mode {
            BookingMode::Mobile => origin.and_then(|o| mobile_placement(&therapist, &availability.transport_modes, o)),
            BookingMode::Onsite => onsite_placement(conn, &therapist, request.site_id.as_deref(), origin)?,
        };
        let Some(placement) = placement else {
            continue;
        };

        let Some(price) = therapist
            .quote(request.duration_minutes)
            .and_then(|quote| quote.checked_add(placement.surcharge))
        else {
            continue;
        };
        if let Some(budget) = request.budget {
            if price > budget {
                continue;
            }
        }

        candidates.push(MatchCandidate {
            therapist_id: therapist.id.clone(),
            site_id: placement.site_id,
            distance_km: placement.distance_km,
            transport_mode: placement.transport_mode,
            rating: therapist.rating,
            price,
            earliest_available_slot: start,
        });
    }

    rank(&mut candidates);
    candidates.truncate(limit);

    tracing::debug!(count = candidates.len(), mode = ?request.mode, "matching finished");
    Ok(candidates)
}

struct Placement {
    site_id: Option<String>,
    distance_km: Option<f64>,
    transport_mode: Option<crate::models::TransportMode>,
    surcharge: i64,
}

fn mobile_placement(
    therapist: &Therapist,
    modes: &crate::models::TransportModes,
    origin: Coordinates,
) -> Option<Placement> {
    let base = therapist.base_location?;
    let distance = base.distance_km(&origin);
    let (mode, cfg) = modes.cheapest_viable(distance)?;
    Some(Placement {
        site_id: None,
        distance_km: Some(distance),
        transport_mode: Some(mode),
        surcharge: cfg.fee,
    })
}

fn onsite_placement(
    conn: &Connection,
    therapist: &Therapist,
    requested_site: Option<&str>,
    origin: Option<Coordinates>,
) -> anyhow::Result<Option<Placement>> {
    let site_id = match requested_site {
        Some(site) if therapist.serves_site(site) => site.to_string(),
        Some(_) => return Ok(None),
        None => match therapist.site_ids.first() {
            Some(site) => site.clone(),
            None => return Ok(None),
        },
    };

    let site_location = queries::get_site(conn, &site_id)?.and_then(|s| s.location);
    let distance_km = origin.zip(site_location).map(|(o, s)| o.distance_km(&s));

    Ok(Some(Placement {
        site_id: Some(site_id),
        distance_km,
        transport_mode: None,
        surcharge: 0,
    }))
}

/// Rating descending, then distance ascending (unknown last), then price
/// ascending. Therapist id settles exact ties so the order is stable.
pub fn rank(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.rating
            .total_cmp(&a.rating)
            .then_with(|| cmp_distance(a.distance_km, b.distance_km))
            .then_with(|| a.price.cmp(&b.price))
            .then_with(|| a.therapist_id.cmp(&b.therapist_id))
    });
}

fn cmp_distance(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
