use anyhow::Context;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::{
    Booking, BookingMode, BookingStatus, Coordinates, LifecycleEvent, PaymentStatus, Payout,
    ReconciliationItem, ReconciliationKind, Site, Therapist, TherapistAvailability, User,
};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_ts(ts: &NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> anyhow::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT).with_context(|| format!("bad timestamp in database: {s}"))
}

fn parse_opt_ts(s: Option<String>) -> anyhow::Result<Option<NaiveDateTime>> {
    s.as_deref().map(parse_ts).transpose()
}

// ── Bookings ──

const BOOKING_COLUMNS: &str = "id, user_id, therapist_id, site_id, office_id, scheduled_start, duration_minutes, \
     mode, address, base_price, line_items, status, payment_status, authorization_id, transaction_id, \
     refunded_amount, created_at, updated_at, started_at, completed_at, cancelled_at, cancellation_reason";

pub fn insert_booking(conn: &Connection, booking: &Booking) -> anyhow::Result<()> {
    let line_items = serde_json::to_string(&booking.line_items)?;

    conn.execute(
        "INSERT INTO bookings (id, user_id, therapist_id, site_id, office_id, scheduled_start, scheduled_end,
            duration_minutes, mode, address, base_price, line_items, status, payment_status, authorization_id,
            transaction_id, refunded_amount, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            booking.id,
            booking.user_id,
            booking.therapist_id,
            booking.site_id,
            booking.office_id,
            format_ts(&booking.scheduled_start),
            format_ts(&booking.scheduled_end()),
            booking.duration_minutes,
            booking.mode.as_str(),
            booking.address,
            booking.base_price,
            line_items,
            booking.status.as_str(),
            booking.payment_status.as_str(),
            booking.authorization_id,
            booking.transaction_id,
            booking.refunded_amount,
            format_ts(&booking.created_at),
            format_ts(&booking.updated_at),
        ],
    )
    .context("failed to insert booking")?;
    Ok(())
}

pub fn get_booking_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Booking>> {
    let result = conn
        .query_row(
            &format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?1"),
            params![id],
            |row| Ok(parse_booking_row(row)),
        )
        .optional()?;

    result.transpose()
}

/// Non-cancelled bookings of a therapist overlapping `[start, end)`.
pub fn find_overlapping(
    conn: &Connection,
    therapist_id: &str,
    start: &NaiveDateTime,
    end: &NaiveDateTime,
    exclude_id: Option<&str>,
) -> anyhow::Result<Vec<Booking>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings
         WHERE therapist_id = ?1 AND status != 'cancelled'
           AND scheduled_start < ?2 AND scheduled_end > ?3
           AND id != COALESCE(?4, '')
         ORDER BY scheduled_start ASC"
    ))?;

    let rows = stmt.query_map(
        params![therapist_id, format_ts(end), format_ts(start), exclude_id],
        |row| Ok(parse_booking_row(row)),
    )?;

    let mut bookings = vec![];
    for row in rows {
        bookings.push(row??);
    }
    Ok(bookings)
}

/// Moves a booking from `from` to `to` only if it is still in `from`.
/// Returns false when another writer got there first.
pub fn update_status(
    conn: &Connection,
    id: &str,
    from: BookingStatus,
    to: BookingStatus,
    now: &NaiveDateTime,
    reason: Option<&str>,
) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE bookings SET
           status = ?1,
           updated_at = ?2,
           started_at = CASE WHEN ?1 = 'in_progress' THEN ?2 ELSE started_at END,
           completed_at = CASE WHEN ?1 = 'completed' THEN ?2 ELSE completed_at END,
           cancelled_at = CASE WHEN ?1 = 'cancelled' THEN ?2 ELSE cancelled_at END,
           cancellation_reason = CASE WHEN ?1 = 'cancelled' THEN ?3 ELSE cancellation_reason END
         WHERE id = ?4 AND status = ?5",
        params![to.as_str(), format_ts(now), reason, id, from.as_str()],
    )?;
    Ok(count > 0)
}

pub struct PaymentUpdate<'a> {
    pub status: PaymentStatus,
    pub transaction_id: Option<&'a str>,
    pub refunded_amount: Option<i64>,
}

/// Sets the payment status only if it is still `expected`. Transaction id and
/// refunded amount are kept when not supplied.
pub fn update_payment(
    conn: &Connection,
    id: &str,
    expected: PaymentStatus,
    update: &PaymentUpdate<'_>,
    now: &NaiveDateTime,
) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE bookings SET
           payment_status = ?1,
           transaction_id = COALESCE(?2, transaction_id),
           refunded_amount = COALESCE(?3, refunded_amount),
           updated_at = ?4
         WHERE id = ?5 AND payment_status = ?6",
        params![
            update.status.as_str(),
            update.transaction_id,
            update.refunded_amount,
            format_ts(now),
            id,
            expected.as_str(),
        ],
    )?;
    Ok(count > 0)
}

/// Records a successful capture, but only while the booking may still hold one.
pub fn mark_captured(
    conn: &Connection,
    id: &str,
    transaction_id: &str,
    now: &NaiveDateTime,
) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE bookings SET payment_status = 'captured', transaction_id = ?1, updated_at = ?2
         WHERE id = ?3
           AND status IN ('confirmed', 'in_progress', 'completed')
           AND payment_status != 'captured'",
        params![transaction_id, format_ts(now), id],
    )?;
    Ok(count > 0)
}

#[derive(Debug, Default)]
pub struct BookingFilter<'a> {
    pub party_id: Option<&'a str>,
    pub status: Option<BookingStatus>,
    pub limit: i64,
}

pub fn list_bookings(conn: &Connection, filter: &BookingFilter<'_>) -> anyhow::Result<Vec<Booking>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings
         WHERE (?1 IS NULL OR user_id = ?1 OR therapist_id = ?1 OR site_id = ?1 OR office_id = ?1)
           AND (?2 IS NULL OR status = ?2)
         ORDER BY scheduled_start DESC LIMIT ?3"
    ))?;

    let rows = stmt.query_map(
        params![filter.party_id, filter.status.map(|s| s.as_str()), filter.limit],
        |row| Ok(parse_booking_row(row)),
    )?;

    let mut bookings = vec![];
    for row in rows {
        bookings.push(row??);
    }
    Ok(bookings)
}

/// Ids of PENDING bookings created before `created_before`.
pub fn list_stale_pending(conn: &Connection, created_before: &NaiveDateTime) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM bookings WHERE status = 'pending' AND created_at < ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![format_ts(created_before)], |row| row.get::<_, String>(0))?;

    let mut ids = vec![];
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

fn parse_booking_row(row: &rusqlite::Row) -> anyhow::Result<Booking> {
    let scheduled_start: String = row.get(5)?;
    let mode: String = row.get(7)?;
    let line_items: String = row.get(10)?;
    let status: String = row.get(11)?;
    let payment_status: String = row.get(12)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    Ok(Booking {
        id: row.get(0)?,
        user_id: row.get(1)?,
        therapist_id: row.get(2)?,
        site_id: row.get(3)?,
        office_id: row.get(4)?,
        scheduled_start: parse_ts(&scheduled_start)?,
        duration_minutes: row.get(6)?,
        mode: BookingMode::parse(&mode),
        address: row.get(8)?,
        base_price: row.get(9)?,
        line_items: serde_json::from_str(&line_items).context("bad line items in database")?,
        status: BookingStatus::parse(&status)
            .with_context(|| format!("unknown booking status in database: {status}"))?,
        payment_status: PaymentStatus::parse(&payment_status),
        authorization_id: row.get(13)?,
        transaction_id: row.get(14)?,
        refunded_amount: row.get(15)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        started_at: parse_opt_ts(row.get(18)?)?,
        completed_at: parse_opt_ts(row.get(19)?)?,
        cancelled_at: parse_opt_ts(row.get(20)?)?,
        cancellation_reason: row.get(21)?,
    })
}

// ── Therapists ──

pub fn upsert_therapist(conn: &Connection, therapist: &Therapist) -> anyhow::Result<()> {
    let areas = serde_json::to_string(&therapist.areas)?;
    let site_ids = serde_json::to_string(&therapist.site_ids)?;
    let (lat, lng) = therapist
        .base_location
        .map(|c| (Some(c.lat), Some(c.lng)))
        .unwrap_or((None, None));

    conn.execute(
        "INSERT INTO therapists (id, name, email, rating, hourly_rate, base_lat, base_lng, areas, site_ids, office_id, auto_approve)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           email = excluded.email,
           rating = excluded.rating,
           hourly_rate = excluded.hourly_rate,
           base_lat = excluded.base_lat,
           base_lng = excluded.base_lng,
           areas = excluded.areas,
           site_ids = excluded.site_ids,
           office_id = excluded.office_id,
           auto_approve = excluded.auto_approve,
           updated_at = datetime('now')",
        params![
            therapist.id,
            therapist.name,
            therapist.email,
            therapist.rating,
            therapist.hourly_rate,
            lat,
            lng,
            areas,
            site_ids,
            therapist.office_id,
            therapist.auto_approve as i32,
        ],
    )?;
    Ok(())
}

const THERAPIST_COLUMNS: &str =
    "id, name, email, rating, hourly_rate, base_lat, base_lng, areas, site_ids, office_id, auto_approve";

pub fn get_therapist(conn: &Connection, id: &str) -> anyhow::Result<Option<Therapist>> {
    let result = conn
        .query_row(
            &format!("SELECT {THERAPIST_COLUMNS} FROM therapists WHERE id = ?1"),
            params![id],
            |row| Ok(parse_therapist_row(row)),
        )
        .optional()?;

    result.transpose()
}

pub fn list_therapists(conn: &Connection) -> anyhow::Result<Vec<Therapist>> {
    let mut stmt = conn.prepare(&format!("SELECT {THERAPIST_COLUMNS} FROM therapists ORDER BY id ASC"))?;
    let rows = stmt.query_map([], |row| Ok(parse_therapist_row(row)))?;

    let mut therapists = vec![];
    for row in rows {
        therapists.push(row??);
    }
    Ok(therapists)
}

fn parse_therapist_row(row: &rusqlite::Row) -> anyhow::Result<Therapist> {
    let lat: Option<f64> = row.get(5)?;
    let lng: Option<f64> = row.get(6)?;
    let areas: String = row.get(7)?;
    let site_ids: String = row.get(8)?;

    Ok(Therapist {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        rating: row.get(3)?,
        hourly_rate: row.get(4)?,
        base_location: lat.zip(lng).map(|(lat, lng)| Coordinates { lat, lng }),
        areas: serde_json::from_str(&areas).context("bad areas in database")?,
        site_ids: serde_json::from_str(&site_ids).context("bad site ids in database")?,
        office_id: row.get(9)?,
        auto_approve: row.get::<_, i32>(10)? != 0,
    })
}

/// Read fresh on every creation decision; never cached.
pub fn get_auto_approve(conn: &Connection, therapist_id: &str) -> anyhow::Result<Option<bool>> {
    let flag = conn
        .query_row(
            "SELECT auto_approve FROM therapists WHERE id = ?1",
            params![therapist_id],
            |row| row.get::<_, i32>(0),
        )
        .optional()?;
    Ok(flag.map(|f| f != 0))
}

pub fn set_auto_approve(conn: &Connection, therapist_id: &str, enabled: bool) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE therapists SET auto_approve = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![enabled as i32, therapist_id],
    )?;
    Ok(count > 0)
}

// ── Availability ──

pub fn save_availability(
    conn: &Connection,
    therapist_id: &str,
    availability: &TherapistAvailability,
) -> anyhow::Result<()> {
    let document = serde_json::to_string(availability)?;
    conn.execute(
        "INSERT INTO therapist_availability (therapist_id, document) VALUES (?1, ?2)
         ON CONFLICT(therapist_id) DO UPDATE SET document = excluded.document, updated_at = datetime('now')",
        params![therapist_id, document],
    )?;
    Ok(())
}

pub fn get_availability(conn: &Connection, therapist_id: &str) -> anyhow::Result<Option<TherapistAvailability>> {
    let document: Option<String> = conn
        .query_row(
            "SELECT document FROM therapist_availability WHERE therapist_id = ?1",
            params![therapist_id],
            |row| row.get(0),
        )
        .optional()?;

    document
        .map(|d| serde_json::from_str(&d).context("bad availability document in database"))
        .transpose()
}

// ── Users & Sites ──

pub fn upsert_user(conn: &Connection, user: &User) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO users (id, name, email) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email, updated_at = datetime('now')",
        params![user.id, user.name, user.email],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, id: &str) -> anyhow::Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, name, email FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

pub fn upsert_site(conn: &Connection, site: &Site) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO sites (id, name, host_email, lat, lng) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           host_email = excluded.host_email,
           lat = excluded.lat,
           lng = excluded.lng,
           updated_at = datetime('now')",
        params![
            site.id,
            site.name,
            site.host_email,
            site.location.map(|c| c.lat),
            site.location.map(|c| c.lng),
        ],
    )?;
    Ok(())
}

pub fn get_site(conn: &Connection, id: &str) -> anyhow::Result<Option<Site>> {
    let site = conn
        .query_row(
            "SELECT id, name, host_email, lat, lng FROM sites WHERE id = ?1",
            params![id],
            |row| {
                let lat: Option<f64> = row.get(3)?;
                let lng: Option<f64> = row.get(4)?;
                Ok(Site {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    host_email: row.get(2)?,
                    location: lat.zip(lng).map(|(lat, lng)| Coordinates { lat, lng }),
                })
            },
        )
        .optional()?;
    Ok(site)
}

// ── Payouts ──

/// Returns false if the booking already has a payout.
pub fn insert_payout(conn: &Connection, payout: &Payout) -> anyhow::Result<bool> {
    let count = conn.execute(
        "INSERT OR IGNORE INTO payouts (booking_id, therapist_id, office_id, gross_amount, commission, therapist_amount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            payout.booking_id,
            payout.therapist_id,
            payout.office_id,
            payout.gross_amount,
            payout.commission,
            payout.therapist_amount,
        ],
    )?;
    Ok(count > 0)
}

pub fn get_payout(conn: &Connection, booking_id: &str) -> anyhow::Result<Option<Payout>> {
    let payout = conn
        .query_row(
            "SELECT booking_id, therapist_id, office_id, gross_amount, commission, therapist_amount
             FROM payouts WHERE booking_id = ?1",
            params![booking_id],
            |row| {
                Ok(Payout {
                    booking_id: row.get(0)?,
                    therapist_id: row.get(1)?,
                    office_id: row.get(2)?,
                    gross_amount: row.get(3)?,
                    commission: row.get(4)?,
                    therapist_amount: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(payout)
}

// ── Reconciliation Queue ──

pub fn enqueue_reconciliation(
    conn: &Connection,
    booking_id: &str,
    kind: ReconciliationKind,
    reason: &str,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO reconciliation_queue (booking_id, kind, reason) VALUES (?1, ?2, ?3)",
        params![booking_id, kind.as_str(), reason],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn resolve_reconciliation(conn: &Connection, booking_id: &str, kind: ReconciliationKind) -> anyhow::Result<usize> {
    let count = conn.execute(
        "UPDATE reconciliation_queue SET resolved = 1 WHERE booking_id = ?1 AND kind = ?2 AND resolved = 0",
        params![booking_id, kind.as_str()],
    )?;
    Ok(count)
}

/// Items of `kind` ever queued for the booking, resolved or not.
pub fn count_reconciliation(conn: &Connection, booking_id: &str, kind: ReconciliationKind) -> anyhow::Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM reconciliation_queue WHERE booking_id = ?1 AND kind = ?2",
        params![booking_id, kind.as_str()],
        |row| row.get::<_, u32>(0),
    )?;
    Ok(count)
}

pub fn list_open_reconciliation(conn: &Connection) -> anyhow::Result<Vec<ReconciliationItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, booking_id, kind, reason, created_at FROM reconciliation_queue
         WHERE resolved = 0 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut items = vec![];
    for row in rows {
        let (id, booking_id, kind, reason, created_at) = row?;
        items.push(ReconciliationItem {
            id,
            booking_id,
            kind: ReconciliationKind::parse(&kind)
                .with_context(|| format!("unknown reconciliation kind: {kind}"))?,
            reason,
            created_at: parse_ts(&created_at)?,
        });
    }
    Ok(items)
}

// ── Lifecycle Events ──

pub fn insert_lifecycle_event(
    conn: &Connection,
    booking_id: &str,
    from: Option<BookingStatus>,
    to: BookingStatus,
    event: &str,
    now: &NaiveDateTime,
) -> anyhow::Result<LifecycleEvent> {
    conn.execute(
        "INSERT INTO lifecycle_events (booking_id, from_status, to_status, event, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![booking_id, from.map(|s| s.as_str()), to.as_str(), event, format_ts(now)],
    )?;

    Ok(LifecycleEvent {
        id: conn.last_insert_rowid(),
        booking_id: booking_id.to_string(),
        from,
        to,
        event: event.to_string(),
        created_at: *now,
    })
}

pub fn get_lifecycle_events_since(conn: &Connection, since_id: i64) -> anyhow::Result<Vec<LifecycleEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, booking_id, from_status, to_status, event, created_at
         FROM lifecycle_events WHERE id > ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![since_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut events = vec![];
    for row in rows {
        let (id, booking_id, from, to, event, created_at) = row?;
        events.push(LifecycleEvent {
            id,
            booking_id,
            from: from.as_deref().and_then(BookingStatus::parse),
            to: BookingStatus::parse(&to).with_context(|| format!("unknown status in event log: {to}"))?,
            event,
            created_at: parse_ts(&created_at)?,
        });
    }
    Ok(events)
}
