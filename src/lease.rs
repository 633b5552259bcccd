//! # Competing-Consumer Leases
//!
//! Several processes may poll for the same named consumer. The subscription
//! row is the lock: every poll and ack is one immediate transaction that reads
//! the row, checks it, and writes it back, so two pollers can never both
//! receive a batch while a lease is outstanding.
//!
//! ## State Machine
//!
//! ```text
//!                    poll: events after watermark
//!        ┌──────────┐  ─────────────────────────►  ┌─────────────────────────┐
//!        │   Idle   │                              │ Leased                  │
//!        │ (wm)     │  ◄─────────────────────────  │ (wm, token, expires)    │
//!        └──────────┘   ack: token matches and     └─────────────────────────┘
//!             ▲         expires > now, wm = max(new, wm)        │
//!             │                                                 │ now ≥ expires
//!             └──────────── next poll may re-grant ◄────────────┘
//! ```
//!
//! - A poll while the lease is unexpired grants nothing.
//! - An expired lease is the only recovery path for a crashed consumer; there
//!   is no renewal. The next poll re-grants from the unchanged watermark, so
//!   delivery is at-least-once.
//! - The watermark only moves on a valid ack, and never backwards.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::clock::{expiry, from_millis, to_millis};
use crate::error::Result;
use crate::reader;
use crate::schema::EventTables;
use crate::types::{EventFilter, EventId, Lease, PollOptions, Subscription};

struct SubscriptionRow {
    watermark: i64,
    lease: Option<String>,
    expires: Option<i64>,
}

impl SubscriptionRow {
    /// True while the row holds a lease that has not yet expired.
    fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some() && self.expires.is_some_and(|e| e > to_millis(now))
    }
}

fn load(conn: &Connection, tables: &EventTables, consumer: &str) -> Result<Option<SubscriptionRow>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT watermark, lease, expires FROM {} WHERE consumer = ?1",
                tables.subscriptions
            ),
            params![consumer],
            |row| {
                Ok(SubscriptionRow {
                    watermark: row.get(0)?,
                    lease: row.get(1)?,
                    expires: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Leases the next batch of events for `consumer`.
///
/// Returns `None` when a lease is still outstanding or when there are no
/// events after the watermark. Neither case writes anything.
pub fn poll(
    conn: &mut Connection,
    tables: &EventTables,
    consumer: &str,
    options: &PollOptions,
    now: DateTime<Utc>,
) -> Result<Option<Lease>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current = load(&tx, tables, consumer)?;
    if current.as_ref().is_some_and(|row| row.is_leased(now)) {
        debug!(consumer, "lease outstanding, nothing granted");
        return Ok(None);
    }

    let watermark = current
        .map(|row| EventId::from_raw(row.watermark))
        .unwrap_or(EventId::NONE);

    let mut filter = EventFilter::new().after(watermark).names(options.names.iter().cloned());
    filter.limit = options.limit;
    let events = reader::query(&tx, tables, &filter)?;
    if events.is_empty() {
        return Ok(None);
    }

    let token = Uuid::new_v4().to_string();
    let expires = expiry(now, options.timeout);

    tx.execute(
        &format!(
            "INSERT INTO {} (consumer, watermark, lease, expires) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(consumer) DO UPDATE SET lease = excluded.lease, expires = excluded.expires",
            tables.subscriptions
        ),
        params![consumer, watermark.as_raw(), token, to_millis(expires)],
    )?;
    tx.commit()?;

    debug!(consumer, %watermark, count = events.len(), %expires, "lease granted");

    Ok(Some(Lease {
        consumer: consumer.to_string(),
        watermark,
        lease: token,
        expires,
        events,
    }))
}

/// Releases the lease `token` held by `consumer` and advances its watermark
/// to `max(watermark, current)`.
///
/// Returns `false` without writing if the subscription no longer holds this
/// exact token or the lease has expired.
pub fn ack(
    conn: &mut Connection,
    tables: &EventTables,
    consumer: &str,
    token: &str,
    watermark: EventId,
    now: DateTime<Utc>,
) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current = match load(&tx, tables, consumer)? {
        Some(row) if row.lease.as_deref() == Some(token) && row.is_leased(now) => row,
        _ => {
            debug!(consumer, "stale ack rejected");
            return Ok(false);
        }
    };

    let next = watermark.max(EventId::from_raw(current.watermark));

    tx.execute(
        &format!(
            "UPDATE {} SET watermark = ?1, lease = NULL, expires = NULL WHERE consumer = ?2",
            tables.subscriptions
        ),
        params![next.as_raw(), consumer],
    )?;
    tx.commit()?;

    debug!(consumer, watermark = %next, "lease acknowledged");
    Ok(true)
}

/// Every subscription of this log, ordered by consumer.
pub fn subscriptions(conn: &Connection, tables: &EventTables) -> Result<Vec<Subscription>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT consumer, watermark, lease, expires FROM {} ORDER BY consumer",
        tables.subscriptions
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(consumer, watermark, lease, expires)| {
            Ok(Subscription {
                consumer,
                watermark: EventId::from_raw(watermark),
                lease,
                expires: expires.map(from_millis).transpose()?,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
