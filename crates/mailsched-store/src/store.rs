use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use mailsched_core::{Event, EventId, EventStatus, NewEvent, ValidationError};
use rusqlite::{types::Type, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::db::{configure, init_db};
use crate::error::{Result, StoreError};

const EVENT_COLUMNS: &str = "id, subject, content, recipients, scheduled_at, created_at,
     status, claimed_at, done_at, attempt_count, last_error";

/// Filter for [`EventStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<EventStatus>,
    pub limit: usize,
    pub offset: usize,
}

/// Number of events per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
}

/// Durable record of scheduled emails; the single source of truth for what
/// must be sent and when.
///
/// Every state change is a single conditional `UPDATE` keyed on the current
/// status, so several dispatchers (in one process or many) can share the
/// same database without any other lock.
pub struct EventStore {
    db: Mutex<Connection>,
}

impl EventStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open `path` (or an in-memory database for `:memory:`).
    pub fn open(path: &str, busy_timeout_ms: u64) -> Result<Self> {
        let conn = if path == mailsched_core::config::MEMORY_DB {
            Connection::open_in_memory()?
        } else {
            let conn = Connection::open(path)?;
            configure(&conn, busy_timeout_ms)?;
            conn
        };
        Self::new(conn)
    }

    /// Persist a new `pending` event and return its id.
    #[instrument(skip(self, new), fields(recipients = new.recipients.len()))]
    pub fn create(&self, new: &NewEvent) -> Result<EventId> {
        if new.subject.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "subject" }.into());
        }
        if new.content.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "content" }.into());
        }
        if new.recipients.is_empty() {
            return Err(ValidationError::NoRecipients.into());
        }

        let recipients = serde_json::to_string(new.recipients.as_slice())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let now = Utc::now();

        let db = self.conn();
        db.execute(
            "INSERT INTO events
             (subject, content, recipients, scheduled_at, created_at, status, attempt_count)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0)",
            rusqlite::params![
                new.subject,
                new.content,
                recipients,
                ts(&new.scheduled_at),
                ts(&now)
            ],
        )?;
        let id = db.last_insert_rowid();

        info!(event_id = id, scheduled_at = %ts(&new.scheduled_at), "event scheduled");
        Ok(id)
    }

    /// Load one event.
    pub fn get(&self, id: EventId) -> Result<Event> {
        let db = self.conn();
        db.query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
            [id],
            row_to_event,
        )
        .optional()?
        .ok_or(StoreError::NotFound { id })
    }

    /// Pending events whose `scheduled_at` has passed, earliest first,
    /// ties broken by id.
    pub fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Event>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at ASC, id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![ts(&now), limit as i64], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    /// Atomically move one event from `pending` to `claimed`.
    ///
    /// Returns `false` when the event is no longer pending (another
    /// dispatcher won, or it already finished).
    pub fn claim(&self, id: EventId) -> Result<bool> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE events SET status = 'claimed', claimed_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            rusqlite::params![id, ts(&Utc::now())],
        )?;
        if n == 0 {
            debug!(event_id = id, "claim conflict");
        }
        Ok(n == 1)
    }

    /// Count one more delivery attempt on a claimed event; returns the new total.
    ///
    /// Also renews the claim lease, so a holder that is about to send never
    /// looks stale to [`EventStore::reclaim_stale`].
    pub fn record_attempt(&self, id: EventId) -> Result<u32> {
        let db = self.conn();
        let count = db
            .query_row(
                "UPDATE events SET attempt_count = attempt_count + 1, claimed_at = ?2
                 WHERE id = ?1 AND status = 'claimed'
                 RETURNING attempt_count",
                rusqlite::params![id, ts(&Utc::now())],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        match count {
            Some(n) => Ok(n),
            None => Err(transition_error(&db, id, "record an attempt")),
        }
    }

    /// Remember the latest transport failure on a claimed event and renew its
    /// claim lease for the retry backoff that follows.
    pub fn record_error(&self, id: EventId, message: &str) -> Result<()> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE events SET last_error = ?2, claimed_at = ?3
             WHERE id = ?1 AND status = 'claimed'",
            rusqlite::params![id, message, ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(transition_error(&db, id, "record an error"));
        }
        Ok(())
    }

    /// Terminal success. Only valid for a `claimed` event.
    pub fn mark_done(&self, id: EventId, done_at: DateTime<Utc>) -> Result<()> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE events SET status = 'done', done_at = ?2
             WHERE id = ?1 AND status = 'claimed'",
            rusqlite::params![id, ts(&done_at)],
        )?;
        if n == 0 {
            return Err(transition_error(&db, id, "mark done"));
        }
        info!(event_id = id, "event delivered");
        Ok(())
    }

    /// Terminal failure. Only valid for a `claimed` event.
    pub fn mark_failed(&self, id: EventId, reason: &str) -> Result<()> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE events SET status = 'failed', last_error = ?2
             WHERE id = ?1 AND status = 'claimed'",
            rusqlite::params![id, reason],
        )?;
        if n == 0 {
            return Err(transition_error(&db, id, "mark failed"));
        }
        warn!(event_id = id, %reason, "event failed");
        Ok(())
    }

    /// Events newest first, optionally filtered by status.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Event>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![
                filter.status.map(EventStatus::as_str),
                filter.limit as i64,
                filter.offset as i64
            ],
            row_to_event,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    /// Take over every claim whose lease was last renewed before `stale_before`.
    ///
    /// One conditional update stamps a fresh `claimed_at` on the stale rows and
    /// returns their ids ascending, so of several instances recovering at
    /// once only one gets each event. Claims a live worker keeps renewing are
    /// never returned.
    pub fn reclaim_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<EventId>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "UPDATE events SET claimed_at = ?1
             WHERE status = 'claimed' AND (claimed_at IS NULL OR claimed_at < ?2)
             RETURNING id",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![ts(&Utc::now()), ts(&stale_before)],
            |row| row.get::<_, EventId>(0),
        )?;
        let mut ids = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        ids.sort_unstable();
        if !ids.is_empty() {
            debug!(count = ids.len(), "stale claims taken over");
        }
        Ok(ids)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM events GROUP BY status")?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.parse::<EventStatus>() {
                Ok(EventStatus::Pending) => counts.pending = n,
                Ok(EventStatus::Claimed) => counts.claimed = n,
                Ok(EventStatus::Done) => counts.done = n,
                Ok(EventStatus::Failed) => counts.failed = n,
                Err(e) => return Err(StoreError::Corrupt(e)),
            }
        }
        Ok(counts)
    }

    /// True when the database answers a trivial query.
    pub fn ping(&self) -> bool {
        self.conn()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written.
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Build the error for a conditional update that matched no row.
fn transition_error(db: &Connection, id: EventId, action: &'static str) -> StoreError {
    let status = db
        .query_row("SELECT status FROM events WHERE id = ?1", [id], |row| {
            row.get::<_, String>(0)
        })
        .optional();
    match status {
        Ok(None) => StoreError::NotFound { id },
        Ok(Some(s)) => match s.parse() {
            Ok(status) => StoreError::InvalidTransition { id, status, action },
            Err(e) => StoreError::Corrupt(e),
        },
        Err(e) => StoreError::Database(e),
    }
}

/// Fixed-width UTC form so text comparison in SQL matches time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

/// Map a SQLite row (in `EVENT_COLUMNS` order) to an `Event`.
fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let recipients_json: String = row.get(3)?;
    let recipients: Vec<String> = serde_json::from_str(&recipients_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let status_str: String = row.get(6)?;
    let status: EventStatus = status_str
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into()))?;

    Ok(Event {
        id: row.get(0)?,
        subject: row.get(1)?,
        content: row.get(2)?,
        recipients,
        scheduled_at: parse_ts(4, &row.get::<_, String>(4)?)?,
        created_at: parse_ts(5, &row.get::<_, String>(5)?)?,
        status,
        claimed_at: parse_opt_ts(7, row.get(7)?)?,
        done_at: parse_opt_ts(8, row.get(8)?)?,
        attempt_count: row.get(9)?,
        last_error: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use chrono::Duration;
    use mailsched_core::Recipients;

    use super::*;

    fn store() -> EventStore {
        EventStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn new_event(at: DateTime<Utc>) -> NewEvent {
        NewEvent {
            subject: "Hello".into(),
            content: "Body".into(),
            recipients: Recipients::parse("a@x.com").unwrap(),
            scheduled_at: at,
        }
    }

    #[test]
    fn create_then_get_roundtrips() {
        let s = store();
        let at = Utc::now() + Duration::hours(1);
        let id = s.create(&new_event(at)).unwrap();

        let ev = s.get(id).unwrap();
        assert_eq!(ev.id, id);
        assert_eq!(ev.status, EventStatus::Pending);
        assert_eq!(ev.recipients, ["a@x.com"]);
        assert_eq!(ev.scheduled_at.timestamp_micros(), at.timestamp_micros());
        assert_eq!(ev.attempt_count, 0);
        assert!(ev.done_at.is_none());
    }

    #[test]
    fn ids_are_monotonic() {
        let s = store();
        let a = s.create(&new_event(Utc::now())).unwrap();
        let b = s.create(&new_event(Utc::now())).unwrap();
        assert!(b > a);
    }

    #[test]
    fn get_missing_is_not_found() {
        assert!(matches!(
            store().get(42),
            Err(StoreError::NotFound { id: 42 })
        ));
    }

    #[test]
    fn create_rejects_blank_subject_without_writing() {
        let s = store();
        let mut ev = new_event(Utc::now());
        ev.subject = "   ".into();
        assert!(matches!(s.create(&ev), Err(StoreError::Validation(_))));
        assert_eq!(s.status_counts().unwrap(), StatusCounts::default());
    }

    #[test]
    fn find_due_orders_by_time_then_id() {
        let s = store();
        let now = Utc::now();
        let late = s.create(&new_event(now - Duration::minutes(1))).unwrap();
        let early = s.create(&new_event(now - Duration::minutes(5))).unwrap();
        let tie = s.create(&new_event(now - Duration::minutes(1))).unwrap();
        let _future = s.create(&new_event(now + Duration::hours(1))).unwrap();

        let due: Vec<_> = s.find_due(now, 10).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(due, [early, late, tie]);

        let limited = s.find_due(now, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, early);
    }

    #[test]
    fn find_due_skips_claimed_events() {
        let s = store();
        let id = s.create(&new_event(Utc::now() - Duration::seconds(1))).unwrap();
        assert!(s.claim(id).unwrap());
        assert!(s.find_due(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn claim_succeeds_once() {
        let s = store();
        let id = s.create(&new_event(Utc::now())).unwrap();
        assert!(s.claim(id).unwrap());
        assert!(!s.claim(id).unwrap());
        let ev = s.get(id).unwrap();
        assert_eq!(ev.status, EventStatus::Claimed);
        assert!(ev.claimed_at.is_some());
    }

    #[test]
    fn claim_unknown_id_is_false() {
        assert!(!store().claim(99).unwrap());
    }

    #[test]
    fn concurrent_claims_on_shared_store_have_one_winner() {
        let s = Arc::new(store());
        let id = s.create(&new_event(Utc::now())).unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    s.claim(id).unwrap()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn concurrent_claims_across_connections_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let path = path.to_str().unwrap().to_string();

        let seed = EventStore::open(&path, 5_000).unwrap();
        let id = seed.create(&new_event(Utc::now())).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let s = EventStore::open(&path, 5_000).unwrap();
                    barrier.wait();
                    s.claim(id).unwrap()
                })
            })
            .collect();
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| **r).count(), 1);
        assert_eq!(seed.get(id).unwrap().status, EventStatus::Claimed);
    }

    #[test]
    fn mark_done_requires_claim() {
        let s = store();
        let id = s.create(&new_event(Utc::now())).unwrap();
        assert!(matches!(
            s.mark_done(id, Utc::now()),
            Err(StoreError::InvalidTransition {
                status: EventStatus::Pending,
                ..
            })
        ));

        s.claim(id).unwrap();
        let done_at = Utc::now();
        s.mark_done(id, done_at).unwrap();
        let ev = s.get(id).unwrap();
        assert_eq!(ev.status, EventStatus::Done);
        assert_eq!(
            ev.done_at.map(|d| d.timestamp_micros()),
            Some(done_at.timestamp_micros())
        );
    }

    #[test]
    fn terminal_states_never_revert() {
        let s = store();
        let id = s.create(&new_event(Utc::now())).unwrap();
        s.claim(id).unwrap();
        s.mark_done(id, Utc::now()).unwrap();

        assert!(matches!(
            s.mark_done(id, Utc::now()),
            Err(StoreError::InvalidTransition {
                status: EventStatus::Done,
                ..
            })
        ));
        assert!(matches!(
            s.mark_failed(id, "late"),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(!s.claim(id).unwrap());
        assert_eq!(s.get(id).unwrap().status, EventStatus::Done);
    }

    #[test]
    fn transitions_on_missing_event_are_not_found() {
        let s = store();
        assert!(matches!(
            s.mark_failed(5, "x"),
            Err(StoreError::NotFound { id: 5 })
        ));
        assert!(matches!(
            s.record_attempt(5),
            Err(StoreError::NotFound { id: 5 })
        ));
    }

    #[test]
    fn attempts_and_errors_are_recorded() {
        let s = store();
        let id = s.create(&new_event(Utc::now())).unwrap();
        assert!(s.record_attempt(id).is_err());

        s.claim(id).unwrap();
        assert_eq!(s.record_attempt(id).unwrap(), 1);
        s.record_error(id, "421 try later").unwrap();
        assert_eq!(s.record_attempt(id).unwrap(), 2);
        s.mark_failed(id, "gave up").unwrap();

        let ev = s.get(id).unwrap();
        assert_eq!(ev.status, EventStatus::Failed);
        assert_eq!(ev.attempt_count, 2);
        assert_eq!(ev.last_error.as_deref(), Some("gave up"));
    }

    #[test]
    fn list_filters_and_pages_newest_first() {
        let s = store();
        let ids: Vec<_> = (0..4)
            .map(|_| s.create(&new_event(Utc::now())).unwrap())
            .collect();
        s.claim(ids[1]).unwrap();

        let all = s
            .list(&ListFilter {
                limit: 10,
                ..ListFilter::default()
            })
            .unwrap();
        assert_eq!(all.first().map(|e| e.id), Some(ids[3]));
        assert_eq!(all.len(), 4);

        let claimed = s
            .list(&ListFilter {
                status: Some(EventStatus::Claimed),
                limit: 10,
                offset: 0,
            })
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, ids[1]);

        let page = s
            .list(&ListFilter {
                status: None,
                limit: 2,
                offset: 2,
            })
            .unwrap();
        let page_ids: Vec<_> = page.into_iter().map(|e| e.id).collect();
        assert_eq!(page_ids, [ids[1], ids[0]]);
    }

    #[test]
    fn counts_by_status() {
        let s = store();
        let a = s.create(&new_event(Utc::now())).unwrap();
        let b = s.create(&new_event(Utc::now())).unwrap();
        let _c = s.create(&new_event(Utc::now())).unwrap();
        s.claim(a).unwrap();
        s.claim(b).unwrap();
        s.mark_done(b, Utc::now()).unwrap();

        assert_eq!(
            s.status_counts().unwrap(),
            StatusCounts {
                pending: 1,
                claimed: 1,
                done: 1,
                failed: 0,
            }
        );
        assert!(s.ping());
    }

    #[test]
    fn reclaim_stale_takes_over_only_expired_claims() {
        let s = store();
        let a = s.create(&new_event(Utc::now())).unwrap();
        let b = s.create(&new_event(Utc::now())).unwrap();
        let c = s.create(&new_event(Utc::now())).unwrap();
        s.claim(a).unwrap();
        s.claim(b).unwrap();
        s.mark_done(b, Utc::now()).unwrap();

        // Fresh claims are left alone.
        assert!(s.reclaim_stale(Utc::now() - Duration::hours(1)).unwrap().is_empty());

        let before = s.get(a).unwrap().claimed_at.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(s.reclaim_stale(Utc::now()).unwrap(), [a]);

        // The takeover renewed the lease, so the same cutoff finds nothing.
        let after = s.get(a).unwrap().claimed_at.unwrap();
        assert!(after > before);
        assert!(s.reclaim_stale(before).unwrap().is_empty());

        assert_eq!(s.get(a).unwrap().status, EventStatus::Claimed);
        assert_eq!(s.get(c).unwrap().status, EventStatus::Pending);
    }

    #[test]
    fn attempts_and_errors_renew_the_lease() {
        let s = store();
        let id = s.create(&new_event(Utc::now())).unwrap();
        s.claim(id).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mid = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.record_attempt(id).unwrap();
        assert!(s.reclaim_stale(mid).unwrap().is_empty());

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mid = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.record_error(id, "421 try later").unwrap();
        assert!(s.reclaim_stale(mid).unwrap().is_empty());
        assert!(s.get(id).unwrap().claimed_at.unwrap() > mid);
    }

    #[test]
    fn each_stale_claim_goes_to_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let path = path.to_str().unwrap();
        let first = EventStore::open(path, 5_000).unwrap();
        let second = EventStore::open(path, 5_000).unwrap();

        let ids: Vec<_> = (0..10)
            .map(|_| first.create(&new_event(Utc::now())).unwrap())
            .collect();
        for id in &ids {
            assert!(first.claim(*id).unwrap());
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        let cutoff = Utc::now();

        let mut taken = first.reclaim_stale(cutoff).unwrap();
        taken.extend(second.reclaim_stale(cutoff).unwrap());
        taken.sort_unstable();
        assert_eq!(taken, ids);
    }
}
