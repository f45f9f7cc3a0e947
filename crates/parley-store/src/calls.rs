//! CRUD operations for [`Call`] records and their [`CallLog`] audit rows.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use parley_shared::models::{Call, CallLog};
use parley_shared::types::{CallId, CallOutcome, CallStatus, ChatId, RoomId, UserId};

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::rows::{enum_at, fmt_ts, opt_ts_at, opt_uuid_at, ts_at, uuid_at};

const CALL_COLUMNS: &str =
    "id, caller, callee, call_type, status, room_id, chat_id, started_at, ended_at";

const LOG_COLUMNS: &str = "id, call_id, chat_id, caller, callee, call_type, outcome,
                           duration_secs, started_at, ended_at";

impl Database {
    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    pub fn insert_call(&self, call: &Call) -> Result<()> {
        self.conn().execute(
            "INSERT INTO calls (id, caller, callee, call_type, status, room_id, chat_id,
                                started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                call.id.to_string(),
                call.caller.to_string(),
                call.callee.to_string(),
                call.call_type.as_str(),
                call.status.as_str(),
                call.room_id.to_string(),
                call.chat_id.map(|c| c.to_string()),
                fmt_ts(&call.started_at),
                call.ended_at.as_ref().map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_call(&self, id: CallId) -> Result<Call> {
        self.conn()
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
                params![id.to_string()],
                row_to_call,
            )
            .map_err(not_found)
    }

    pub fn call_by_room(&self, room: RoomId) -> Result<Call> {
        self.conn()
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE room_id = ?1"),
                params![room.to_string()],
                row_to_call,
            )
            .map_err(not_found)
    }

    pub fn update_call_status(
        &self,
        id: CallId,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE calls SET status = ?2, ended_at = COALESCE(?3, ended_at) WHERE id = ?1",
            params![id.to_string(), status.as_str(), ended_at.as_ref().map(fmt_ts)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Calls where `user` is caller or callee, newest first.
    pub fn calls_for_user(&self, user: UserId) -> Result<Vec<Call>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM calls
             WHERE caller = ?1 OR callee = ?1
             ORDER BY started_at DESC, rowid DESC"
        ))?;

        let rows = stmt.query_map(params![user.to_string()], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    /// Calls that never reached a terminal status.
    pub fn open_calls(&self) -> Result<Vec<Call>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE status <> 'ended' ORDER BY started_at ASC"
        ))?;

        let rows = stmt.query_map([], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    // ------------------------------------------------------------------
    // Call logs
    // ------------------------------------------------------------------

    pub fn insert_call_log(&self, log: &CallLog) -> Result<()> {
        self.conn().execute(
            "INSERT INTO call_logs (id, call_id, chat_id, caller, callee, call_type, outcome,
                                    duration_secs, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                log.id.to_string(),
                log.call_id.to_string(),
                log.chat_id.map(|c| c.to_string()),
                log.caller.to_string(),
                log.callee.to_string(),
                log.call_type.as_str(),
                log.outcome.as_str(),
                log.duration_secs,
                fmt_ts(&log.started_at),
                log.ended_at.as_ref().map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_call_log(&self, call: CallId) -> Result<CallLog> {
        self.conn()
            .query_row(
                &format!("SELECT {LOG_COLUMNS} FROM call_logs WHERE call_id = ?1"),
                params![call.to_string()],
                row_to_call_log,
            )
            .map_err(not_found)
    }

    pub fn set_call_log_outcome(&self, call: CallId, outcome: CallOutcome) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE call_logs SET outcome = ?2 WHERE call_id = ?1",
            params![call.to_string(), outcome.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn close_call_log(
        &self,
        call: CallId,
        ended_at: DateTime<Utc>,
        duration_secs: i64,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE call_logs SET ended_at = ?2, duration_secs = ?3 WHERE call_id = ?1",
            params![call.to_string(), fmt_ts(&ended_at), duration_secs],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Log rows where `user` took part, newest first.
    pub fn call_logs_for_user(&self, user: UserId) -> Result<Vec<CallLog>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM call_logs
             WHERE caller = ?1 OR callee = ?1
             ORDER BY started_at DESC, rowid DESC"
        ))?;

        let rows = stmt.query_map(params![user.to_string()], row_to_call_log)?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<Call> {
    Ok(Call {
        id: CallId(uuid_at(row, 0)?),
        caller: UserId(uuid_at(row, 1)?),
        callee: UserId(uuid_at(row, 2)?),
        call_type: enum_at(row, 3)?,
        status: enum_at(row, 4)?,
        room_id: RoomId(uuid_at(row, 5)?),
        chat_id: opt_uuid_at(row, 6)?.map(ChatId),
        started_at: ts_at(row, 7)?,
        ended_at: opt_ts_at(row, 8)?,
    })
}

fn row_to_call_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallLog> {
    let id: Uuid = uuid_at(row, 0)?;
    Ok(CallLog {
        id,
        call_id: CallId(uuid_at(row, 1)?),
        chat_id: opt_uuid_at(row, 2)?.map(ChatId),
        caller: UserId(uuid_at(row, 3)?),
        callee: UserId(uuid_at(row, 4)?),
        call_type: enum_at(row, 5)?,
        outcome: enum_at(row, 6)?,
        duration_secs: row.get(7)?,
        started_at: ts_at(row, 8)?,
        ended_at: opt_ts_at(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::make_user;
    use chrono::Duration;
    use parley_shared::types::CallType;

    fn make_call(db: &Database, caller: UserId, callee: UserId, at: DateTime<Utc>) -> Call {
        let call = Call {
            id: CallId::new(),
            caller,
            callee,
            call_type: CallType::Video,
            status: CallStatus::Pending,
            room_id: RoomId::new(),
            chat_id: None,
            started_at: at,
            ended_at: None,
        };
        db.insert_call(&call).unwrap();
        db.insert_call_log(&CallLog {
            id: Uuid::new_v4(),
            call_id: call.id,
            chat_id: None,
            caller,
            callee,
            call_type: call.call_type,
            outcome: CallOutcome::Missed,
            duration_secs: 0,
            started_at: at,
            ended_at: None,
        })
        .unwrap();
        call
    }

    #[test]
    fn call_status_moves_and_records_end() {
        let db = Database::open_in_memory().unwrap();
        let a = make_user(&db, "Ada");
        let b = make_user(&db, "Bob");
        let call = make_call(&db, a.id, b.id, Utc::now());

        assert_eq!(db.call_by_room(call.room_id).unwrap(), call);

        db.update_call_status(call.id, CallStatus::Accepted, None).unwrap();
        let ended = Utc::now();
        db.update_call_status(call.id, CallStatus::Ended, Some(ended)).unwrap();

        let stored = db.get_call(call.id).unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(stored.ended_at, Some(ended));
        assert!(db.open_calls().unwrap().is_empty());
        assert!(matches!(
            db.update_call_status(CallId::new(), CallStatus::Ended, None),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn call_log_outcome_and_duration() {
        let db = Database::open_in_memory().unwrap();
        let a = make_user(&db, "Ada");
        let b = make_user(&db, "Bob");
        let start = Utc::now();
        let call = make_call(&db, a.id, b.id, start);

        db.set_call_log_outcome(call.id, CallOutcome::Accepted).unwrap();
        db.close_call_log(call.id, start + Duration::seconds(42), 42)
            .unwrap();

        let log = db.get_call_log(call.id).unwrap();
        assert_eq!(log.outcome, CallOutcome::Accepted);
        assert_eq!(log.duration_secs, 42);
    }

    #[test]
    fn history_is_newest_first_for_both_parties() {
        let db = Database::open_in_memory().unwrap();
        let a = make_user(&db, "Ada");
        let b = make_user(&db, "Bob");
        let c = make_user(&db, "Cy");
        let t0 = Utc::now();
        let older = make_call(&db, a.id, b.id, t0);
        let newer = make_call(&db, c.id, a.id, t0 + Duration::seconds(10));
        make_call(&db, b.id, c.id, t0 + Duration::seconds(20));

        let history: Vec<_> = db
            .calls_for_user(a.id)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(history, vec![newer.id, older.id]);

        let logs = db.call_logs_for_user(a.id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].call_id, newer.id);
        assert_eq!(db.open_calls().unwrap().len(), 3);
    }
}
