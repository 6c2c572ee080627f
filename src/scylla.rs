// Copyright (C) 2025 the chronicle authors
//
// This file is part of chronicle.
//
// chronicle is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// chronicle is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with chronicle.  If not,
// see <http://www.gnu.org/licenses/>.

//! # scylla
//!
//! [Backend] implementation for ScyllaDB/Cassandra.
//!
//! Expected schema, in keyspace `chronicle`:
//!
//! ```cql
//! CREATE TABLE notifications (
//!   req_id uuid, phase text, date timestamp, message text, object_key text,
//!   object_type text, operation text, payload blob, sender text,
//!   PRIMARY KEY (req_id, phase));
//! CREATE TABLE activity (
//!   day text, date timestamp, req_id uuid, phase text, message text, object_key text,
//!   object_type text, operation text, payload blob, sender text,
//!   PRIMARY KEY (day, date, req_id, phase))
//!   WITH CLUSTERING ORDER BY (date DESC);
//! CREATE TABLE pending (
//!   bucket int, req_id uuid, lease_until timestamp,
//!   PRIMARY KEY (bucket, req_id));
//! CREATE TABLE objects (
//!   kind text, key text, fields blob,
//!   PRIMARY KEY (kind, key));
//! ```
//!
//! `notifications` is the source of truth; `activity` (partitioned by UTC day, clustered
//! newest-first, for the feed) and `pending` (a single-partition pickup queue for the dispatcher)
//! are projections written alongside each append & re-derivable from the log. `payload` and
//! `fields` columns are MessagePack blobs.
//!
//! [Backend]: crate::storage::Backend

use async_trait::async_trait;
use chrono::{DateTime, Days, Duration, Utc};
use enum_map::{Enum, EnumMap};
use futures::stream;
use itertools::Itertools;
use scylla::{
    prepared_statement::PreparedStatement, transport::errors::QueryError, SessionBuilder,
};
use secrecy::{ExposeSecret, SecretString};
use snafu::{Backtrace, ResultExt, Snafu};
use tap::Pipe;
use uuid::Uuid;

use crate::{
    entities::{Notification, ObjectKind, Phase, RequestId, Sender},
    payload::Payload,
    storage::{self, ObjectRecord},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A query was expected to produce at most one row & did not."))]
    AtMostOneRow { backtrace: Backtrace },
    #[snafu(display(
        "The number of prepared statements isn't consistent; this is a bug & should be reported!"
    ))]
    BadPreparedStatementCount { backtrace: Backtrace },
    #[snafu(display("A notification for ({req_id}, {phase}) has already been appended"))]
    Duplicate {
        req_id: RequestId,
        phase: Phase,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to set keyspace: {source}"))]
    Keyspace {
        source: QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create a ScyllaDB session: {source}"))]
    NewSession {
        source: scylla::transport::errors::NewSessionError,
        backtrace: Backtrace,
    },
    #[snafu(display("The notification for {req_id} vanished between being leased & being read"))]
    NoSuchRequest {
        req_id: RequestId,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to prepare statement: {stmt}: {source}"))]
    Prepare {
        stmt: String,
        source: QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Stored row for {req_id} won't parse: {source}"))]
    RowParse {
        req_id: Uuid,
        source: crate::entities::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Stored row for {req_id} carries an empty sender"))]
    RowSender {
        req_id: Uuid,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

use storage::Error as StorError;

impl std::convert::From<QueryError> for StorError {
    fn from(value: QueryError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::IntoRowsResultError> for StorError {
    fn from(value: scylla::transport::query_result::IntoRowsResultError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::RowsError> for StorError {
    fn from(value: scylla::transport::query_result::RowsError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::FirstRowError> for StorError {
    fn from(value: scylla::transport::query_result::FirstRowError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::deserialize::DeserializationError> for StorError {
    fn from(value: scylla::deserialize::DeserializationError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<rmp_serde::encode::Error> for StorError {
    fn from(value: rmp_serde::encode::Error) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<rmp_serde::decode::Error> for StorError {
    fn from(value: rmp_serde::decode::Error) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<Error> for StorError {
    fn from(value: Error) -> Self {
        StorError::new(value)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                 chronicle ScyllaDB session type                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The set of prepared statements used by chronicle
///
/// Rather than giving each prepared statement its own field on [Session] (unwieldy once past a
/// handful), this enum serves as both a mnemonic tag and the key type of an [EnumMap] from tags
/// to the actual [PreparedStatement]s; the index operator on an [EnumMap] is guaranteed to
/// succeed.
#[derive(Clone, Debug, Enum, Eq, PartialEq)]
enum PreparedStatements {
    InsertNotification,
    InsertActivity,
    InsertPending,
    SelectByRequestId,
    SelectActivityDay,
    SelectPending,
    LeasePending,
    DeletePending,
    SelectObject,
    InsertObject,
    DeleteObject,
}

/// All notifications land in one `pending` partition; the queue is small by construction (the
/// dispatcher drains it) so the usual single-hot-partition concern doesn't bite.
const PENDING_BUCKET: i32 = 0;

/// How many days back [storage::Backend::recent] will walk the `activity` partitions.
const ACTIVITY_HORIZON_DAYS: u64 = 30;

/// CQL `limit` argument for one activity page: the remaining entry count, saturated rather than
/// truncated into an i32.
fn page_limit(remaining: usize) -> i32 {
    remaining.try_into().unwrap_or(i32::MAX)
}

/// `chronicle`-specific ScyllaDB Session type
///
/// Instantiate this via [Session::new] with connection info & credentials if need be; when dropped
/// the ScyllaDB session will be terminated.
pub struct Session {
    session: ::scylla::Session,
    prepared_statements: EnumMap<PreparedStatements, PreparedStatement>,
}

impl Session {
    /// Prepare a statement
    async fn prepare(scylla: &::scylla::Session, stmt: &str) -> Result<PreparedStatement> {
        scylla.prepare(stmt).await.context(PrepareSnafu {
            stmt: stmt.to_owned(),
        })
    }

    /// [Session] constructor
    ///
    /// Construct with a collection of SycllaDB hosts. The `Item`s are regrettably typed as `&str`,
    /// but they need to be parsable as `IpAddress`es. `credentials`, if non-None, should be a pair
    /// of strings consisting of the username & password.
    pub async fn new(
        hosts: impl IntoIterator<Item = impl AsRef<str>>,
        credentials: &Option<(SecretString, SecretString)>,
    ) -> Result<Session> {
        let mut builder = SessionBuilder::new().known_nodes(hosts);
        if let Some((user, pass)) = credentials {
            builder = builder.user(user.expose_secret(), pass.expose_secret())
        }
        let scylla = builder.build().await.context(NewSessionSnafu)?;
        scylla
            .use_keyspace("chronicle", false)
            .await
            .context(KeyspaceSnafu)?;

        use futures::stream::StreamExt;
        // The statements listed here must be in the same order as [PreparedStatements].
        let prepared_statements = stream::iter(vec![
            "insert into notifications (req_id,phase,date,message,object_key,object_type,operation,payload,sender) values (?,?,?,?,?,?,?,?,?) if not exists",
            "insert into activity (day,date,req_id,phase,message,object_key,object_type,operation,payload,sender) values (?,?,?,?,?,?,?,?,?,?)",
            "insert into pending (bucket,req_id,lease_until) values (?,?,?)",
            "select req_id,object_type,operation,phase,sender,object_key,payload,date,message from notifications where req_id=?",
            "select req_id,object_type,operation,phase,sender,object_key,payload,date,message from activity where day=? limit ?",
            "select req_id,lease_until from pending where bucket=?",
            "update pending set lease_until=? where bucket=? and req_id=? if lease_until=?",
            "delete from pending where bucket=? and req_id=?",
            "select kind,key,fields from objects where kind=? and key=?",
            "insert into objects (kind,key,fields) values (?,?,?)",
            "delete from objects where kind=? and key=? if exists",
        ])
            .then(|s| async { Self::prepare(&scylla, s).await })
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<PreparedStatement>>>()?;
        // `EnumMap::from_array` needs a slice of *precisely the right length*, in the right
        // order. The latter can't be tested for; the former can.
        let prepared_statements: [PreparedStatement; 11] = prepared_statements
            .try_into()
            .map_err(|_| BadPreparedStatementCountSnafu.build())?;

        Ok(Session {
            session: scylla,
            prepared_statements: EnumMap::from_array(prepared_statements),
        })
    }

    /// Fetch & decode every notification row for `req_id`, in no particular order.
    async fn notifications_for(&self, req_id: RequestId) -> StdResult<Vec<Notification>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectByRequestId],
                (req_id,),
            )
            .await?
            .into_rows_result()?
            .rows::<NotificationRow>()?
            .map(|row| Ok::<_, StorError>(decode_row(row?)?))
            .collect::<StdResult<Vec<Notification>, StorError>>()
    }
}

/// The wire shape of a notification row: enums as text, payload as a MessagePack blob.
type NotificationRow = (
    RequestId,
    String,
    String,
    String,
    String,
    String,
    Vec<u8>,
    DateTime<Utc>,
    Option<String>,
);

fn decode_row(row: NotificationRow) -> Result<Notification> {
    let (req_id, object_type, operation, phase, sender, object_key, payload, date, message) = row;
    let raw = *req_id.as_uuid();
    Ok(Notification {
        req_id,
        object_type: object_type.parse().context(RowParseSnafu { req_id: raw })?,
        operation: operation.parse().context(RowParseSnafu { req_id: raw })?,
        phase: phase.parse().context(RowParseSnafu { req_id: raw })?,
        sender: Sender::new(sender).ok_or_else(|| RowSenderSnafu { req_id: raw }.build())?,
        object_key,
        payload: decode_payload(&payload)?,
        date,
        message,
    })
}

fn decode_payload(blob: &[u8]) -> Result<Payload> {
    // An unreadable payload is still a notification; don't let one bad blob poison a whole read.
    Ok(rmp_serde::from_slice(blob).unwrap_or_default())
}

#[async_trait]
impl storage::Backend for Session {
    async fn append(&self, notification: Notification) -> StdResult<Notification, StorError> {
        let payload = rmp_serde::to_vec_named(&notification.payload)?;
        let applied = self
            .session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::InsertNotification],
                (
                    notification.req_id,
                    notification.phase.as_str(),
                    notification.date,
                    &notification.message,
                    &notification.object_key,
                    notification.object_type.as_str(),
                    notification.operation.as_str(),
                    &payload,
                    notification.sender.as_str(),
                ),
            )
            .await?
            .into_rows_result()?
            // An LWT insert yields `[applied]` followed by the prior values of every column, in
            // table order; only the flag matters here.
            .first_row::<(
                bool,
                Option<RequestId>,
                Option<String>,
                Option<DateTime<Utc>>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<Vec<u8>>,
                Option<String>,
            )>()?
            .0;
        if !applied {
            return DuplicateSnafu {
                req_id: notification.req_id,
                phase: notification.phase,
            }
            .fail()
            .map_err(StorError::from);
        }

        // Projections. If we crash between these writes the log is still correct; the feed
        // misses an entry, and an orphaned pending row is retired on its first lease attempt.
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::InsertActivity],
                (
                    notification.date.format("%Y-%m-%d").to_string(),
                    notification.date,
                    notification.req_id,
                    notification.phase.as_str(),
                    &notification.message,
                    &notification.object_key,
                    notification.object_type.as_str(),
                    notification.operation.as_str(),
                    &payload,
                    notification.sender.as_str(),
                ),
            )
            .await?;
        if notification.phase == Phase::Request {
            self.session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::InsertPending],
                    (
                        PENDING_BUCKET,
                        notification.req_id,
                        None::<DateTime<Utc>>,
                    ),
                )
                .await?;
        }
        Ok(notification)
    }

    async fn find_by_request_id(
        &self,
        req_id: RequestId,
    ) -> StdResult<Option<Notification>, StorError> {
        let rows = self.notifications_for(req_id).await?;
        rows.iter()
            .filter(|n| n.is_terminal())
            .min_by_key(|n| n.date)
            .or_else(|| rows.iter().find(|n| n.phase == Phase::Request))
            .cloned()
            .pipe(Ok)
    }

    async fn recent(&self, n: usize) -> StdResult<Vec<Notification>, StorError> {
        let mut out: Vec<Notification> = Vec::with_capacity(n);
        let today = Utc::now();
        for back in 0..ACTIVITY_HORIZON_DAYS {
            if out.len() >= n {
                break;
            }
            let day = match today.checked_sub_days(Days::new(back)) {
                Some(day) => day.format("%Y-%m-%d").to_string(),
                None => break,
            };
            let wanted = page_limit(n - out.len());
            let mut rows = self
                .session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::SelectActivityDay],
                    (day, wanted),
                )
                .await?
                .into_rows_result()?
                .rows::<NotificationRow>()?
                .map(|row| Ok::<_, StorError>(decode_row(row?)?))
                .collect::<StdResult<Vec<Notification>, StorError>>()?;
            // Already newest-first within a day, per the clustering order.
            out.append(&mut rows);
        }
        out.truncate(n);
        Ok(out)
    }

    async fn lease_request(
        &self,
        lease: Duration,
    ) -> StdResult<Option<Notification>, StorError> {
        let now = Utc::now();
        let candidates = self
            .session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectPending],
                (PENDING_BUCKET,),
            )
            .await?
            .into_rows_result()?
            .rows::<(RequestId, Option<DateTime<Utc>>)>()?
            .collect::<StdResult<Vec<_>, _>>()?;

        for (req_id, lease_until) in candidates {
            if matches!(lease_until, Some(until) if until > now) {
                continue;
            }
            // A terminal already on the log means some worker finished but died before retiring
            // the row; retire it now & move on.
            let rows = self.notifications_for(req_id).await?;
            if rows.iter().any(Notification::is_terminal) {
                self.close_request(req_id).await?;
                continue;
            }
            // Conditional claim: only one of any number of racing workers sees `[applied]`.
            let applied = self
                .session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::LeasePending],
                    (now + lease, PENDING_BUCKET, req_id, lease_until),
                )
                .await?
                .into_rows_result()?
                .first_row::<(bool, Option<DateTime<Utc>>)>()?
                .0;
            if !applied {
                continue;
            }
            let request = rows
                .into_iter()
                .find(|n| n.phase == Phase::Request)
                .ok_or_else(|| NoSuchRequestSnafu { req_id }.build())?;
            return Ok(Some(request));
        }
        Ok(None)
    }

    async fn close_request(&self, req_id: RequestId) -> StdResult<(), StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::DeletePending],
                (PENDING_BUCKET, req_id),
            )
            .await?;
        Ok(())
    }

    async fn get_object(
        &self,
        kind: ObjectKind,
        key: &str,
    ) -> StdResult<Option<ObjectRecord>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectObject],
                (kind.as_str(), key),
            )
            .await?
            .into_rows_result()?
            .rows::<(String, String, Vec<u8>)>()?
            .at_most_one()
            .map_err(|_| StorError::new(AtMostOneRowSnafu.build()))?
            .transpose()?
            .map(|(kind, key, fields)| {
                Ok::<_, StorError>(ObjectRecord {
                    kind: kind
                        .parse()
                        .map_err(StorError::new)?,
                    key,
                    fields: rmp_serde::from_slice(&fields)?,
                })
            })
            .transpose()
    }

    async fn put_object(&self, record: ObjectRecord) -> StdResult<(), StorError> {
        let fields = rmp_serde::to_vec_named(&record.fields)?;
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::InsertObject],
                (record.kind.as_str(), &record.key, &fields),
            )
            .await?;
        Ok(())
    }

    async fn delete_object(&self, kind: ObjectKind, key: &str) -> StdResult<bool, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::DeleteObject],
                (kind.as_str(), key),
            )
            .await?
            .into_rows_result()?
            .first_row::<(bool, Option<String>, Option<String>, Option<Vec<u8>>)>()?
            .0
            .pipe(Ok)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_limits_saturate() {
        assert_eq!(page_limit(0), 0);
        assert_eq!(page_limit(10), 10);
        assert_eq!(page_limit(usize::MAX), i32::MAX);
    }
}
