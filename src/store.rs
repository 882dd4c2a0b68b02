use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::include_res;

const SCHEMA: &str = include_res!(str, "/schema.sql");

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
}

/// One row of a room's history, annotated with the sender's display name.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryMessage {
    pub sender_id: i64,
    pub sender_name: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A room as seen from one user's side: the room id and the other member.
#[derive(Debug, Clone, Serialize)]
pub struct RoomEntry {
    pub room_id: Uuid,
    pub peer_id: i64,
    pub peer_name: String,
}

/// Room membership and durable message history over SQLite. Cloneable; all
/// methods take `&self` and run one query or one transaction.
#[derive(Clone)]
pub struct Directory {
    pool: SqlitePool,
}

impl Directory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> sqlx::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> sqlx::Result<i64> {
        let result = sqlx::query("insert into users (username) values (?)")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_user(&self, id: i64) -> sqlx::Result<Option<User>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("select id, username from users where id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, username)| User { id, username }))
    }

    pub async fn is_member(&self, user_id: i64, room_id: Uuid) -> sqlx::Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("select 1 from users_rooms where user_id = ? and room_id = ?")
                .bind(user_id)
                .bind(room_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Look up the room shared by two users, whichever order they come in.
    pub async fn find_room(&self, a: i64, b: i64) -> sqlx::Result<Option<Uuid>> {
        let (lo, hi) = (a.min(b), a.max(b));
        let row: Option<(String,)> =
            sqlx::query_as("select id from rooms where user_lo = ? and user_hi = ?")
                .bind(lo)
                .bind(hi)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(id,)| parse_uuid(&id)).transpose()
    }

    /// Create a room and both membership rows in one transaction; on any
    /// failure nothing is committed. The unique (user_lo, user_hi) pair
    /// rejects a second room for the same two users.
    pub async fn create_room(&self, a: i64, b: i64) -> sqlx::Result<Uuid> {
        if a == b {
            return Err(sqlx::Error::Protocol(
                "a room pairs two distinct users".into(),
            ));
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let room_id = Uuid::now_v7();

        let mut tx = self.pool.begin().await?;
        sqlx::query("insert into rooms (id, user_lo, user_hi) values (?, ?, ?)")
            .bind(room_id.to_string())
            .bind(lo)
            .bind(hi)
            .execute(&mut *tx)
            .await?;
        for user_id in [lo, hi] {
            sqlx::query("insert into users_rooms (user_id, room_id) values (?, ?)")
                .bind(user_id)
                .bind(room_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(room_id)
    }

    /// Find the pair's room, creating it if this is their first contact. A
    /// concurrent creator losing the race on the pair constraint falls back
    /// to the row the winner committed, so both callers get the same id.
    pub async fn find_or_create_room(&self, a: i64, b: i64) -> sqlx::Result<Uuid> {
        if let Some(room_id) = self.find_room(a, b).await? {
            return Ok(room_id);
        }
        tracing::info!(user_a = a, user_b = b, "room not found, creating one");
        match self.create_room(a, b).await {
            Ok(room_id) => Ok(room_id),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                self.find_room(a, b).await?.ok_or(sqlx::Error::RowNotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Persist one message and return the server-assigned timestamp. The
    /// message is only eligible for fan-out once this has succeeded.
    pub async fn append_message(
        &self,
        room_id: Uuid,
        sender_id: i64,
        content: &str,
    ) -> sqlx::Result<OffsetDateTime> {
        let created_at = OffsetDateTime::now_utc();
        sqlx::query("insert into messages (room_id, user_id, content, created_at) values (?, ?, ?, ?)")
            .bind(room_id.to_string())
            .bind(sender_id)
            .bind(content)
            .bind(encode_ts(created_at))
            .execute(&self.pool)
            .await?;
        Ok(created_at)
    }

    /// Full history of a room, ascending by creation time. The message id
    /// breaks exact-timestamp ties so replay order is stable.
    pub async fn list_messages(&self, room_id: Uuid) -> sqlx::Result<Vec<HistoryMessage>> {
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            "select m.user_id, u.username, m.content, m.created_at \
             from messages m join users u on u.id = m.user_id \
             where m.room_id = ? \
             order by m.created_at asc, m.id asc",
        )
        .bind(room_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(sender_id, sender_name, content, created_at)| {
                Ok(HistoryMessage {
                    sender_id,
                    sender_name,
                    content,
                    created_at: decode_ts(created_at)?,
                })
            })
            .collect()
    }

    /// Every room the user belongs to, each with the other member's id and
    /// display name.
    pub async fn rooms_for_user(&self, user_id: i64) -> sqlx::Result<Vec<RoomEntry>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "select ur.room_id, u.id, u.username \
             from users_rooms ur \
             join users_rooms peer on peer.room_id = ur.room_id and peer.user_id != ur.user_id \
             join users u on u.id = peer.user_id \
             where ur.user_id = ? \
             order by ur.room_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(room_id, peer_id, peer_name)| {
                Ok(RoomEntry {
                    room_id: parse_uuid(&room_id)?,
                    peer_id,
                    peer_name,
                })
            })
            .collect()
    }
}

// timestamps are stored as unix nanoseconds so that sql-side ordering and
// the in-memory OffsetDateTime agree exactly
fn encode_ts(ts: OffsetDateTime) -> i64 {
    ts.unix_timestamp_nanos() as i64
}

fn decode_ts(nanos: i64) -> sqlx::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

fn parse_uuid(s: &str) -> sqlx::Result<Uuid> {
    Uuid::parse_str(s).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}
