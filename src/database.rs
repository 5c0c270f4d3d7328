//! Database management for agent conversation state
//!
//! Uses SQLite to persist accounts, rooms, participants and memories

use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Lock error")]
    LockError,
}

/// A stored conversation line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub created_at: i64,
}

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initialize database tables
    fn init(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                username TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS participants (
                user_id TEXT NOT NULL,
                room_id TEXT NOT NULL,
                PRIMARY KEY (user_id, room_id)
            );
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS memories_room ON memories (room_id, created_at);",
        )?;
        Ok(())
    }

    /// Insert an account unless it exists
    pub fn ensure_account(&self, id: Uuid, name: &str, username: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "INSERT OR IGNORE INTO accounts (id, name, username, created_at) VALUES (?, ?, ?, ?)",
            params![id.to_string(), name, username, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Insert a room unless it exists
    pub fn ensure_room(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "INSERT OR IGNORE INTO rooms (id, created_at) VALUES (?, ?)",
            params![id.to_string(), Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Add a participant to a room unless already present
    pub fn ensure_participant(&self, user_id: Uuid, room_id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "INSERT OR IGNORE INTO participants (user_id, room_id) VALUES (?, ?)",
            params![user_id.to_string(), room_id.to_string()],
        )?;
        Ok(())
    }

    pub fn account_name(&self, id: Uuid) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let result = conn.query_row(
            "SELECT name FROM accounts WHERE id = ?",
            [id.to_string()],
            |row| row.get(0),
        );
        match result {
            Ok(name) => Ok(Some(name)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn participant_count(&self, room_id: Uuid) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM participants WHERE room_id = ?",
            [room_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Store a conversation line
    pub fn add_memory(&self, memory: &Memory) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "INSERT OR REPLACE INTO memories (id, room_id, user_id, text, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                memory.id.to_string(),
                memory.room_id.to_string(),
                memory.user_id.to_string(),
                memory.text,
                memory.created_at,
            ],
        )?;
        Ok(())
    }

    /// Most recent memories of a room, oldest first
    pub fn recent_memories(&self, room_id: Uuid, limit: usize) -> Result<Vec<Memory>, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let mut stmt = conn.prepare(
            "SELECT id, room_id, user_id, text, created_at FROM memories
             WHERE room_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )?;

        let rows = stmt.query_map(params![room_id.to_string(), limit as i64], |row| {
            Ok(Memory {
                id: uuid_column(row, 0)?,
                room_id: uuid_column(row, 1)?,
                user_id: uuid_column(row, 2)?,
                text: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut memories = rows.collect::<Result<Vec<_>, _>>()?;
        memories.reverse();
        Ok(memories)
    }
}

fn uuid_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_operations_are_idempotent() {
        let db = Database::open(":memory:").unwrap();
        let user = Uuid::new_v4();
        let room = Uuid::new_v4();

        db.ensure_account(user, "Alice", "alice").unwrap();
        db.ensure_account(user, "Renamed", "alice").unwrap();
        db.ensure_room(room).unwrap();
        db.ensure_room(room).unwrap();
        db.ensure_participant(user, room).unwrap();
        db.ensure_participant(user, room).unwrap();

        assert_eq!(db.account_name(user).unwrap().as_deref(), Some("Alice"));
        assert_eq!(db.participant_count(room).unwrap(), 1);
        assert!(db.account_name(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_recent_memories_order_and_limit() {
        let db = Database::open(":memory:").unwrap();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();

        for i in 0..5 {
            db.add_memory(&Memory {
                id: Uuid::new_v4(),
                room_id: room,
                user_id: user,
                text: format!("line {}", i),
                created_at: i,
            })
            .unwrap();
        }

        let recent = db.recent_memories(room, 3).unwrap();
        let texts: Vec<&str> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
        assert!(db.recent_memories(Uuid::new_v4(), 3).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_memory_id_is_an_error() {
        let db = Database::open(":memory:").unwrap();
        let room = Uuid::new_v4();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO memories (id, room_id, user_id, text, created_at) VALUES (?, ?, ?, ?, ?)",
                params!["not-a-uuid", room.to_string(), Uuid::new_v4().to_string(), "hi", 1],
            )
            .unwrap();
        }

        let err = db.recent_memories(room, 5).unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Sqlite(rusqlite::Error::FromSqlConversionFailure(0, _, _))
        ));
    }
}
