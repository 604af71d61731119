//! SQLite 实现的 RecallStore
//!
//! rusqlite 为同步 API：连接放在 `Arc<Mutex<Connection>>` 中，每次操作经 spawn_blocking 执行。
//! created_at 以微秒整数存储；seq 为自增主键，用于同一时刻的次序。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use crate::core::AgentError;
use crate::memory::cursor::{CursorPage, CursorQuery, OrderBy};
use crate::memory::{Message, RecallStore, Role, ToolCall};

const COLUMNS: &str = "id, agent_id, role, text, tool_call, tool_call_id, created_at";

/// 持久化的消息日志
pub struct SqliteRecallStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AgentError::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AgentError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池中持锁执行
    async fn with_conn<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, AgentError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AgentError::Storage("sqlite connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| AgentError::Storage(e.to_string()))?
    }
}

fn migrate(conn: &Connection) -> Result<(), AgentError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          agent_id TEXT NOT NULL,
          role TEXT NOT NULL,
          text TEXT NOT NULL,
          tool_call TEXT,
          tool_call_id TEXT,
          created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_agent_time ON messages(agent_id, created_at, seq);
        "#,
    )?;
    Ok(())
}

/// 未解析的行；转换错误以 AgentError::Storage 报出
struct RawRow {
    id: String,
    agent_id: String,
    role: String,
    text: String,
    tool_call: Option<String>,
    tool_call_id: Option<String>,
    created_at: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            role: row.get(2)?,
            text: row.get(3)?,
            tool_call: row.get(4)?,
            tool_call_id: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_message(self) -> Result<Message, AgentError> {
        let corrupt = |what: &str| AgentError::Storage(format!("corrupt message row: {}", what));
        let tool_call = match self.tool_call {
            Some(raw) => Some(
                serde_json::from_str::<ToolCall>(&raw).map_err(|_| corrupt("tool_call"))?,
            ),
            None => None,
        };
        Ok(Message {
            id: Uuid::parse_str(&self.id).map_err(|_| corrupt("id"))?,
            agent_id: Uuid::parse_str(&self.agent_id).map_err(|_| corrupt("agent_id"))?,
            role: Role::parse(&self.role).ok_or_else(|| corrupt("role"))?,
            text: self.text,
            tool_call,
            tool_call_id: self.tool_call_id,
            created_at: DateTime::<Utc>::from_timestamp_micros(self.created_at)
                .ok_or_else(|| corrupt("created_at"))?,
        })
    }
}

fn collect_rows(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<Message>, AgentError> {
    let rows = stmt
        .query_map(params, RawRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RawRow::into_message).collect()
}

fn encode_tool_call(call: &Option<ToolCall>) -> Result<Option<String>, AgentError> {
    call.as_ref()
        .map(|c| serde_json::to_string(c).map_err(|e| AgentError::Storage(e.to_string())))
        .transpose()
}

#[async_trait]
impl RecallStore for SqliteRecallStore {
    async fn append(&self, messages: &[Message]) -> Result<(), AgentError> {
        messages.iter().try_for_each(Message::validate)?;
        let messages = messages.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (id, agent_id, role, text, tool_call, tool_call_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for m in &messages {
                    stmt.execute(params![
                        m.id.to_string(),
                        m.agent_id.to_string(),
                        m.role.as_str(),
                        m.text,
                        encode_tool_call(&m.tool_call)?,
                        m.tool_call_id,
                        m.created_at.timestamp_micros(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update(&self, message: &Message) -> Result<(), AgentError> {
        let m = message.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET text = ?1, tool_call = ?2, tool_call_id = ?3
                 WHERE id = ?4 AND agent_id = ?5",
                params![
                    m.text,
                    encode_tool_call(&m.tool_call)?,
                    m.tool_call_id,
                    m.id.to_string(),
                    m.agent_id.to_string(),
                ],
            )?;
            if changed == 0 {
                return Err(AgentError::not_found("message", m.id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, agent_id: Uuid, ids: &[Uuid]) -> Result<usize, AgentError> {
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM messages WHERE agent_id = ?1 AND id = ?2")?;
                for id in &ids {
                    removed += stmt.execute(params![agent_id.to_string(), id])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn get_many(&self, agent_id: Uuid, ids: &[Uuid]) -> Result<Vec<Message>, AgentError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages WHERE agent_id = ?1 AND id = ?2"
            ))?;
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let raw = stmt
                    .query_row(params![agent_id.to_string(), id.to_string()], RawRow::from_row)
                    .optional()?;
                if let Some(raw) = raw {
                    out.push(raw.into_message()?);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn page_desc(
        &self,
        agent_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AgentError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages WHERE agent_id = ?1
                 ORDER BY created_at DESC, seq DESC LIMIT ?2 OFFSET ?3"
            ))?;
            collect_rows(
                &mut stmt,
                params![agent_id.to_string(), limit as i64, offset as i64],
            )
        })
        .await
    }

    async fn cursor(
        &self,
        agent_id: Uuid,
        query: &CursorQuery,
    ) -> Result<CursorPage<Message>, AgentError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let agent = agent_id.to_string();
            let mut clauses = vec!["agent_id = ?".to_string()];
            let mut args: Vec<SqlValue> = vec![SqlValue::Text(agent.clone())];

            for (bound, op) in [(query.after, ">"), (query.before, "<")] {
                let Some(id) = bound else { continue };
                match query.order_by {
                    OrderBy::CreatedAt => {
                        let key: Option<(i64, i64)> = conn
                            .query_row(
                                "SELECT created_at, seq FROM messages WHERE agent_id = ?1 AND id = ?2",
                                params![agent, id.to_string()],
                                |r| Ok((r.get(0)?, r.get(1)?)),
                            )
                            .optional()?;
                        let (at, seq) =
                            key.ok_or_else(|| AgentError::not_found("cursor", id.to_string()))?;
                        clauses.push(format!("(created_at, seq) {op} (?, ?)"));
                        args.push(SqlValue::Integer(at));
                        args.push(SqlValue::Integer(seq));
                    }
                    OrderBy::Id => {
                        clauses.push(format!("id {op} ?"));
                        args.push(SqlValue::Text(id.to_string()));
                    }
                }
            }

            let dir = if query.reverse { "DESC" } else { "ASC" };
            let order = match query.order_by {
                OrderBy::CreatedAt => format!("created_at {dir}, seq {dir}"),
                OrderBy::Id => format!("id {dir}"),
            };
            args.push(SqlValue::Integer(query.limit as i64));
            let sql = format!(
                "SELECT {COLUMNS} FROM messages WHERE {} ORDER BY {order} LIMIT ?",
                clauses.join(" AND ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = collect_rows(&mut stmt, params_from_iter(args))?;
            Ok(CursorPage {
                next_cursor: records.last().map(|m| m.id),
                records,
            })
        })
        .await
    }

    async fn search_text(
        &self,
        agent_id: Uuid,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AgentError> {
        let needle = query.to_lowercase();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages WHERE agent_id = ?1 AND instr(lower(text), ?2) > 0
                 ORDER BY created_at DESC, seq DESC LIMIT ?3 OFFSET ?4"
            ))?;
            collect_rows(
                &mut stmt,
                params![agent_id.to_string(), needle, limit as i64, offset as i64],
            )
        })
        .await
    }

    async fn size(&self, agent_id: Uuid) -> Result<usize, AgentError> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE agent_id = ?1",
                params![agent_id.to_string()],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    async fn delete_agent(&self, agent_id: Uuid) -> Result<(), AgentError> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM messages WHERE agent_id = ?1",
                params![agent_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRecallStore;
    use chrono::Duration;

    fn seeded(agent: Uuid, n: usize) -> Vec<Message> {
        let base = DateTime::<Utc>::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();
        (0..n)
            .map(|i| {
                Message::user(agent, format!("message {}", i))
                    .with_created_at(base + Duration::microseconds(i as i64 * 10))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recall.db");
        let agent = Uuid::new_v4();
        let msgs = seeded(agent, 3);
        {
            let store = SqliteRecallStore::open(&path).unwrap();
            store.append(&msgs).await.unwrap();
        }
        let store = SqliteRecallStore::open(&path).unwrap();
        assert_eq!(store.size(agent).await.unwrap(), 3);
        let got = store.get_many(agent, &[msgs[2].id, msgs[0].id]).await.unwrap();
        assert_eq!(got[0].text, "message 2");
        assert_eq!(got[1].created_at, msgs[0].created_at);
    }

    #[tokio::test]
    async fn test_tool_call_persisted() {
        let store = SqliteRecallStore::open_in_memory().unwrap();
        let agent = Uuid::new_v4();
        let call = ToolCall {
            id: "call-1".into(),
            name: "send_message".into(),
            arguments: r#"{"message":"hi"}"#.into(),
        };
        let m = Message::assistant(agent, "thinking").with_tool_call(call.clone());
        store.append(std::slice::from_ref(&m)).await.unwrap();
        let got = store.page_desc(agent, 0, 1).await.unwrap();
        assert_eq!(got[0].tool_call.as_ref(), Some(&call));
        assert_eq!(got[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_matches_in_memory_store() {
        let sqlite = SqliteRecallStore::open_in_memory().unwrap();
        let memory = InMemoryRecallStore::new();
        let agent = Uuid::new_v4();
        let msgs = seeded(agent, 6);
        sqlite.append(&msgs).await.unwrap();
        memory.append(&msgs).await.unwrap();

        for (offset, limit) in [(0, 2), (1, 3), (4, 5)] {
            let a: Vec<Uuid> = sqlite.page_desc(agent, offset, limit).await.unwrap().iter().map(|m| m.id).collect();
            let b: Vec<Uuid> = memory.page_desc(agent, offset, limit).await.unwrap().iter().map(|m| m.id).collect();
            assert_eq!(a, b);
        }

        let q = CursorQuery::limit(2).after(msgs[1].id);
        let a = sqlite.cursor(agent, &q).await.unwrap();
        let b = memory.cursor(agent, &q).await.unwrap();
        let ids = |p: &CursorPage<Message>| p.records.iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.next_cursor, Some(msgs[3].id));

        let q = CursorQuery::limit(2).reversed().before(msgs[4].id);
        let a = sqlite.cursor(agent, &q).await.unwrap();
        let b = memory.cursor(agent, &q).await.unwrap();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(ids(&a), vec![msgs[3].id, msgs[2].id]);
    }

    #[tokio::test]
    async fn test_update_delete_search() {
        let store = SqliteRecallStore::open_in_memory().unwrap();
        let agent = Uuid::new_v4();
        let mut msgs = seeded(agent, 3);
        msgs[1].text = "Remember the Ferris crab".into();
        store.append(&msgs).await.unwrap();

        let hits = store.search_text(agent, "ferris", 0, 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        msgs[0].text = "edited".into();
        store.update(&msgs[0]).await.unwrap();
        assert_eq!(store.get_many(agent, &[msgs[0].id]).await.unwrap()[0].text, "edited");

        assert_eq!(store.delete(agent, &[msgs[0].id, Uuid::new_v4()]).await.unwrap(), 1);
        assert_eq!(store.size(agent).await.unwrap(), 2);
        store.delete_agent(agent).await.unwrap();
        assert_eq!(store.size(agent).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_cursor() {
        let store = SqliteRecallStore::open_in_memory().unwrap();
        let agent = Uuid::new_v4();
        store.append(&seeded(agent, 2)).await.unwrap();
        let err = store
            .cursor(agent, &CursorQuery::limit(1).after(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound { .. }));
    }
}
