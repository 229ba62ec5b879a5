use super::{Conversation, ConversationStore, Message};
use crate::types::Citation;
use chrono::{DateTime, Utc};
use docrag_core::{AppError, AppResult};
use docrag_prompt::Role;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_conversations_agent ON conversations(agent_id);

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        role TEXT NOT NULL,
        text TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (conversation_id, position)
    );

    CREATE TABLE IF NOT EXISTS citations (
        message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        chunk_id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        score REAL NOT NULL,
        tag TEXT NOT NULL,
        PRIMARY KEY (message_id, position)
    );
"#;

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> AppError + '_ {
    move |e| AppError::Storage(format!("{}: {}", context, e))
}

fn parse_time(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Storage(format!("Bad timestamp {}: {}", value, e)))
}

/// Conversations in the workspace SQLite database.
pub struct SqliteConversationStore {
    conn: Mutex<Connection>,
}

impl SqliteConversationStore {
    pub fn open(db_path: &Path) -> AppResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(storage_err("Failed to open database"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(storage_err("Failed to open database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(storage_err("Failed to create conversation tables"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn citations_for(conn: &Connection, message_id: &str) -> AppResult<Vec<Citation>> {
        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, document_id, score, tag FROM citations
                 WHERE message_id = ?1 ORDER BY position",
            )
            .map_err(storage_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                Ok(Citation {
                    chunk_id: row.get(0)?,
                    document_id: row.get(1)?,
                    score: row.get::<_, f64>(2)? as f32,
                    tag: row.get(3)?,
                })
            })
            .map_err(storage_err("Failed to query citations"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(storage_err("Failed to read citation row"))
    }
}

impl ConversationStore for SqliteConversationStore {
    fn create(&self, conversation: &Conversation) -> AppResult<()> {
        self.conn()
            .execute(
                "INSERT INTO conversations (id, agent_id, created_at) VALUES (?1, ?2, ?3)",
                params![
                    conversation.id,
                    conversation.agent_id,
                    conversation.created_at.to_rfc3339()
                ],
            )
            .map_err(storage_err("Failed to create conversation"))?;
        Ok(())
    }

    fn get(&self, conversation_id: &str) -> AppResult<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, agent_id, created_at FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()
            .map_err(storage_err("Failed to load conversation"))?;

        row.map(|(id, agent_id, created_at)| {
            Ok(Conversation {
                id,
                agent_id,
                created_at: parse_time(&created_at)?,
            })
        })
        .transpose()
    }

    fn append(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        citations: &[Citation],
    ) -> AppResult<Message> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(storage_err("Failed to begin transaction"))?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err("Failed to load conversation"))?;
        if exists.is_none() {
            return Err(AppError::NotFound(format!("conversation {}", conversation_id)));
        }

        let position: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(storage_err("Failed to count messages"))?;

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            position: position as u32,
            role,
            text: text.to_string(),
            citations: citations.to_vec(),
            created_at: Utc::now(),
        };

        tx.execute(
            "INSERT INTO messages (id, conversation_id, position, role, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                conversation_id,
                position,
                role.as_str(),
                text,
                message.created_at.to_rfc3339(),
            ],
        )
        .map_err(storage_err("Failed to insert message"))?;

        for (i, citation) in citations.iter().enumerate() {
            tx.execute(
                "INSERT INTO citations (message_id, position, chunk_id, document_id, score, tag)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    i as i64,
                    citation.chunk_id,
                    citation.document_id,
                    citation.score as f64,
                    citation.tag,
                ],
            )
            .map_err(storage_err("Failed to insert citation"))?;
        }

        tx.commit().map_err(storage_err("Failed to commit message"))?;
        Ok(message)
    }

    fn messages(&self, conversation_id: &str) -> AppResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, position, role, text, created_at FROM messages
                 WHERE conversation_id = ?1 ORDER BY position",
            )
            .map_err(storage_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(storage_err("Failed to query messages"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err("Failed to read message row"))?;

        rows.into_iter()
            .map(|(id, position, role, text, created_at)| {
                let citations = Self::citations_for(&conn, &id)?;
                Ok(Message {
                    id,
                    conversation_id: conversation_id.to_string(),
                    position: position as u32,
                    role: role.parse()?,
                    text,
                    citations,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    fn delete(&self, conversation_id: &str) -> AppResult<bool> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![conversation_id],
            )
            .map_err(storage_err("Failed to delete conversation"))?;
        Ok(deleted > 0)
    }

    fn list(&self, agent_id: &str) -> AppResult<Vec<Conversation>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, agent_id, created_at FROM conversations
                 WHERE agent_id = ?1 ORDER BY created_at, id",
            )
            .map_err(storage_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map(params![agent_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(storage_err("Failed to list conversations"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err("Failed to read conversation row"))?;

        rows.into_iter()
            .map(|(id, agent_id, created_at)| {
                Ok(Conversation {
                    id,
                    agent_id,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn conversation(id: &str, agent: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            agent_id: agent.to_string(),
            created_at: Utc::now(),
        }
    }

    fn citation(tag: &str) -> Citation {
        Citation {
            chunk_id: format!("chunk-{}", tag),
            document_id: "policy.md".to_string(),
            score: 0.5,
            tag: tag.to_string(),
        }
    }

    #[test]
    fn test_messages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("docrag.sqlite");
        {
            let store = SqliteConversationStore::open(&path).unwrap();
            store.create(&conversation("c1", "a1")).unwrap();
            store.append("c1", Role::User, "question", &[]).unwrap();
            store
                .append("c1", Role::Assistant, "answer [S2]", &[citation("S1"), citation("S2")])
                .unwrap();
        }

        let store = SqliteConversationStore::open(&path).unwrap();
        let messages = store.messages("c1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].position, 1);
        let tags: Vec<&str> = messages[1].citations.iter().map(|c| c.tag.as_str()).collect();
        assert_eq!(tags, vec!["S1", "S2"]);
    }

    #[test]
    fn test_delete_cascades() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        store.create(&conversation("c1", "a1")).unwrap();
        store
            .append("c1", Role::Assistant, "x", &[citation("S1")])
            .unwrap();

        assert!(store.delete("c1").unwrap());
        assert!(store.get("c1").unwrap().is_none());

        let orphans: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM citations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_append_to_missing_conversation() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        assert!(matches!(
            store.append("nope", Role::User, "x", &[]),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_by_agent() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        store.create(&conversation("c1", "a1")).unwrap();
        store.create(&conversation("c2", "a2")).unwrap();
        store.create(&conversation("c3", "a1")).unwrap();

        let ids: Vec<String> = store.list("a1").unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"c1".to_string()) && ids.contains(&"c3".to_string()));
    }
}
