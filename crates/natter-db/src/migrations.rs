use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub const SCHEMA_VERSION: i64 = 1;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE media (
                id          TEXT PRIMARY KEY,
                data        BLOB NOT NULL,
                media_type  TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                photo_id    TEXT REFERENCES media(id) ON DELETE SET NULL,
                created_at  TEXT NOT NULL
            );

            -- direct_key holds the sorted participant pair of a direct
            -- conversation and is NULL for groups.
            CREATE TABLE conversations (
                id          TEXT PRIMARY KEY,
                title       TEXT NOT NULL,
                is_group    INTEGER NOT NULL CHECK (is_group IN (0, 1)),
                photo_id    TEXT REFERENCES media(id) ON DELETE SET NULL,
                direct_key  TEXT UNIQUE,
                created_at  TEXT NOT NULL,
                CHECK ((is_group = 1) = (direct_key IS NULL))
            );

            CREATE UNIQUE INDEX idx_group_title
                ON conversations(title) WHERE is_group = 1;

            CREATE TABLE participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id),
                joined_at       TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user
                ON participants(user_id);

            -- parent_id is checked on insert only; deleting a parent leaves
            -- replies pointing at nothing.
            CREATE TABLE messages (
                id               TEXT PRIMARY KEY,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id        TEXT NOT NULL REFERENCES users(id),
                kind             TEXT NOT NULL CHECK (kind IN ('text', 'photo')),
                content          TEXT NOT NULL,
                content_type     TEXT NOT NULL,
                parent_id        TEXT,
                status           TEXT NOT NULL DEFAULT 'delivered'
                                 CHECK (status IN ('delivered', 'read')),
                read_count       INTEGER NOT NULL DEFAULT 0,
                forwarded_from   TEXT REFERENCES users(id),
                original_sent_at TEXT,
                created_at       TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE message_reads (
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                read_at     TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE TABLE reactions (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                emoji       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                UNIQUE(message_id, user_id)
            );

            CREATE TABLE comments (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                content     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_comments_message
                ON comments(message_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete (schema v{})", SCHEMA_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn direct_key_required_only_for_direct_conversations() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        let bad = conn.execute(
            "INSERT INTO conversations (id, title, is_group, direct_key, created_at)
             VALUES ('cv1', 't', 1, 'a|b', '2024-01-01')",
            [],
        );
        assert!(bad.is_err());

        conn.execute(
            "INSERT INTO conversations (id, title, is_group, direct_key, created_at)
             VALUES ('cv2', 't', 0, 'a|b', '2024-01-01')",
            [],
        )
        .unwrap();
    }
}
