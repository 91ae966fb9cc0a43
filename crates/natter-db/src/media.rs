use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use natter_types::models::MediaBlob;

use crate::error::{StoreError, StoreResult};
use crate::{Database, IdKind, now};

impl Database {
    pub fn store_media(&self, data: &[u8], media_type: &str) -> StoreResult<String> {
        self.with_tx(|tx| self.insert_media(tx, data, media_type))
    }

    pub fn get_media(&self, media_id: &str) -> StoreResult<MediaBlob> {
        self.with_conn(|conn| {
            query_media(conn, media_id)?.ok_or_else(|| StoreError::not_found(format!("media {}", media_id)))
        })
    }

    /// Insert a blob inside an open transaction. Shared by photo messages,
    /// group photos and avatars so the blob and its reference land together.
    pub(crate) fn insert_media(
        &self,
        conn: &Connection,
        data: &[u8],
        media_type: &str,
    ) -> StoreResult<String> {
        validate_media(data, media_type)?;

        let id = self.next_id(conn, IdKind::Media)?;
        conn.execute(
            "INSERT INTO media (id, data, media_type, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, data, media_type.trim(), now()],
        )?;

        debug!("Stored media {} ({} bytes, {})", id, data.len(), media_type);
        Ok(id)
    }
}

pub(crate) fn media_exists(conn: &Connection, media_id: &str) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM media WHERE id = ?1)",
        [media_id],
        |row| row.get(0),
    )?)
}

fn validate_media(data: &[u8], media_type: &str) -> StoreResult<()> {
    if data.is_empty() {
        return Err(StoreError::Validation("media payload is empty".into()));
    }
    let well_formed = media_type
        .trim()
        .split_once('/')
        .is_some_and(|(ty, sub)| !ty.is_empty() && !sub.is_empty() && !sub.contains('/'));
    if !well_formed {
        return Err(StoreError::Validation(format!("bad media type '{}'", media_type)));
    }
    Ok(())
}

fn query_media(conn: &Connection, media_id: &str) -> StoreResult<Option<MediaBlob>> {
    let blob = conn
        .query_row(
            "SELECT id, data, media_type, created_at FROM media WHERE id = ?1",
            [media_id],
            |row| {
                Ok(MediaBlob {
                    id: row.get(0)?,
                    data: row.get(1)?,
                    media_type: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(blob)
}
