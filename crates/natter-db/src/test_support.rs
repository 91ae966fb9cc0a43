use crate::{Database, IdGenerator, IdScheme};
use natter_types::models::{MessageKind, User};

pub fn db() -> Database {
    Database::open_in_memory(IdGenerator::seeded(IdScheme::Prefixed, 0x5eed)).unwrap()
}

pub fn user(db: &Database, name: &str) -> User {
    db.ensure_user(name).unwrap()
}

pub fn direct(db: &Database, a: &User, b: &User) -> String {
    db.start_conversation(&a.id, &[b.id.clone()], "", false)
        .unwrap()
        .conversation_id
}

pub fn group(db: &Database, title: &str, creator: &User, others: &[&User]) -> String {
    let ids: Vec<String> = others.iter().map(|u| u.id.clone()).collect();
    db.start_conversation(&creator.id, &ids, title, true)
        .unwrap()
        .conversation_id
}

pub fn text(db: &Database, conversation_id: &str, sender: &User, content: &str) -> String {
    db.add_message(conversation_id, &sender.id, MessageKind::Text, content, "text/plain", None)
        .unwrap()
        .id
}

pub fn count(db: &Database, table: &str) -> i64 {
    db.with_conn(|conn| {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?)
    })
    .unwrap()
}
