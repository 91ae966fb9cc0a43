//! Short, printable identifiers for every stored entity.
//!
//! The default [`IdScheme::Prefixed`] draws a kind-specific prefix followed by
//! digits (or, for users, 12 alphanumerics) and checks the candidate against
//! the target table, retrying up to [`MAX_ATTEMPTS`] times. [`IdScheme::Random`]
//! uses 128 random bits instead and skips the check entirely.

use std::fmt;
use std::sync::Mutex;

use anyhow::anyhow;
use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rusqlite::Connection;
use tracing::warn;

use crate::error::StoreResult;

pub const MAX_ATTEMPTS: usize = 10;

const USER_ID_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    User,
    Conversation,
    Message,
    Media,
    Reaction,
    Comment,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::User => "",
            Self::Conversation => "cv",
            Self::Message => "msg",
            Self::Media => "med",
            Self::Reaction => "rx",
            Self::Comment => "cm",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Conversation => "conversations",
            Self::Message => "messages",
            Self::Media => "media",
            Self::Reaction => "reactions",
            Self::Comment => "comments",
        }
    }

    fn digit_count(&self) -> usize {
        match self {
            Self::User => 0,
            Self::Conversation | Self::Media => 10,
            Self::Message | Self::Reaction | Self::Comment => 12,
        }
    }

    fn random_prefix(&self) -> &'static str {
        match self {
            Self::User => "u",
            other => other.prefix(),
        }
    }

    /// Whether `id` has the textual shape of this kind under either scheme.
    pub fn matches(&self, id: &str) -> bool {
        let prefixed = match self {
            Self::User => id.len() == USER_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric()),
            _ => id.strip_prefix(self.prefix()).is_some_and(|rest| {
                rest.len() == self.digit_count() && rest.bytes().all(|b| b.is_ascii_digit())
            }),
        };
        let random = id.strip_prefix(self.random_prefix()).is_some_and(|rest| {
            rest.len() == 32 && rest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        });
        prefixed || random
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Conversation => "conversation",
            Self::Message => "message",
            Self::Media => "media",
            Self::Reaction => "reaction",
            Self::Comment => "comment",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdScheme {
    #[default]
    Prefixed,
    Random,
}

impl std::str::FromStr for IdScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prefixed" => Ok(Self::Prefixed),
            "random" => Ok(Self::Random),
            other => Err(anyhow!("unknown id scheme '{}'", other)),
        }
    }
}

pub struct IdGenerator {
    scheme: IdScheme,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl IdGenerator {
    pub fn new(scheme: IdScheme, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            scheme,
            rng: Mutex::new(rng),
        }
    }

    pub fn from_os_rng(scheme: IdScheme) -> Self {
        Self::new(scheme, Box::new(StdRng::from_os_rng()))
    }

    pub fn seeded(scheme: IdScheme, seed: u64) -> Self {
        Self::new(scheme, Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn scheme(&self) -> IdScheme {
        self.scheme
    }

    pub fn generate(&self, conn: &Connection, kind: IdKind) -> StoreResult<String> {
        match self.scheme {
            IdScheme::Random => Ok(self.draw_random(kind)?),
            IdScheme::Prefixed => {
                for attempt in 1..=MAX_ATTEMPTS {
                    let candidate = self.draw_prefixed(kind)?;
                    if !id_exists(conn, kind, &candidate)? {
                        return Ok(candidate);
                    }
                    warn!("{} id collision on {} (attempt {})", kind, candidate, attempt);
                }
                Err(anyhow!(
                    "identifier space exhausted for {} after {} attempts",
                    kind,
                    MAX_ATTEMPTS
                )
                .into())
            }
        }
    }

    fn draw_prefixed(&self, kind: IdKind) -> anyhow::Result<String> {
        let mut guard = self.rng.lock().map_err(|e| anyhow!("RNG lock poisoned: {}", e))?;
        let rng: &mut dyn RngCore = &mut **guard;

        let id = match kind {
            IdKind::User => (0..USER_ID_LEN)
                .map(|_| char::from(rng.sample(Alphanumeric)))
                .collect::<String>(),
            _ => {
                let mut id = String::with_capacity(kind.prefix().len() + kind.digit_count());
                id.push_str(kind.prefix());
                for _ in 0..kind.digit_count() {
                    id.push(char::from(b'0' + rng.random_range(0..10u8)));
                }
                id
            }
        };
        Ok(id)
    }

    fn draw_random(&self, kind: IdKind) -> anyhow::Result<String> {
        let mut bytes = [0u8; 16];
        self.rng
            .lock()
            .map_err(|e| anyhow!("RNG lock poisoned: {}", e))?
            .fill_bytes(&mut bytes);
        let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
        Ok(format!("{}{}", kind.random_prefix(), uuid.simple()))
    }
}

fn id_exists(conn: &Connection, kind: IdKind, id: &str) -> StoreResult<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", kind.table());
    Ok(conn.query_row(&sql, [id], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;

    /// Always yields zero, so every prefixed draw is the same candidate.
    struct ZeroRng;

    impl RngCore for ZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, dst: &mut [u8]) {
            dst.fill(0);
        }
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run(&conn).unwrap();
        conn
    }

    #[test]
    fn prefixed_ids_match_their_kind() {
        let conn = conn();
        let ids = IdGenerator::seeded(IdScheme::Prefixed, 7);
        for kind in [
            IdKind::User,
            IdKind::Conversation,
            IdKind::Message,
            IdKind::Media,
            IdKind::Reaction,
            IdKind::Comment,
        ] {
            let id = ids.generate(&conn, kind).unwrap();
            assert!(kind.matches(&id), "{} does not match {}", id, kind);
        }
    }

    #[test]
    fn random_ids_match_their_kind() {
        let conn = conn();
        let ids = IdGenerator::seeded(IdScheme::Random, 7);
        let id = ids.generate(&conn, IdKind::Message).unwrap();
        assert!(id.starts_with("msg"));
        assert_eq!(id.len(), 3 + 32);
        assert!(IdKind::Message.matches(&id));
        assert!(!IdKind::Conversation.matches(&id));
    }

    #[test]
    fn same_seed_gives_same_sequence() {
        let conn = conn();
        let a = IdGenerator::seeded(IdScheme::Prefixed, 42);
        let b = IdGenerator::seeded(IdScheme::Prefixed, 42);
        assert_eq!(
            a.generate(&conn, IdKind::Conversation).unwrap(),
            b.generate(&conn, IdKind::Conversation).unwrap()
        );
    }

    #[test]
    fn exhausts_after_bounded_collisions() {
        let conn = conn();
        let ids = IdGenerator::new(IdScheme::Prefixed, Box::new(ZeroRng));

        let first = ids.generate(&conn, IdKind::Media).unwrap();
        assert_eq!(first, "med0000000000");
        conn.execute(
            "INSERT INTO media (id, data, media_type, created_at) VALUES (?1, x'00', 'image/png', '2024-01-01')",
            [&first],
        )
        .unwrap();

        let err = ids.generate(&conn, IdKind::Media).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn random_scheme_never_checks_the_table() {
        let conn = conn();
        let ids = IdGenerator::new(IdScheme::Random, Box::new(ZeroRng));
        let a = ids.generate(&conn, IdKind::User).unwrap();
        assert!(a.starts_with('u'));
        assert!(IdKind::User.matches(&a));
    }

    #[test]
    fn scheme_parses_from_config_strings() {
        assert_eq!("Random".parse::<IdScheme>().unwrap(), IdScheme::Random);
        assert_eq!(" prefixed ".parse::<IdScheme>().unwrap(), IdScheme::Prefixed);
        assert!("sequential".parse::<IdScheme>().is_err());
    }
}
