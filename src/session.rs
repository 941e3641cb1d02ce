// Battle session join codes.

use rand::Rng;

use crate::db::{BattleSession, Database};

/// Alphabet for join codes. Visually ambiguous characters (I, O, 0, 1)
/// are excluded.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a join code.
pub const CODE_LENGTH: usize = 6;

/// Generate a random 6-character session code.
pub fn generate_session_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Whether a string has the shape of a join code (length and alphabet).
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

/// Create a session with a freshly generated unique code, retrying on the
/// rare code collision.
pub async fn create_session_with_code(
    db: &Database,
    host_user_id: i64,
    max_players: i64,
    time_limit: i64,
    battle_theme: Option<&str>,
) -> Result<BattleSession, sqlx::Error> {
    const MAX_ATTEMPTS: usize = 5;

    let mut last_err = None;
    for _ in 0..MAX_ATTEMPTS {
        let code = generate_session_code();
        match db
            .create_session(host_user_id, &code, max_players, time_limit, battle_theme)
            .await
        {
            Ok(session) => return Ok(session),
            Err(e) if e.to_string().contains("UNIQUE") => {
                tracing::debug!(code = %code, "Session code collision, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("collision retry loop ran at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_shape() {
        for _ in 0..100 {
            let code = generate_session_code();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(is_valid_code(&code), "bad code: {code}");
        }
    }

    #[test]
    fn test_ambiguous_characters_excluded() {
        for c in ['I', 'O', '0', '1'] {
            assert!(!CODE_ALPHABET.contains(&(c as u8)));
        }
        assert_eq!(CODE_ALPHABET.len(), 32);
    }

    #[test]
    fn test_is_valid_code() {
        assert!(is_valid_code("AB23CD"));
        assert!(!is_valid_code("ab23cd")); // lowercase
        assert!(!is_valid_code("AB23C")); // too short
        assert!(!is_valid_code("AB23CDE")); // too long
        assert!(!is_valid_code("AB10CD")); // ambiguous characters
    }

    #[tokio::test]
    async fn test_create_session_with_code() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let host = db.create_user("host@example.com", "hash", None).await.unwrap();

        let session = create_session_with_code(&db, host.id, 2, 60, Some("retro"))
            .await
            .unwrap();
        assert!(is_valid_code(&session.session_code));
        assert_eq!(session.battle_theme.as_deref(), Some("retro"));

        // The generated code is joinable right away.
        let joinable = db
            .get_joinable_session_by_code(&session.session_code)
            .await
            .unwrap();
        assert!(joinable.is_some());
    }
}
