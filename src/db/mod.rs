// Database access layer (SQLite via sqlx).

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub profile_pic_url: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BattleSession {
    pub id: i64,
    pub host_user_id: i64,
    pub session_code: String,
    pub is_active: bool,
    pub max_players: i64,
    pub current_players: i64,
    pub battle_theme: Option<String>,
    pub time_limit: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BattlePrompt {
    pub id: i64,
    pub session_id: i64,
    pub user_id: i64,
    pub prompt_text: String,
    pub player_position: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GeneratedImage {
    pub id: i64,
    pub prompt_id: i64,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub generation_status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BattleResult {
    pub id: i64,
    pub session_id: i64,
    pub winner_prompt_id: i64,
    pub winner_votes: i64,
    pub total_votes: i64,
    pub created_at: String,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                profile_pic_url TEXT NOT NULL DEFAULT '',
                display_name TEXT,
                bio TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS battle_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_user_id INTEGER NOT NULL REFERENCES users(id),
                session_code TEXT NOT NULL UNIQUE,
                is_active INTEGER NOT NULL DEFAULT 1,
                max_players INTEGER NOT NULL DEFAULT 2,
                current_players INTEGER NOT NULL DEFAULT 1,
                battle_theme TEXT,
                time_limit INTEGER NOT NULL DEFAULT 60,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS battle_prompts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES battle_sessions(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id),
                prompt_text TEXT NOT NULL,
                player_position INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generated_images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prompt_id INTEGER NOT NULL REFERENCES battle_prompts(id) ON DELETE CASCADE,
                image_url TEXT,
                thumbnail_url TEXT,
                generation_status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS battle_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES battle_sessions(id) ON DELETE CASCADE,
                winner_prompt_id INTEGER NOT NULL REFERENCES battle_prompts(id),
                winner_votes INTEGER NOT NULL DEFAULT 0,
                total_votes INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        display_name: Option<&str>,
    ) -> Result<User, sqlx::Error> {
        let row = sqlx::query_as::<_, User>(
            "INSERT INTO users (username, password_hash, display_name) VALUES (?, ?, ?) \
             RETURNING id, username, password_hash, profile_pic_url, display_name, bio, created_at, updated_at",
        )
        .bind(username)
        .bind(password_hash)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, profile_pic_url, display_name, bio, created_at, updated_at \
             FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, profile_pic_url, display_name, bio, created_at, updated_at \
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_user(
        &self,
        id: i64,
        display_name: Option<&str>,
        bio: Option<&str>,
    ) -> Result<Option<User>, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET \
                display_name = COALESCE(?, display_name), \
                bio = COALESCE(?, bio), \
                updated_at = datetime('now') \
             WHERE id = ?",
        )
        .bind(display_name)
        .bind(bio)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_user(id).await
    }

    // ── Battle sessions ───────────────────────────────────────────────

    pub async fn create_session(
        &self,
        host_user_id: i64,
        session_code: &str,
        max_players: i64,
        time_limit: i64,
        battle_theme: Option<&str>,
    ) -> Result<BattleSession, sqlx::Error> {
        let row = sqlx::query_as::<_, BattleSession>(
            "INSERT INTO battle_sessions (host_user_id, session_code, max_players, time_limit, battle_theme) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, host_user_id, session_code, is_active, max_players, current_players, battle_theme, time_limit, created_at, updated_at",
        )
        .bind(host_user_id)
        .bind(session_code)
        .bind(max_players)
        .bind(time_limit)
        .bind(battle_theme)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_session(&self, id: i64) -> Result<Option<BattleSession>, sqlx::Error> {
        let row = sqlx::query_as::<_, BattleSession>(
            "SELECT id, host_user_id, session_code, is_active, max_players, current_players, battle_theme, time_limit, created_at, updated_at \
             FROM battle_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_session_by_code(
        &self,
        code: &str,
    ) -> Result<Option<BattleSession>, sqlx::Error> {
        let row = sqlx::query_as::<_, BattleSession>(
            "SELECT id, host_user_id, session_code, is_active, max_players, current_players, battle_theme, time_limit, created_at, updated_at \
             FROM battle_sessions WHERE session_code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Look up a session by join code. Only active sessions with spare
    /// capacity match; anything else is reported as absent.
    pub async fn get_joinable_session_by_code(
        &self,
        code: &str,
    ) -> Result<Option<BattleSession>, sqlx::Error> {
        let row = sqlx::query_as::<_, BattleSession>(
            "SELECT id, host_user_id, session_code, is_active, max_players, current_players, battle_theme, time_limit, created_at, updated_at \
             FROM battle_sessions \
             WHERE session_code = ? AND is_active = 1 AND current_players < max_players \
             LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Join a session by code: increments the player count, guarded by the
    /// same active/capacity check as the lookup. Returns false if the code
    /// did not match a joinable session.
    pub async fn join_session(&self, code: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE battle_sessions \
             SET current_players = current_players + 1, updated_at = datetime('now') \
             WHERE session_code = ? AND is_active = 1 AND current_players < max_players",
        )
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn close_session(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE battle_sessions SET is_active = 0, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_sessions_for_host(
        &self,
        host_user_id: i64,
    ) -> Result<Vec<BattleSession>, sqlx::Error> {
        let rows = sqlx::query_as::<_, BattleSession>(
            "SELECT id, host_user_id, session_code, is_active, max_players, current_players, battle_theme, time_limit, created_at, updated_at \
             FROM battle_sessions WHERE host_user_id = ? ORDER BY id",
        )
        .bind(host_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Battle prompts ────────────────────────────────────────────────

    pub async fn record_prompt(
        &self,
        session_id: i64,
        user_id: i64,
        prompt_text: &str,
        player_position: i64,
    ) -> Result<BattlePrompt, sqlx::Error> {
        let row = sqlx::query_as::<_, BattlePrompt>(
            "INSERT INTO battle_prompts (session_id, user_id, prompt_text, player_position) \
             VALUES (?, ?, ?, ?) \
             RETURNING id, session_id, user_id, prompt_text, player_position, created_at",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(prompt_text)
        .bind(player_position)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_prompts(&self, session_id: i64) -> Result<Vec<BattlePrompt>, sqlx::Error> {
        let rows = sqlx::query_as::<_, BattlePrompt>(
            "SELECT id, session_id, user_id, prompt_text, player_position, created_at \
             FROM battle_prompts WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Generated images ──────────────────────────────────────────────

    pub async fn record_image(
        &self,
        prompt_id: i64,
        image_url: Option<&str>,
        generation_status: &str,
    ) -> Result<GeneratedImage, sqlx::Error> {
        let row = sqlx::query_as::<_, GeneratedImage>(
            "INSERT INTO generated_images (prompt_id, image_url, generation_status) \
             VALUES (?, ?, ?) \
             RETURNING id, prompt_id, image_url, thumbnail_url, generation_status, created_at",
        )
        .bind(prompt_id)
        .bind(image_url)
        .bind(generation_status)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_images_for_session(
        &self,
        session_id: i64,
    ) -> Result<Vec<GeneratedImage>, sqlx::Error> {
        let rows = sqlx::query_as::<_, GeneratedImage>(
            "SELECT gi.id, gi.prompt_id, gi.image_url, gi.thumbnail_url, gi.generation_status, gi.created_at \
             FROM generated_images gi \
             JOIN battle_prompts bp ON bp.id = gi.prompt_id \
             WHERE bp.session_id = ? ORDER BY gi.id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Battle results ────────────────────────────────────────────────

    pub async fn record_result(
        &self,
        session_id: i64,
        winner_prompt_id: i64,
        winner_votes: i64,
        total_votes: i64,
    ) -> Result<BattleResult, sqlx::Error> {
        let row = sqlx::query_as::<_, BattleResult>(
            "INSERT INTO battle_results (session_id, winner_prompt_id, winner_votes, total_votes) \
             VALUES (?, ?, ?, ?) \
             RETURNING id, session_id, winner_prompt_id, winner_votes, total_votes, created_at",
        )
        .bind(session_id)
        .bind(winner_prompt_id)
        .bind(winner_votes)
        .bind(total_votes)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_result(&self, session_id: i64) -> Result<Option<BattleResult>, sqlx::Error> {
        let row = sqlx::query_as::<_, BattleResult>(
            "SELECT id, session_id, winner_prompt_id, winner_votes, total_votes, created_at \
             FROM battle_results WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    async fn test_user(db: &Database, username: &str) -> User {
        db.create_user(username, "hash", None).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let db = test_db().await;

        let user = db
            .create_user("alice@example.com", "argon2hash", Some("Alice"))
            .await
            .unwrap();
        assert_eq!(user.username, "alice@example.com");
        assert_eq!(user.display_name.as_deref(), Some("Alice"));

        let fetched = db.get_user(user.id).await.unwrap();
        assert!(fetched.is_some());

        let by_name = db.get_user_by_username("alice@example.com").await.unwrap();
        assert_eq!(by_name.unwrap().id, user.id);

        let missing = db.get_user_by_username("nobody@example.com").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let db = test_db().await;
        test_user(&db, "bob@example.com").await;
        let dup = db.create_user("bob@example.com", "otherhash", None).await;
        assert!(dup.is_err());
        assert!(dup.unwrap_err().to_string().contains("UNIQUE"));
    }

    #[tokio::test]
    async fn test_update_user_profile() {
        let db = test_db().await;
        let user = test_user(&db, "carol@example.com").await;

        let updated = db
            .update_user(user.id, Some("Carol"), Some("prompt wrangler"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Carol"));
        assert_eq!(updated.bio.as_deref(), Some("prompt wrangler"));

        // Partial update keeps the other field.
        let updated = db.update_user(user.id, None, Some("new bio")).await.unwrap().unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Carol"));
        assert_eq!(updated.bio.as_deref(), Some("new bio"));

        let missing = db.update_user(999, Some("X"), None).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_session_create_and_lookup() {
        let db = test_db().await;
        let host = test_user(&db, "host@example.com").await;

        let session = db
            .create_session(host.id, "AB23CD", 2, 60, Some("cyberpunk"))
            .await
            .unwrap();
        assert_eq!(session.session_code, "AB23CD");
        assert!(session.is_active);
        assert_eq!(session.current_players, 1);
        assert_eq!(session.max_players, 2);
        assert_eq!(session.time_limit, 60);

        let joinable = db.get_joinable_session_by_code("AB23CD").await.unwrap();
        assert!(joinable.is_some());

        let missing = db.get_joinable_session_by_code("ZZZZZZ").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_join_session_capacity_guard() {
        let db = test_db().await;
        let host = test_user(&db, "host2@example.com").await;
        let session = db
            .create_session(host.id, "JOINME", 2, 60, None)
            .await
            .unwrap();

        // One free slot: the join succeeds.
        assert!(db.join_session("JOINME").await.unwrap());
        let full = db.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(full.current_players, 2);

        // At capacity: further joins and lookups fail.
        assert!(!db.join_session("JOINME").await.unwrap());
        assert!(db
            .get_joinable_session_by_code("JOINME")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_inactive_session_not_joinable() {
        let db = test_db().await;
        let host = test_user(&db, "host3@example.com").await;
        let session = db
            .create_session(host.id, "CLOSED", 4, 60, None)
            .await
            .unwrap();

        assert!(db.close_session(session.id).await.unwrap());
        assert!(db
            .get_joinable_session_by_code("CLOSED")
            .await
            .unwrap()
            .is_none());
        assert!(!db.join_session("CLOSED").await.unwrap());

        assert!(!db.close_session(999).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_session_code_rejected() {
        let db = test_db().await;
        let host = test_user(&db, "host4@example.com").await;
        db.create_session(host.id, "SAME01", 2, 60, None)
            .await
            .unwrap();
        assert!(db
            .create_session(host.id, "SAME01", 2, 60, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_prompts_images_and_result() {
        let db = test_db().await;
        let host = test_user(&db, "p1@example.com").await;
        let guest = test_user(&db, "p2@example.com").await;
        let session = db
            .create_session(host.id, "BATTLE", 2, 60, None)
            .await
            .unwrap();

        let p1 = db
            .record_prompt(session.id, host.id, "a red cube", 1)
            .await
            .unwrap();
        let p2 = db
            .record_prompt(session.id, guest.id, "a blue sphere", 2)
            .await
            .unwrap();

        let prompts = db.list_prompts(session.id).await.unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].prompt_text, "a red cube");
        assert_eq!(prompts[1].player_position, 2);

        db.record_image(p1.id, Some("/images/one.png"), "completed")
            .await
            .unwrap();
        db.record_image(p2.id, None, "failed").await.unwrap();

        let images = db.list_images_for_session(session.id).await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].generation_status, "completed");
        assert_eq!(images[1].generation_status, "failed");
        assert!(images[1].image_url.is_none());

        let result = db
            .record_result(session.id, p1.id, 7, 10)
            .await
            .unwrap();
        assert_eq!(result.winner_votes, 7);
        assert_eq!(result.total_votes, 10);

        let fetched = db.get_result(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.winner_prompt_id, p1.id);

        assert!(db.get_result(999).await.unwrap().is_none());
    }
}
