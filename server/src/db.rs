//! Repository layer over SQLite.
//!
//! Typed CRUD for users, conversations, and messages. The schema keeps the
//! invariants the rest of the server relies on: one conversation per
//! unordered participant pair, monotonic message status, `last`/`total`
//! maintained on every insert and delete, and pin bounds per user.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ChatError, ChatResult};
use crate::models::{
    ContentEnvelope, Conversation, ConversationCounts, ConversationScope, Message, MessageStatus,
    Participant, ParticipantRole, ParticipantStatus, Reaction, ReactionSlot, Reactions,
    RegisterKeysRequest, ReplyPreview, TrustKind, User, UserStatus,
};

/// Milliseconds since the Unix epoch. All repository timestamps use this.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Single-field user updates the edit endpoints route through.
#[derive(Debug, Clone)]
pub enum UserField {
    Name(String),
    Avatar(String),
    Status(UserStatus),
    Verified(bool),
}

/// Conversation listing filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationFilter {
    All,
    Requested,
    Trusted,
    Unread,
    Pins,
}

impl ConversationFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(ConversationFilter::All),
            "requested" => Some(ConversationFilter::Requested),
            "trusted" => Some(ConversationFilter::Trusted),
            "unread" => Some(ConversationFilter::Unread),
            "pins" => Some(ConversationFilter::Pins),
            _ => None,
        }
    }
}

/// Canonical key for an unordered participant set; backs the
/// one-conversation-per-pair uniqueness index.
pub fn pair_key(hexes: &[String]) -> String {
    let mut sorted: Vec<&str> = hexes.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(":")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(url: &str) -> ChatResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ChatError::Backend(format!("database url: {e}")))?
            .create_if_missing(true);

        // An in-memory database lives and dies with its connection; pin the
        // pool to one connection that is never reaped.
        let mut pool_options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> ChatResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                hex TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                avatar TEXT NOT NULL DEFAULT '',
                verified INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                public_key TEXT NOT NULL,
                encrypted_private_key TEXT NOT NULL,
                private_key_nonce TEXT NOT NULL,
                passcode_salt TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                hex TEXT PRIMARY KEY NOT NULL,
                pair_key TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL DEFAULT 'request',
                scope TEXT NOT NULL DEFAULT 'user',
                from_hex TEXT NOT NULL,
                last_id TEXT,
                unread INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                conversation_hex TEXT NOT NULL,
                user_hex TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                status TEXT NOT NULL DEFAULT 'active',
                online INTEGER NOT NULL DEFAULT 0,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (conversation_hex, user_hex),
                FOREIGN KEY (conversation_hex) REFERENCES conversations (hex) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pins (
                user_hex TEXT NOT NULL,
                conversation_hex TEXT NOT NULL,
                pinned_at INTEGER NOT NULL,
                PRIMARY KEY (user_hex, conversation_hex),
                FOREIGN KEY (conversation_hex) REFERENCES conversations (hex) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deletions (
                user_hex TEXT NOT NULL,
                conversation_hex TEXT NOT NULL,
                deleted_at INTEGER NOT NULL,
                PRIMARY KEY (user_hex, conversation_hex),
                FOREIGN KEY (conversation_hex) REFERENCES conversations (hex) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY NOT NULL,
                conversation_hex TEXT NOT NULL,
                kind TEXT NOT NULL,
                msg_type TEXT NOT NULL,
                parent TEXT,
                user_hex TEXT NOT NULL,
                recipient_content TEXT NOT NULL,
                sender_content TEXT NOT NULL,
                status TEXT NOT NULL,
                attachments TEXT,
                images TEXT,
                videos TEXT,
                audio TEXT,
                reaction_from TEXT,
                reaction_to TEXT,
                reply TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (conversation_hex) REFERENCES conversations (hex) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_participants_user ON participants (user_hex)",
            "CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations (updated_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_hex, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages (parent)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ── User operations ──

    pub async fn create_user(&self, hex: &str, keys: &RegisterKeysRequest) -> ChatResult<User> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO users (hex, public_key, encrypted_private_key, private_key_nonce,
                               passcode_salt, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(hex)
        .bind(&keys.public_key)
        .bind(&keys.encrypted_private_key)
        .bind(&keys.private_key_nonce)
        .bind(&keys.passcode_salt)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.find_user(hex).await,
            Err(err) if is_unique_violation(&err) => {
                Err(ChatError::Conflict("User already exists".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_user(&self, hex: &str) -> ChatResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE hex = ?")
            .bind(hex)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ChatError::NotFound("User not found".into()))?;
        row_to_user(&row)
    }

    pub async fn user_exists(&self, hex: &str) -> ChatResult<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE hex = ?")
            .bind(hex)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn update_user_keys(&self, hex: &str, keys: &RegisterKeysRequest) -> ChatResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET public_key = ?, encrypted_private_key = ?, private_key_nonce = ?,
                passcode_salt = ?, updated_at = ?
            WHERE hex = ?
            "#,
        )
        .bind(&keys.public_key)
        .bind(&keys.encrypted_private_key)
        .bind(&keys.private_key_nonce)
        .bind(&keys.passcode_salt)
        .bind(now_ms())
        .bind(hex)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound("User not found".into()));
        }
        Ok(())
    }

    pub async fn update_user_field(&self, hex: &str, field: UserField) -> ChatResult<()> {
        let now = now_ms();
        let query = match &field {
            UserField::Name(name) => sqlx::query("UPDATE users SET name = ?, updated_at = ? WHERE hex = ?").bind(name.clone()),
            UserField::Avatar(avatar) => sqlx::query("UPDATE users SET avatar = ?, updated_at = ? WHERE hex = ?").bind(avatar.clone()),
            UserField::Status(status) => sqlx::query("UPDATE users SET status = ?, updated_at = ? WHERE hex = ?").bind(status.as_str()),
            UserField::Verified(verified) => sqlx::query("UPDATE users SET verified = ?, updated_at = ? WHERE hex = ?").bind(*verified),
        };

        let result = query.bind(now).bind(hex).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound("User not found".into()));
        }
        Ok(())
    }

    pub async fn delete_user(&self, hex: &str) -> ChatResult<()> {
        let result = sqlx::query("DELETE FROM users WHERE hex = ?")
            .bind(hex)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound("User not found".into()));
        }
        Ok(())
    }

    // ── Conversation operations ──

    pub async fn create_conversation(
        &self,
        hex: &str,
        participants: &[(String, ParticipantRole)],
        scope: ConversationScope,
        from: &str,
    ) -> ChatResult<Conversation> {
        let hexes: Vec<String> = participants.iter().map(|(h, _)| h.clone()).collect();
        let key = pair_key(&hexes);
        let now = now_ms();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO conversations (hex, pair_key, kind, scope, from_hex, created_at, updated_at)
            VALUES (?, ?, 'request', ?, ?, ?, ?)
            "#,
        )
        .bind(hex)
        .bind(&key)
        .bind(scope.as_str())
        .bind(from)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            return Err(if is_unique_violation(&err) {
                ChatError::Conflict("Conversation already exists".into())
            } else {
                err.into()
            });
        }

        for (user_hex, role) in participants {
            sqlx::query(
                r#"
                INSERT INTO participants (conversation_hex, user_hex, role, status, online, joined_at)
                VALUES (?, ?, ?, 'active', 0, ?)
                "#,
            )
            .bind(hex)
            .bind(user_hex)
            .bind(role.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.find_conversation(hex).await
    }

    pub async fn find_conversation(&self, hex: &str) -> ChatResult<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE hex = ?")
            .bind(hex)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ChatError::NotFound("Conversation not found".into()))?;
        self.hydrate_conversation(&row).await
    }

    /// The one conversation for an unordered participant set, if any.
    pub async fn find_conversation_by_pair(&self, hexes: &[String]) -> ChatResult<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE pair_key = ?")
            .bind(pair_key(hexes))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ChatError::NotFound("Conversation not found".into()))?;
        self.hydrate_conversation(&row).await
    }

    pub async fn conversation_exists(&self, hexes: &[String]) -> ChatResult<bool> {
        let row = sqlx::query("SELECT 1 FROM conversations WHERE pair_key = ?")
            .bind(pair_key(hexes))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_conversations(
        &self,
        user_hex: &str,
        filter: ConversationFilter,
        page: i64,
        per_page: i64,
    ) -> ChatResult<Vec<Conversation>> {
        let clause = match filter {
            ConversationFilter::All => "",
            ConversationFilter::Requested => "AND c.kind = 'request'",
            ConversationFilter::Trusted => "AND c.kind = 'trusted'",
            ConversationFilter::Unread => "AND c.kind = 'trusted' AND c.unread > 0",
            ConversationFilter::Pins => "",
        };
        let join = match filter {
            ConversationFilter::Pins => {
                "JOIN pins pi ON pi.conversation_hex = c.hex AND pi.user_hex = p.user_hex"
            }
            _ => "",
        };
        let sql = format!(
            r#"
            SELECT c.* FROM conversations c
            JOIN participants p ON p.conversation_hex = c.hex
            {join}
            WHERE p.user_hex = ? {clause}
            ORDER BY c.updated_at DESC
            LIMIT ? OFFSET ?
            "#
        );

        let offset = (page.max(1) - 1) * per_page;
        let rows = sqlx::query(&sql)
            .bind(user_hex)
            .bind(per_page)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in &rows {
            conversations.push(self.hydrate_conversation(row).await?);
        }
        Ok(conversations)
    }

    pub async fn pin(&self, conversation: &str, user_hex: &str, max_pins: i64) -> ChatResult<()> {
        // Presence check first so a bad hex reads as NotFound, not a cap hit.
        self.find_conversation(conversation).await?;

        let pinned: i64 = sqlx::query("SELECT COUNT(*) AS n FROM pins WHERE user_hex = ?")
            .bind(user_hex)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        if pinned >= max_pins {
            return Err(ChatError::Invariant(format!(
                "Cannot pin more than {max_pins} conversations"
            )));
        }

        let result = sqlx::query(
            "INSERT INTO pins (user_hex, conversation_hex, pinned_at) VALUES (?, ?, ?)",
        )
        .bind(user_hex)
        .bind(conversation)
        .bind(now_ms())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(ChatError::Conflict("Conversation already pinned".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn unpin(&self, conversation: &str, user_hex: &str) -> ChatResult<()> {
        let result = sqlx::query("DELETE FROM pins WHERE user_hex = ? AND conversation_hex = ?")
            .bind(user_hex)
            .bind(conversation)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound("Pin not found".into()));
        }
        Ok(())
    }

    /// One-way request → trusted transition.
    pub async fn accept(&self, conversation: &str, user_hex: &str) -> ChatResult<Conversation> {
        let existing = self.find_conversation(conversation).await?;
        if !existing.is_participant(user_hex) {
            return Err(ChatError::Forbidden(
                "Not a participant of this conversation".into(),
            ));
        }

        let result = sqlx::query(
            "UPDATE conversations SET kind = 'trusted', updated_at = ? WHERE hex = ? AND kind = 'request'",
        )
        .bind(now_ms())
        .bind(conversation)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ChatError::Invariant("Conversation already accepted".into()));
        }
        self.find_conversation(conversation).await
    }

    pub async fn counts(&self, user_hex: &str) -> ChatResult<ConversationCounts> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM participants WHERE user_hex = ?",
        )
        .bind(user_hex)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        let unread: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM conversations c
            JOIN participants p ON p.conversation_hex = c.hex
            WHERE p.user_hex = ? AND c.kind = 'trusted' AND c.unread > 0
            "#,
        )
        .bind(user_hex)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        let requested: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM conversations c
            JOIN participants p ON p.conversation_hex = c.hex
            WHERE p.user_hex = ? AND c.kind = 'request' AND c.from_hex != ?
            "#,
        )
        .bind(user_hex)
        .bind(user_hex)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        Ok(ConversationCounts {
            total,
            unread,
            requested,
        })
    }

    /// Per-user tombstone; older messages become invisible to that user.
    pub async fn mark_deleted(&self, conversation: &str, user_hex: &str) -> ChatResult<()> {
        self.find_conversation(conversation).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO deletions (user_hex, conversation_hex, deleted_at) VALUES (?, ?, ?)",
        )
        .bind(user_hex)
        .bind(conversation)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_participant_online(
        &self,
        conversation: &str,
        user_hex: &str,
        online: bool,
    ) -> ChatResult<()> {
        sqlx::query(
            "UPDATE participants SET online = ? WHERE conversation_hex = ? AND user_hex = ?",
        )
        .bind(online)
        .bind(conversation)
        .bind(user_hex)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Message operations ──

    /// Insert with server-assigned timestamps; bumps the conversation's
    /// `last`, `total`, `unread`, and `updatedAt` in the same transaction.
    pub async fn insert_message(&self, message: &Message) -> ChatResult<Message> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_hex, kind, msg_type, parent, user_hex,
                                  recipient_content, sender_content, status, attachments,
                                  images, videos, audio, reaction_from, reaction_to, reply,
                                  created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation)
        .bind(message.kind.as_str())
        .bind(message.message_type.as_str())
        .bind(&message.parent)
        .bind(&message.user)
        .bind(serde_json::to_string(&message.recipient_content)?)
        .bind(serde_json::to_string(&message.sender_content)?)
        .bind(message.status.as_str())
        .bind(to_json_opt(&message.attachments)?)
        .bind(to_json_opt(&message.images)?)
        .bind(to_json_opt(&message.videos)?)
        .bind(&message.audio)
        .bind(message.reactions.from.map(Reaction::as_str))
        .bind(message.reactions.to.map(Reaction::as_str))
        .bind(to_json_opt(&message.reply)?)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            return Err(if is_unique_violation(&err) {
                ChatError::Conflict("Message id already exists".into())
            } else {
                err.into()
            });
        }

        sqlx::query(
            r#"
            UPDATE conversations
            SET last_id = ?, total = total + 1, unread = unread + 1, updated_at = ?
            WHERE hex = ?
            "#,
        )
        .bind(&message.id)
        .bind(message.created_at)
        .bind(&message.conversation)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.find_message(&message.id).await
    }

    pub async fn find_message(&self, id: &str) -> ChatResult<Message> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ChatError::NotFound("Message not found".into()))?;
        row_to_message(&row)
    }

    /// Advance `sent → delivered → read`. Anything else is refused.
    pub async fn update_status(&self, id: &str, status: MessageStatus) -> ChatResult<Message> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET status = ?1, updated_at = ?2
            WHERE id = ?3
              AND ((?1 = 'delivered' AND status = 'sent')
                OR (?1 = 'read' AND status = 'delivered'))
            "#,
        )
        .bind(status.as_str())
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing message from a refused transition.
            self.find_message(id).await?;
            return Err(ChatError::Invariant(
                "Cannot move message status backwards".into(),
            ));
        }
        self.find_message(id).await
    }

    /// Set or clear one reaction slot.
    pub async fn update_reactions(
        &self,
        id: &str,
        slot: ReactionSlot,
        value: Option<Reaction>,
    ) -> ChatResult<Message> {
        let column = match slot {
            ReactionSlot::From => "reaction_from",
            ReactionSlot::To => "reaction_to",
        };
        let sql = format!("UPDATE messages SET {column} = ?, updated_at = ? WHERE id = ?");
        let result = sqlx::query(&sql)
            .bind(value.map(Reaction::as_str))
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound("Message not found".into()));
        }
        self.find_message(id).await
    }

    /// Replace both content envelopes atomically.
    pub async fn update_contents(
        &self,
        id: &str,
        sender: &ContentEnvelope,
        recipient: &ContentEnvelope,
    ) -> ChatResult<Message> {
        let result = sqlx::query(
            "UPDATE messages SET sender_content = ?, recipient_content = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(sender)?)
        .bind(serde_json::to_string(recipient)?)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound("Message not found".into()));
        }
        self.find_message(id).await
    }

    /// Hard delete by the author. Recomputes the conversation's `last`
    /// and `total` when the head message goes away.
    pub async fn delete_message(&self, id: &str, actor: &str) -> ChatResult<Message> {
        let message = self.find_message(id).await?;
        if message.user != actor {
            return Err(ChatError::Invariant(
                "Unauthorized to delete message".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET total = (SELECT COUNT(*) FROM messages WHERE conversation_hex = ?1),
                last_id = (SELECT id FROM messages WHERE conversation_hex = ?1
                           ORDER BY created_at DESC, id DESC LIMIT 1),
                updated_at = ?2
            WHERE hex = ?1
            "#,
        )
        .bind(&message.conversation)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    /// Newest-first history page, filtered by the viewer's tombstone.
    pub async fn page_messages(
        &self,
        conversation: &str,
        viewer: &str,
        page: i64,
        page_size: i64,
    ) -> ChatResult<Vec<Message>> {
        let cutoff: i64 = sqlx::query(
            "SELECT deleted_at FROM deletions WHERE user_hex = ? AND conversation_hex = ?",
        )
        .bind(viewer)
        .bind(conversation)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get("deleted_at"))
        .transpose()?
        .unwrap_or(-1);

        let offset = (page.max(1) - 1) * page_size;
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE conversation_hex = ? AND created_at > ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(conversation)
        .bind(cutoff)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// A fetched history page counts as caught up.
    pub async fn reset_unread(&self, conversation: &str) -> ChatResult<()> {
        sqlx::query("UPDATE conversations SET unread = 0 WHERE hex = ?")
            .bind(conversation)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Hydration ──

    async fn hydrate_conversation(&self, row: &sqlx::sqlite::SqliteRow) -> ChatResult<Conversation> {
        let hex: String = row.try_get("hex")?;

        let participant_rows = sqlx::query(
            "SELECT * FROM participants WHERE conversation_hex = ? ORDER BY joined_at, user_hex",
        )
        .bind(&hex)
        .fetch_all(&self.pool)
        .await?;

        let mut participants = Vec::with_capacity(participant_rows.len());
        for p in &participant_rows {
            participants.push(Participant {
                hex: p.try_get("user_hex")?,
                role: ParticipantRole::parse(&p.try_get::<String, _>("role")?)?,
                status: ParticipantStatus::parse(&p.try_get::<String, _>("status")?)?,
                online: p.try_get("online")?,
                joined_at: p.try_get("joined_at")?,
            });
        }

        let last = match row.try_get::<Option<String>, _>("last_id")? {
            Some(id) => match self.find_message(&id).await {
                Ok(message) => Some(message),
                Err(ChatError::NotFound(_)) => None,
                Err(err) => return Err(err),
            },
            None => None,
        };

        Ok(Conversation {
            hex,
            participants,
            kind: TrustKind::parse(&row.try_get::<String, _>("kind")?)?,
            scope: ConversationScope::parse(&row.try_get::<String, _>("scope")?)?,
            from: row.try_get("from_hex")?,
            last,
            unread: row.try_get("unread")?,
            total: row.try_get("total")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> ChatResult<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(ChatError::from))
        .transpose()
}

fn from_json_opt<T: serde::de::DeserializeOwned>(
    value: Option<String>,
) -> ChatResult<Option<T>> {
    value
        .map(|s| serde_json::from_str(&s).map_err(ChatError::from))
        .transpose()
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> ChatResult<User> {
    Ok(User {
        hex: row.try_get("hex")?,
        name: row.try_get("name")?,
        avatar: row.try_get("avatar")?,
        verified: row.try_get("verified")?,
        status: UserStatus::parse(&row.try_get::<String, _>("status")?)?,
        public_key: row.try_get("public_key")?,
        encrypted_private_key: row.try_get("encrypted_private_key")?,
        private_key_nonce: row.try_get("private_key_nonce")?,
        passcode_salt: row.try_get("passcode_salt")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> ChatResult<Message> {
    let reactions = Reactions {
        from: row
            .try_get::<Option<String>, _>("reaction_from")?
            .map(|s| Reaction::parse(&s))
            .transpose()?,
        to: row
            .try_get::<Option<String>, _>("reaction_to")?
            .map(|s| Reaction::parse(&s))
            .transpose()?,
    };

    Ok(Message {
        id: row.try_get("id")?,
        conversation: row.try_get("conversation_hex")?,
        kind: crate::models::MessageKind::parse(&row.try_get::<String, _>("kind")?)?,
        message_type: crate::models::MessageType::parse(&row.try_get::<String, _>("msg_type")?)?,
        parent: row.try_get("parent")?,
        user: row.try_get("user_hex")?,
        recipient_content: serde_json::from_str(&row.try_get::<String, _>("recipient_content")?)?,
        sender_content: serde_json::from_str(&row.try_get::<String, _>("sender_content")?)?,
        status: MessageStatus::parse(&row.try_get::<String, _>("status")?)?,
        attachments: from_json_opt(row.try_get("attachments")?)?,
        images: from_json_opt(row.try_get("images")?)?,
        videos: from_json_opt(row.try_get("videos")?)?,
        audio: row.try_get("audio")?,
        reactions,
        reply: from_json_opt::<ReplyPreview>(row.try_get("reply")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{generate_hex, ID_BYTES};
    use crate::models::{MessageKind, MessageType};
    use serde_json::json;

    async fn test_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    fn keys() -> RegisterKeysRequest {
        serde_json::from_value(json!({
            "publicKey": "cGs=",
            "encryptedPrivateKey": "c2s=",
            "privateKeyNonce": "bm8=",
            "passcodeSalt": "c2FsdA=="
        }))
        .unwrap()
    }

    async fn seed_conversation(db: &Database, a: &str, b: &str) -> Conversation {
        db.create_user(a, &keys()).await.unwrap();
        db.create_user(b, &keys()).await.unwrap();
        db.create_conversation(
            &generate_hex(ID_BYTES),
            &[
                (a.to_string(), ParticipantRole::Member),
                (b.to_string(), ParticipantRole::Member),
            ],
            ConversationScope::User,
            a,
        )
        .await
        .unwrap()
    }

    fn build_message(conversation: &str, author: &str, created_at: i64) -> Message {
        Message {
            id: generate_hex(ID_BYTES),
            conversation: conversation.to_string(),
            kind: MessageKind::Message,
            message_type: MessageType::All,
            parent: None,
            user: author.to_string(),
            recipient_content: ContentEnvelope {
                encrypted: "E1".into(),
                nonce: "N1".into(),
            },
            sender_content: ContentEnvelope {
                encrypted: "E2".into(),
                nonce: "N2".into(),
            },
            status: MessageStatus::Sent,
            attachments: None,
            images: None,
            videos: None,
            audio: None,
            reactions: Reactions::default(),
            reply: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn duplicate_user_hex_is_a_conflict() {
        let db = test_db().await;
        db.create_user("aa11", &keys()).await.unwrap();
        assert!(matches!(
            db.create_user("aa11", &keys()).await,
            Err(ChatError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn one_conversation_per_unordered_pair() {
        let db = test_db().await;
        seed_conversation(&db, "aa11", "bb22").await;

        // Same pair in the other order must be rejected.
        let err = db
            .create_conversation(
                &generate_hex(ID_BYTES),
                &[
                    ("bb22".to_string(), ParticipantRole::Member),
                    ("aa11".to_string(), ParticipantRole::Member),
                ],
                ConversationScope::User,
                "bb22",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));

        assert!(db
            .conversation_exists(&["bb22".to_string(), "aa11".to_string()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn accept_is_one_way() {
        let db = test_db().await;
        let conv = seed_conversation(&db, "aa11", "bb22").await;
        assert_eq!(conv.kind, TrustKind::Request);

        let accepted = db.accept(&conv.hex, "bb22").await.unwrap();
        assert_eq!(accepted.kind, TrustKind::Trusted);

        assert!(matches!(
            db.accept(&conv.hex, "bb22").await,
            Err(ChatError::Invariant(_))
        ));
        assert!(matches!(
            db.accept(&conv.hex, "cc33").await,
            Err(ChatError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn pin_cap_and_duplicate_pin() {
        let db = test_db().await;
        db.create_user("aa11", &keys()).await.unwrap();

        let mut conversations = Vec::new();
        for i in 0..6 {
            let other = format!("bb2{i}");
            db.create_user(&other, &keys()).await.unwrap();
            let conv = db
                .create_conversation(
                    &generate_hex(ID_BYTES),
                    &[
                        ("aa11".to_string(), ParticipantRole::Member),
                        (other.clone(), ParticipantRole::Member),
                    ],
                    ConversationScope::User,
                    "aa11",
                )
                .await
                .unwrap();
            conversations.push(conv.hex);
        }

        for hex in conversations.iter().take(5) {
            db.pin(hex, "aa11", 5).await.unwrap();
        }

        let err = db.pin(&conversations[5], "aa11", 5).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot pin more than 5 conversations"
        );

        let err = db.pin(&conversations[0], "aa11", 10).await.unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));

        db.unpin(&conversations[0], "aa11").await.unwrap();
        db.pin(&conversations[5], "aa11", 5).await.unwrap();

        let pinned = db
            .list_conversations("aa11", ConversationFilter::Pins, 1, 10)
            .await
            .unwrap();
        assert_eq!(pinned.len(), 5);
    }

    #[tokio::test]
    async fn insert_updates_last_total_unread() {
        let db = test_db().await;
        let conv = seed_conversation(&db, "aa11", "bb22").await;

        let m1 = db
            .insert_message(&build_message(&conv.hex, "aa11", 1000))
            .await
            .unwrap();
        let m2 = db
            .insert_message(&build_message(&conv.hex, "bb22", 2000))
            .await
            .unwrap();

        let conv = db.find_conversation(&conv.hex).await.unwrap();
        assert_eq!(conv.total, 2);
        assert_eq!(conv.unread, 2);
        let last = conv.last.unwrap();
        assert_eq!(last.id, m2.id);
        assert!(last.created_at >= m1.created_at);

        db.reset_unread(&conv.hex).await.unwrap();
        let conv = db.find_conversation(&conv.hex).await.unwrap();
        assert_eq!(conv.unread, 0);
    }

    #[tokio::test]
    async fn status_only_advances() {
        let db = test_db().await;
        let conv = seed_conversation(&db, "aa11", "bb22").await;
        let msg = db
            .insert_message(&build_message(&conv.hex, "aa11", 1000))
            .await
            .unwrap();

        let msg = db
            .update_status(&msg.id, MessageStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);

        let msg = db.update_status(&msg.id, MessageStatus::Read).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Read);

        // Downgrade attempts leave the row untouched.
        let err = db
            .update_status(&msg.id, MessageStatus::Delivered)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Invariant(_)));
        assert_eq!(
            db.find_message(&msg.id).await.unwrap().status,
            MessageStatus::Read
        );

        // Skipping sent → read directly is refused too.
        let other = db
            .insert_message(&build_message(&conv.hex, "aa11", 1100))
            .await
            .unwrap();
        assert!(matches!(
            db.update_status(&other.id, MessageStatus::Read).await,
            Err(ChatError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn reaction_slots_set_and_clear() {
        let db = test_db().await;
        let conv = seed_conversation(&db, "aa11", "bb22").await;
        let msg = db
            .insert_message(&build_message(&conv.hex, "aa11", 1000))
            .await
            .unwrap();

        let msg = db
            .update_reactions(&msg.id, ReactionSlot::To, Some(Reaction::Love))
            .await
            .unwrap();
        assert_eq!(msg.reactions.to, Some(Reaction::Love));
        assert!(msg.reactions.from.is_none());

        let msg = db
            .update_reactions(&msg.id, ReactionSlot::To, None)
            .await
            .unwrap();
        assert!(msg.reactions.to.is_none());
    }

    #[tokio::test]
    async fn delete_enforces_authorship_and_recomputes_last() {
        let db = test_db().await;
        let conv = seed_conversation(&db, "aa11", "bb22").await;
        let m1 = db
            .insert_message(&build_message(&conv.hex, "aa11", 1000))
            .await
            .unwrap();
        let m2 = db
            .insert_message(&build_message(&conv.hex, "aa11", 2000))
            .await
            .unwrap();

        let err = db.delete_message(&m2.id, "bb22").await.unwrap_err();
        assert_eq!(err.to_string(), "Unauthorized to delete message");
        assert!(db.find_message(&m2.id).await.is_ok());

        db.delete_message(&m2.id, "aa11").await.unwrap();
        assert!(matches!(
            db.find_message(&m2.id).await,
            Err(ChatError::NotFound(_))
        ));

        let conv = db.find_conversation(&conv.hex).await.unwrap();
        assert_eq!(conv.total, 1);
        assert_eq!(conv.last.as_ref().unwrap().id, m1.id);

        db.delete_message(&m1.id, "aa11").await.unwrap();
        let conv = db.find_conversation(&conv.hex).await.unwrap();
        assert_eq!(conv.total, 0);
        assert!(conv.last.is_none());
    }

    #[tokio::test]
    async fn pages_newest_first_and_respects_tombstones() {
        let db = test_db().await;
        let conv = seed_conversation(&db, "aa11", "bb22").await;
        for i in 0..5 {
            db.insert_message(&build_message(&conv.hex, "aa11", 1000 + i))
                .await
                .unwrap();
        }

        let page = db.page_messages(&conv.hex, "bb22", 1, 3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert!(page[0].created_at > page[1].created_at);
        assert!(page[1].created_at > page[2].created_at);

        let page2 = db.page_messages(&conv.hex, "bb22", 2, 3).await.unwrap();
        assert_eq!(page2.len(), 2);

        // Tombstone hides the history but keeps the rows.
        db.mark_deleted(&conv.hex, "bb22").await.unwrap();
        assert!(db
            .page_messages(&conv.hex, "bb22", 1, 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(db.page_messages(&conv.hex, "aa11", 1, 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn listings_filter_and_sort() {
        let db = test_db().await;
        db.create_user("aa11", &keys()).await.unwrap();
        db.create_user("bb22", &keys()).await.unwrap();
        db.create_user("cc33", &keys()).await.unwrap();

        let c1 = db
            .create_conversation(
                &generate_hex(ID_BYTES),
                &[
                    ("aa11".to_string(), ParticipantRole::Member),
                    ("bb22".to_string(), ParticipantRole::Member),
                ],
                ConversationScope::User,
                "aa11",
            )
            .await
            .unwrap();
        let c2 = db
            .create_conversation(
                &generate_hex(ID_BYTES),
                &[
                    ("aa11".to_string(), ParticipantRole::Member),
                    ("cc33".to_string(), ParticipantRole::Member),
                ],
                ConversationScope::User,
                "cc33",
            )
            .await
            .unwrap();

        db.accept(&c1.hex, "bb22").await.unwrap();
        db.insert_message(&build_message(&c1.hex, "bb22", now_ms()))
            .await
            .unwrap();

        let all = db
            .list_conversations("aa11", ConversationFilter::All, 1, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        // Most recently updated first: c1 took a message after c2 was made.
        assert_eq!(all[0].hex, c1.hex);
        assert!(all[0].last.is_some());

        let trusted = db
            .list_conversations("aa11", ConversationFilter::Trusted, 1, 10)
            .await
            .unwrap();
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].hex, c1.hex);

        let requested = db
            .list_conversations("aa11", ConversationFilter::Requested, 1, 10)
            .await
            .unwrap();
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].hex, c2.hex);

        let unread = db
            .list_conversations("aa11", ConversationFilter::Unread, 1, 10)
            .await
            .unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].hex, c1.hex);

        let counts = db.counts("aa11").await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.unread, 1);
        assert_eq!(counts.requested, 1); // c2 was initiated by cc33
    }

    #[tokio::test]
    async fn user_field_updates() {
        let db = test_db().await;
        db.create_user("aa11", &keys()).await.unwrap();

        db.update_user_field("aa11", UserField::Name("Ada".into()))
            .await
            .unwrap();
        db.update_user_field("aa11", UserField::Verified(true))
            .await
            .unwrap();
        db.update_user_field("aa11", UserField::Status(UserStatus::Inactive))
            .await
            .unwrap();

        let user = db.find_user("aa11").await.unwrap();
        assert_eq!(user.name, "Ada");
        assert!(user.verified);
        assert_eq!(user.status, UserStatus::Inactive);

        db.delete_user("aa11").await.unwrap();
        assert!(matches!(
            db.find_user("aa11").await,
            Err(ChatError::NotFound(_))
        ));
    }
}
