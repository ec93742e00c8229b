//! User lookups.

use sqlx::{FromRow, PgExecutor};

use crate::error::Result;
use crate::types::instrument::User;
use crate::types::order::UserId;

#[derive(FromRow)]
pub struct UserRow {
    pub id: i64,
    pub email: String,
    pub account_number: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            account_number: row.account_number,
        }
    }
}

pub async fn get_user_by_id<'e, E: PgExecutor<'e>>(executor: E, id: UserId) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, email, account_number FROM users WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(User::from))
}

/// Lock the user row. All balance checks for one user queue behind this lock, so
/// the ledger reads that follow observe rows committed by the previous holder.
pub async fn lock_user<'e, E: PgExecutor<'e>>(executor: E, id: UserId) -> Result<bool> {
    let locked = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(locked.is_some())
}
