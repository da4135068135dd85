use crate::application::repos::RepoError;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::PoolTimedOut => RepoError::Unavailable {
            message: "timed out acquiring a pooled connection".to_string(),
        },
        sqlx::Error::PoolClosed => RepoError::Unavailable {
            message: "connection pool is closed".to_string(),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            RepoError::shape(err.to_string())
        }
        sqlx::Error::Database(db)
            if db.message().contains("canceling statement due to statement timeout")
                || db
                    .message()
                    .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        other => RepoError::from_persistence(other),
    }
}
