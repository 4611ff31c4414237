use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorchatSDKError {
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    JsonError(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    // 同步子系统的错误分类
    /// 拉取远端分页失败（网络/远端错误），只中止当前 scope 的同步链
    #[error("Transient fetch error [{scope}]: {message}")]
    TransientFetch { scope: String, message: String },
    /// 写库失败，调用方可重试
    #[error("Store write error: {0}")]
    StoreWrite(String),
    /// 事件仍在等待解密
    #[error("Decryption pending: {event_id}")]
    DecryptionPending { event_id: String },
    /// 事件结构不完整，仍会落库但带错误标记
    #[error("Malformed event {event_id}: {reason}")]
    MalformedEvent { event_id: String, reason: String },
}

impl From<serde_json::Error> for MirrorchatSDKError {
    fn from(error: serde_json::Error) -> Self {
        MirrorchatSDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for MirrorchatSDKError {
    fn from(error: std::io::Error) -> Self {
        MirrorchatSDKError::IO(error.to_string())
    }
}

impl MirrorchatSDKError {
    /// 是否为远端拉取的瞬时错误（由调用方决定是否重试）
    pub fn is_transient(&self) -> bool {
        matches!(self, MirrorchatSDKError::TransientFetch { .. })
    }

    /// 是否为写库错误（含底层 SQLite 错误）
    pub fn is_store_write(&self) -> bool {
        matches!(
            self,
            MirrorchatSDKError::StoreWrite(_)
                | MirrorchatSDKError::SqliteError(_)
                | MirrorchatSDKError::Database(_)
        )
    }

    pub fn transient(scope: impl ToString, message: impl ToString) -> Self {
        MirrorchatSDKError::TransientFetch {
            scope: scope.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorchatSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sync_errors() {
        let fetch = MirrorchatSDKError::transient("!room", "connection reset");
        assert!(fetch.is_transient());
        assert!(!fetch.is_store_write());
        assert_eq!(
            fetch.to_string(),
            "Transient fetch error [!room]: connection reset"
        );

        let write = MirrorchatSDKError::StoreWrite("disk full".into());
        assert!(write.is_store_write());
        assert!(!write.is_transient());
    }
}
