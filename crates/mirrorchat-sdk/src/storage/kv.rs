//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 保存同步游标、追赶检查点、通知计数快照和时间线锚点。
//! 每个用户一个独立的 Tree（`user_{user_id}`），值统一用 JSON 编码。

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{MirrorchatSDKError, Result};

/// KV 统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvStats {
    pub key_count: u64,
    pub storage_size: u64,
}

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
    db: Arc<Db>,
    tree: Tree,
}

impl KvStore {
    /// 打开 `{path}` 下的 sled 数据库并选中用户 Tree
    pub async fn open(path: &Path, user_id: &str) -> Result<Self> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| MirrorchatSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，重试几次并退避
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut attempt = 0;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(MirrorchatSDKError::KvStore(format!(
                            "打开 sled 数据库失败: {}",
                            msg
                        )));
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                }
            }
        };

        let tree = db
            .open_tree(format!("user_{}", user_id))
            .map_err(|e| MirrorchatSDKError::KvStore(format!("打开用户 Tree 失败: {}", e)))?;
        tracing::info!("用户 KV Tree 初始化完成: {}", user_id);

        Ok(Self {
            path: path.to_path_buf(),
            db: Arc::new(db),
            tree,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| MirrorchatSDKError::Serialization(format!("序列化值失败: {}", e)))?;
        self.tree
            .insert(key, value_bytes)
            .map_err(|e| MirrorchatSDKError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self
            .tree
            .get(key)
            .map_err(|e| MirrorchatSDKError::KvStore(format!("获取键值对失败: {}", e)))?;
        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes).map_err(|e| {
                    MirrorchatSDKError::Serialization(format!("反序列化值失败: {}", e))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let removed = self
            .tree
            .remove(key)
            .map_err(|e| MirrorchatSDKError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(removed.is_some())
    }

    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .contains_key(key)
            .map_err(|e| MirrorchatSDKError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 获取指定前缀的所有键值对
    pub async fn scan_prefix<V>(&self, prefix: &str) -> Result<Vec<(String, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value_bytes) =
                item.map_err(|e| MirrorchatSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;
            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| MirrorchatSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
            results.push((String::from_utf8_lossy(&key).into_owned(), value));
        }
        Ok(results)
    }

    /// 删除指定前缀的所有键，返回删除数量
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) =
                item.map_err(|e| MirrorchatSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;
            batch.remove(key);
            count += 1;
        }
        self.tree
            .apply_batch(batch)
            .map_err(|e| MirrorchatSDKError::KvStore(format!("批量删除失败: {}", e)))?;
        Ok(count)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| MirrorchatSDKError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<KvStats> {
        let storage_size = self
            .db
            .size_on_disk()
            .map_err(|e| MirrorchatSDKError::KvStore(format!("获取存储大小失败: {}", e)))?;
        Ok(KvStats {
            key_count: self.tree.len() as u64,
            storage_size,
        })
    }
}
