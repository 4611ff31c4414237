//! 数据库迁移与初始化 - 由 refinery 自动管理
//!
//! - Migration 版本 = migrations 文件顺序（V{n}__{name}.sql），编译期嵌入。
//! - 每个版本只执行一次，按版本递增执行，已执行的版本记录在 refinery_schema_history，
//!   进程重启后不会重复执行。
//! - 统一入口 `init_db`：pragmas → 版本校验 → migrate → 版本校验。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;

use crate::error::{MirrorchatSDKError, Result};
use crate::version::SDK_DB_VERSION;

/// refinery 使用的 migration 历史表名
const REFINERY_TABLE: &str = "refinery_schema_history";

/// WAL、NORMAL 同步、内存临时表
const STORE_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA temp_store=MEMORY;
";

pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(STORE_PRAGMAS.trim())
        .map_err(|e| MirrorchatSDKError::Database(format!("设置 PRAGMA 失败: {}", e)))?;
    Ok(())
}

/// 执行内置 migrations（编译期嵌入，自动按版本顺序执行，已执行的跳过）
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let report = embedded::migrations::runner()
        .run(conn)
        .map_err(|e| MirrorchatSDKError::Migration(format!("执行 migration 失败: {}", e)))?;
    for migration in report.applied_migrations() {
        tracing::info!(
            "已应用 migration: version={}, name={}",
            migration.version(),
            migration.name()
        );
    }
    Ok(())
}

/// 读取当前数据库已应用的最高 migration 版本；无表或空表返回 None
pub fn schema_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [REFINERY_TABLE],
            |row| row.get(0),
        )
        .map_err(|e| MirrorchatSDKError::Database(format!("查询 {} 失败: {}", REFINERY_TABLE, e)))?;

    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|e| MirrorchatSDKError::Database(format!("读取 migration 版本失败: {}", e)))?;

    Ok(version.filter(|&v| v > 0))
}

/// 若 DB 版本 > 当前 SDK 支持的最高版本，拒绝使用（防 downgrade 后 schema 不兼容）
fn check_db_version(conn: &Connection) -> Result<()> {
    let Some(v) = schema_version(conn)? else {
        return Ok(());
    };
    if v > SDK_DB_VERSION {
        return Err(MirrorchatSDKError::Migration(format!(
            "数据库版本 {} 高于当前 SDK 支持的最高版本 {}，请升级 SDK 后再打开",
            v, SDK_DB_VERSION
        )));
    }
    Ok(())
}

pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    check_db_version(conn)?;
    run_migrations(conn)?;
    check_db_version(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn creates_every_mirror_table() {
        let dir = TempDir::new().unwrap();
        let mut conn = Connection::open(dir.path().join("events.db")).unwrap();
        init_db(&mut conn).unwrap();

        let tables = table_names(&conn);
        for table in [
            "timeline",
            "messages",
            "messages_edit",
            "messages_primary_edit",
            "messages_search",
            "reactions",
            "threads",
            "members",
            "receipt",
            "pending_redactions",
        ] {
            assert!(tables.contains(&table.to_string()), "缺少表 {}", table);
        }
        assert_eq!(schema_version(&conn).unwrap(), Some(SDK_DB_VERSION));
    }

    #[test]
    fn migrations_are_applied_once_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        {
            let mut conn = Connection::open(&path).unwrap();
            init_db(&mut conn).unwrap();
        }
        let mut conn = Connection::open(&path).unwrap();
        init_db(&mut conn).unwrap();

        let applied: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", REFINERY_TABLE),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(applied, SDK_DB_VERSION);
    }

    #[test]
    fn refuses_newer_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        {
            let mut conn = Connection::open(&path).unwrap();
            init_db(&mut conn).unwrap();
            conn.execute(
                &format!(
                    "INSERT INTO {} (version, name, applied_on, checksum) VALUES (?1, 'future', '', '0')",
                    REFINERY_TABLE
                ),
                [SDK_DB_VERSION + 1],
            )
            .unwrap();
        }
        let mut conn = Connection::open(&path).unwrap();
        assert!(init_db(&mut conn).is_err());
    }
}
