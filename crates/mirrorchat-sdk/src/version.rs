//! SDK 版本与数据库 schema 版本
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Migration Version** → migrations 文件（文件即版本，由 refinery 自动管理）

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 当前 SDK 支持的最高数据库 migration 版本（refinery_schema_history 的 version）。
/// 由 build.rs 扫描 migrations/ 下 V{version}__*.sql 取最大值生成。
/// 启动时若 DB 版本 > 此值则拒绝打开（防 downgrade 导致 schema 不兼容）。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

/// 编译期解析版本号字符串为 i64（build.rs 只会输出纯数字）
const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_version_matches_embedded_migrations() {
        assert_eq!(parse_db_version("4"), 4);
        assert_eq!(parse_db_version("12"), 12);
        assert!(SDK_DB_VERSION >= 1);
    }
}
