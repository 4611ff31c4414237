//! 编译期生成 SDK_DB_VERSION（从 migrations/ 目录扫描 V{version}__*.sql 取最大版本号）

use std::env;
use std::fs;
use std::path::Path;

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR");
    let migrations_dir = Path::new(&manifest_dir).join("migrations");
    let mut max_version: i64 = 0;
    if let Ok(entries) = fs::read_dir(&migrations_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(s) = name.to_str() else { continue };
            // refinery 格式: V{version}__{name}.sql
            if !(s.starts_with('V') && s.ends_with(".sql")) {
                continue;
            }
            let rest = &s[1..s.len() - 4];
            if let Some(Ok(v)) = rest.split("__").next().map(|p| p.parse::<i64>()) {
                max_version = max_version.max(v);
            }
        }
    }
    println!("cargo:rustc-env=SDK_DB_VERSION={}", max_version);
    println!("cargo:rerun-if-changed=migrations/");
}
