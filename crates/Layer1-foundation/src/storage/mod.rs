//! Storage module for DeepCtx
//!
//! - `kv`: 네임스페이스 키-값 저장소 trait + 메모리 구현
//! - `sqlite`: SQLite 기반 영속 KV (원자적 batch = 트랜잭션)
//! - `json`: JSON - 설정 파일 저장/로드

mod json;
mod kv;
mod sqlite;

// KV Storage (컨텍스트 데이터)
pub use kv::{get_json, scan_json, KvOp, KvStore, MemoryKv};
pub use sqlite::SqliteKv;

// JSON Storage (설정)
pub use json::JsonStore;
