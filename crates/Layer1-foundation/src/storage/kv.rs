//! Key-value storage abstraction
//!
//! ContextStore와 CheckpointLedger가 사용하는 영속 저장소 인터페이스입니다.
//! `apply`는 batch 전체가 적용되거나 전혀 적용되지 않아야 합니다.

use crate::Result;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// 단일 저장소 연산
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: String, value: String },
    Delete { key: String },
    DeletePrefix { prefix: String },
}

impl KvOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// 값을 JSON으로 직렬화하여 Put 생성
    pub fn put_json<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self> {
        Ok(KvOp::Put {
            key: key.into(),
            value: serde_json::to_string(value)?,
        })
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvOp::Delete { key: key.into() }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        KvOp::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

/// 네임스페이스 키-값 저장소
pub trait KvStore: Send + Sync {
    /// 단일 키 조회
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// prefix로 시작하는 모든 키를 키 순서대로 조회
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// 연산 batch를 원자적으로 적용
    fn apply(&self, batch: Vec<KvOp>) -> Result<()>;

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.apply(vec![KvOp::put(key, value)])
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.apply(vec![KvOp::delete(key)])
    }
}

/// JSON 값 조회
pub fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// prefix 아래 JSON 값 전체 조회
pub fn scan_json<T: DeserializeOwned>(kv: &dyn KvStore, prefix: &str) -> Result<Vec<T>> {
    kv.scan_prefix(prefix)?
        .into_iter()
        .map(|(_, raw)| serde_json::from_str(&raw).map_err(Into::into))
        .collect()
}

// ============================================================================
// MemoryKv
// ============================================================================

/// 인메모리 KV (테스트 및 휘발성 세션용)
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply(&self, batch: Vec<KvOp>) -> Result<()> {
        let mut entries = self.entries.write();
        for op in batch {
            match op {
                KvOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                KvOp::Delete { key } => {
                    entries.remove(&key);
                }
                KvOp::DeletePrefix { prefix } => {
                    entries.retain(|k, _| !k.starts_with(&prefix));
                }
            }
        }
        Ok(())
    }
}
