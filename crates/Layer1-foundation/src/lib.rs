//! # deepctx-foundation
//!
//! Foundation layer for DeepCtx:
//! - Core: 컨텍스트 아이템, 워크스페이스 ID, 필터
//! - Tokenizer: 문자 기반 토큰 추정 (ASCII/CJK/기타)
//! - Storage: KV 저장소 (SQLite, 메모리), JsonStore (설정)
//! - Config: 통합 설정 (DeepCtxConfig)
//! - Event: 컨텍스트 변경 이벤트 버스
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  deepctx-core (Store, Selector, Compressor, Ledger)     │
//! │                     │                                   │
//! │          ┌──────────┼───────────┐                       │
//! │          ▼          ▼           ▼                       │
//! │     TokenEstimator  KvStore     EventBus                │
//! │                  (sqlite|memory)                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod storage;
pub mod tokenizer;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Core (데이터 모델)
// ============================================================================
pub use core::{
    validate_key_segment, ContextItem, ContextType, ItemFilter, PriorityUpdate, WorkspaceId,
    DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    CheckpointConfig, CompressionConfig, DeepCtxConfig, SelectorConfig, StorageBackend,
    StorageConfig, DEEPCTX_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::{
    // KV (컨텍스트 데이터)
    get_json,
    scan_json,
    JsonStore,
    KvOp,
    KvStore,
    MemoryKv,
    SqliteKv,
};

// ============================================================================
// Event (이벤트 시스템)
// ============================================================================
pub use event::{ContextEvent, ContextEventKind, EventBus, EventBusConfig, EventFilter, EventId};

// ============================================================================
// Tokenizer (토큰 추정)
// ============================================================================
pub use tokenizer::{TokenEstimator, Tokenizer};
