//! Core Module - 컨텍스트 데이터 모델
//!
//! 모든 레이어에서 공유하는 컨텍스트 아이템과 식별자 타입을 정의합니다.
//!
//! ## 격리 모델
//!
//! ```text
//! user ─┬─ workspace A ─┬─ items/{id}      (ContextItem)
//!       │               └─ {session}/checkpoints, snapshots, branches
//!       └─ workspace B ─── ...             (A와 완전히 격리)
//! ```
//!
//! 워크스페이스 간 아이템 이동은 명시적인 synthesis 연산으로만 가능합니다.

mod types;

pub use types::{
    validate_key_segment, ContextItem, ContextType, ItemFilter, PriorityUpdate, WorkspaceId,
    DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
