//! deepctx-core: Context Budget & Compression Engine
//!
//! Layer2 - 워크스페이스별 컨텍스트 저장, 선택, 압축, 체크포인트
//!
//! # 주요 모듈
//!
//! - `store`: 워크스페이스 격리 아이템 저장소 (토큰 회계)
//! - `selector`: 토큰 예산 내 관련성 기반 선택
//! - `compressor`: 전략 기반 압축 (미리보기 → 커밋)
//! - `checkpoint`: 세션 체크포인트, 비파괴 복원, 브랜치
//! - `stats`: 워크스페이스 요약 통계
//! - `engine`: 위 컴포넌트를 묶는 파사드
//! - `protocol`: UI 메시지 채널 (Request / Response)
//! - `mutation`: 낙관적 UI 변경 추적
//!
//! # 사용 예시
//!
//! ```ignore
//! use deepctx_core::{ContextEngine, CompressionStrategy, SelectOptions};
//! use deepctx_foundation::{ContextItem, ContextType, WorkspaceId};
//!
//! let engine = ContextEngine::in_memory()?;
//! let ws = WorkspaceId::new("research");
//!
//! engine.write(&ws, ContextItem::new(ContextType::Page, "...").with_priority(5)).await?;
//!
//! // 예산 내 선택
//! let items = engine.select(&ws, "rust async", 2000, &SelectOptions::default()).await?;
//!
//! // 미리보기 후 커밋 (커밋 전에 체크포인트가 생성됨)
//! let preview = engine.preview_compression(&ws, &CompressionStrategy::balanced(), 1500).await?;
//! let outcome = engine.commit_compression(&ws, "session-1", &preview).await?;
//! ```

mod keys;

pub mod checkpoint;
pub mod compressor;
pub mod engine;
pub mod mutation;
pub mod protocol;
pub mod selector;
pub mod stats;
pub mod store;

pub use checkpoint::{
    Branch, BranchId, Checkpoint, CheckpointId, CheckpointLedger, RestoreOutcome,
};
pub use compressor::{
    CompressionPreview, CompressionResult, CompressionStats, CompressionStrategy, Compressor,
    DegradedItem, ModifiedItem, Shrinker, TruncatingShrinker, DEFAULT_SHRINK_TIMEOUT,
    ELISION_MARKER,
};
pub use engine::{CommitOutcome, ContextEngine, SYNTHESIZED_FROM_KEY};
pub use mutation::{MutationId, MutationKind, MutationState, MutationTracker};
pub use protocol::{ContextService, Request, Response};
pub use selector::{
    lost_in_the_middle, RelevanceScore, ScoredItem, SelectOptions, Selection, Selector, Weights,
};
pub use stats::{ContextStats, StatsAggregator, UNATTRIBUTED_AGENT};
pub use store::{ContextStore, DEFAULT_MAX_ITEM_TOKENS, TRUNCATED_FROM_KEY};

// Re-export foundation
pub use deepctx_foundation::{
    ContextItem, ContextType, DeepCtxConfig, Error, ItemFilter, PriorityUpdate, Result,
    WorkspaceId,
};
