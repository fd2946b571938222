//! Context Engine - 컴포넌트 파사드
//!
//! Store, Selector, Compressor, CheckpointLedger, StatsAggregator를 하나씩 소유하고
//! 호출 순서 규칙을 강제합니다.
//!
//! - 파괴적 교체(압축 커밋, 브랜치 체크아웃) 전에는 항상 체크포인트
//! - 체크포인트 실패 시 `CheckpointFailed`로 중단, 저장소는 그대로
//! - 모든 변경은 `ContextEvent`로 발행
//!
//! ```text
//! preview_compression ─► CompressionResult
//!        │
//!        ▼
//! commit_compression ─► stale? ─► checkpoint ─► replace_if_unchanged ─► event
//! ```

use crate::checkpoint::{
    Branch, BranchId, Checkpoint, CheckpointId, CheckpointLedger, RestoreOutcome,
};
use crate::compressor::{
    CompressionResult, CompressionStrategy, Compressor, Shrinker, TruncatingShrinker,
};
use crate::selector::{SelectOptions, Selection, Selector};
use crate::stats::{ContextStats, StatsAggregator};
use crate::store::{ContextStore, TRUNCATED_FROM_KEY};
use deepctx_foundation::{
    ContextEvent, ContextEventKind, ContextItem, DeepCtxConfig, Error, EventBus, EventFilter,
    ItemFilter, KvStore, MemoryKv, PriorityUpdate, Result, SqliteKv, StorageBackend, WorkspaceId,
};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 합성 출처 메타데이터 키 (`{workspace}/{item}`)
pub const SYNTHESIZED_FROM_KEY: &str = "synthesized_from";

/// 교체 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    /// 교체 전에 생성된 체크포인트 (변경이 없으면 None)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// 교체 후 워크스페이스 상태
    pub items: Vec<ContextItem>,
}

/// 컨텍스트 엔진
pub struct ContextEngine {
    store: Arc<ContextStore>,
    selector: Arc<Selector>,
    compressor: Arc<Compressor>,
    ledger: Arc<CheckpointLedger>,
    stats: StatsAggregator,
    events: Arc<EventBus>,
    default_strategy: CompressionStrategy,
    config: DeepCtxConfig,
}

impl ContextEngine {
    /// 설정에 지정된 백엔드로 생성
    pub fn from_config(config: DeepCtxConfig) -> Result<Self> {
        let backend: Arc<dyn KvStore> = match config.storage.backend {
            StorageBackend::Sqlite => Arc::new(SqliteKv::open(&config.data_dir())?),
            StorageBackend::Memory => Arc::new(MemoryKv::new()),
        };
        Self::new(backend, config)
    }

    /// 메모리 백엔드 + 기본 설정 (테스트용)
    pub fn in_memory() -> Result<Self> {
        Self::new(
            Arc::new(MemoryKv::new()),
            DeepCtxConfig::new().with_backend(StorageBackend::Memory),
        )
    }

    pub fn new(backend: Arc<dyn KvStore>, config: DeepCtxConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(
            ContextStore::new(backend, config.user_id())
                .with_max_item_tokens(config.storage.max_item_tokens),
        );
        let selector = Arc::new(Selector::new(store.clone(), config.selector.clone()));
        let compressor = Arc::new(
            Compressor::new(Arc::new(TruncatingShrinker::new()))
                .with_timeout(config.compression.shrink_timeout()),
        );
        let ledger = Arc::new(
            CheckpointLedger::new(store.clone())
                .with_max_per_session(config.checkpoints.max_per_session),
        );
        let stats = StatsAggregator::new(store.clone(), selector.clone());
        let default_strategy =
            CompressionStrategy::from_name(&config.compression.default_strategy)?;

        Ok(Self {
            store,
            selector,
            compressor,
            ledger,
            stats,
            events: Arc::new(EventBus::new()),
            default_strategy,
            config,
        })
    }

    /// shrink 협력자 교체
    pub fn with_shrinker(mut self, shrinker: Arc<dyn Shrinker>) -> Self {
        self.compressor = Arc::new(
            Compressor::new(shrinker).with_timeout(self.config.compression.shrink_timeout()),
        );
        self
    }

    /// 체크포인트 원장 교체
    pub fn with_ledger(mut self, ledger: CheckpointLedger) -> Self {
        self.ledger = Arc::new(ledger);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn compressor(&self) -> &Arc<Compressor> {
        &self.compressor
    }

    pub fn ledger(&self) -> &Arc<CheckpointLedger> {
        &self.ledger
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &DeepCtxConfig {
        &self.config
    }

    pub fn default_strategy(&self) -> &CompressionStrategy {
        &self.default_strategy
    }

    async fn emit(&self, ws: &WorkspaceId, kind: ContextEventKind) {
        self.events.publish(ContextEvent::new(ws.as_str(), kind)).await;
    }

    /// 최근 변경 이벤트 (최신순, 최대 `limit`개)
    pub async fn recent_events(
        &self,
        filter: &EventFilter,
        limit: Option<usize>,
    ) -> Vec<ContextEvent> {
        let mut events = self.events.search_history(filter).await;
        events.reverse();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }

    // ========================================================================
    // Store operations
    // ========================================================================

    pub async fn write(&self, ws: &WorkspaceId, item: ContextItem) -> Result<ContextItem> {
        let item = self.store.write(ws, item).await?;
        let truncated_from = item
            .metadata
            .get(TRUNCATED_FROM_KEY)
            .and_then(|v| v.parse().ok());
        self.emit(
            ws,
            ContextEventKind::ItemWritten {
                item_id: item.id.clone(),
                tokens: item.tokens,
                truncated_from,
            },
        )
        .await;
        Ok(item)
    }

    pub async fn read(&self, ws: &WorkspaceId, id: &str) -> Result<ContextItem> {
        self.store.read(ws, id).await
    }

    pub async fn list(
        &self,
        ws: &WorkspaceId,
        filter: Option<&ItemFilter>,
    ) -> Result<Vec<ContextItem>> {
        self.store.list(ws, filter).await
    }

    pub async fn remove(&self, ws: &WorkspaceId, id: &str) -> Result<bool> {
        let removed = self.store.remove(ws, id).await?;
        if removed {
            self.emit(
                ws,
                ContextEventKind::ItemRemoved {
                    item_id: id.to_string(),
                },
            )
            .await;
        }
        Ok(removed)
    }

    pub async fn update_priorities(
        &self,
        ws: &WorkspaceId,
        updates: &[PriorityUpdate],
    ) -> Result<()> {
        self.store.update_priorities(ws, updates).await?;
        self.emit(
            ws,
            ContextEventKind::PrioritiesUpdated {
                count: updates.len(),
            },
        )
        .await;
        Ok(())
    }

    pub async fn delete_workspace(&self, ws: &WorkspaceId) -> Result<()> {
        self.store.delete_workspace(ws).await?;
        self.emit(ws, ContextEventKind::WorkspaceDeleted).await;
        Ok(())
    }

    pub async fn workspaces(&self) -> Result<Vec<WorkspaceId>> {
        self.store.workspaces().await
    }

    // ========================================================================
    // Selection / Stats
    // ========================================================================

    pub async fn select(
        &self,
        ws: &WorkspaceId,
        query: &str,
        token_budget: usize,
        options: &SelectOptions,
    ) -> Result<Vec<ContextItem>> {
        self.selector.select(ws, query, token_budget, options).await
    }

    pub async fn select_scored(
        &self,
        ws: &WorkspaceId,
        query: &str,
        token_budget: usize,
        options: &SelectOptions,
    ) -> Result<Selection> {
        self.selector
            .select_scored(ws, query, token_budget, options)
            .await
    }

    pub async fn stats(&self, ws: &WorkspaceId) -> Result<ContextStats> {
        self.stats.stats(ws).await
    }

    pub async fn stats_with_cancel(
        &self,
        ws: &WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<ContextStats> {
        self.stats.stats_with_cancel(ws, cancel).await
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    pub async fn create_checkpoint(
        &self,
        ws: &WorkspaceId,
        session: &str,
        label: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<CheckpointId> {
        let id = self.ledger.create(ws, session, label, metadata).await?;
        self.emit(
            ws,
            ContextEventKind::CheckpointCreated {
                checkpoint_id: id.to_string(),
                session_id: session.to_string(),
                label: label.to_string(),
            },
        )
        .await;
        Ok(id)
    }

    pub async fn restore_checkpoint(
        &self,
        ws: &WorkspaceId,
        session: &str,
        checkpoint_id: &CheckpointId,
    ) -> Result<RestoreOutcome> {
        let outcome = self.ledger.restore(ws, session, checkpoint_id).await?;
        if let Some(ref branch_id) = outcome.new_branch_id {
            self.emit(
                ws,
                ContextEventKind::CheckpointRestored {
                    checkpoint_id: checkpoint_id.to_string(),
                    branch_id: branch_id.to_string(),
                },
            )
            .await;
        }
        Ok(outcome)
    }

    pub async fn list_checkpoints(
        &self,
        ws: &WorkspaceId,
        session: &str,
    ) -> Result<Vec<Checkpoint>> {
        self.ledger.list(ws, session).await
    }

    pub async fn branches(&self, ws: &WorkspaceId, session: &str) -> Result<Vec<Branch>> {
        self.ledger.branches(ws, session).await
    }

    pub async fn cleanup_checkpoints(
        &self,
        ws: &WorkspaceId,
        session: &str,
        keep_latest: usize,
    ) -> Result<usize> {
        self.ledger.cleanup(ws, session, keep_latest).await
    }

    /// 체크포인트 생성, 실패하면 `CheckpointFailed`
    ///
    /// 체크포인트에 담긴 아이템을 함께 반환합니다. 이어지는 교체는 이 상태와
    /// 비교해서 체크포인트 이후에 끼어든 쓰기를 덮어쓰지 않습니다.
    async fn checkpoint_before(
        &self,
        ws: &WorkspaceId,
        session: &str,
        label: &str,
    ) -> Result<(CheckpointId, Vec<ContextItem>)> {
        let (checkpoint, items) = match self.ledger.capture(ws, session, label, None).await {
            Ok(captured) => captured,
            Err(e @ Error::NamespaceGone(_)) | Err(e @ Error::InvalidInput(_)) => return Err(e),
            Err(e) => {
                warn!(workspace = %ws, session, error = %e, "Checkpoint failed, aborting");
                return Err(Error::CheckpointFailed(e.to_string()));
            }
        };
        self.emit(
            ws,
            ContextEventKind::CheckpointCreated {
                checkpoint_id: checkpoint.id.to_string(),
                session_id: session.to_string(),
                label: label.to_string(),
            },
        )
        .await;
        Ok((checkpoint.id, items))
    }

    // ========================================================================
    // Compression
    // ========================================================================

    /// 현재 워크스페이스 압축 미리보기 (저장소 변경 없음)
    pub async fn preview_compression(
        &self,
        ws: &WorkspaceId,
        strategy: &CompressionStrategy,
        target_tokens: usize,
    ) -> Result<CompressionResult> {
        let cancel = CancellationToken::new();
        self.preview_compression_with_cancel(ws, strategy, target_tokens, &cancel)
            .await
    }

    pub async fn preview_compression_with_cancel(
        &self,
        ws: &WorkspaceId,
        strategy: &CompressionStrategy,
        target_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<CompressionResult> {
        let items = self.store.list(ws, None).await?;
        self.compressor
            .compress_with_cancel(&items, strategy, target_tokens, cancel)
            .await
    }

    /// 압축 결과 커밋
    ///
    /// 워크스페이스가 `result.original`과 다르면 `Conflict`.
    /// 체크포인트가 먼저 기록되고, 실패하면 아무것도 바꾸지 않습니다.
    pub async fn commit_compression(
        &self,
        ws: &WorkspaceId,
        session: &str,
        result: &CompressionResult,
    ) -> Result<CommitOutcome> {
        let live = self.store.list(ws, None).await?;
        if live != result.original {
            return Err(Error::Conflict(format!(
                "workspace '{}' changed since the compression was computed",
                ws
            )));
        }

        if !result.has_changes() {
            return Ok(CommitOutcome {
                checkpoint_id: None,
                items: live,
            });
        }

        let label = format!("before {} compression", result.strategy);
        let (checkpoint_id, _) = self.checkpoint_before(ws, session, &label).await?;

        let items = self
            .store
            .replace_if_unchanged(ws, &result.original, result.compressed.clone())
            .await?;

        info!(
            workspace = %ws,
            checkpoint = %checkpoint_id,
            original_tokens = result.original_tokens,
            compressed_tokens = result.compressed_tokens,
            "Compression committed"
        );
        self.emit(
            ws,
            ContextEventKind::ContextReplaced {
                previous_items: result.original.len(),
                items: items.len(),
                previous_tokens: result.original_tokens,
                tokens: result.compressed_tokens,
                checkpoint_id: Some(checkpoint_id.to_string()),
            },
        )
        .await;

        Ok(CommitOutcome {
            checkpoint_id: Some(checkpoint_id),
            items,
        })
    }

    /// 미리보기 + 커밋
    pub async fn compress_and_commit(
        &self,
        ws: &WorkspaceId,
        session: &str,
        strategy: &CompressionStrategy,
        target_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<(CompressionResult, CommitOutcome)> {
        let result = self
            .preview_compression_with_cancel(ws, strategy, target_tokens, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let outcome = self.commit_compression(ws, session, &result).await?;
        Ok((result, outcome))
    }

    // ========================================================================
    // Branch checkout
    // ========================================================================

    /// 브랜치 상태로 워크스페이스 교체 (현재 상태는 체크포인트로 남김)
    ///
    /// 체크포인트 이후 워크스페이스가 바뀌었으면 `Conflict`로 실패하고 아무것도 바꾸지 않습니다.
    pub async fn checkout_branch(
        &self,
        ws: &WorkspaceId,
        session: &str,
        branch_id: &BranchId,
    ) -> Result<CommitOutcome> {
        let branch = self.ledger.branch(ws, session, branch_id).await?;

        let label = format!("before checkout {}", branch_id);
        let (checkpoint_id, previous) = self.checkpoint_before(ws, session, &label).await?;

        // 체크포인트 이후 쓰기가 있었다면 덮어쓰지 않고 Conflict
        let items = self
            .store
            .replace_if_unchanged(ws, &previous, branch.items)
            .await?;

        info!(workspace = %ws, branch = %branch_id, items = items.len(), "Branch checked out");
        self.emit(
            ws,
            ContextEventKind::ContextReplaced {
                previous_items: previous.len(),
                items: items.len(),
                previous_tokens: previous.iter().map(|i| i.tokens).sum(),
                tokens: items.iter().map(|i| i.tokens).sum(),
                checkpoint_id: Some(checkpoint_id.to_string()),
            },
        )
        .await;

        Ok(CommitOutcome {
            checkpoint_id: Some(checkpoint_id),
            items,
        })
    }

    // ========================================================================
    // Synthesis (유일한 워크스페이스 간 경로)
    // ========================================================================

    /// 여러 워크스페이스의 아이템을 대상 워크스페이스로 복사
    ///
    /// 복사본은 새 id를 받고 `metadata["synthesized_from"]`에 출처를 기록합니다.
    pub async fn synthesize(
        &self,
        sources: &[WorkspaceId],
        target: &WorkspaceId,
        filter: Option<&ItemFilter>,
    ) -> Result<Vec<ContextItem>> {
        if sources.is_empty() {
            return Err(Error::InvalidInput(
                "synthesis needs at least one source workspace".to_string(),
            ));
        }
        if sources.contains(target) {
            return Err(Error::InvalidInput(format!(
                "target workspace '{}' cannot also be a source",
                target
            )));
        }

        let per_source =
            try_join_all(sources.iter().map(|ws| self.store.list(ws, filter))).await?;

        let mut written = Vec::new();
        for (source, items) in sources.iter().zip(per_source) {
            for item in items {
                let origin = format!("{}/{}", source, item.id);
                let copy = ContextItem {
                    id: uuid::Uuid::new_v4().to_string(),
                    workspace_id: target.clone(),
                    sequence: 0,
                    ..item
                }
                .with_metadata(SYNTHESIZED_FROM_KEY, origin);
                written.push(self.store.write(target, copy).await?);
            }
        }

        info!(
            target = %target,
            sources = sources.len(),
            items = written.len(),
            "Context synthesized"
        );
        self.emit(
            target,
            ContextEventKind::Synthesized {
                sources: sources.iter().map(|s| s.to_string()).collect(),
                items: written.len(),
            },
        )
        .await;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepctx_foundation::ContextType;

    fn ws(name: &str) -> WorkspaceId {
        WorkspaceId::new(name)
    }

    async fn seed(engine: &ContextEngine, ws: &WorkspaceId, tokens: &[(usize, u8)]) {
        for &(t, p) in tokens {
            engine
                .write(
                    ws,
                    ContextItem::new(ContextType::Message, "a".repeat(t * 4)).with_priority(p),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_commit_creates_checkpoint_first() {
        let engine = ContextEngine::in_memory().unwrap();
        seed(&engine, &ws("w"), &[(200, 5), (150, 2), (150, 4)]).await;

        let result = engine
            .preview_compression(&ws("w"), &CompressionStrategy::aggressive(), 150)
            .await
            .unwrap();
        let outcome = engine
            .commit_compression(&ws("w"), "s", &result)
            .await
            .unwrap();

        let checkpoint_id = outcome.checkpoint_id.unwrap();
        let snapshot = engine
            .ledger()
            .snapshot(&ws("w"), "s", &checkpoint_id)
            .await
            .unwrap();
        assert_eq!(snapshot, result.original);
        assert!(engine.store().total_tokens(&ws("w")).await.unwrap() <= 150);
    }

    #[tokio::test]
    async fn test_stale_commit_conflicts() {
        let engine = ContextEngine::in_memory().unwrap();
        seed(&engine, &ws("w"), &[(100, 5), (100, 1)]).await;

        let result = engine
            .preview_compression(&ws("w"), &CompressionStrategy::balanced(), 120)
            .await
            .unwrap();
        seed(&engine, &ws("w"), &[(10, 3)]).await;

        let err = engine
            .commit_compression(&ws("w"), "s", &result)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(engine.list_checkpoints(&ws("w"), "s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_published() {
        let engine = ContextEngine::in_memory().unwrap();
        let mut rx = engine.events().receiver();

        let item = engine
            .write(&ws("w"), ContextItem::new(ContextType::Page, "page"))
            .await
            .unwrap();
        engine.remove(&ws("w"), &item.id).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind.name(), "itemWritten");
        assert_eq!(rx.recv().await.unwrap().kind.name(), "itemRemoved");
    }

    #[tokio::test]
    async fn test_synthesize_copies_with_provenance() {
        let engine = ContextEngine::in_memory().unwrap();
        let source = engine
            .write(&ws("a"), ContextItem::new(ContextType::Memory, "fact"))
            .await
            .unwrap();

        let copies = engine.synthesize(&[ws("a")], &ws("b"), None).await.unwrap();
        assert_eq!(copies.len(), 1);
        assert_ne!(copies[0].id, source.id);
        assert_eq!(copies[0].workspace_id, ws("b"));
        assert_eq!(
            copies[0].metadata.get(SYNTHESIZED_FROM_KEY),
            Some(&format!("a/{}", source.id))
        );
        // 원본은 그대로
        assert_eq!(engine.list(&ws("a"), None).await.unwrap(), vec![source]);

        assert!(engine.synthesize(&[ws("b")], &ws("b"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_checkout_branch() {
        let engine = ContextEngine::in_memory().unwrap();
        seed(&engine, &ws("w"), &[(10, 3)]).await;
        let original = engine.list(&ws("w"), None).await.unwrap();

        let cp = engine
            .create_checkpoint(&ws("w"), "s", "start", None)
            .await
            .unwrap();
        seed(&engine, &ws("w"), &[(20, 4)]).await;

        let restored = engine.restore_checkpoint(&ws("w"), "s", &cp).await.unwrap();
        let branch_id = restored.new_branch_id.unwrap();
        assert_eq!(engine.list(&ws("w"), None).await.unwrap().len(), 2);

        let outcome = engine
            .checkout_branch(&ws("w"), "s", &branch_id)
            .await
            .unwrap();
        assert_eq!(outcome.items, original);
        assert!(outcome.checkpoint_id.is_some());
        assert_eq!(engine.list_checkpoints(&ws("w"), "s").await.unwrap().len(), 2);
    }
}
