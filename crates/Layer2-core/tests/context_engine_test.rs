//! ContextEngine 통합 테스트 - 저장/선택/압축/체크포인트 속성 검증
//!
//! `cargo test -p deepctx-core --test context_engine_test`

use async_trait::async_trait;
use deepctx_core::{
    CheckpointLedger, CompressionStrategy, ContextEngine, ContextService, ContextStats,
    MutationState, MutationTracker, Request, SelectOptions, Shrinker,
};
use deepctx_foundation::{
    ContextItem, ContextType, DeepCtxConfig, Error, KvOp, KvStore, MemoryKv, PriorityUpdate,
    Result, StorageBackend, TokenEstimator, WorkspaceId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ws(name: &str) -> WorkspaceId {
    WorkspaceId::new(name)
}

/// ASCII 4글자 = 1토큰
fn text(tokens: usize) -> String {
    "a".repeat(tokens * 4)
}

async fn seed(
    engine: &ContextEngine,
    ws: &WorkspaceId,
    items: &[(usize, u8)],
) -> Vec<ContextItem> {
    let mut written = Vec::new();
    for &(tokens, priority) in items {
        written.push(
            engine
                .write(
                    ws,
                    ContextItem::new(ContextType::Message, text(tokens)).with_priority(priority),
                )
                .await
                .expect("write failed"),
        );
    }
    written
}

// ============================================================================
// Token accounting / isolation
// ============================================================================

#[tokio::test]
async fn test_token_accounting_matches_estimator() {
    let engine = ContextEngine::in_memory().unwrap();
    let estimator = TokenEstimator::new();
    let w = ws("acct");

    engine
        .write(&w, ContextItem::new(ContextType::Page, "Rust ownership rules"))
        .await
        .unwrap();
    engine
        .write(&w, ContextItem::new(ContextType::Memory, "한국어 메모 내용"))
        .await
        .unwrap();
    engine
        .write(&w, ContextItem::new(ContextType::File, text(37)))
        .await
        .unwrap();

    let items = engine.list(&w, None).await.unwrap();
    for item in &items {
        assert_eq!(item.tokens, estimator.estimate(&item.content));
    }

    let stats: ContextStats = engine.stats(&w).await.unwrap();
    assert_eq!(stats.total_items, 3);
    assert_eq!(
        stats.total_tokens,
        items.iter().map(|i| i.tokens).sum::<usize>()
    );
    assert_eq!(
        stats.tokens_by_type.values().sum::<usize>(),
        stats.total_tokens
    );
}

#[tokio::test]
async fn test_workspace_isolation() {
    let engine = ContextEngine::in_memory().unwrap();
    let a = seed(&engine, &ws("a"), &[(10, 3), (20, 4)]).await;
    let b = seed(&engine, &ws("b"), &[(30, 5)]).await;

    assert_eq!(engine.list(&ws("a"), None).await.unwrap(), a);
    assert_eq!(engine.list(&ws("b"), None).await.unwrap(), b);

    // 다른 워크스페이스의 id로는 접근 불가
    assert!(matches!(
        engine.read(&ws("a"), &b[0].id).await,
        Err(Error::NotFound(_))
    ));
    assert!(!engine.remove(&ws("a"), &b[0].id).await.unwrap());

    engine.delete_workspace(&ws("a")).await.unwrap();
    assert_eq!(engine.list(&ws("b"), None).await.unwrap(), b);
}

#[tokio::test]
async fn test_namespace_gone_after_teardown() {
    let engine = ContextEngine::in_memory().unwrap();
    let w = ws("gone");
    let item = seed(&engine, &w, &[(5, 3)]).await.remove(0);

    engine.delete_workspace(&w).await.unwrap();

    assert!(matches!(
        engine.read(&w, &item.id).await,
        Err(Error::NamespaceGone(_))
    ));
    assert!(matches!(
        engine.list(&w, None).await,
        Err(Error::NamespaceGone(_))
    ));
    assert!(matches!(
        engine.delete_workspace(&w).await,
        Err(Error::NamespaceGone(_))
    ));
    assert!(!engine.workspaces().await.unwrap().contains(&w));
}

// ============================================================================
// Selection
// ============================================================================

#[tokio::test]
async fn test_select_scenario() {
    let engine = ContextEngine::in_memory().unwrap();
    let w = ws("select");
    seed(&engine, &w, &[(100, 5), (200, 3), (50, 1)]).await;

    let selected = engine
        .select(&w, "", 250, &SelectOptions::default())
        .await
        .unwrap();

    let mut tokens: Vec<usize> = selected.iter().map(|i| i.tokens).collect();
    tokens.sort_unstable();
    assert_eq!(tokens, vec![50, 100]);
}

#[tokio::test]
async fn test_select_respects_budget() {
    let engine = ContextEngine::in_memory().unwrap();
    let w = ws("budget");
    seed(
        &engine,
        &w,
        &[(13, 1), (70, 5), (41, 2), (9, 4), (120, 3), (33, 5), (64, 2)],
    )
    .await;

    for budget in [0, 5, 9, 50, 100, 200, 349, 1000] {
        let selection = engine
            .select_scored(&w, "", budget, &SelectOptions::default())
            .await
            .unwrap();
        let total: usize = selection.items.iter().map(|s| s.item.tokens).sum();
        assert!(total <= budget, "budget {} exceeded: {}", budget, total);
        assert_eq!(total, selection.total_tokens);
    }

    // 예산이 가장 작은 아이템보다 작으면 빈 결과
    let selection = engine
        .select_scored(&w, "", 8, &SelectOptions::default())
        .await
        .unwrap();
    assert!(selection.items.is_empty());
}

// ============================================================================
// Compression
// ============================================================================

#[tokio::test]
async fn test_aggressive_compression_scenario() {
    let engine = ContextEngine::in_memory().unwrap();
    let w = ws("compress");
    seed(&engine, &w, &[(200, 5), (150, 2), (150, 4)]).await;

    let result = engine
        .preview_compression(&w, &CompressionStrategy::aggressive(), 150)
        .await
        .unwrap();

    assert_eq!(result.original_tokens, 500);
    assert!(result.compressed_tokens <= 150);
    assert!(result.has_changes());
    // 미리보기는 저장소를 바꾸지 않음
    assert_eq!(engine.store().total_tokens(&w).await.unwrap(), 500);
}

#[tokio::test]
async fn test_compression_reduces_and_never_empties() {
    let engine = ContextEngine::in_memory().unwrap();
    let w = ws("shrink");
    seed(&engine, &w, &[(40, 1), (80, 2), (60, 3), (90, 5), (30, 4)]).await;

    for strategy in CompressionStrategy::all() {
        for target in [1, 10, 100, 250, 299, 300, 1000] {
            let result = engine
                .preview_compression(&w, &strategy, target)
                .await
                .unwrap();
            assert!(
                result.compressed_tokens <= result.original_tokens,
                "{} grew at target {}",
                strategy.name,
                target
            );
            assert!(
                !result.compressed.is_empty(),
                "{} emptied at target {}",
                strategy.name,
                target
            );
        }
    }
}

#[tokio::test]
async fn test_compress_and_commit_checkpoints_first() {
    let engine = ContextEngine::in_memory().unwrap();
    let w = ws("commit");
    let before = seed(&engine, &w, &[(100, 1), (100, 4), (100, 5)]).await;

    let (result, outcome) = engine
        .compress_and_commit(
            &w,
            "s1",
            &CompressionStrategy::balanced(),
            150,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.compressed_tokens <= 150);

    let checkpoint_id = outcome.checkpoint_id.expect("checkpoint missing");
    let snapshot = engine
        .ledger()
        .snapshot(&w, "s1", &checkpoint_id)
        .await
        .unwrap();
    assert_eq!(snapshot, before);
    assert_eq!(engine.list(&w, None).await.unwrap(), outcome.items);
}

struct StallingShrinker;

#[async_trait]
impl Shrinker for StallingShrinker {
    async fn shrink(&self, _text: &str, _ratio: f32) -> Result<String> {
        std::future::pending::<()>().await;
        Ok(String::new())
    }
}

#[tokio::test(start_paused = true)]
async fn test_shrink_timeout_degrades_item() {
    let engine = ContextEngine::in_memory()
        .unwrap()
        .with_shrinker(Arc::new(StallingShrinker));
    let w = ws("timeout");
    seed(&engine, &w, &[(100, 5), (100, 4)]).await;

    let result = engine
        .preview_compression(&w, &CompressionStrategy::minimal(), 150)
        .await
        .unwrap();

    assert!(!result.degraded.is_empty());
    assert!(result.compressed_tokens <= 150);
    assert_eq!(result.compressed.len(), 1);
}

#[tokio::test]
async fn test_cancelled_compression_leaves_store_unchanged() {
    let engine = Arc::new(
        ContextEngine::in_memory()
            .unwrap()
            .with_shrinker(Arc::new(StallingShrinker)),
    );
    let w = ws("cancel");
    let before = seed(&engine, &w, &[(100, 5), (100, 4)]).await;

    let cancel = CancellationToken::new();
    let task = {
        let engine = engine.clone();
        let w = w.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            engine
                .compress_and_commit(&w, "s", &CompressionStrategy::minimal(), 150, &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let outcome = task.await.unwrap();
    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert_eq!(engine.list(&w, None).await.unwrap(), before);
    assert!(engine.list_checkpoints(&w, "s").await.unwrap().is_empty());
}

/// 읽기는 되지만 쓰기는 항상 실패하는 저장소
struct ReadOnlyKv(MemoryKv);

impl KvStore for ReadOnlyKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.0.get(key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.0.scan_prefix(prefix)
    }

    fn apply(&self, _batch: Vec<KvOp>) -> Result<()> {
        Err(Error::Storage("disk full".to_string()))
    }
}

#[tokio::test]
async fn test_checkpoint_failure_aborts_commit() {
    let engine = ContextEngine::in_memory().unwrap();
    let failing = Arc::new(ReadOnlyKv(MemoryKv::new()));
    let ledger = CheckpointLedger::with_backend(failing, engine.store().clone());
    let engine = engine.with_ledger(ledger);

    let w = ws("abort");
    let before = seed(&engine, &w, &[(100, 1), (100, 5)]).await;

    let result = engine
        .preview_compression(&w, &CompressionStrategy::aggressive(), 100)
        .await
        .unwrap();
    assert!(result.has_changes());

    let err = engine.commit_compression(&w, "s", &result).await.unwrap_err();
    assert!(matches!(err, Error::CheckpointFailed(_)));
    assert_eq!(engine.list(&w, None).await.unwrap(), before);
}

/// 첫 쓰기를 잠시 붙잡는 저장소 (체크포인트 기록 중에 다른 작업을 끼워 넣기 위함)
struct SlowKv {
    inner: Arc<MemoryKv>,
    entered: Arc<AtomicBool>,
}

impl KvStore for SlowKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.inner.scan_prefix(prefix)
    }

    fn apply(&self, batch: Vec<KvOp>) -> Result<()> {
        if !self.entered.swap(true, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
        self.inner.apply(batch)
    }
}

fn slow_ledger_engine() -> (Arc<ContextEngine>, Arc<MemoryKv>, Arc<AtomicBool>) {
    let kv = Arc::new(MemoryKv::new());
    let engine = ContextEngine::new(
        kv.clone(),
        DeepCtxConfig::new().with_backend(StorageBackend::Memory),
    )
    .unwrap();
    let entered = Arc::new(AtomicBool::new(false));
    let slow = Arc::new(SlowKv {
        inner: kv.clone(),
        entered: entered.clone(),
    });
    let ledger = CheckpointLedger::with_backend(slow, engine.store().clone());
    (Arc::new(engine.with_ledger(ledger)), kv, entered)
}

async fn wait_for(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checkout_never_loses_concurrent_write() {
    let (engine, _kv, entered) = slow_ledger_engine();
    let w = ws("checkout-race");
    seed(&engine, &w, &[(10, 3)]).await;

    // 브랜치 준비 (이 체크포인트 기록이 느린 첫 쓰기를 소비)
    let cp = engine.create_checkpoint(&w, "s", "base", None).await.unwrap();
    seed(&engine, &w, &[(20, 4)]).await;
    let branch = engine
        .restore_checkpoint(&w, "s", &cp)
        .await
        .unwrap()
        .new_branch_id
        .unwrap();
    entered.store(false, Ordering::SeqCst);

    let checkout = {
        let engine = engine.clone();
        let w = w.clone();
        tokio::spawn(async move { engine.checkout_branch(&w, "s", &branch).await })
    };

    wait_for(&entered).await;
    let late = engine
        .write(&w, ContextItem::new(ContextType::Message, "late"))
        .await
        .unwrap();
    let outcome = checkout.await.unwrap();

    let live = engine.list(&w, None).await.unwrap();
    let checkpoints = engine.list_checkpoints(&w, "s").await.unwrap();
    let last = checkpoints.last().unwrap();
    let saved = engine.ledger().snapshot(&w, "s", &last.id).await.unwrap();

    // 늦은 쓰기는 현재 상태나 체크포인트 중 하나에는 반드시 남는다
    let in_live = live.iter().any(|i| i.id == late.id);
    let in_checkpoint = saved.iter().any(|i| i.id == late.id);
    assert!(in_live || in_checkpoint);
    if let Err(e) = outcome {
        assert!(matches!(e, Error::Conflict(_)));
        assert!(in_live);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_during_checkpoint_leaves_no_records() {
    let (engine, kv, entered) = slow_ledger_engine();
    let w = ws("delete-race");
    seed(&engine, &w, &[(10, 3)]).await;

    let create = {
        let engine = engine.clone();
        let w = w.clone();
        tokio::spawn(async move { engine.create_checkpoint(&w, "s", "racing", None).await })
    };

    wait_for(&entered).await;
    engine.delete_workspace(&w).await.unwrap();
    create.await.unwrap().unwrap();

    // 삭제가 체크포인트 기록 뒤에 실행되므로 세션 레코드가 남지 않음
    let leftovers: Vec<String> = kv
        .scan_prefix("")
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .filter(|key| key.contains("/s/"))
        .collect();
    assert!(leftovers.is_empty(), "orphaned records: {:?}", leftovers);
    assert!(matches!(
        engine.list_checkpoints(&w, "s").await,
        Err(Error::NamespaceGone(_))
    ));
}

#[tokio::test]
async fn test_checkpoints_are_kept_until_cleanup() {
    let engine = ContextEngine::in_memory().unwrap();
    let w = ws("retention");
    seed(&engine, &w, &[(10, 3)]).await;

    let first = engine.create_checkpoint(&w, "s", "cp0", None).await.unwrap();
    for i in 1..56 {
        engine
            .create_checkpoint(&w, "s", &format!("cp{}", i), None)
            .await
            .unwrap();
    }

    assert_eq!(engine.list_checkpoints(&w, "s").await.unwrap().len(), 56);
    assert!(engine.restore_checkpoint(&w, "s", &first).await.unwrap().success);

    assert_eq!(engine.cleanup_checkpoints(&w, "s", 10).await.unwrap(), 46);
    assert!(!engine.restore_checkpoint(&w, "s", &first).await.unwrap().success);
}

// ============================================================================
// Priorities / checkpoints
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_priority_update_is_atomic_for_readers() {
    let engine = Arc::new(ContextEngine::in_memory().unwrap());
    let w = ws("atomic");
    let items = seed(&engine, &w, &[(5, 3); 12]).await;
    let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();

    let writer = {
        let engine = engine.clone();
        let w = w.clone();
        tokio::spawn(async move {
            for round in 0..100u32 {
                let priority = if round % 2 == 0 { 1 } else { 5 };
                let updates: Vec<PriorityUpdate> = ids
                    .iter()
                    .map(|id| PriorityUpdate::new(id.clone(), priority))
                    .collect();
                engine.update_priorities(&w, &updates).await.unwrap();
            }
        })
    };

    for _ in 0..200 {
        let listed = engine.list(&w, None).await.unwrap();
        let first = listed[0].priority;
        assert!(
            listed.iter().all(|i| i.priority == first),
            "reader observed a partial priority update"
        );
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    // 존재하지 않는 id가 섞이면 전체가 거부됨
    let listed = engine.list(&w, None).await.unwrap();
    let err = engine
        .update_priorities(
            &w,
            &[
                PriorityUpdate::new(listed[0].id.clone(), 2),
                PriorityUpdate::new("missing", 2),
            ],
        )
        .await;
    assert!(err.is_err());
    assert_eq!(engine.list(&w, None).await.unwrap(), listed);
}

#[tokio::test]
async fn test_restore_is_non_destructive() {
    let engine = ContextEngine::in_memory().unwrap();
    let w = ws("restore");
    let at_checkpoint = seed(&engine, &w, &[(10, 3), (20, 4)]).await;

    let cp = engine.create_checkpoint(&w, "s", "first", None).await.unwrap();
    seed(&engine, &w, &[(30, 5)]).await;
    let head = engine.list(&w, None).await.unwrap();

    let outcome = engine.restore_checkpoint(&w, "s", &cp).await.unwrap();
    assert!(outcome.success);

    // 현재 상태와 체크포인트 목록은 그대로
    assert_eq!(engine.list(&w, None).await.unwrap(), head);
    assert_eq!(engine.list_checkpoints(&w, "s").await.unwrap().len(), 1);

    let branches = engine.branches(&w, "s").await.unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].items, at_checkpoint);
    assert_eq!(branches[0].preserved_head, head);

    // 없는 체크포인트는 실패 결과
    let missing = engine
        .restore_checkpoint(&w, "s", &deepctx_core::CheckpointId::new())
        .await
        .unwrap();
    assert!(!missing.success);
    assert!(missing.new_branch_id.is_none());
}

// ============================================================================
// Protocol / optimistic mutations
// ============================================================================

#[tokio::test]
async fn test_service_rejects_malformed_requests() {
    let service = ContextService::new(Arc::new(ContextEngine::in_memory().unwrap()));

    for line in [
        r#"{"type":"select","workspaceId":"w","tokenBudget":10,"bogus":1}"#,
        r#"{"type":"select","workspaceId":"w"}"#,
        r#"{"type":"stats","workspaceId":""}"#,
        r#"{"type":"select","workspaceId":"w","tokenBudget":10,"options":{"recencyBias":3.0}}"#,
        r#"{"type":"updatePriorities","workspaceId":"w","updates":[{"id":"x","priority":7}]}"#,
        r#"{"type":"previewCompression","workspaceId":"w","strategy":"nuke","targetTokens":5}"#,
    ] {
        let response = service.handle_line(line).await;
        assert_eq!(response.code(), Some("invalid_input"), "accepted: {}", line);
    }
}

#[tokio::test]
async fn test_optimistic_remove_rolls_back_on_failure() {
    let engine = Arc::new(ContextEngine::in_memory().unwrap());
    let service = ContextService::new(engine.clone());
    let w = ws("ui");
    seed(&engine, &w, &[(10, 3), (10, 4)]).await;

    let mut tracker = MutationTracker::new();
    tracker.load(&w, engine.list(&w, None).await.unwrap());
    let before = tracker.view(&w).to_vec();

    // 서버 쪽 워크스페이스가 사라진 상태에서 제거 시도
    let target = before[0].id.clone();
    let id = tracker.begin_remove(&w, &target).unwrap();
    assert_eq!(tracker.view(&w).len(), 1);

    engine.delete_workspace(&w).await.unwrap();
    let response = service.handle(tracker.request(id).unwrap()).await;
    assert_eq!(response.code(), Some("namespace_gone"));

    assert_eq!(tracker.settle(id, &response).unwrap(), MutationState::RolledBack);
    assert_eq!(tracker.view(&w), before.as_slice());
}

#[tokio::test]
async fn test_optimistic_reorder_commits() {
    let engine = Arc::new(ContextEngine::in_memory().unwrap());
    let service = ContextService::new(engine.clone());
    let w = ws("ui-ok");
    let items = seed(&engine, &w, &[(10, 3), (10, 4)]).await;

    let mut tracker = MutationTracker::new();
    tracker.load(&w, items.clone());

    let id = tracker
        .begin_reorder(&w, vec![PriorityUpdate::new(items[0].id.clone(), 5)])
        .unwrap();
    let response = service.handle(tracker.request(id).unwrap()).await;
    assert!(response.is_ok());
    assert_eq!(tracker.settle(id, &response).unwrap(), MutationState::Committed);

    let stored = engine.read(&w, &items[0].id).await.unwrap();
    assert_eq!(stored.priority, 5);
    assert_eq!(tracker.view(&w)[0].id, items[0].id);
}

#[tokio::test]
async fn test_service_compress_round_trip() {
    let service = ContextService::new(Arc::new(ContextEngine::in_memory().unwrap()));
    let w = ws("svc");
    seed(service.engine(), &w, &[(200, 5), (150, 2), (150, 4)]).await;

    let response = service
        .handle(Request::PreviewCompression {
            workspace_id: w.clone(),
            strategy: Some("aggressive".to_string()),
            target_tokens: 150,
        })
        .await;
    let result = serde_json::from_value(response.data().unwrap().clone()).unwrap();

    let response = service
        .handle(Request::CommitCompression {
            workspace_id: w.clone(),
            session_id: "s".to_string(),
            result,
        })
        .await;
    assert!(response.is_ok(), "{:?}", response);
    assert!(response.data().unwrap()["checkpointId"].is_string());
    assert!(service.engine().store().total_tokens(&w).await.unwrap() <= 150);
}
