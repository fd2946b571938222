//! Checkpoint Ledger
//!
//! 파괴적 연산(압축 커밋, 브랜치 체크아웃) 전에 복원 지점을 남깁니다.
//! 복원은 비파괴적입니다. 체크포인트 상태로 새 브랜치를 만들 뿐
//! 현재 워크스페이스는 바꾸지 않습니다.
//!
//! ```text
//! create ──► checkpoints/{id} + snapshots/{id}     (한 batch)
//! restore ─► branches/{new}  { items: snapshot, preserved_head: 현재 상태 }
//! ```

use crate::keys::{self, SessionRecord};
use crate::store::ContextStore;
use chrono::{DateTime, Utc};
use deepctx_foundation::{
    get_json, scan_json, ContextItem, Error, KvOp, KvStore, Result, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

// ============================================================================
// Checkpoint Types
// ============================================================================

/// Unique identifier for a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a branch created by restore
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A checkpoint representing a restore point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub workspace_id: WorkspaceId,
    pub session_id: String,
    pub label: String,
    pub timestamp: DateTime<Utc>,

    /// 세션 내 생성 순서
    pub ordinal: u64,

    /// 스냅샷 아이템 수
    pub item_count: usize,

    /// 스냅샷 총 토큰
    pub total_tokens: usize,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// 체크포인트 시점의 전체 아이템
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    checkpoint_id: CheckpointId,
    items: Vec<ContextItem>,
}

/// 복원으로 생성된 브랜치
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: BranchId,
    pub workspace_id: WorkspaceId,
    pub session_id: String,
    pub checkpoint_id: CheckpointId,
    pub created_at: DateTime<Utc>,

    /// 체크포인트 상태
    pub items: Vec<ContextItem>,

    /// 복원 시점의 워크스페이스 상태
    pub preserved_head: Vec<ContextItem>,
}

/// 복원 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_branch_id: Option<BranchId>,
}

// ============================================================================
// Checkpoint Ledger
// ============================================================================

/// 세션별 체크포인트 관리
pub struct CheckpointLedger {
    store: Arc<ContextStore>,
    backend: Arc<dyn KvStore>,

    /// 세션당 최대 체크포인트 수 (0이면 무제한)
    max_per_session: usize,

    /// create/cleanup 직렬화
    write_lock: Mutex<()>,
}

impl CheckpointLedger {
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self::with_backend(store.backend().clone(), store)
    }

    /// 별도 백엔드 사용 (테스트에서 실패 주입용)
    pub fn with_backend(backend: Arc<dyn KvStore>, store: Arc<ContextStore>) -> Self {
        Self {
            store,
            backend,
            max_per_session: 0,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_max_per_session(mut self, max: usize) -> Self {
        self.max_per_session = max;
        self
    }

    fn user(&self) -> &str {
        self.store.user_id()
    }

    async fn ensure_live(&self, ws: &WorkspaceId) -> Result<()> {
        if self.store.is_gone(ws).await? {
            Err(Error::NamespaceGone(ws.to_string()))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// 현재 워크스페이스 상태로 체크포인트 생성
    pub async fn create(
        &self,
        ws: &WorkspaceId,
        session: &str,
        label: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<CheckpointId> {
        let (checkpoint, _) = self.capture(ws, session, label, metadata).await?;
        Ok(checkpoint.id)
    }

    /// 체크포인트 생성, 스냅샷에 담긴 아이템도 함께 반환
    ///
    /// 스냅샷과 기록은 네임스페이스 읽기 잠금 안에서 이뤄지므로 그 사이에
    /// 끼어든 쓰기나 워크스페이스 삭제는 없습니다.
    pub(crate) async fn capture(
        &self,
        ws: &WorkspaceId,
        session: &str,
        label: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(Checkpoint, Vec<ContextItem>)> {
        keys::validate_session(session)?;

        let _guard = self.write_lock.lock().await;
        let (checkpoint, items, existing) = self
            .store
            .with_items(ws, |items| {
                let existing = self.load_checkpoints(ws, session)?;
                let ordinal = existing.iter().map(|c| c.ordinal + 1).max().unwrap_or(1);

                let checkpoint = Checkpoint {
                    id: CheckpointId::new(),
                    workspace_id: ws.clone(),
                    session_id: session.to_string(),
                    label: label.to_string(),
                    timestamp: Utc::now(),
                    ordinal,
                    item_count: items.len(),
                    total_tokens: items.iter().map(|i| i.tokens).sum(),
                    metadata: metadata.unwrap_or_default(),
                };
                let snapshot = Snapshot {
                    checkpoint_id: checkpoint.id.clone(),
                    items,
                };

                self.backend.apply(vec![
                    KvOp::put_json(
                        self.key(ws, session, SessionRecord::Checkpoint, checkpoint.id.as_str()),
                        &checkpoint,
                    )?,
                    KvOp::put_json(
                        self.key(ws, session, SessionRecord::Snapshot, checkpoint.id.as_str()),
                        &snapshot,
                    )?,
                ])?;
                Ok((checkpoint, snapshot.items, existing))
            })
            .await?;

        info!(
            workspace = %ws,
            session,
            checkpoint = %checkpoint.id,
            label,
            items = checkpoint.item_count,
            "Checkpoint created"
        );

        // 보존 한도는 명시적으로 설정한 경우에만
        if self.max_per_session > 0 && existing.len() + 1 > self.max_per_session {
            let mut all = existing;
            all.push(checkpoint.clone());
            self.prune(ws, session, all, self.max_per_session)?;
        }

        Ok((checkpoint, items))
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// 체크포인트를 새 브랜치로 복원 (현재 상태는 변경되지 않음)
    pub async fn restore(
        &self,
        ws: &WorkspaceId,
        session: &str,
        checkpoint_id: &CheckpointId,
    ) -> Result<RestoreOutcome> {
        keys::validate_session(session)?;
        self.ensure_live(ws).await?;

        let snapshot: Option<Snapshot> = get_json(
            self.backend.as_ref(),
            &self.key(ws, session, SessionRecord::Snapshot, checkpoint_id.as_str()),
        )?;
        let Some(snapshot) = snapshot else {
            debug!(workspace = %ws, session, checkpoint = %checkpoint_id, "Checkpoint not found");
            return Ok(RestoreOutcome {
                success: false,
                message: format!("Checkpoint '{}' not found", checkpoint_id),
                new_branch_id: None,
            });
        };

        let preserved_head = self.store.list(ws, None).await?;
        let branch = Branch {
            id: BranchId::new(),
            workspace_id: ws.clone(),
            session_id: session.to_string(),
            checkpoint_id: checkpoint_id.clone(),
            created_at: Utc::now(),
            items: snapshot.items,
            preserved_head,
        };

        self.backend.apply(vec![KvOp::put_json(
            self.key(ws, session, SessionRecord::Branch, branch.id.as_str()),
            &branch,
        )?])?;

        info!(
            workspace = %ws,
            session,
            checkpoint = %checkpoint_id,
            branch = %branch.id,
            "Checkpoint restored into branch"
        );

        Ok(RestoreOutcome {
            success: true,
            message: format!(
                "Restored {} items into branch {}",
                branch.items.len(),
                branch.id
            ),
            new_branch_id: Some(branch.id),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// 체크포인트 목록 (오래된 순)
    pub async fn list(&self, ws: &WorkspaceId, session: &str) -> Result<Vec<Checkpoint>> {
        keys::validate_session(session)?;
        self.ensure_live(ws).await?;
        self.load_checkpoints(ws, session)
    }

    pub async fn get(
        &self,
        ws: &WorkspaceId,
        session: &str,
        checkpoint_id: &CheckpointId,
    ) -> Result<Checkpoint> {
        keys::validate_session(session)?;
        self.ensure_live(ws).await?;
        get_json(
            self.backend.as_ref(),
            &self.key(ws, session, SessionRecord::Checkpoint, checkpoint_id.as_str()),
        )?
        .ok_or_else(|| Error::not_found("checkpoint", checkpoint_id))
    }

    /// 체크포인트 시점의 아이템
    pub async fn snapshot(
        &self,
        ws: &WorkspaceId,
        session: &str,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<ContextItem>> {
        keys::validate_session(session)?;
        self.ensure_live(ws).await?;
        let snapshot: Snapshot = get_json(
            self.backend.as_ref(),
            &self.key(ws, session, SessionRecord::Snapshot, checkpoint_id.as_str()),
        )?
        .ok_or_else(|| Error::not_found("checkpoint", checkpoint_id))?;
        Ok(snapshot.items)
    }

    pub async fn branch(
        &self,
        ws: &WorkspaceId,
        session: &str,
        branch_id: &BranchId,
    ) -> Result<Branch> {
        keys::validate_session(session)?;
        self.ensure_live(ws).await?;
        get_json(
            self.backend.as_ref(),
            &self.key(ws, session, SessionRecord::Branch, branch_id.as_str()),
        )?
        .ok_or_else(|| Error::not_found("branch", branch_id))
    }

    /// 브랜치 목록 (생성순)
    pub async fn branches(&self, ws: &WorkspaceId, session: &str) -> Result<Vec<Branch>> {
        keys::validate_session(session)?;
        self.ensure_live(ws).await?;
        let mut branches: Vec<Branch> = scan_json(
            self.backend.as_ref(),
            &keys::session_prefix(self.user(), ws, session, SessionRecord::Branch),
        )?;
        branches.sort_by_key(|b| b.created_at);
        Ok(branches)
    }

    // ========================================================================
    // Delete / Cleanup
    // ========================================================================

    /// 체크포인트 삭제 (스냅샷 포함). 존재했으면 true
    pub async fn delete(
        &self,
        ws: &WorkspaceId,
        session: &str,
        checkpoint_id: &CheckpointId,
    ) -> Result<bool> {
        keys::validate_session(session)?;
        self.ensure_live(ws).await?;

        let _guard = self.write_lock.lock().await;
        let key = self.key(ws, session, SessionRecord::Checkpoint, checkpoint_id.as_str());
        if self.backend.get(&key)?.is_none() {
            return Ok(false);
        }

        self.backend.apply(vec![
            KvOp::delete(key),
            KvOp::delete(self.key(ws, session, SessionRecord::Snapshot, checkpoint_id.as_str())),
        ])?;
        debug!(workspace = %ws, session, checkpoint = %checkpoint_id, "Checkpoint deleted");
        Ok(true)
    }

    /// 최신 `keep_latest`개만 남기고 삭제. 삭제한 수 반환
    pub async fn cleanup(
        &self,
        ws: &WorkspaceId,
        session: &str,
        keep_latest: usize,
    ) -> Result<usize> {
        keys::validate_session(session)?;
        self.ensure_live(ws).await?;

        let _guard = self.write_lock.lock().await;
        let all = self.load_checkpoints(ws, session)?;
        self.prune(ws, session, all, keep_latest)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn key(&self, ws: &WorkspaceId, session: &str, record: SessionRecord, id: &str) -> String {
        keys::session_key(self.user(), ws, session, record, id)
    }

    fn load_checkpoints(&self, ws: &WorkspaceId, session: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = scan_json(
            self.backend.as_ref(),
            &keys::session_prefix(self.user(), ws, session, SessionRecord::Checkpoint),
        )?;
        checkpoints.sort_by_key(|c| c.ordinal);
        Ok(checkpoints)
    }

    /// `all`은 오래된 순으로 정렬되어 있어야 함
    fn prune(
        &self,
        ws: &WorkspaceId,
        session: &str,
        all: Vec<Checkpoint>,
        keep_latest: usize,
    ) -> Result<usize> {
        let excess = all.len().saturating_sub(keep_latest);
        if excess == 0 {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(excess * 2);
        for checkpoint in all.iter().take(excess) {
            batch.push(KvOp::delete(self.key(
                ws,
                session,
                SessionRecord::Checkpoint,
                checkpoint.id.as_str(),
            )));
            batch.push(KvOp::delete(self.key(
                ws,
                session,
                SessionRecord::Snapshot,
                checkpoint.id.as_str(),
            )));
        }
        self.backend.apply(batch)?;

        info!(workspace = %ws, session, removed = excess, "Old checkpoints cleaned up");
        Ok(excess)
    }
}
