//! Context Store - 워크스페이스 단위로 격리된 컨텍스트 아이템 저장소
//!
//! - 네임스페이스마다 독립적인 `RwLock` (쓰기 직렬화, 읽기는 스냅샷 복제)
//! - 모든 변경은 백엔드 batch가 성공한 뒤에만 메모리에 반영
//! - 삭제된 워크스페이스는 tombstone으로 남아 이후 호출이 `NamespaceGone`으로 실패
//!
//! ```text
//! write ─► normalize (id, tokens, truncation) ─► KvStore::apply(batch) ─► memory
//! ```

use crate::keys;
use chrono::{DateTime, Utc};
use deepctx_foundation::{
    get_json, scan_json, validate_key_segment, ContextItem, Error, ItemFilter, KvOp, KvStore,
    PriorityUpdate, Result, TokenEstimator, Tokenizer, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 잘림 기록 메타데이터 키
pub const TRUNCATED_FROM_KEY: &str = "truncated_from_tokens";

/// 기본 아이템당 최대 토큰
pub const DEFAULT_MAX_ITEM_TOKENS: usize = 8_000;

/// 첫 sequence 값 (0은 "미할당"을 의미)
const FIRST_SEQUENCE: u64 = 1;

// ============================================================================
// Namespace State
// ============================================================================

/// 네임스페이스 메타데이터 (백엔드 저장용)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamespaceMeta {
    next_sequence: u64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tombstone {
    deleted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct NamespaceState {
    items: HashMap<String, ContextItem>,
    next_sequence: u64,
    created_at: Option<DateTime<Utc>>,
    gone: bool,
}

impl NamespaceState {
    fn sorted_items(&self, filter: Option<&ItemFilter>) -> Vec<ContextItem> {
        let mut items: Vec<ContextItem> = self
            .items
            .values()
            .filter(|item| filter.map_or(true, |f| f.matches(item)))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.sequence);
        items
    }
}

// ============================================================================
// ContextStore
// ============================================================================

/// 컨텍스트 저장소
///
/// 하나의 사용자(user) 아래 여러 워크스페이스를 관리합니다.
/// 워크스페이스 간 읽기 경로는 없습니다.
pub struct ContextStore {
    backend: Arc<dyn KvStore>,
    user_id: String,
    estimator: TokenEstimator,
    max_item_tokens: usize,
    namespaces: parking_lot::Mutex<HashMap<WorkspaceId, Arc<RwLock<NamespaceState>>>>,
}

impl ContextStore {
    pub fn new(backend: Arc<dyn KvStore>, user_id: impl Into<String>) -> Self {
        Self {
            backend,
            user_id: user_id.into(),
            estimator: TokenEstimator::new(),
            max_item_tokens: DEFAULT_MAX_ITEM_TOKENS,
            namespaces: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// 아이템당 최대 토큰 설정
    pub fn with_max_item_tokens(mut self, max_item_tokens: usize) -> Self {
        self.max_item_tokens = max_item_tokens.max(1);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    pub(crate) fn backend(&self) -> &Arc<dyn KvStore> {
        &self.backend
    }

    // ========================================================================
    // Namespace loading
    // ========================================================================

    fn namespace(&self, ws: &WorkspaceId) -> Result<Arc<RwLock<NamespaceState>>> {
        ws.validate()?;

        if let Some(ns) = self.namespaces.lock().get(ws) {
            return Ok(ns.clone());
        }

        let loaded = Arc::new(RwLock::new(self.load_namespace(ws)?));
        let mut namespaces = self.namespaces.lock();
        Ok(namespaces.entry(ws.clone()).or_insert(loaded).clone())
    }

    fn load_namespace(&self, ws: &WorkspaceId) -> Result<NamespaceState> {
        let tombstone: Option<Tombstone> =
            get_json(self.backend.as_ref(), &keys::tombstone_key(&self.user_id, ws))?;
        if tombstone.is_some() {
            return Ok(NamespaceState {
                gone: true,
                ..Default::default()
            });
        }

        let meta: Option<NamespaceMeta> =
            get_json(self.backend.as_ref(), &keys::meta_key(&self.user_id, ws))?;
        let items: Vec<ContextItem> = scan_json(
            self.backend.as_ref(),
            &keys::items_prefix(&self.user_id, ws),
        )?;

        let max_seq = items
            .iter()
            .map(|i| i.sequence + 1)
            .max()
            .unwrap_or(FIRST_SEQUENCE)
            .max(FIRST_SEQUENCE);
        let next_sequence = meta
            .as_ref()
            .map_or(max_seq, |m| m.next_sequence.max(max_seq));

        debug!(
            workspace = %ws,
            items = items.len(),
            next_sequence,
            "Loaded namespace"
        );

        Ok(NamespaceState {
            items: items.into_iter().map(|i| (i.id.clone(), i)).collect(),
            next_sequence,
            created_at: meta.map(|m| m.created_at),
            gone: false,
        })
    }

    fn ensure_live(ws: &WorkspaceId, state: &NamespaceState) -> Result<()> {
        if state.gone {
            Err(Error::NamespaceGone(ws.to_string()))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Normalization
    // ========================================================================

    /// id 할당, 워크스페이스 검증, 토큰 재계산, 크기 제한 적용
    fn normalize(&self, ws: &WorkspaceId, mut item: ContextItem) -> Result<ContextItem> {
        if item.id.is_empty() {
            item.id = uuid::Uuid::new_v4().to_string();
        }
        validate_key_segment("item id", &item.id)?;
        ContextItem::validate_priority(item.priority)?;

        if item.workspace_id.is_empty() {
            item.workspace_id = ws.clone();
        } else if &item.workspace_id != ws {
            return Err(Error::InvalidInput(format!(
                "item '{}' belongs to workspace '{}', not '{}'",
                item.id, item.workspace_id, ws
            )));
        }

        let tokens = self.estimator.estimate(&item.content);
        if tokens > self.max_item_tokens {
            warn!(
                workspace = %ws,
                item_id = %item.id,
                tokens,
                limit = self.max_item_tokens,
                "Item content exceeds size bound, truncating"
            );
            item.content = self.estimator.truncate(&item.content, self.max_item_tokens);
            item.metadata
                .insert(TRUNCATED_FROM_KEY.to_string(), tokens.to_string());
        }
        item.tokens = self.estimator.estimate(&item.content);

        Ok(item)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// 아이템 upsert
    ///
    /// 갱신 시 `sequence`, `timestamp`, `item_type`, `source_agent_id`는 기존 값을 유지합니다.
    pub async fn write(&self, ws: &WorkspaceId, item: ContextItem) -> Result<ContextItem> {
        let mut item = self.normalize(ws, item)?;

        let ns = self.namespace(ws)?;
        let mut state = ns.write().await;
        Self::ensure_live(ws, &state)?;

        let mut batch = Vec::with_capacity(2);
        let is_new = match state.items.get(&item.id) {
            Some(existing) => {
                item.sequence = existing.sequence;
                item.timestamp = existing.timestamp;
                item.item_type = existing.item_type;
                if existing.source_agent_id.is_some() {
                    item.source_agent_id = existing.source_agent_id.clone();
                }
                false
            }
            None => true,
        };

        if is_new {
            item.sequence = state.next_sequence;
            let meta = NamespaceMeta {
                next_sequence: state.next_sequence + 1,
                created_at: state.created_at.unwrap_or_else(Utc::now),
            };
            batch.push(KvOp::put_json(keys::meta_key(&self.user_id, ws), &meta)?);
            state.created_at = Some(meta.created_at);
        }
        batch.push(KvOp::put_json(
            keys::item_key(&self.user_id, ws, &item.id),
            &item,
        )?);

        self.backend.apply(batch)?;

        if is_new {
            state.next_sequence += 1;
        }
        state.items.insert(item.id.clone(), item.clone());

        debug!(workspace = %ws, item_id = %item.id, tokens = item.tokens, "Item written");
        Ok(item)
    }

    /// 단일 아이템 조회
    pub async fn read(&self, ws: &WorkspaceId, id: &str) -> Result<ContextItem> {
        let ns = self.namespace(ws)?;
        let state = ns.read().await;
        Self::ensure_live(ws, &state)?;

        state
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("item", id))
    }

    /// 아이템 목록 (sequence 순)
    pub async fn list(
        &self,
        ws: &WorkspaceId,
        filter: Option<&ItemFilter>,
    ) -> Result<Vec<ContextItem>> {
        let ns = self.namespace(ws)?;
        let state = ns.read().await;
        Self::ensure_live(ws, &state)?;

        Ok(state.sorted_items(filter))
    }

    /// 읽기 잠금을 잡은 채로 현재 아이템(sequence 순)을 `f`에 넘김
    ///
    /// `f`가 끝날 때까지 같은 워크스페이스의 쓰기, 교체, 삭제는 대기합니다.
    pub(crate) async fn with_items<T>(
        &self,
        ws: &WorkspaceId,
        f: impl FnOnce(Vec<ContextItem>) -> Result<T>,
    ) -> Result<T> {
        let ns = self.namespace(ws)?;
        let state = ns.read().await;
        Self::ensure_live(ws, &state)?;

        f(state.sorted_items(None))
    }

    /// 아이템 삭제 (멱등). 실제로 삭제되었으면 true
    pub async fn remove(&self, ws: &WorkspaceId, id: &str) -> Result<bool> {
        let ns = self.namespace(ws)?;
        let mut state = ns.write().await;
        Self::ensure_live(ws, &state)?;

        if !state.items.contains_key(id) {
            return Ok(false);
        }

        self.backend
            .apply(vec![KvOp::delete(keys::item_key(&self.user_id, ws, id))])?;
        state.items.remove(id);

        debug!(workspace = %ws, item_id = %id, "Item removed");
        Ok(true)
    }

    /// 우선순위 일괄 변경 (전부 적용되거나 전혀 적용되지 않음)
    pub async fn update_priorities(
        &self,
        ws: &WorkspaceId,
        updates: &[PriorityUpdate],
    ) -> Result<()> {
        for update in updates {
            ContextItem::validate_priority(update.priority)?;
        }

        let ns = self.namespace(ws)?;
        let mut state = ns.write().await;
        Self::ensure_live(ws, &state)?;

        let mut changed: HashMap<&str, ContextItem> = HashMap::new();
        for update in updates {
            let current = match changed.get(update.id.as_str()) {
                Some(item) => item.clone(),
                None => state
                    .items
                    .get(&update.id)
                    .cloned()
                    .ok_or_else(|| Error::not_found("item", &update.id))?,
            };
            changed.insert(
                update.id.as_str(),
                ContextItem {
                    priority: update.priority,
                    ..current
                },
            );
        }

        let batch = changed
            .values()
            .map(|item| KvOp::put_json(keys::item_key(&self.user_id, ws, &item.id), item))
            .collect::<Result<Vec<_>>>()?;
        self.backend.apply(batch)?;

        let count = changed.len();
        for (_, item) in changed {
            state.items.insert(item.id.clone(), item);
        }

        debug!(workspace = %ws, count, "Priorities updated");
        Ok(())
    }

    /// 아이템 전체를 원자적으로 교체 (압축 커밋, 브랜치 체크아웃)
    ///
    /// 현재 상태가 `expected`와 같을 때만 교체하고, 다르면 `Conflict`.
    /// 기존 `sequence`가 있는 아이템은 그 값을 유지합니다.
    pub async fn replace_if_unchanged(
        &self,
        ws: &WorkspaceId,
        expected: &[ContextItem],
        items: Vec<ContextItem>,
    ) -> Result<Vec<ContextItem>> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(items.len());
        for item in items {
            let item = self.normalize(ws, item)?;
            if !seen.insert(item.id.clone()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate item id '{}' in replacement set",
                    item.id
                )));
            }
            normalized.push(item);
        }

        let ns = self.namespace(ws)?;
        let mut state = ns.write().await;
        Self::ensure_live(ws, &state)?;

        if state.sorted_items(None) != expected {
            return Err(Error::Conflict(format!(
                "workspace '{}' changed since the replacement was computed",
                ws
            )));
        }

        // sequence 0 = 미할당 (기존 아이템이면 그 값을, 아니면 새 값을 부여)
        let mut next_sequence = normalized
            .iter()
            .map(|i| i.sequence + 1)
            .max()
            .unwrap_or(FIRST_SEQUENCE)
            .max(state.next_sequence);
        for item in normalized.iter_mut() {
            if item.sequence == 0 {
                match state.items.get(&item.id) {
                    Some(existing) => item.sequence = existing.sequence,
                    None => {
                        item.sequence = next_sequence;
                        next_sequence += 1;
                    }
                }
            }
        }

        let mut batch = Vec::with_capacity(normalized.len() + 2);
        batch.push(KvOp::delete_prefix(keys::items_prefix(&self.user_id, ws)));
        for item in &normalized {
            batch.push(KvOp::put_json(
                keys::item_key(&self.user_id, ws, &item.id),
                item,
            )?);
        }
        let meta = NamespaceMeta {
            next_sequence,
            created_at: state.created_at.unwrap_or_else(Utc::now),
        };
        batch.push(KvOp::put_json(keys::meta_key(&self.user_id, ws), &meta)?);

        self.backend.apply(batch)?;

        state.created_at = Some(meta.created_at);
        state.next_sequence = next_sequence;
        state.items = normalized
            .iter()
            .map(|i| (i.id.clone(), i.clone()))
            .collect();

        info!(workspace = %ws, items = normalized.len(), "Context replaced");
        normalized.sort_by_key(|i| i.sequence);
        Ok(normalized)
    }

    /// 워크스페이스 삭제 (tombstone 기록)
    pub async fn delete_workspace(&self, ws: &WorkspaceId) -> Result<()> {
        let ns = self.namespace(ws)?;
        let mut state = ns.write().await;
        Self::ensure_live(ws, &state)?;

        let tombstone = Tombstone {
            deleted_at: Utc::now(),
        };
        self.backend.apply(vec![
            KvOp::delete_prefix(keys::workspace_prefix(&self.user_id, ws)),
            KvOp::put_json(keys::tombstone_key(&self.user_id, ws), &tombstone)?,
        ])?;

        *state = NamespaceState {
            gone: true,
            ..Default::default()
        };

        info!(workspace = %ws, "Workspace deleted");
        Ok(())
    }

    /// 워크스페이스가 삭제되었는지 확인
    pub async fn is_gone(&self, ws: &WorkspaceId) -> Result<bool> {
        let ns = self.namespace(ws)?;
        let state = ns.read().await;
        Ok(state.gone)
    }

    /// 현재 사용자의 살아있는 워크스페이스 목록
    pub async fn workspaces(&self) -> Result<Vec<WorkspaceId>> {
        let mut found: Vec<WorkspaceId> = self
            .backend
            .scan_prefix(&keys::user_prefix(&self.user_id))?
            .into_iter()
            .filter_map(|(key, _)| {
                keys::workspace_from_meta_key(&self.user_id, &key).map(WorkspaceId::from)
            })
            .collect();
        found.sort();
        found.dedup();
        Ok(found)
    }

    /// 워크스페이스의 총 토큰 수
    pub async fn total_tokens(&self, ws: &WorkspaceId) -> Result<usize> {
        let ns = self.namespace(ws)?;
        let state = ns.read().await;
        Self::ensure_live(ws, &state)?;
        Ok(state.items.values().map(|i| i.tokens).sum())
    }
}
