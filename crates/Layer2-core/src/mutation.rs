//! Mutation Tracker - 낙관적 UI 변경 추적
//!
//! UI는 요청을 보내기 전에 로컬 뷰를 먼저 바꾸고, 응답에 따라 확정하거나 되돌립니다.
//!
//! ```text
//! begin_remove / begin_reorder ─► Pending ─┬─ confirm ─► Committed
//!                                          └─ fail    ─► RolledBack (뷰 복원)
//! ```
//!
//! 되돌릴 때는 변경 직전 뷰로 돌아간 뒤, 이후에 시작된 변경을 확정 여부와 관계없이
//! 순서대로 다시 적용합니다.

use crate::protocol::{Request, Response};
use deepctx_foundation::{ContextItem, Error, PriorityUpdate, Result, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// 변경 ID (트래커 내 단조 증가)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(u64);

impl std::fmt::Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationState {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MutationKind {
    Remove { item_id: String },
    Reorder { updates: Vec<PriorityUpdate> },
}

/// 정리된 변경 상태를 기억하는 최대 개수
const SETTLED_HISTORY: usize = 256;

#[derive(Debug, Clone)]
struct LoggedMutation {
    workspace_id: WorkspaceId,
    kind: MutationKind,
    /// Pending 또는 Committed
    state: MutationState,
    /// 적용 직전의 로컬 뷰
    before: Vec<ContextItem>,
}

/// 워크스페이스별 로컬 뷰와 진행 중인 변경
#[derive(Debug, Default)]
pub struct MutationTracker {
    views: HashMap<WorkspaceId, Vec<ContextItem>>,
    /// 앞선 변경이 아직 모두 정리되지 않은 변경들 (되돌릴 때 재적용 대상)
    log: BTreeMap<MutationId, LoggedMutation>,
    /// 최근에 정리된 변경 (오래된 것부터 버림)
    settled: BTreeMap<MutationId, MutationState>,
    next_id: u64,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 서버 상태로 로컬 뷰 설정
    pub fn load(&mut self, ws: &WorkspaceId, items: Vec<ContextItem>) {
        self.views.insert(ws.clone(), items);
    }

    pub fn view(&self, ws: &WorkspaceId) -> &[ContextItem] {
        self.views.get(ws).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn state(&self, id: MutationId) -> Option<MutationState> {
        self.log
            .get(&id)
            .map(|m| m.state)
            .or_else(|| self.settled.get(&id).copied())
    }

    pub fn pending_count(&self) -> usize {
        self.log
            .values()
            .filter(|m| m.state == MutationState::Pending)
            .count()
    }

    /// 아이템 제거 (로컬 뷰에 즉시 반영)
    pub fn begin_remove(&mut self, ws: &WorkspaceId, item_id: &str) -> Result<MutationId> {
        self.begin(
            ws,
            MutationKind::Remove {
                item_id: item_id.to_string(),
            },
        )
    }

    /// 우선순위 변경 (로컬 뷰에 즉시 반영)
    pub fn begin_reorder(
        &mut self,
        ws: &WorkspaceId,
        updates: Vec<PriorityUpdate>,
    ) -> Result<MutationId> {
        for update in &updates {
            ContextItem::validate_priority(update.priority)?;
        }
        self.begin(ws, MutationKind::Reorder { updates })
    }

    fn begin(&mut self, ws: &WorkspaceId, kind: MutationKind) -> Result<MutationId> {
        let before = self.view(ws).to_vec();
        let after = apply(&before, &kind)?;

        self.next_id += 1;
        let id = MutationId(self.next_id);
        self.views.insert(ws.clone(), after);
        self.log.insert(
            id,
            LoggedMutation {
                workspace_id: ws.clone(),
                kind,
                state: MutationState::Pending,
                before,
            },
        );
        debug!(mutation = %id, workspace = %ws, "Mutation pending");
        Ok(id)
    }

    /// 서버가 받아들인 변경 확정
    ///
    /// 앞선 변경이 아직 Pending이면 로그에 남아서 그 변경이 되돌려질 때 다시 적용됩니다.
    pub fn confirm(&mut self, id: MutationId) -> Result<()> {
        self.ensure_pending(id)?;
        if let Some(entry) = self.log.get_mut(&id) {
            entry.state = MutationState::Committed;
        }
        self.compact();
        debug!(mutation = %id, "Mutation committed");
        Ok(())
    }

    /// 실패한 변경 되돌리기
    ///
    /// 변경 직전 뷰에서 시작해 이후의 변경(확정된 것 포함)을 순서대로 다시 적용합니다.
    pub fn fail(&mut self, id: MutationId) -> Result<()> {
        self.ensure_pending(id)?;
        let failed = self
            .log
            .remove(&id)
            .ok_or_else(|| Error::not_found("Mutation", id.to_string()))?;
        let ws = failed.workspace_id;
        let mut view = failed.before;

        // 더 이상 적용되지 않는 변경은 건너뛴다
        for (later_id, later) in self.log.range_mut(id..) {
            if later.workspace_id != ws {
                continue;
            }
            later.before = view.clone();
            match apply(&view, &later.kind) {
                Ok(next) => view = next,
                Err(e) => debug!(mutation = %later_id, error = %e, "Replay skipped"),
            }
        }

        self.views.insert(ws, view);
        self.record_settled(id, MutationState::RolledBack);
        self.compact();
        debug!(mutation = %id, "Mutation rolled back");
        Ok(())
    }

    /// 응답에 따라 confirm 또는 fail
    pub fn settle(&mut self, id: MutationId, response: &Response) -> Result<MutationState> {
        if response.is_ok() {
            self.confirm(id)?;
            Ok(MutationState::Committed)
        } else {
            self.fail(id)?;
            Ok(MutationState::RolledBack)
        }
    }

    /// 변경을 서버에 보낼 요청
    pub fn request(&self, id: MutationId) -> Result<Request> {
        self.ensure_pending(id)?;
        let logged = self
            .log
            .get(&id)
            .ok_or_else(|| Error::not_found("Pending mutation", id.to_string()))?;
        let workspace_id = logged.workspace_id.clone();
        Ok(match &logged.kind {
            MutationKind::Remove { item_id } => Request::Remove {
                workspace_id,
                item_id: item_id.clone(),
            },
            MutationKind::Reorder { updates } => Request::UpdatePriorities {
                workspace_id,
                updates: updates.clone(),
            },
        })
    }

    fn ensure_pending(&self, id: MutationId) -> Result<()> {
        match self.state(id) {
            Some(MutationState::Pending) => Ok(()),
            Some(state) => Err(Error::InvalidInput(format!(
                "mutation {} is already {:?}",
                id, state
            ))),
            None => Err(Error::not_found("Mutation", id.to_string())),
        }
    }

    /// 앞선 변경이 모두 정리된 확정 변경은 로그에서 뺀다
    fn compact(&mut self) {
        while let Some(entry) = self.log.first_entry() {
            if entry.get().state != MutationState::Committed {
                break;
            }
            let id = *entry.key();
            entry.remove();
            self.record_settled(id, MutationState::Committed);
        }
    }

    fn record_settled(&mut self, id: MutationId, state: MutationState) {
        self.settled.insert(id, state);
        while self.settled.len() > SETTLED_HISTORY {
            self.settled.pop_first();
        }
    }
}

/// 뷰에 변경 적용 (원본은 그대로)
fn apply(view: &[ContextItem], kind: &MutationKind) -> Result<Vec<ContextItem>> {
    match kind {
        MutationKind::Remove { item_id } => {
            if !view.iter().any(|i| &i.id == item_id) {
                return Err(Error::not_found("Item", item_id));
            }
            Ok(view.iter().filter(|i| &i.id != item_id).cloned().collect())
        }
        MutationKind::Reorder { updates } => {
            let mut next = view.to_vec();
            for update in updates {
                let item = next
                    .iter_mut()
                    .find(|i| i.id == update.id)
                    .ok_or_else(|| Error::not_found("Item", &update.id))?;
                item.priority = update.priority;
            }
            next.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.sequence.cmp(&b.sequence))
            });
            Ok(next)
        }
    }
}
