//! Protocol - UI 메시지 채널
//!
//! 닫힌 tagged union (`type` 필드)으로 요청을 받고 `Response`로 응답합니다.
//! 알 수 없는 필드나 타입은 역직렬화 단계에서 거부되고,
//! `Request::validate()`가 디스패치 전에 값 범위를 확인합니다.
//!
//! ```json
//! {"type":"select","workspaceId":"w1","query":"rust","tokenBudget":2000}
//! {"status":"ok","data":{...}}
//! {"status":"error","code":"namespace_gone","message":"..."}
//! ```

use crate::checkpoint::{BranchId, CheckpointId};
use crate::compressor::{CompressionResult, CompressionStrategy};
use crate::engine::ContextEngine;
use crate::keys;
use crate::selector::SelectOptions;
use deepctx_foundation::{
    ContextItem, Error, EventFilter, ItemFilter, PriorityUpdate, Result, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ============================================================================
// Request
// ============================================================================

/// UI → 엔진 요청
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum Request {
    Write {
        workspace_id: WorkspaceId,
        item: ContextItem,
    },
    Read {
        workspace_id: WorkspaceId,
        item_id: String,
    },
    List {
        workspace_id: WorkspaceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<ItemFilter>,
    },
    Remove {
        workspace_id: WorkspaceId,
        item_id: String,
    },
    UpdatePriorities {
        workspace_id: WorkspaceId,
        updates: Vec<PriorityUpdate>,
    },
    Select {
        workspace_id: WorkspaceId,
        #[serde(default)]
        query: String,
        token_budget: usize,
        #[serde(default)]
        options: SelectOptions,
    },
    PreviewCompression {
        workspace_id: WorkspaceId,
        /// 없으면 설정의 기본 전략
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy: Option<String>,
        target_tokens: usize,
    },
    CommitCompression {
        workspace_id: WorkspaceId,
        session_id: String,
        result: CompressionResult,
    },
    CompressAndCommit {
        workspace_id: WorkspaceId,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy: Option<String>,
        target_tokens: usize,
    },
    CreateCheckpoint {
        workspace_id: WorkspaceId,
        session_id: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<BTreeMap<String, String>>,
    },
    RestoreCheckpoint {
        workspace_id: WorkspaceId,
        session_id: String,
        checkpoint_id: CheckpointId,
    },
    ListCheckpoints {
        workspace_id: WorkspaceId,
        session_id: String,
    },
    ListBranches {
        workspace_id: WorkspaceId,
        session_id: String,
    },
    CheckoutBranch {
        workspace_id: WorkspaceId,
        session_id: String,
        branch_id: BranchId,
    },
    CleanupCheckpoints {
        workspace_id: WorkspaceId,
        session_id: String,
        keep_latest: usize,
    },
    Stats {
        workspace_id: WorkspaceId,
    },
    DeleteWorkspace {
        workspace_id: WorkspaceId,
    },
    Synthesize {
        sources: Vec<WorkspaceId>,
        target: WorkspaceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<ItemFilter>,
    },
    Workspaces,
    /// 최근 변경 이벤트 (최신순)
    Events {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_id: Option<WorkspaceId>,
        /// 이벤트 종류 (`itemWritten`, `contextReplaced`, ...). 비어 있으면 전부
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        kinds: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
}

impl Request {
    /// 요청 타입 이름 (로그용)
    pub fn name(&self) -> &'static str {
        match self {
            Request::Write { .. } => "write",
            Request::Read { .. } => "read",
            Request::List { .. } => "list",
            Request::Remove { .. } => "remove",
            Request::UpdatePriorities { .. } => "updatePriorities",
            Request::Select { .. } => "select",
            Request::PreviewCompression { .. } => "previewCompression",
            Request::CommitCompression { .. } => "commitCompression",
            Request::CompressAndCommit { .. } => "compressAndCommit",
            Request::CreateCheckpoint { .. } => "createCheckpoint",
            Request::RestoreCheckpoint { .. } => "restoreCheckpoint",
            Request::ListCheckpoints { .. } => "listCheckpoints",
            Request::ListBranches { .. } => "listBranches",
            Request::CheckoutBranch { .. } => "checkoutBranch",
            Request::CleanupCheckpoints { .. } => "cleanupCheckpoints",
            Request::Stats { .. } => "stats",
            Request::DeleteWorkspace { .. } => "deleteWorkspace",
            Request::Synthesize { .. } => "synthesize",
            Request::Workspaces => "workspaces",
            Request::Events { .. } => "events",
        }
    }

    /// 대상 워크스페이스 (합성은 target)
    pub fn workspace(&self) -> Option<&WorkspaceId> {
        match self {
            Request::Write { workspace_id, .. }
            | Request::Read { workspace_id, .. }
            | Request::List { workspace_id, .. }
            | Request::Remove { workspace_id, .. }
            | Request::UpdatePriorities { workspace_id, .. }
            | Request::Select { workspace_id, .. }
            | Request::PreviewCompression { workspace_id, .. }
            | Request::CommitCompression { workspace_id, .. }
            | Request::CompressAndCommit { workspace_id, .. }
            | Request::CreateCheckpoint { workspace_id, .. }
            | Request::RestoreCheckpoint { workspace_id, .. }
            | Request::ListCheckpoints { workspace_id, .. }
            | Request::ListBranches { workspace_id, .. }
            | Request::CheckoutBranch { workspace_id, .. }
            | Request::CleanupCheckpoints { workspace_id, .. }
            | Request::Stats { workspace_id }
            | Request::DeleteWorkspace { workspace_id } => Some(workspace_id),
            Request::Synthesize { target, .. } => Some(target),
            Request::Events { workspace_id, .. } => workspace_id.as_ref(),
            Request::Workspaces => None,
        }
    }

    fn session(&self) -> Option<&str> {
        match self {
            Request::CommitCompression { session_id, .. }
            | Request::CompressAndCommit { session_id, .. }
            | Request::CreateCheckpoint { session_id, .. }
            | Request::RestoreCheckpoint { session_id, .. }
            | Request::ListCheckpoints { session_id, .. }
            | Request::ListBranches { session_id, .. }
            | Request::CheckoutBranch { session_id, .. }
            | Request::CleanupCheckpoints { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// 값 범위 검증 (디스패치 전)
    pub fn validate(&self) -> Result<()> {
        if let Some(ws) = self.workspace() {
            ws.validate()?;
        }
        if let Some(session) = self.session() {
            keys::validate_session(session)?;
        }

        match self {
            Request::Write { item, .. } => ContextItem::validate_priority(item.priority),
            Request::Read { item_id, .. } | Request::Remove { item_id, .. } => {
                non_empty("itemId", item_id)
            }
            Request::UpdatePriorities { updates, .. } => {
                for update in updates {
                    non_empty("id", &update.id)?;
                    ContextItem::validate_priority(update.priority)?;
                }
                Ok(())
            }
            Request::Select { options, .. } => options.validate(),
            Request::PreviewCompression {
                strategy,
                target_tokens,
                ..
            }
            | Request::CompressAndCommit {
                strategy,
                target_tokens,
                ..
            } => {
                if *target_tokens == 0 {
                    return Err(Error::InvalidInput(
                        "targetTokens must be greater than 0".to_string(),
                    ));
                }
                match strategy {
                    Some(name) => CompressionStrategy::from_name(name).map(|_| ()),
                    None => Ok(()),
                }
            }
            Request::CreateCheckpoint { label, .. } => non_empty("label", label),
            Request::RestoreCheckpoint { checkpoint_id, .. } => {
                non_empty("checkpointId", checkpoint_id.as_str())
            }
            Request::CheckoutBranch { branch_id, .. } => {
                non_empty("branchId", branch_id.as_str())
            }
            Request::Synthesize {
                sources, target, ..
            } => {
                if sources.is_empty() {
                    return Err(Error::InvalidInput(
                        "synthesize needs at least one source".to_string(),
                    ));
                }
                for source in sources {
                    source.validate()?;
                }
                if sources.contains(target) {
                    return Err(Error::InvalidInput(format!(
                        "target workspace '{}' cannot also be a source",
                        target
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

// ============================================================================
// Response
// ============================================================================

/// 엔진 → UI 응답
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Response {
    Ok {
        #[serde(default)]
        data: Value,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Response::Ok { data },
            Err(e) => Response::error(&Error::from(e)),
        }
    }

    pub fn error(err: &Error) -> Self {
        Response::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    /// 오류 코드 (성공이면 None)
    pub fn code(&self) -> Option<&str> {
        match self {
            Response::Ok { .. } => None,
            Response::Error { code, .. } => Some(code),
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Response::Ok { data } => Some(data),
            Response::Error { .. } => None,
        }
    }
}

// ============================================================================
// ContextService
// ============================================================================

/// 요청 디스패처
pub struct ContextService {
    engine: Arc<ContextEngine>,
    /// 종료 시 진행 중인 압축/통계를 취소
    shutdown: CancellationToken,
}

impl ContextService {
    pub fn new(engine: Arc<ContextEngine>) -> Self {
        Self {
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &Arc<ContextEngine> {
        &self.engine
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// JSON 한 줄 처리 (파싱 실패도 응답으로 돌려줌)
    pub async fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                Response::error(&Error::InvalidInput(format!("malformed request: {}", e)))
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let name = request.name();
        if let Err(e) = request.validate() {
            debug!(request = name, error = %e, "Request rejected");
            return Response::error(&e);
        }

        match self.dispatch(request).await {
            Ok(data) => Response::Ok { data },
            Err(e) => {
                if e.is_recoverable() {
                    debug!(request = name, error = %e, "Request failed");
                } else {
                    warn!(request = name, error = %e, "Request failed");
                }
                Response::error(&e)
            }
        }
    }

    fn strategy(&self, name: Option<&str>) -> Result<CompressionStrategy> {
        match name {
            Some(name) => CompressionStrategy::from_name(name),
            None => Ok(self.engine.default_strategy().clone()),
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value> {
        let engine = &self.engine;
        let value = match request {
            Request::Write { workspace_id, item } => {
                to_value(engine.write(&workspace_id, item).await?)?
            }
            Request::Read {
                workspace_id,
                item_id,
            } => to_value(engine.read(&workspace_id, &item_id).await?)?,
            Request::List {
                workspace_id,
                filter,
            } => to_value(engine.list(&workspace_id, filter.as_ref()).await?)?,
            Request::Remove {
                workspace_id,
                item_id,
            } => to_value(engine.remove(&workspace_id, &item_id).await?)?,
            Request::UpdatePriorities {
                workspace_id,
                updates,
            } => {
                engine.update_priorities(&workspace_id, &updates).await?;
                Value::Null
            }
            Request::Select {
                workspace_id,
                query,
                token_budget,
                options,
            } => to_value(
                engine
                    .select_scored(&workspace_id, &query, token_budget, &options)
                    .await?,
            )?,
            Request::PreviewCompression {
                workspace_id,
                strategy,
                target_tokens,
            } => {
                let strategy = self.strategy(strategy.as_deref())?;
                to_value(
                    engine
                        .preview_compression_with_cancel(
                            &workspace_id,
                            &strategy,
                            target_tokens,
                            &self.shutdown,
                        )
                        .await?,
                )?
            }
            Request::CommitCompression {
                workspace_id,
                session_id,
                result,
            } => to_value(
                engine
                    .commit_compression(&workspace_id, &session_id, &result)
                    .await?,
            )?,
            Request::CompressAndCommit {
                workspace_id,
                session_id,
                strategy,
                target_tokens,
            } => {
                let strategy = self.strategy(strategy.as_deref())?;
                let (result, outcome) = engine
                    .compress_and_commit(
                        &workspace_id,
                        &session_id,
                        &strategy,
                        target_tokens,
                        &self.shutdown,
                    )
                    .await?;
                serde_json::json!({ "result": result, "outcome": outcome })
            }
            Request::CreateCheckpoint {
                workspace_id,
                session_id,
                label,
                metadata,
            } => to_value(
                engine
                    .create_checkpoint(&workspace_id, &session_id, &label, metadata)
                    .await?,
            )?,
            Request::RestoreCheckpoint {
                workspace_id,
                session_id,
                checkpoint_id,
            } => to_value(
                engine
                    .restore_checkpoint(&workspace_id, &session_id, &checkpoint_id)
                    .await?,
            )?,
            Request::ListCheckpoints {
                workspace_id,
                session_id,
            } => to_value(engine.list_checkpoints(&workspace_id, &session_id).await?)?,
            Request::ListBranches {
                workspace_id,
                session_id,
            } => to_value(engine.branches(&workspace_id, &session_id).await?)?,
            Request::CheckoutBranch {
                workspace_id,
                session_id,
                branch_id,
            } => to_value(
                engine
                    .checkout_branch(&workspace_id, &session_id, &branch_id)
                    .await?,
            )?,
            Request::CleanupCheckpoints {
                workspace_id,
                session_id,
                keep_latest,
            } => to_value(
                engine
                    .cleanup_checkpoints(&workspace_id, &session_id, keep_latest)
                    .await?,
            )?,
            Request::Stats { workspace_id } => to_value(
                engine
                    .stats_with_cancel(&workspace_id, &self.shutdown)
                    .await?,
            )?,
            Request::DeleteWorkspace { workspace_id } => {
                engine.delete_workspace(&workspace_id).await?;
                Value::Null
            }
            Request::Synthesize {
                sources,
                target,
                filter,
            } => to_value(
                engine
                    .synthesize(&sources, &target, filter.as_ref())
                    .await?,
            )?,
            Request::Workspaces => to_value(engine.workspaces().await?)?,
            Request::Events {
                workspace_id,
                kinds,
                limit,
            } => {
                let mut filter = EventFilter::new();
                if let Some(ws) = workspace_id {
                    filter = filter.with_workspace(ws.to_string());
                }
                if !kinds.is_empty() {
                    filter = filter.with_kinds(kinds);
                }
                to_value(engine.recent_events(&filter, limit).await)?
            }
        };
        Ok(value)
    }
}

fn to_value(value: impl Serialize) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepctx_foundation::ContextType;

    fn service() -> ContextService {
        ContextService::new(Arc::new(ContextEngine::in_memory().unwrap()))
    }

    #[test]
    fn test_request_wire_format() {
        let req: Request = serde_json::from_str(
            r#"{"type":"select","workspaceId":"w1","query":"rust","tokenBudget":2000}"#,
        )
        .unwrap();
        assert_eq!(req.name(), "select");
        assert_eq!(req.workspace(), Some(&WorkspaceId::new("w1")));

        let req: Request = serde_json::from_str(r#"{"type":"workspaces"}"#).unwrap();
        assert_eq!(req, Request::Workspaces);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = serde_json::from_str::<Request>(
            r#"{"type":"stats","workspaceId":"w1","extra":true}"#,
        );
        assert!(err.is_err());

        let err = serde_json::from_str::<Request>(r#"{"type":"dropEverything"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_validate() {
        let bad_ws = Request::Stats {
            workspace_id: WorkspaceId::new(""),
        };
        assert!(matches!(bad_ws.validate(), Err(Error::InvalidInput(_))));

        let bad_priority = Request::UpdatePriorities {
            workspace_id: WorkspaceId::new("w"),
            updates: vec![PriorityUpdate::new("a", 9)],
        };
        assert!(bad_priority.validate().is_err());

        let bad_target = Request::PreviewCompression {
            workspace_id: WorkspaceId::new("w"),
            strategy: None,
            target_tokens: 0,
        };
        assert!(bad_target.validate().is_err());

        let bad_strategy = Request::PreviewCompression {
            workspace_id: WorkspaceId::new("w"),
            strategy: Some("extreme".to_string()),
            target_tokens: 10,
        };
        assert!(bad_strategy.validate().is_err());

        let reserved_session = Request::ListCheckpoints {
            workspace_id: WorkspaceId::new("w"),
            session_id: "items".to_string(),
        };
        assert!(reserved_session.validate().is_err());
    }

    #[tokio::test]
    async fn test_handle_roundtrip() {
        let service = service();
        let ws = WorkspaceId::new("w");

        let resp = service
            .handle(Request::Write {
                workspace_id: ws.clone(),
                item: ContextItem::new(ContextType::Page, "hello world").with_id("p1"),
            })
            .await;
        assert!(resp.is_ok());

        let resp = service
            .handle(Request::Read {
                workspace_id: ws.clone(),
                item_id: "p1".to_string(),
            })
            .await;
        let item: ContextItem = serde_json::from_value(resp.data().unwrap().clone()).unwrap();
        assert_eq!(item.content, "hello world");

        let resp = service
            .handle(Request::Read {
                workspace_id: ws,
                item_id: "missing".to_string(),
            })
            .await;
        assert_eq!(resp.code(), Some("not_found"));
    }

    #[tokio::test]
    async fn test_handle_line_malformed() {
        let service = service();
        let resp = service.handle_line("{not json").await;
        assert_eq!(resp.code(), Some("invalid_input"));

        let resp = service.handle_line(r#"{"type":"workspaces"}"#).await;
        assert!(resp.is_ok());
    }

    #[tokio::test]
    async fn test_events_newest_first() {
        let service = service();
        for (ws, id) in [("w1", "a"), ("w2", "b"), ("w1", "c")] {
            let resp = service
                .handle(Request::Write {
                    workspace_id: WorkspaceId::new(ws),
                    item: ContextItem::new(ContextType::Message, "x").with_id(id),
                })
                .await;
            assert!(resp.is_ok());
        }
        service
            .handle(Request::Remove {
                workspace_id: WorkspaceId::new("w1"),
                item_id: "a".to_string(),
            })
            .await;

        let resp = service
            .handle_line(r#"{"type":"events","workspaceId":"w1","kinds":["itemWritten"]}"#)
            .await;
        let events = resp.data().unwrap().as_array().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["itemId"], "c");
        assert_eq!(events[1]["itemId"], "a");

        let resp = service
            .handle(Request::Events {
                workspace_id: None,
                kinds: Vec::new(),
                limit: Some(1),
            })
            .await;
        let events = resp.data().unwrap().as_array().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["kind"], "itemRemoved");
    }

    #[test]
    fn test_response_wire_format() {
        let ok = serde_json::to_value(Response::ok(3)).unwrap();
        assert_eq!(ok["status"], "ok");
        assert_eq!(ok["data"], 3);

        let err = serde_json::to_value(Response::error(&Error::NotFound("x".into()))).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["code"], "not_found");
    }
}
