//! Event Types - 컨텍스트 변경 이벤트 정의
//!
//! 모든 자동 변경(잘림, 압축, 복원)을 관찰 가능하게 만듭니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Event ID
// ============================================================================

/// 이벤트 고유 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Kind
// ============================================================================

/// 이벤트 종류
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ContextEventKind {
    /// 아이템 생성/갱신
    #[serde(rename_all = "camelCase")]
    ItemWritten {
        item_id: String,
        tokens: usize,
        /// 크기 제한으로 잘렸으면 원래 토큰 수
        truncated_from: Option<usize>,
    },

    /// 아이템 삭제
    #[serde(rename_all = "camelCase")]
    ItemRemoved { item_id: String },

    /// 우선순위 일괄 변경
    #[serde(rename_all = "camelCase")]
    PrioritiesUpdated { count: usize },

    /// 전체 교체 (압축 커밋, 브랜치 체크아웃)
    #[serde(rename_all = "camelCase")]
    ContextReplaced {
        previous_items: usize,
        items: usize,
        previous_tokens: usize,
        tokens: usize,
        checkpoint_id: Option<String>,
    },

    /// 체크포인트 생성
    #[serde(rename_all = "camelCase")]
    CheckpointCreated {
        checkpoint_id: String,
        session_id: String,
        label: String,
    },

    /// 체크포인트 복원 (새 브랜치)
    #[serde(rename_all = "camelCase")]
    CheckpointRestored {
        checkpoint_id: String,
        branch_id: String,
    },

    /// 워크스페이스 삭제
    WorkspaceDeleted,

    /// 다른 워크스페이스에서 합성
    #[serde(rename_all = "camelCase")]
    Synthesized { sources: Vec<String>, items: usize },
}

impl ContextEventKind {
    /// 종류 이름 (필터/로그용)
    pub fn name(&self) -> &'static str {
        match self {
            Self::ItemWritten { .. } => "itemWritten",
            Self::ItemRemoved { .. } => "itemRemoved",
            Self::PrioritiesUpdated { .. } => "prioritiesUpdated",
            Self::ContextReplaced { .. } => "contextReplaced",
            Self::CheckpointCreated { .. } => "checkpointCreated",
            Self::CheckpointRestored { .. } => "checkpointRestored",
            Self::WorkspaceDeleted => "workspaceDeleted",
            Self::Synthesized { .. } => "synthesized",
        }
    }
}

// ============================================================================
// ContextEvent
// ============================================================================

/// 컨텍스트 변경 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub workspace_id: String,
    #[serde(flatten)]
    pub kind: ContextEventKind,
}

impl ContextEvent {
    pub fn new(workspace_id: impl Into<String>, kind: ContextEventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            workspace_id: workspace_id.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ContextEvent::new(
            "ws",
            ContextEventKind::ItemRemoved {
                item_id: "a".into(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "itemRemoved");
        assert_eq!(json["itemId"], "a");
        assert_eq!(json["workspaceId"], "ws");

        let back: ContextEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_kind_name() {
        assert_eq!(ContextEventKind::WorkspaceDeleted.name(), "workspaceDeleted");
    }
}
