//! Core Types - 컨텍스트 아이템 정의

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 최저 우선순위
pub const MIN_PRIORITY: u8 = 1;

/// 최고 우선순위
pub const MAX_PRIORITY: u8 = 5;

/// 기본 우선순위
pub const DEFAULT_PRIORITY: u8 = 3;

// ============================================================================
// WorkspaceId - 격리 경계
// ============================================================================

/// 워크스페이스 식별자 (네임스페이스 키)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 저장소 키로 사용할 수 있는지 검증
    pub fn validate(&self) -> Result<()> {
        validate_key_segment("workspace id", &self.0)
    }
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkspaceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 키 세그먼트 검증 (비어있지 않고 '/' 미포함)
pub fn validate_key_segment(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be empty", kind)));
    }
    if value.contains('/') {
        return Err(Error::InvalidInput(format!(
            "{} must not contain '/': {}",
            kind, value
        )));
    }
    Ok(())
}

// ============================================================================
// ContextType
// ============================================================================

/// 컨텍스트 아이템 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    /// 대화 메시지
    Message,
    /// 웹 페이지
    Page,
    /// Gmail 메일
    Gmail,
    /// 메모리 fact
    Memory,
    /// 파일
    File,
    /// 브라우저 히스토리
    History,
}

impl ContextType {
    pub const ALL: [ContextType; 6] = [
        ContextType::Message,
        ContextType::Page,
        ContextType::Gmail,
        ContextType::Memory,
        ContextType::File,
        ContextType::History,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Message => "message",
            ContextType::Page => "page",
            ContextType::Gmail => "gmail",
            ContextType::Memory => "memory",
            ContextType::File => "file",
            ContextType::History => "history",
        }
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContextType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ContextType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("unknown context type: {}", s)))
    }
}

// ============================================================================
// ContextItem
// ============================================================================

/// 컨텍스트 아이템 - 토큰 비용과 우선순위를 가진 검색 가능한 텍스트 단위
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    /// 고유 ID (생성 시 할당, 불변)
    #[serde(default)]
    pub id: String,

    /// 아이템 종류 (불변)
    #[serde(rename = "type")]
    pub item_type: ContextType,

    /// 내용
    pub content: String,

    /// 토큰 수 (쓰기 시점에 재계산)
    #[serde(default)]
    pub tokens: usize,

    /// 우선순위 1-5 (높을수록 먼저 유지)
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// 생성 시간 (불변)
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// 생성한 에이전트/서브시스템
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,

    /// 소속 워크스페이스 (불변)
    #[serde(default)]
    pub workspace_id: WorkspaceId,

    /// 대화 스레드
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// 네임스페이스 내 삽입 순서 (동점 처리용)
    #[serde(default)]
    pub sequence: u64,

    /// 메타데이터 (출처, truncation 기록 등)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl ContextItem {
    /// 새 아이템 생성 (ID 자동 할당)
    pub fn new(item_type: ContextType, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_type,
            content: content.into(),
            tokens: 0,
            priority: DEFAULT_PRIORITY,
            timestamp: Utc::now(),
            source_agent_id: None,
            workspace_id: WorkspaceId::default(),
            thread_id: None,
            sequence: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.source_agent_id = Some(agent_id.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 우선순위 범위 검증
    pub fn validate_priority(priority: u8) -> Result<()> {
        if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "priority must be between {} and {}, got {}",
                MIN_PRIORITY, MAX_PRIORITY, priority
            )))
        }
    }
}

// ============================================================================
// Filter / Update
// ============================================================================

/// 목록 조회 필터
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFilter {
    /// 허용할 종류 (None이면 전체)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<ContextType>>,

    /// 에이전트 필터
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,

    /// 스레드 필터
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl ItemFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: Vec<ContextType>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_source_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.source_agent_id = Some(agent_id.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// 아이템이 필터를 통과하는지 확인
    pub fn matches(&self, item: &ContextItem) -> bool {
        if let Some(ref types) = self.types {
            if !types.contains(&item.item_type) {
                return false;
            }
        }

        if let Some(ref agent) = self.source_agent_id {
            if item.source_agent_id.as_deref() != Some(agent.as_str()) {
                return false;
            }
        }

        if let Some(ref thread) = self.thread_id {
            if item.thread_id.as_deref() != Some(thread.as_str()) {
                return false;
            }
        }

        true
    }
}

/// 우선순위 일괄 변경 항목
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityUpdate {
    pub id: String,
    pub priority: u8,
}

impl PriorityUpdate {
    pub fn new(id: impl Into<String>, priority: u8) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_builder() {
        let item = ContextItem::new(ContextType::Page, "hello")
            .with_priority(5)
            .with_source_agent("reader");

        assert!(!item.id.is_empty());
        assert_eq!(item.priority, 5);
        assert_eq!(item.source_agent_id.as_deref(), Some("reader"));
    }

    #[test]
    fn test_priority_range() {
        assert!(ContextItem::validate_priority(1).is_ok());
        assert!(ContextItem::validate_priority(5).is_ok());
        assert!(ContextItem::validate_priority(0).is_err());
        assert!(ContextItem::validate_priority(6).is_err());
    }

    #[test]
    fn test_workspace_id_validation() {
        assert!(WorkspaceId::new("w1").validate().is_ok());
        assert!(WorkspaceId::new("").validate().is_err());
        assert!(WorkspaceId::new("a/b").validate().is_err());
    }

    #[test]
    fn test_filter_matches() {
        let item = ContextItem::new(ContextType::Gmail, "mail")
            .with_source_agent("inbox")
            .with_thread("t1");

        assert!(ItemFilter::new().matches(&item));
        assert!(ItemFilter::new()
            .with_types(vec![ContextType::Gmail, ContextType::Page])
            .matches(&item));
        assert!(!ItemFilter::new()
            .with_types(vec![ContextType::Memory])
            .matches(&item));
        assert!(!ItemFilter::new().with_source_agent("other").matches(&item));
        assert!(ItemFilter::new().with_thread("t1").matches(&item));
    }

    #[test]
    fn test_serde_shape() {
        let item = ContextItem::new(ContextType::Memory, "fact").with_id("m1");
        let json = serde_json::to_value(&item).unwrap();

        assert_eq!(json["type"], "memory");
        assert_eq!(json["id"], "m1");
        assert!(json.get("workspaceId").is_some());

        let parsed: ContextType = "GMAIL".parse().unwrap();
        assert_eq!(parsed, ContextType::Gmail);
    }
}
