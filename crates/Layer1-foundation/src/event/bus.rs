//! Event Bus - 이벤트 브로드캐스트 시스템
//!
//! `tokio::sync::broadcast` 기반 발행/구독. 최근 이벤트는 히스토리에 보관합니다.

use super::types::ContextEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

// ============================================================================
// EventFilter
// ============================================================================

/// 이벤트 필터
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 워크스페이스 필터
    pub workspace_id: Option<String>,

    /// 이벤트 종류 필터 (`ContextEventKind::name`)
    pub kinds: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// 이벤트가 필터를 통과하는지 확인
    pub fn matches(&self, event: &ContextEvent) -> bool {
        if let Some(ref ws) = self.workspace_id {
            if &event.workspace_id != ws {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.iter().any(|k| k == event.kind.name()) {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// 이벤트 버스 설정
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// 브로드캐스트 채널 용량
    pub channel_capacity: usize,

    /// 이벤트 히스토리 보관 개수
    pub history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_size: 100,
        }
    }
}

/// 이벤트 버스
///
/// ```ignore
/// let bus = EventBus::new();
/// let mut rx = bus.receiver();
/// bus.publish(ContextEvent::new("ws", ContextEventKind::WorkspaceDeleted)).await;
/// let event = rx.recv().await?;
/// ```
pub struct EventBus {
    config: EventBusConfig,

    /// 브로드캐스트 채널 송신자
    sender: broadcast::Sender<ContextEvent>,

    /// 이벤트 히스토리
    history: RwLock<VecDeque<ContextEvent>>,

    /// 발행된 이벤트 수
    event_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));

        Self {
            config,
            sender,
            history: RwLock::new(VecDeque::new()),
            event_count: AtomicU64::new(0),
        }
    }

    /// 이벤트 발행
    ///
    /// 수신자가 없어도 실패하지 않습니다.
    pub async fn publish(&self, event: ContextEvent) {
        let count = self.event_count.fetch_add(1, Ordering::SeqCst);

        trace!(
            event_id = %event.id,
            workspace = %event.workspace_id,
            kind = event.kind.name(),
            "Publishing event #{}", count + 1
        );

        {
            let mut history = self.history.write().await;
            history.push_back(event.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        let _ = self.sender.send(event);
    }

    /// 브로드캐스트 수신자 생성
    pub fn receiver(&self) -> broadcast::Receiver<ContextEvent> {
        self.sender.subscribe()
    }

    /// 필터로 히스토리 검색 (발행순)
    pub async fn search_history(&self, filter: &EventFilter) -> Vec<ContextEvent> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
