//! Stats Aggregator - 현재 아이템 집합의 요약 통계

use crate::selector::{query_terms, SelectOptions, Selector};
use crate::store::ContextStore;
use chrono::Utc;
use deepctx_foundation::{ContextItem, ContextType, Error, Result, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 에이전트 정보가 없는 아이템의 집계 키
pub const UNATTRIBUTED_AGENT: &str = "unattributed";

/// 취소 확인 주기 (아이템 수)
const CANCEL_CHECK_INTERVAL: usize = 256;

/// 워크스페이스 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
    pub total_items: usize,
    pub total_tokens: usize,
    pub items_by_type: BTreeMap<ContextType, usize>,
    pub tokens_by_type: BTreeMap<ContextType, usize>,
    pub items_by_agent: BTreeMap<String, usize>,
    /// 빈 쿼리 기준 평균 Selector 점수
    pub average_relevance: f32,
}

pub struct StatsAggregator {
    store: Arc<ContextStore>,
    selector: Arc<Selector>,
}

impl StatsAggregator {
    pub fn new(store: Arc<ContextStore>, selector: Arc<Selector>) -> Self {
        Self { store, selector }
    }

    pub async fn stats(&self, ws: &WorkspaceId) -> Result<ContextStats> {
        self.stats_with_cancel(ws, &CancellationToken::new()).await
    }

    pub async fn stats_with_cancel(
        &self,
        ws: &WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<ContextStats> {
        let items = self.store.list(ws, None).await?;
        self.aggregate(&items, cancel)
    }

    /// 아이템 목록에서 통계 계산 (O(n))
    pub fn aggregate(
        &self,
        items: &[ContextItem],
        cancel: &CancellationToken,
    ) -> Result<ContextStats> {
        let mut stats = ContextStats::default();
        let weights = self.selector.weights(&SelectOptions::default());
        let terms = query_terms("");
        let now = Utc::now();
        let mut relevance_sum = 0.0f32;

        for (i, item) in items.iter().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            stats.total_items += 1;
            stats.total_tokens += item.tokens;
            *stats.items_by_type.entry(item.item_type).or_default() += 1;
            *stats.tokens_by_type.entry(item.item_type).or_default() += item.tokens;

            let agent = item
                .source_agent_id
                .clone()
                .unwrap_or_else(|| UNATTRIBUTED_AGENT.to_string());
            *stats.items_by_agent.entry(agent).or_default() += 1;

            relevance_sum += self.selector.score(item, &terms, weights, now).total;
        }

        if stats.total_items > 0 {
            stats.average_relevance = relevance_sum / stats.total_items as f32;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepctx_foundation::{MemoryKv, SelectorConfig};

    fn setup() -> (Arc<ContextStore>, StatsAggregator) {
        let store = Arc::new(ContextStore::new(Arc::new(MemoryKv::new()), "user"));
        let selector = Arc::new(Selector::new(store.clone(), SelectorConfig::default()));
        (store.clone(), StatsAggregator::new(store, selector))
    }

    #[tokio::test]
    async fn test_stats_breakdown() {
        let (store, stats) = setup();
        let ws = WorkspaceId::new("w");
        store
            .write(&ws, ContextItem::new(ContextType::Message, "abcd").with_source_agent("planner"))
            .await
            .unwrap();
        store
            .write(&ws, ContextItem::new(ContextType::Message, "abcdefgh"))
            .await
            .unwrap();
        store
            .write(&ws, ContextItem::new(ContextType::Gmail, "abcd").with_source_agent("planner"))
            .await
            .unwrap();

        let s = stats.stats(&ws).await.unwrap();
        assert_eq!(s.total_items, 3);
        assert_eq!(s.total_tokens, 4);
        assert_eq!(s.items_by_type[&ContextType::Message], 2);
        assert_eq!(s.tokens_by_type[&ContextType::Message], 3);
        assert_eq!(s.items_by_agent["planner"], 2);
        assert_eq!(s.items_by_agent[UNATTRIBUTED_AGENT], 1);
        assert!(s.average_relevance > 0.0 && s.average_relevance <= 1.0);
    }

    #[tokio::test]
    async fn test_empty_workspace() {
        let (_store, stats) = setup();
        let s = stats.stats(&WorkspaceId::new("empty")).await.unwrap();
        assert_eq!(s, ContextStats::default());
    }

    #[tokio::test]
    async fn test_cancelled() {
        let (store, stats) = setup();
        let ws = WorkspaceId::new("w");
        store
            .write(&ws, ContextItem::new(ContextType::Page, "x"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            stats.stats_with_cancel(&ws, &cancel).await,
            Err(Error::Cancelled)
        ));
    }
}
