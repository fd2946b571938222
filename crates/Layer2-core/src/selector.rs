//! Selector - 토큰 예산 내 컨텍스트 선택
//!
//! 점수 = priority * W1 + recency * W2 + keywordOverlap * W3 (가중치 합 = 1)
//!
//! 1. 점수 내림차순 정렬 (동점은 낮은 sequence 우선)
//! 2. 예산에 맞는 아이템을 greedy하게 채택 (안 맞으면 건너뛰고 계속)
//! 3. "lost-in-the-middle" 배치: 최고 우선순위는 맨 앞, 두 번째는 맨 뒤
//!
//! ```text
//! [P5] [P3] [P2] ... [P4]
//!  ^    └── middle ──┘  ^
//!  first               last
//! ```

use crate::store::ContextStore;
use chrono::{DateTime, Utc};
use deepctx_foundation::{
    ContextItem, ContextType, Error, ItemFilter, Result, SelectorConfig, WorkspaceId,
    MAX_PRIORITY,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Options / Scores
// ============================================================================

/// 선택 옵션
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectOptions {
    /// 후보 종류 제한
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<ContextType>>,

    /// recency 가중치 덮어쓰기 (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recency_bias: Option<f32>,

    /// 최소 정규화 점수 (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_threshold: Option<f32>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: Vec<ContextType>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_recency_bias(mut self, bias: f32) -> Self {
        self.recency_bias = Some(bias);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.semantic_threshold = Some(threshold);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("recencyBias", self.recency_bias),
            ("semanticThreshold", self.semantic_threshold),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(Error::InvalidInput(format!(
                        "{} must be within [0, 1], got {}",
                        name, v
                    )));
                }
            }
        }
        Ok(())
    }
}

/// 컨텍스트 아이템의 관련성 점수
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelevanceScore {
    /// 우선순위 (priority / 5)
    pub priority: f32,
    /// 시간 가중치 (반감기 기반 감쇠)
    pub recency: f32,
    /// 쿼리 단어 겹침 비율
    pub keyword: f32,
    /// 종합 점수 (0.0 - 1.0)
    pub total: f32,
}

/// 정규화된 가중치
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub priority: f32,
    pub recency: f32,
    pub keyword: f32,
}

impl Weights {
    fn normalized(priority: f32, recency: f32, keyword: f32) -> Self {
        let sum = priority + recency + keyword;
        if sum <= 0.0 {
            // 전부 0이면 우선순위만 사용
            return Self {
                priority: 1.0,
                recency: 0.0,
                keyword: 0.0,
            };
        }
        Self {
            priority: priority / sum,
            recency: recency / sum,
            keyword: keyword / sum,
        }
    }
}

/// 점수가 매겨진 아이템
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredItem {
    pub item: ContextItem,
    pub score: RelevanceScore,
}

/// 선택 결과 (점수 포함)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    /// lost-in-the-middle 순서로 배치된 아이템
    pub items: Vec<ScoredItem>,
    pub total_tokens: usize,
    pub budget: usize,
    /// 필터/임계값을 통과한 후보 수
    pub considered: usize,
    /// 예산 초과로 건너뛴 수
    pub skipped: usize,
}

impl Selection {
    pub fn into_items(self) -> Vec<ContextItem> {
        self.items.into_iter().map(|s| s.item).collect()
    }
}

// ============================================================================
// Selector
// ============================================================================

pub struct Selector {
    store: Arc<ContextStore>,
    config: SelectorConfig,
}

impl Selector {
    pub fn new(store: Arc<ContextStore>, config: SelectorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// 옵션을 반영한 정규화 가중치
    pub fn weights(&self, options: &SelectOptions) -> Weights {
        Weights::normalized(
            self.config.priority_weight,
            options.recency_bias.unwrap_or(self.config.recency_weight),
            self.config.keyword_weight,
        )
    }

    /// 예산에 맞는 아이템 선택
    pub async fn select(
        &self,
        ws: &WorkspaceId,
        query: &str,
        token_budget: usize,
        options: &SelectOptions,
    ) -> Result<Vec<ContextItem>> {
        Ok(self
            .select_scored(ws, query, token_budget, options)
            .await?
            .into_items())
    }

    /// 예산에 맞는 아이템 선택 (점수/통계 포함)
    pub async fn select_scored(
        &self,
        ws: &WorkspaceId,
        query: &str,
        token_budget: usize,
        options: &SelectOptions,
    ) -> Result<Selection> {
        options.validate()?;

        let filter = ItemFilter {
            types: options.types.clone(),
            ..Default::default()
        };
        let items = self.store.list(ws, Some(&filter)).await?;

        let mut ranked = self.rank(items, query, options, Utc::now());
        if let Some(threshold) = options.semantic_threshold {
            ranked.retain(|s| s.score.total >= threshold);
        }

        let considered = ranked.len();
        if let Err(e) = Self::check_budget(token_budget, ranked.iter().map(|s| &s.item)) {
            debug!(workspace = %ws, "{}", e);
            return Ok(Selection {
                budget: token_budget,
                considered,
                skipped: considered,
                ..Default::default()
            });
        }

        let mut chosen = Vec::new();
        let mut total_tokens = 0usize;
        let mut skipped = 0usize;
        for scored in ranked {
            if total_tokens + scored.item.tokens <= token_budget {
                total_tokens += scored.item.tokens;
                chosen.push(scored);
            } else {
                skipped += 1;
            }
        }

        debug!(
            workspace = %ws,
            selected = chosen.len(),
            skipped,
            total_tokens,
            token_budget,
            "Context selected"
        );

        Ok(Selection {
            items: lost_in_the_middle(chosen),
            total_tokens,
            budget: token_budget,
            considered,
            skipped,
        })
    }

    /// 예산이 가장 작은 후보보다 작으면 `BudgetTooSmall`
    pub fn check_budget<'a>(
        budget: usize,
        candidates: impl IntoIterator<Item = &'a ContextItem>,
    ) -> Result<()> {
        match candidates.into_iter().map(|i| i.tokens).min() {
            Some(smallest) if budget < smallest => Err(Error::BudgetTooSmall { budget, smallest }),
            _ => Ok(()),
        }
    }

    /// 점수 계산 후 내림차순 정렬 (동점은 낮은 sequence 우선)
    pub fn rank(
        &self,
        items: Vec<ContextItem>,
        query: &str,
        options: &SelectOptions,
        now: DateTime<Utc>,
    ) -> Vec<ScoredItem> {
        let weights = self.weights(options);
        let terms = query_terms(query);

        let mut scored: Vec<ScoredItem> = items
            .into_iter()
            .map(|item| {
                let score = self.score(&item, &terms, weights, now);
                ScoredItem { item, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total
                .partial_cmp(&a.score.total)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.item.sequence.cmp(&b.item.sequence))
        });
        scored
    }

    /// 단일 아이템 점수
    pub fn score(
        &self,
        item: &ContextItem,
        terms: &HashSet<String>,
        weights: Weights,
        now: DateTime<Utc>,
    ) -> RelevanceScore {
        let priority = item.priority.min(MAX_PRIORITY) as f32 / MAX_PRIORITY as f32;
        let recency = calc_recency(item.timestamp, now, self.config.recency_half_life_hours);
        let keyword = keyword_overlap(terms, &item.content);

        RelevanceScore {
            priority,
            recency,
            keyword,
            total: (priority * weights.priority
                + recency * weights.recency
                + keyword * weights.keyword)
                .clamp(0.0, 1.0),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// 반감기 기반 최근성 (미래 timestamp는 1.0)
fn calc_recency(timestamp: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f32) -> f32 {
    let age_hours = now.signed_duration_since(timestamp).num_seconds().max(0) as f32 / 3600.0;
    if half_life_hours <= 0.0 {
        return 0.0;
    }
    0.5f32.powf(age_hours / half_life_hours)
}

/// 소문자 영숫자 단어 집합
pub fn query_terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// 쿼리 단어 중 아이템에 등장하는 비율
fn keyword_overlap(terms: &HashSet<String>, content: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let words = query_terms(content);
    let hits = terms.iter().filter(|t| words.contains(*t)).count();
    hits as f32 / terms.len() as f32
}

/// lost-in-the-middle 배치
///
/// 우선순위 내림차순(동점은 입력 순서)으로 정렬한 뒤
/// 1위는 맨 앞, 2위는 맨 뒤, 나머지는 그 사이에 내림차순으로 배치합니다.
pub fn lost_in_the_middle(mut items: Vec<ScoredItem>) -> Vec<ScoredItem> {
    // stable sort - 동점은 점수 순서 유지
    items.sort_by(|a, b| b.item.priority.cmp(&a.item.priority));
    if items.len() <= 2 {
        return items;
    }

    let second = items.remove(1);
    items.push(second);
    items
}
