//! Context Compressor
//!
//! 아이템 집합을 목표 토큰 수 이하로 줄이고 구조화된 diff를 돌려줍니다.
//! 저장소는 건드리지 않습니다 (커밋은 `ContextEngine`의 책임).
//!
//! ## 알고리즘
//!
//! 1. 우선순위 오름차순(동점은 낮은 sequence)으로 후보 정렬
//! 2. 목표 초과분이 남아있는 동안:
//!    - `priority <= drop_priority_ceiling` → 제거
//!    - 그 외 → `Shrinker::shrink(text, max(target_ratio, (tokens - excess) / tokens))`
//! 3. 그래도 초과하면 같은 순서로 제거 (마지막 하나는 유지)
//! 4. 마지막 하나가 여전히 초과하면 목표 크기로 잘라냄

mod shrink;
mod strategy;

pub use shrink::{Shrinker, TruncatingShrinker, ELISION_MARKER};
pub use strategy::CompressionStrategy;

use deepctx_foundation::{ContextItem, Error, Result, TokenEstimator, Tokenizer};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 기본 shrink 타임아웃
pub const DEFAULT_SHRINK_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Compression Result
// ============================================================================

/// 축약된 아이템 (전/후)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedItem {
    pub original: ContextItem,
    pub compressed: ContextItem,
}

/// 압축 미리보기
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionPreview {
    pub removed_items: Vec<ContextItem>,
    pub modified_items: Vec<ModifiedItem>,
}

/// 협력자 실패로 제거된 아이템
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedItem {
    pub item_id: String,
    pub reason: String,
}

/// 압축 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    pub original: Vec<ContextItem>,
    /// 살아남은 아이템 (입력 순서 유지)
    pub compressed: Vec<ContextItem>,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// compressed_tokens / original_tokens
    pub compression_ratio: f32,
    pub preview: CompressionPreview,
    #[serde(default)]
    pub degraded: Vec<DegradedItem>,
    pub strategy: String,
}

impl CompressionResult {
    /// 압축하지 않음 (이미 목표 이하)
    fn unchanged(items: &[ContextItem], tokens: usize, strategy: &CompressionStrategy) -> Self {
        Self {
            original: items.to_vec(),
            compressed: items.to_vec(),
            original_tokens: tokens,
            compressed_tokens: tokens,
            compression_ratio: 1.0,
            preview: CompressionPreview::default(),
            degraded: Vec::new(),
            strategy: strategy.name.clone(),
        }
    }

    /// 변경이 있는지
    pub fn has_changes(&self) -> bool {
        !self.preview.removed_items.is_empty() || !self.preview.modified_items.is_empty()
    }

    pub fn tokens_saved(&self) -> usize {
        self.original_tokens.saturating_sub(self.compressed_tokens)
    }
}

/// 압축 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub compression_count: u64,
    pub total_tokens_saved: u64,
    pub degraded_count: u64,
}

// ============================================================================
// Working state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Kept,
    Modified,
    Dropped,
}

struct Slot {
    item: ContextItem,
    tokens: usize,
    state: SlotState,
}

struct Work {
    slots: Vec<Slot>,
    total: usize,
    live: usize,
    degraded: Vec<DegradedItem>,
}

impl Work {
    fn drop_slot(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if slot.state != SlotState::Dropped {
            self.total -= slot.tokens;
            self.live -= 1;
            slot.state = SlotState::Dropped;
        }
    }

    fn set_content(&mut self, idx: usize, content: String, tokens: usize) {
        let slot = &mut self.slots[idx];
        self.total = self.total - slot.tokens + tokens;
        slot.item.content = content;
        slot.item.tokens = tokens;
        slot.tokens = tokens;
        slot.state = SlotState::Modified;
    }
}

/// shrink 호출 결과
enum ShrinkOutcome {
    Shrunk(String, usize),
    NoGain,
    Failed(String),
}

// ============================================================================
// Compressor
// ============================================================================

/// 컨텍스트 압축기
pub struct Compressor {
    estimator: TokenEstimator,
    shrinker: Arc<dyn Shrinker>,
    shrink_timeout: Duration,

    /// 누적 압축 횟수
    compression_count: AtomicU64,

    /// 누적 절약 토큰
    total_tokens_saved: AtomicU64,

    /// 누적 degraded 아이템 수
    degraded_count: AtomicU64,
}

impl Compressor {
    pub fn new(shrinker: Arc<dyn Shrinker>) -> Self {
        Self {
            estimator: TokenEstimator::new(),
            shrinker,
            shrink_timeout: DEFAULT_SHRINK_TIMEOUT,
            compression_count: AtomicU64::new(0),
            total_tokens_saved: AtomicU64::new(0),
            degraded_count: AtomicU64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.shrink_timeout = timeout;
        self
    }

    pub fn shrink_timeout(&self) -> Duration {
        self.shrink_timeout
    }

    /// 압축 수행
    pub async fn compress(
        &self,
        items: &[ContextItem],
        strategy: &CompressionStrategy,
        target_tokens: usize,
    ) -> Result<CompressionResult> {
        self.compress_with_cancel(items, strategy, target_tokens, &CancellationToken::new())
            .await
    }

    /// 취소 가능한 압축
    ///
    /// 취소되면 `Cancelled`를 반환합니다. 부분 결과는 없습니다.
    pub async fn compress_with_cancel(
        &self,
        items: &[ContextItem],
        strategy: &CompressionStrategy,
        target_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<CompressionResult> {
        if items.is_empty() {
            return Err(Error::NoContentToCompress);
        }
        if target_tokens == 0 {
            return Err(Error::InvalidInput(
                "target tokens must be greater than zero".to_string(),
            ));
        }
        strategy.validate()?;

        let slots: Vec<Slot> = items
            .iter()
            .map(|item| {
                let tokens = self.estimator.count(&item.content);
                Slot {
                    item: ContextItem {
                        tokens,
                        ..item.clone()
                    },
                    tokens,
                    state: SlotState::Kept,
                }
            })
            .collect();
        let original_tokens: usize = slots.iter().map(|s| s.tokens).sum();

        if original_tokens <= target_tokens {
            debug!(original_tokens, target_tokens, "Compression not needed");
            return Ok(CompressionResult::unchanged(items, original_tokens, strategy));
        }

        let mut work = Work {
            live: slots.len(),
            total: original_tokens,
            slots,
            degraded: Vec::new(),
        };

        // 우선순위 오름차순, 동점은 sequence, 입력 순서
        let mut order: Vec<usize> = (0..work.slots.len()).collect();
        order.sort_by_key(|&i| (work.slots[i].item.priority, work.slots[i].item.sequence, i));

        // Pass 1: 제거 또는 축약
        for &idx in &order {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if work.total <= target_tokens {
                break;
            }

            let is_last = work.live == 1;
            let tokens = work.slots[idx].tokens;
            if tokens == 0 {
                continue;
            }

            if strategy.drops(work.slots[idx].item.priority) {
                if !is_last {
                    work.drop_slot(idx);
                }
                continue;
            }

            let excess = work.total - target_tokens;
            let keep = tokens.saturating_sub(excess);
            let ratio = strategy.target_ratio.max(keep as f32 / tokens as f32);

            match self.shrink_slot(&work.slots[idx], ratio, cancel).await? {
                ShrinkOutcome::Shrunk(content, new_tokens) => {
                    work.set_content(idx, content, new_tokens);
                }
                ShrinkOutcome::NoGain => {
                    if !is_last {
                        work.drop_slot(idx);
                    }
                }
                ShrinkOutcome::Failed(reason) => {
                    warn!(
                        item_id = %work.slots[idx].item.id,
                        shrinker = self.shrinker.name(),
                        %reason,
                        "Shrink failed, degrading item"
                    );
                    work.degraded.push(DegradedItem {
                        item_id: work.slots[idx].item.id.clone(),
                        reason,
                    });
                    if !is_last {
                        work.drop_slot(idx);
                    }
                }
            }
        }

        // Pass 2: 남은 초과분은 제거 (마지막 하나는 유지)
        for &idx in &order {
            if work.total <= target_tokens || work.live <= 1 {
                break;
            }
            if work.slots[idx].state != SlotState::Dropped {
                work.drop_slot(idx);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // 마지막 생존자 강제 절단
        if work.total > target_tokens {
            if let Some(idx) = (0..work.slots.len())
                .find(|&i| work.slots[i].state != SlotState::Dropped)
            {
                let content = self
                    .estimator
                    .truncate(&work.slots[idx].item.content, target_tokens);
                let tokens = self.estimator.count(&content);
                work.set_content(idx, content, tokens);
            }
        }

        let result = self.finish(items, original_tokens, work, strategy);

        self.compression_count.fetch_add(1, Ordering::Relaxed);
        self.total_tokens_saved
            .fetch_add(result.tokens_saved() as u64, Ordering::Relaxed);
        self.degraded_count
            .fetch_add(result.degraded.len() as u64, Ordering::Relaxed);

        info!(
            strategy = %strategy.name,
            original_tokens = result.original_tokens,
            compressed_tokens = result.compressed_tokens,
            removed = result.preview.removed_items.len(),
            modified = result.preview.modified_items.len(),
            degraded = result.degraded.len(),
            "Compression computed"
        );

        Ok(result)
    }

    /// 단일 아이템 축약 (타임아웃 + 취소)
    async fn shrink_slot(
        &self,
        slot: &Slot,
        ratio: f32,
        cancel: &CancellationToken,
    ) -> Result<ShrinkOutcome> {
        let ceiling = (slot.tokens as f32 * ratio).floor() as usize;
        if ceiling == 0 {
            return Ok(ShrinkOutcome::NoGain);
        }

        let call = tokio::time::timeout(
            self.shrink_timeout,
            self.shrinker.shrink(&slot.item.content, ratio),
        );
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = call => outcome,
        };

        let text = match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Ok(ShrinkOutcome::Failed(e.to_string())),
            Err(_) => {
                let e = Error::ExternalTimeout(format!(
                    "shrink timed out after {:?}",
                    self.shrink_timeout
                ));
                return Ok(ShrinkOutcome::Failed(e.to_string()));
            }
        };

        // 요청 이상으로 돌아오면 강제 절단
        let text = if self.estimator.count(&text) > ceiling {
            self.estimator.truncate(&text, ceiling)
        } else {
            text
        };
        let tokens = self.estimator.count(&text);

        if tokens >= slot.tokens {
            Ok(ShrinkOutcome::NoGain)
        } else {
            Ok(ShrinkOutcome::Shrunk(text, tokens))
        }
    }

    fn finish(
        &self,
        items: &[ContextItem],
        original_tokens: usize,
        work: Work,
        strategy: &CompressionStrategy,
    ) -> CompressionResult {
        let mut compressed = Vec::new();
        let mut preview = CompressionPreview::default();

        for (original, slot) in items.iter().zip(work.slots) {
            match slot.state {
                SlotState::Kept => compressed.push(slot.item),
                SlotState::Modified => {
                    preview.modified_items.push(ModifiedItem {
                        original: original.clone(),
                        compressed: slot.item.clone(),
                    });
                    compressed.push(slot.item);
                }
                SlotState::Dropped => preview.removed_items.push(original.clone()),
            }
        }

        let compressed_tokens: usize = compressed.iter().map(|i| i.tokens).sum();
        let compression_ratio = if original_tokens == 0 {
            1.0
        } else {
            compressed_tokens as f32 / original_tokens as f32
        };

        CompressionResult {
            original: items.to_vec(),
            compressed,
            original_tokens,
            compressed_tokens,
            compression_ratio,
            preview,
            degraded: work.degraded,
            strategy: strategy.name.clone(),
        }
    }

    /// 압축 통계
    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            compression_count: self.compression_count.load(Ordering::Relaxed),
            total_tokens_saved: self.total_tokens_saved.load(Ordering::Relaxed),
            degraded_count: self.degraded_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(Arc::new(TruncatingShrinker::new()))
    }
}

// ============================================================================
// Tests
// ============================================================================
