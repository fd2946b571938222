//! Shrinker - 텍스트 축약 협력자
//!
//! 요약 모델(로컬/클라우드 AI)은 외부 협력자이므로 trait으로 분리합니다.
//! 기본 구현 `TruncatingShrinker`는 앞/뒤를 남기고 가운데를 생략합니다.

use async_trait::async_trait;
use deepctx_foundation::{Result, TokenEstimator, Tokenizer};

/// 생략 표시
pub const ELISION_MARKER: &str = "\n[...]\n";

/// 텍스트 축약 트레이트
#[async_trait]
pub trait Shrinker: Send + Sync {
    /// 이름 (로그용)
    fn name(&self) -> &str {
        "shrinker"
    }

    /// `ratio` 비율(토큰 기준)로 텍스트 축약
    async fn shrink(&self, text: &str, ratio: f32) -> Result<String>;
}

/// 앞/뒤 유지 + 가운데 생략
#[derive(Debug, Clone, Default)]
pub struct TruncatingShrinker {
    estimator: TokenEstimator,
}

impl TruncatingShrinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 동기 버전 (테스트/내부용)
    pub fn shrink_to(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.estimator.count(text);
        if tokens <= max_tokens {
            return text.to_string();
        }

        let marker = self.estimator.count(ELISION_MARKER);
        if max_tokens <= marker + 1 {
            return self.estimator.truncate(text, max_tokens);
        }

        let available = max_tokens - marker;
        let head_budget = (available * 2 / 3).max(1);
        let head = self.estimator.truncate(text, head_budget);
        let tail_budget = available.saturating_sub(self.estimator.count(&head));
        let tail = self.estimator.truncate_from_end(text, tail_budget);

        format!("{}{}{}", head, ELISION_MARKER, tail)
    }
}

#[async_trait]
impl Shrinker for TruncatingShrinker {
    fn name(&self) -> &str {
        "truncating"
    }

    async fn shrink(&self, text: &str, ratio: f32) -> Result<String> {
        let tokens = self.estimator.count(text);
        let max_tokens = (tokens as f32 * ratio.clamp(0.0, 1.0)).floor() as usize;
        Ok(self.shrink_to(text, max_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shrink_keeps_head_and_tail() {
        let shrinker = TruncatingShrinker::new();
        let text = format!("{}{}{}", "H".repeat(200), "m".repeat(400), "T".repeat(200));

        let out = shrinker.shrink(&text, 0.3).await.unwrap();
        let estimator = TokenEstimator::new();

        assert!(estimator.count(&out) <= 60);
        assert!(out.starts_with('H'));
        assert!(out.ends_with('T'));
        assert!(out.contains(ELISION_MARKER));
    }

    #[tokio::test]
    async fn test_short_text_untouched() {
        let shrinker = TruncatingShrinker::new();
        assert_eq!(shrinker.shrink("abc", 1.0).await.unwrap(), "abc");
    }

    #[test]
    fn test_tiny_budget_plain_truncate() {
        let shrinker = TruncatingShrinker::new();
        let out = shrinker.shrink_to(&"x".repeat(100), 2);
        assert_eq!(out, "x".repeat(8));
    }
}
