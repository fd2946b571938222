//! 문자 기반 토큰 추정기
//!
//! 언어별 문자/토큰 비율을 적용해 결정적으로 토큰 수를 추정합니다.

use super::traits::Tokenizer;

/// ASCII 문자당 토큰 비율
const ASCII_CHARS_PER_TOKEN: f32 = 4.0;

/// CJK 문자당 토큰 비율
const CJK_CHARS_PER_TOKEN: f32 = 1.5;

/// 기타 유니코드 문자당 토큰 비율
const OTHER_CHARS_PER_TOKEN: f32 = 2.0;

/// 문자 기반 추정 토크나이저
///
/// Deterministic, side-effect-free, O(length).
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    /// 텍스트의 언어 특성을 분석하여 토큰 수 추정
    ///
    /// Single-pass, no allocation.
    #[inline]
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let mut ascii_count = 0u32;
        let mut cjk_count = 0u32;
        let mut other_count = 0u32;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_count += 1;
            } else if is_cjk(c) {
                cjk_count += 1;
            } else {
                other_count += 1;
            }
        }

        let ascii_tokens = ascii_count as f32 / ASCII_CHARS_PER_TOKEN;
        let cjk_tokens = cjk_count as f32 / CJK_CHARS_PER_TOKEN;
        let other_tokens = other_count as f32 / OTHER_CHARS_PER_TOKEN;

        (ascii_tokens + cjk_tokens + other_tokens).ceil() as usize
    }
}

impl Tokenizer for TokenEstimator {
    fn count(&self, text: &str) -> usize {
        self.estimate(text)
    }
}

/// CJK 문자 판별 (한글, 한자, 가나)
#[inline]
fn is_cjk(c: char) -> bool {
    let code = c as u32;

    // Fast-path: 0x1100 미만은 CJK 아님
    if code < 0x1100 {
        return false;
    }

    // Korean syllables
    if (0xAC00..=0xD7AF).contains(&code) {
        return true;
    }

    // CJK Unified Ideographs
    if (0x4E00..=0x9FFF).contains(&code) {
        return true;
    }

    // Hiragana / Katakana
    if (0x3040..=0x30FF).contains(&code) {
        return true;
    }

    // Hangul Jamo
    (0x1100..=0x11FF).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(TokenEstimator::new().estimate(""), 0);
    }

    #[test]
    fn test_ascii_ratio() {
        let estimator = TokenEstimator::new();
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
        assert_eq!(estimator.estimate(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_cjk_costs_more() {
        let estimator = TokenEstimator::new();
        let en = estimator.estimate("Hello");
        let ko = estimator.estimate("안녕하세요");
        assert!(ko > en);
        assert_eq!(ko, 4);
    }

    #[test]
    fn test_deterministic() {
        let estimator = TokenEstimator::new();
        let text = "Mixed 텍스트 with ünïcödé";
        assert_eq!(estimator.estimate(text), estimator.estimate(text));
    }

    #[test]
    fn test_cjk_detection() {
        assert!(is_cjk('가'));
        assert!(is_cjk('中'));
        assert!(is_cjk('あ'));
        assert!(!is_cjk('a'));
        assert!(!is_cjk('é'));
    }
}
