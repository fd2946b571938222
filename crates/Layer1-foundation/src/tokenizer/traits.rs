//! Tokenizer Trait 정의

/// 토크나이저 트레이트
///
/// 모든 토큰 계산 구현체가 따라야 하는 인터페이스입니다.
pub trait Tokenizer: Send + Sync {
    /// 텍스트를 토큰 수로 계산
    fn count(&self, text: &str) -> usize;

    /// 텍스트를 토큰 제한 내로 자르기
    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        // 이진 검색으로 적절한 길이 찾기
        let chars: Vec<char> = text.chars().collect();
        let mut low = 0;
        let mut high = chars.len();

        while low < high {
            let mid = (low + high + 1) / 2;
            let substr: String = chars[..mid].iter().collect();

            if self.count(&substr) <= max_tokens {
                low = mid;
            } else {
                high = mid - 1;
            }
        }

        chars[..low].iter().collect()
    }

    /// 텍스트를 토큰 제한 내로 자르기 (끝에서부터)
    fn truncate_from_end(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        let chars: Vec<char> = text.chars().collect();
        let mut low = 0;
        let mut high = chars.len();

        while low < high {
            let mid = (low + high + 1) / 2;
            let start = chars.len() - mid;
            let substr: String = chars[start..].iter().collect();

            if self.count(&substr) <= max_tokens {
                low = mid;
            } else {
                high = mid - 1;
            }
        }

        let start = chars.len() - low;
        chars[start..].iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::TokenEstimator;

    #[test]
    fn test_truncate() {
        let tokenizer = TokenEstimator::new();
        let text = "Hello, this is a test string that might be too long.";

        let truncated = tokenizer.truncate(text, 5);
        assert!(tokenizer.count(&truncated) <= 5);
        assert!(text.starts_with(&truncated));
    }

    #[test]
    fn test_truncate_from_end() {
        let tokenizer = TokenEstimator::new();
        let text = "first part of the text, then the tail we keep";

        let truncated = tokenizer.truncate_from_end(text, 3);
        assert!(tokenizer.count(&truncated) <= 3);
        assert!(text.ends_with(&truncated));
    }
}
