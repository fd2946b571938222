//! Tokenizer Module - 토큰 수 추정
//!
//! 컨텍스트 아이템의 토큰 비용을 계산합니다. 정확한 토큰화 대신
//! 문자 기반 추정을 사용하며, 저장소/Selector/Compressor/통계가
//! 모두 같은 추정기를 공유해야 예산 계산이 일관됩니다.
//!
//! ## 추정 비율
//!
//! | 문자 종류 | 토큰당 문자 수 |
//! |----------|---------------|
//! | ASCII | 4.0 |
//! | CJK (한글/한자/가나) | 1.5 |
//! | 기타 유니코드 | 2.0 |
//!
//! ## 사용법
//!
//! ```ignore
//! use deepctx_foundation::tokenizer::{TokenEstimator, Tokenizer};
//!
//! let estimator = TokenEstimator::new();
//! assert_eq!(estimator.count(""), 0);
//!
//! // 토큰 제한 내에서 텍스트 자르기
//! let truncated = estimator.truncate("very long text...", 100);
//! ```

mod estimator;
mod traits;

pub use estimator::TokenEstimator;
pub use traits::Tokenizer;
