//! Compression Strategy - 압축 전략 프리셋

use deepctx_foundation::{Error, Result};
use serde::{Deserialize, Serialize};

/// 압축 전략
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStrategy {
    pub name: String,

    pub description: String,

    /// 아이템당 최소 유지 비율 (0.0 < r <= 1.0)
    pub target_ratio: f32,

    /// 이 우선순위 이하는 축약하지 않고 바로 제거 (0이면 제거 없음)
    pub drop_priority_ceiling: u8,
}

impl CompressionStrategy {
    /// 80% 유지, 제거 없음
    pub fn minimal() -> Self {
        Self {
            name: "minimal".to_string(),
            description: "Light trimming, keeps about 80% of each item".to_string(),
            target_ratio: 0.8,
            drop_priority_ceiling: 0,
        }
    }

    /// 50% 유지, 우선순위 1 제거
    pub fn balanced() -> Self {
        Self {
            name: "balanced".to_string(),
            description: "Halves items and drops the lowest priority".to_string(),
            target_ratio: 0.5,
            drop_priority_ceiling: 1,
        }
    }

    /// 30% 유지, 우선순위 2 이하 제거
    pub fn aggressive() -> Self {
        Self {
            name: "aggressive".to_string(),
            description: "Keeps about 30% and drops priorities 1-2".to_string(),
            target_ratio: 0.3,
            drop_priority_ceiling: 2,
        }
    }

    /// 사용자 정의 전략
    pub fn custom(
        name: impl Into<String>,
        target_ratio: f32,
        drop_priority_ceiling: u8,
    ) -> Result<Self> {
        let strategy = Self {
            name: name.into(),
            description: "Custom strategy".to_string(),
            target_ratio,
            drop_priority_ceiling,
        };
        strategy.validate()?;
        Ok(strategy)
    }

    /// 기본 제공 전략 목록
    pub fn all() -> Vec<Self> {
        vec![Self::minimal(), Self::balanced(), Self::aggressive()]
    }

    /// 이름으로 전략 찾기 (대소문자 무시)
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::minimal()),
            "balanced" => Ok(Self::balanced()),
            "aggressive" => Ok(Self::aggressive()),
            other => Err(Error::InvalidInput(format!(
                "unknown compression strategy '{}' (expected minimal, balanced or aggressive)",
                other
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.target_ratio > 0.0 && self.target_ratio <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "target ratio must be within (0, 1], got {}",
                self.target_ratio
            )));
        }
        Ok(())
    }

    /// 이 우선순위의 아이템을 제거해야 하는지
    pub fn drops(&self, priority: u8) -> bool {
        priority <= self.drop_priority_ceiling
    }
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        Self::balanced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(CompressionStrategy::minimal().target_ratio, 0.8);
        assert_eq!(CompressionStrategy::balanced().target_ratio, 0.5);
        assert_eq!(CompressionStrategy::aggressive().target_ratio, 0.3);
        assert!(!CompressionStrategy::minimal().drops(1));
        assert!(CompressionStrategy::aggressive().drops(2));
        assert!(!CompressionStrategy::aggressive().drops(3));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            CompressionStrategy::from_name("Aggressive").unwrap(),
            CompressionStrategy::aggressive()
        );
        assert!(CompressionStrategy::from_name("extreme").is_err());
    }

    #[test]
    fn test_custom_validation() {
        assert!(CompressionStrategy::custom("x", 0.0, 0).is_err());
        assert!(CompressionStrategy::custom("x", 1.0, 0).is_ok());
        assert!(CompressionStrategy::custom("x", 1.2, 0).is_err());
    }
}
