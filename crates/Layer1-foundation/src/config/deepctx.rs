//! DeepCtx Config - 통합 설정
//!
//! 글로벌(`<config_dir>/deepctx/config.json`)과 프로젝트(`.deepctx/config.json`)
//! 설정을 병합하여 사용합니다. 프로젝트 설정이 우선합니다.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 설정 파일명
pub const DEEPCTX_CONFIG_FILE: &str = "config.json";

/// 기본 사용자 ID
const DEFAULT_USER: &str = "local";

// ============================================================================
// DeepCtx Config (통합)
// ============================================================================

/// DeepCtx 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeepCtxConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    /// 사용자 ID (네임스페이스 최상위 키)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// 데이터 디렉토리 (SQLite 파일 위치)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// 저장소 설정
    #[serde(default)]
    pub storage: StorageConfig,

    /// Selector 가중치
    #[serde(default)]
    pub selector: SelectorConfig,

    /// 압축 설정
    #[serde(default)]
    pub compression: CompressionConfig,

    /// 체크포인트 설정
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
}

impl DeepCtxConfig {
    pub fn new() -> Self {
        Self {
            version: default_version(),
            ..Default::default()
        }
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load() -> Result<Self> {
        let global = JsonStore::global().ok();
        let project = JsonStore::current_project().ok();
        Self::load_from(global.as_ref(), project.as_ref())
    }

    /// 지정한 저장소들에서 순서대로 병합 로드
    pub fn load_from(global: Option<&JsonStore>, project: Option<&JsonStore>) -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Some(store) = global {
            if let Some(global_config) = store.load_optional::<DeepCtxConfig>(DEEPCTX_CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Some(store) = project {
            if let Some(project_config) =
                store.load_optional::<DeepCtxConfig>(DEEPCTX_CONFIG_FILE)?
            {
                config.merge(project_config);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// 글로벌 설정 저장
    pub fn save_global(&self) -> Result<()> {
        JsonStore::global()?.save(DEEPCTX_CONFIG_FILE, self)
    }

    /// 프로젝트 설정 저장
    pub fn save_project(&self) -> Result<()> {
        JsonStore::current_project()?.save(DEEPCTX_CONFIG_FILE, self)
    }

    /// 다른 설정을 병합 (other 우선)
    pub fn merge(&mut self, other: DeepCtxConfig) {
        if other.user_id.is_some() {
            self.user_id = other.user_id;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }

        self.storage.merge(other.storage);
        self.selector.merge(other.selector);
        self.compression.merge(other.compression);
        self.checkpoints.merge(other.checkpoints);
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        self.selector.validate()?;
        if self.compression.shrink_timeout_secs == 0 {
            return Err(Error::Config(
                "compression.shrinkTimeoutSecs must be positive".to_string(),
            ));
        }
        if self.storage.max_item_tokens == 0 {
            return Err(Error::Config(
                "storage.maxItemTokens must be positive".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or(DEFAULT_USER)
    }

    /// 데이터 디렉토리 (설정 없으면 <data_dir>/deepctx)
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("deepctx")
        })
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_backend(mut self, backend: StorageBackend) -> Self {
        self.storage.backend = backend;
        self
    }
}

// ============================================================================
// Storage Config
// ============================================================================

/// 저장소 백엔드 종류
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

/// 저장소 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// 아이템당 최대 토큰 (초과분은 저장 시 잘림)
    #[serde(default = "default_max_item_tokens")]
    pub max_item_tokens: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            max_item_tokens: default_max_item_tokens(),
        }
    }
}

impl StorageConfig {
    fn merge(&mut self, other: StorageConfig) {
        if other.backend != StorageBackend::default() {
            self.backend = other.backend;
        }
        if other.max_item_tokens != default_max_item_tokens() {
            self.max_item_tokens = other.max_item_tokens;
        }
    }
}

// ============================================================================
// Selector Config
// ============================================================================

/// Selector 점수 가중치
///
/// score = priority * W1 + recency * W2 + keywordOverlap * W3
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorConfig {
    #[serde(default = "default_priority_weight")]
    pub priority_weight: f32,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f32,

    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,

    /// recency 반감기 (시간)
    #[serde(default = "default_half_life_hours")]
    pub recency_half_life_hours: f32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            priority_weight: default_priority_weight(),
            recency_weight: default_recency_weight(),
            keyword_weight: default_keyword_weight(),
            recency_half_life_hours: default_half_life_hours(),
        }
    }
}

impl SelectorConfig {
    fn merge(&mut self, other: SelectorConfig) {
        if other.priority_weight != default_priority_weight() {
            self.priority_weight = other.priority_weight;
        }
        if other.recency_weight != default_recency_weight() {
            self.recency_weight = other.recency_weight;
        }
        if other.keyword_weight != default_keyword_weight() {
            self.keyword_weight = other.keyword_weight;
        }
        if other.recency_half_life_hours != default_half_life_hours() {
            self.recency_half_life_hours = other.recency_half_life_hours;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let weights = [self.priority_weight, self.recency_weight, self.keyword_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Config(
                "selector weights must be finite and non-negative".to_string(),
            ));
        }
        if weights.iter().sum::<f32>() <= 0.0 {
            return Err(Error::Config(
                "at least one selector weight must be positive".to_string(),
            ));
        }
        if !(self.recency_half_life_hours > 0.0) {
            return Err(Error::Config(
                "selector.recencyHalfLifeHours must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Compression Config
// ============================================================================

/// 압축 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionConfig {
    /// 기본 전략 이름 (minimal / balanced / aggressive)
    #[serde(default = "default_strategy")]
    pub default_strategy: String,

    /// shrink 협력자 타임아웃 (초)
    #[serde(default = "default_shrink_timeout")]
    pub shrink_timeout_secs: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            shrink_timeout_secs: default_shrink_timeout(),
        }
    }
}

impl CompressionConfig {
    fn merge(&mut self, other: CompressionConfig) {
        if other.default_strategy != default_strategy() {
            self.default_strategy = other.default_strategy;
        }
        if other.shrink_timeout_secs != default_shrink_timeout() {
            self.shrink_timeout_secs = other.shrink_timeout_secs;
        }
    }

    pub fn shrink_timeout(&self) -> Duration {
        Duration::from_secs(self.shrink_timeout_secs)
    }
}

// ============================================================================
// Checkpoint Config
// ============================================================================

/// 체크포인트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// 세션당 최대 체크포인트 수 (기본 0 = 무제한, 설정하면 초과분을 오래된 것부터 정리)
    #[serde(default = "default_max_checkpoints")]
    pub max_per_session: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_per_session: default_max_checkpoints(),
        }
    }
}

impl CheckpointConfig {
    fn merge(&mut self, other: CheckpointConfig) {
        if other.max_per_session != default_max_checkpoints() {
            self.max_per_session = other.max_per_session;
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn default_version() -> u32 {
    1
}

fn default_max_item_tokens() -> usize {
    8_000
}

fn default_priority_weight() -> f32 {
    0.6
}

fn default_recency_weight() -> f32 {
    0.15
}

fn default_keyword_weight() -> f32 {
    0.25
}

fn default_half_life_hours() -> f32 {
    24.0
}

fn default_strategy() -> String {
    "balanced".to_string()
}

fn default_shrink_timeout() -> u64 {
    30
}

fn default_max_checkpoints() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = DeepCtxConfig::new();
        assert_eq!(config.version, 1);
        assert_eq!(config.user_id(), "local");
        assert_eq!(config.compression.shrink_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_merge() {
        let mut base = DeepCtxConfig::new().with_user("alice");
        base.compression.shrink_timeout_secs = 10;

        let mut overlay = DeepCtxConfig::new();
        overlay.compression.default_strategy = "aggressive".to_string();
        overlay.storage.backend = StorageBackend::Memory;

        base.merge(overlay);

        assert_eq!(base.user_id(), "alice");
        assert_eq!(base.compression.default_strategy, "aggressive");
        assert_eq!(base.compression.shrink_timeout_secs, 10);
        assert_eq!(base.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_load_from_project_overrides_global() {
        let global_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let global = JsonStore::new(global_dir.path());
        let project = JsonStore::new(project_dir.path());

        global
            .save(DEEPCTX_CONFIG_FILE, &DeepCtxConfig::new().with_user("global-user"))
            .unwrap();
        let mut project_config = DeepCtxConfig::new();
        project_config.checkpoints.max_per_session = 5;
        project.save(DEEPCTX_CONFIG_FILE, &project_config).unwrap();

        let config = DeepCtxConfig::load_from(Some(&global), Some(&project)).unwrap();
        assert_eq!(config.user_id(), "global-user");
        assert_eq!(config.checkpoints.max_per_session, 5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DeepCtxConfig =
            serde_json::from_str(r#"{"selector":{"keywordWeight":0.5}}"#).unwrap();
        assert_eq!(config.selector.keyword_weight, 0.5);
        assert_eq!(config.selector.priority_weight, 0.6);
        assert_eq!(config.storage.max_item_tokens, 8_000);
        assert_eq!(config.checkpoints.max_per_session, 0);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let mut config = DeepCtxConfig::new();
        config.selector.priority_weight = -1.0;
        assert!(config.validate().is_err());
    }
}
