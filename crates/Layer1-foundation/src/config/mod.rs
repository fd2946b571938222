//! Config - 통합 설정 관리
//!
//! - `deepctx.rs` - DeepCtxConfig 통합 설정 (storage, selector, compression, checkpoints)

mod deepctx;

pub use deepctx::{
    CheckpointConfig, CompressionConfig, DeepCtxConfig, SelectorConfig, StorageBackend,
    StorageConfig, DEEPCTX_CONFIG_FILE,
};
