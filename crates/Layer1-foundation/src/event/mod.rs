//! Event System - 컨텍스트 변경 이벤트 발행/구독
//!
//! ```text
//! ContextEngine ── publish(event) ──► EventBus ──► receiver() (UI, CLI serve)
//!                                        └──► history
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusConfig, EventFilter};
pub use types::{ContextEvent, ContextEventKind, EventId};
