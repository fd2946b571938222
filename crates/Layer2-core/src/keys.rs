//! 저장소 키 레이아웃
//!
//! ```text
//! {user}/{workspace}/items/{id}
//! {user}/{workspace}/meta
//! {user}/{workspace}/tombstone
//! {user}/{workspace}/{session}/checkpoints/{id}
//! {user}/{workspace}/{session}/snapshots/{id}
//! {user}/{workspace}/{session}/branches/{id}
//! ```

use deepctx_foundation::{validate_key_segment, Error, Result, WorkspaceId};

const ITEMS: &str = "items";
const META: &str = "meta";
const TOMBSTONE: &str = "tombstone";

/// 세션 ID로 사용할 수 없는 이름 (워크스페이스 레벨 키와 충돌)
const RESERVED_SESSIONS: [&str; 3] = [ITEMS, META, TOMBSTONE];

/// 세션 하위 레코드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionRecord {
    Checkpoint,
    Snapshot,
    Branch,
}

impl SessionRecord {
    fn as_str(self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoints",
            Self::Snapshot => "snapshots",
            Self::Branch => "branches",
        }
    }
}

pub(crate) fn user_prefix(user: &str) -> String {
    format!("{}/", user)
}

pub(crate) fn workspace_prefix(user: &str, ws: &WorkspaceId) -> String {
    format!("{}/{}/", user, ws)
}

pub(crate) fn items_prefix(user: &str, ws: &WorkspaceId) -> String {
    format!("{}/{}/{}/", user, ws, ITEMS)
}

pub(crate) fn item_key(user: &str, ws: &WorkspaceId, id: &str) -> String {
    format!("{}{}", items_prefix(user, ws), id)
}

pub(crate) fn meta_key(user: &str, ws: &WorkspaceId) -> String {
    format!("{}/{}/{}", user, ws, META)
}

pub(crate) fn tombstone_key(user: &str, ws: &WorkspaceId) -> String {
    format!("{}/{}/{}", user, ws, TOMBSTONE)
}

pub(crate) fn session_prefix(
    user: &str,
    ws: &WorkspaceId,
    session: &str,
    record: SessionRecord,
) -> String {
    format!("{}/{}/{}/{}/", user, ws, session, record.as_str())
}

pub(crate) fn session_key(
    user: &str,
    ws: &WorkspaceId,
    session: &str,
    record: SessionRecord,
    id: &str,
) -> String {
    format!("{}{}", session_prefix(user, ws, session, record), id)
}

/// `{user}/{ws}/meta` 형태의 키에서 워크스페이스 이름 추출
pub(crate) fn workspace_from_meta_key<'a>(user: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(user)?.strip_prefix('/')?;
    let ws = rest.strip_suffix(META)?.strip_suffix('/')?;
    if ws.is_empty() || ws.contains('/') {
        None
    } else {
        Some(ws)
    }
}

/// 세션 ID 검증
pub(crate) fn validate_session(session: &str) -> Result<()> {
    validate_key_segment("session id", session)?;
    if RESERVED_SESSIONS.contains(&session) {
        return Err(Error::InvalidInput(format!(
            "session id '{}' is reserved",
            session
        )));
    }
    Ok(())
}
