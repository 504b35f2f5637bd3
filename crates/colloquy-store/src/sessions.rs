use tracing::instrument;

use colloquy_core::ids::SessionId;
use colloquy_core::session::SessionInfo;

use crate::error::StoreError;
use crate::keys;
use crate::storage::Store;

/// Session records under `session/info/<id>`.
#[derive(Clone)]
pub struct SessionRepo {
    store: Store,
}

impl SessionRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(session_id = %info.id))]
    pub fn put(&self, info: &SessionInfo) -> Result<(), StoreError> {
        self.store.write(&keys::session(&info.id), info)
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionInfo, StoreError> {
        self.store.read(&keys::session(id))
    }

    pub fn find(&self, id: &SessionId) -> Result<Option<SessionInfo>, StoreError> {
        self.store.read_optional(&keys::session(id))
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Result<Vec<SessionInfo>, StoreError> {
        self.store
            .list(keys::SESSION_INFO)?
            .iter()
            .map(|key| self.store.read(key))
            .collect()
    }

    pub fn children(&self, parent: &SessionId) -> Result<Vec<SessionInfo>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.parent_id.as_ref() == Some(parent))
            .collect())
    }

    pub fn remove(&self, id: &SessionId) -> Result<(), StoreError> {
        self.store.remove(&keys::session(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SessionRepo {
        SessionRepo::new(Store::in_memory().unwrap())
    }

    #[test]
    fn put_get_roundtrip() {
        let repo = repo();
        let info = SessionInfo::new(None);
        repo.put(&info).unwrap();
        assert_eq!(repo.get(&info.id).unwrap(), info);
    }

    #[test]
    fn missing_session() {
        let repo = repo();
        let id = SessionId::new();
        assert!(repo.get(&id).unwrap_err().is_not_found());
        assert!(repo.find(&id).unwrap().is_none());
    }

    #[test]
    fn list_in_creation_order_and_children() {
        let repo = repo();
        let parent = SessionInfo::new(None);
        let child_a = SessionInfo::new(Some(parent.id.clone()));
        let other = SessionInfo::new(None);
        let child_b = SessionInfo::new(Some(parent.id.clone()));
        for s in [&child_b, &other, &parent, &child_a] {
            repo.put(s).unwrap();
        }

        let ids: Vec<_> = repo.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![parent.id.clone(), child_a.id.clone(), other.id, child_b.id.clone()]);

        let children: Vec<_> = repo.children(&parent.id).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(children, vec![child_a.id, child_b.id]);
    }

    #[test]
    fn remove_is_idempotent() {
        let repo = repo();
        let info = SessionInfo::new(None);
        repo.put(&info).unwrap();
        repo.remove(&info.id).unwrap();
        repo.remove(&info.id).unwrap();
        assert!(repo.find(&info.id).unwrap().is_none());
    }
}
