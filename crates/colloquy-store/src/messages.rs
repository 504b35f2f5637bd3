use tracing::instrument;

use colloquy_core::ids::{MessageId, SessionId};
use colloquy_core::message::{MessageInfo, MessageWithParts, Part};

use crate::error::StoreError;
use crate::keys;
use crate::storage::Store;

/// Message headers under `session/message/<session>/<message>` and their
/// parts under `session/part/<message>/<part>`.
#[derive(Clone)]
pub struct MessageRepo {
    store: Store,
}

impl MessageRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn put_info(&self, info: &MessageInfo) -> Result<(), StoreError> {
        self.store.write(&keys::message(&info.session_id, &info.id), info)
    }

    pub fn put_part(&self, part: &Part) -> Result<(), StoreError> {
        self.store.write(&keys::part(&part.message_id, &part.id), part)
    }

    pub fn get_info(&self, session_id: &SessionId, id: &MessageId) -> Result<MessageInfo, StoreError> {
        self.store.read(&keys::message(session_id, id))
    }

    /// Message headers of a session in creation order.
    pub fn list_infos(&self, session_id: &SessionId) -> Result<Vec<MessageInfo>, StoreError> {
        self.store
            .list(&keys::messages(session_id))?
            .iter()
            .map(|key| self.store.read(key))
            .collect()
    }

    /// Parts of a message in creation order.
    pub fn list_parts(&self, message_id: &MessageId) -> Result<Vec<Part>, StoreError> {
        self.store
            .list(&keys::parts(message_id))?
            .iter()
            .map(|key| self.store.read(key))
            .collect()
    }

    pub fn get(&self, session_id: &SessionId, id: &MessageId) -> Result<MessageWithParts, StoreError> {
        let info = self.get_info(session_id, id)?;
        let parts = self.list_parts(id)?;
        Ok(MessageWithParts { info, parts })
    }

    /// Full history of a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn load(&self, session_id: &SessionId) -> Result<Vec<MessageWithParts>, StoreError> {
        self.list_infos(session_id)?
            .into_iter()
            .map(|info| {
                let parts = self.list_parts(&info.id)?;
                Ok(MessageWithParts { info, parts })
            })
            .collect()
    }

    /// Persist a header and every part.
    pub fn put(&self, message: &MessageWithParts) -> Result<(), StoreError> {
        self.put_info(&message.info)?;
        for part in &message.parts {
            self.put_part(part)?;
        }
        Ok(())
    }

    pub fn remove_part(&self, part: &Part) -> Result<(), StoreError> {
        self.store.remove(&keys::part(&part.message_id, &part.id))
    }

    /// Drop a message header and all of its parts.
    pub fn remove(&self, session_id: &SessionId, id: &MessageId) -> Result<(), StoreError> {
        self.store.remove_dir(&keys::parts(id))?;
        self.store.remove(&keys::message(session_id, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::message::{ChatInput, PartKind};

    fn repo() -> MessageRepo {
        MessageRepo::new(Store::in_memory().unwrap())
    }

    #[test]
    fn load_preserves_order_of_messages_and_parts() {
        let repo = repo();
        let sid = SessionId::new();
        let user = ChatInput::text("hi").into_message(sid.clone());
        let mut assistant = MessageWithParts::new(MessageInfo::assistant(sid.clone(), "mock", "m", vec![]));
        for text in ["a", "b", "c"] {
            let part = Part::new(&assistant.info, PartKind::Text { text: text.into(), synthetic: false });
            assistant.parts.push(part);
        }
        repo.put(&assistant).unwrap();
        repo.put(&user).unwrap();

        let history = repo.load(&sid).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], user);
        assert_eq!(history[1].text(), "abc");
    }

    #[test]
    fn remove_drops_parts() {
        let repo = repo();
        let sid = SessionId::new();
        let msg = ChatInput::text("bye").into_message(sid.clone());
        repo.put(&msg).unwrap();
        repo.remove(&sid, &msg.info.id).unwrap();
        assert!(repo.load(&sid).unwrap().is_empty());
        assert!(repo.list_parts(&msg.info.id).unwrap().is_empty());
    }

    #[test]
    fn part_overwrite_keeps_position() {
        let repo = repo();
        let sid = SessionId::new();
        let mut msg = ChatInput::text("one").into_message(sid.clone());
        let second = Part::new(&msg.info, PartKind::Text { text: "two".into(), synthetic: false });
        msg.parts.push(second);
        repo.put(&msg).unwrap();

        msg.parts[0].kind = PartKind::Text { text: "ONE".into(), synthetic: false };
        repo.put_part(&msg.parts[0]).unwrap();
        assert_eq!(repo.get(&sid, &msg.info.id).unwrap().text(), "ONEtwo");
    }
}
