use super::*;

use sha2::{Digest, Sha256};

/// Stable hash of a command configuration. Two invocations with the same
/// command and configuration share a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(super) struct Fingerprint(pub(super) u64);

impl Fingerprint {
    pub(super) fn of(command_id: &str, type_tag: &str, serialized_config: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [command_id, type_tag, serialized_config] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LiveElement {
    message_id: MessageId,
    fingerprint: Fingerprint,
}

/// In-process view of which elements are live per channel. Entries leave
/// only through supersede or forget.
#[derive(Debug, Default)]
pub(super) struct LiveElementCache {
    channels: Mutex<HashMap<ChannelId, BTreeSet<LiveElement>>>,
}

impl LiveElementCache {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) async fn mark_live(&self, channel_id: ChannelId, message_id: MessageId, fingerprint: Fingerprint) {
        let mut channels = self.channels.lock().await;
        channels.entry(channel_id).or_default().insert(LiveElement {
            message_id,
            fingerprint,
        });
    }

    pub(super) async fn is_live(&self, channel_id: ChannelId, message_id: MessageId, fingerprint: Fingerprint) -> bool {
        let channels = self.channels.lock().await;
        channels
            .get(&channel_id)
            .map(|elements| {
                elements.contains(&LiveElement {
                    message_id,
                    fingerprint,
                })
            })
            .unwrap_or(false)
    }

    /// Removes the elements of the channel that share `fingerprint` and are
    /// older than `keep`, returning their message ids. Message ids grow with
    /// time on every supported platform, so newer elements stay untouched.
    pub(super) async fn supersede(
        &self,
        channel_id: ChannelId,
        keep: MessageId,
        fingerprint: Fingerprint,
    ) -> Vec<MessageId> {
        self.take_where(channel_id, |element| {
            element.fingerprint == fingerprint && element.message_id < keep
        })
        .await
    }

    pub(super) async fn forget(&self, channel_id: ChannelId, message_id: MessageId) {
        self.take_where(channel_id, |element| element.message_id == message_id)
            .await;
    }

    /// Drops the whole channel and returns the ids that were live in it.
    pub(super) async fn take_channel(&self, channel_id: ChannelId) -> BTreeSet<MessageId> {
        self.channels
            .lock()
            .await
            .remove(&channel_id)
            .map(|elements| elements.into_iter().map(|e| e.message_id).collect())
            .unwrap_or_default()
    }

    async fn take_where<F>(&self, channel_id: ChannelId, predicate: F) -> Vec<MessageId>
    where
        F: Fn(&LiveElement) -> bool,
    {
        let mut channels = self.channels.lock().await;
        let Some(elements) = channels.get_mut(&channel_id) else {
            return Vec::new();
        };
        let taken: Vec<LiveElement> = elements.iter().filter(|e| predicate(*e)).copied().collect();
        for element in &taken {
            elements.remove(element);
        }
        if elements.is_empty() {
            channels.remove(&channel_id);
        }
        let mut ids: Vec<MessageId> = taken.into_iter().map(|e| e.message_id).collect();
        ids.dedup();
        ids
    }
}
