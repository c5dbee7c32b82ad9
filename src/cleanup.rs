use super::*;

const SUSPICIOUS_CANDIDATE_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct CleanupPolicy {
    /// Minimum wait between a terminal click and the deletion pass.
    pub(super) grace_delay: Duration,
    /// Requests for the same owner arriving within this window share a pass.
    pub(super) coalesce_window: Duration,
    /// How long a pinned element's row survives after being marked stale.
    pub(super) stale_ttl: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            grace_delay: Duration::from_millis(DEFAULT_GRACE_DELAY_MS),
            coalesce_window: Duration::from_millis(DEFAULT_COALESCE_WINDOW_MS),
            stale_ttl: Duration::from_secs(DEFAULT_STALE_STATE_TTL_SECS),
        }
    }
}

/// What a settled pass did, per message id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct CleanupReport {
    pub(super) deleted: BTreeSet<MessageId>,
    pub(super) already_absent: BTreeSet<MessageId>,
    pub(super) pinned: BTreeSet<MessageId>,
    pub(super) not_deletable: BTreeSet<MessageId>,
    pub(super) protected: BTreeSet<MessageId>,
    pub(super) failed: BTreeSet<MessageId>,
}

impl CleanupReport {
    pub(super) fn touched(&self) -> usize {
        self.deleted.len()
            + self.already_absent.len()
            + self.pinned.len()
            + self.not_deletable.len()
            + self.failed.len()
    }
}

/// Resolves once the pass that absorbed the request has settled.
#[derive(Debug)]
pub(super) struct CleanupHandle {
    rx: oneshot::Receiver<CleanupReport>,
}

impl CleanupHandle {
    pub(super) async fn settled(self) -> Option<CleanupReport> {
        self.rx.await.ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct CleanupRequest {
    pub(super) channel_id: ChannelId,
    pub(super) keep_message_id: MessageId,
    pub(super) owner: Uuid,
    pub(super) fingerprint: Fingerprint,
    /// Extra ids known to be superseded, usually from the live cache.
    pub(super) candidates: Vec<MessageId>,
}

type PassKey = (ChannelId, Uuid);

struct PendingPass {
    fingerprint: Fingerprint,
    keep: BTreeSet<MessageId>,
    /// One entry per request whose keep id still holds channel protection.
    protected: Vec<MessageId>,
    candidates: BTreeSet<MessageId>,
    waiters: Vec<oneshot::Sender<CleanupReport>>,
}

impl PendingPass {
    /// Folds a later request into this pass. Keeps of earlier requests that
    /// the later one supersedes turn into candidates and lose protection;
    /// returns those ids so the caller can release them.
    fn absorb(
        &mut self,
        request: CleanupRequest,
        waiter: oneshot::Sender<CleanupReport>,
    ) -> Vec<MessageId> {
        let mut released = Vec::new();
        for candidate in &request.candidates {
            if self.keep.remove(candidate) {
                let before = self.protected.len();
                self.protected.retain(|id| id != candidate);
                released.extend(std::iter::repeat(*candidate).take(before - self.protected.len()));
            }
        }
        self.keep.insert(request.keep_message_id);
        self.protected.push(request.keep_message_id);
        self.candidates.extend(request.candidates);
        self.waiters.push(waiter);
        released
    }
}

#[derive(Default)]
struct OwnerPasses {
    pending: Option<PendingPass>,
    running: bool,
}

#[derive(Default)]
struct Passes {
    owners: HashMap<PassKey, OwnerPasses>,
    /// Keep ids of every unsettled request, counted per channel.
    protected: HashMap<ChannelId, BTreeMap<MessageId, usize>>,
}

impl Passes {
    fn protect(&mut self, channel_id: ChannelId, message_id: MessageId) {
        *self
            .protected
            .entry(channel_id)
            .or_default()
            .entry(message_id)
            .or_insert(0) += 1;
    }

    fn release(&mut self, channel_id: ChannelId, message_id: MessageId) {
        let Some(counts) = self.protected.get_mut(&channel_id) else {
            return;
        };
        if let Some(count) = counts.get_mut(&message_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&message_id);
            }
        }
        if counts.is_empty() {
            self.protected.remove(&channel_id);
        }
    }

    fn is_protected(&self, channel_id: ChannelId, message_id: MessageId) -> bool {
        self.protected
            .get(&channel_id)
            .map(|counts| counts.contains_key(&message_id))
            .unwrap_or(false)
    }
}

/// Deletes superseded elements after a grace delay, at most one pass per
/// (channel, owner) at a time.
pub(super) struct CleanupCoordinator {
    store: Arc<dyn ConfigStateStore>,
    platform: Arc<dyn Platform>,
    cache: Arc<LiveElementCache>,
    policy: CleanupPolicy,
    passes: Mutex<Passes>,
    settled: Notify,
    executed_passes: AtomicUsize,
}

impl CleanupCoordinator {
    pub(super) fn new(
        store: Arc<dyn ConfigStateStore>,
        platform: Arc<dyn Platform>,
        cache: Arc<LiveElementCache>,
        policy: CleanupPolicy,
    ) -> Self {
        Self {
            store,
            platform,
            cache,
            policy,
            passes: Mutex::new(Passes::default()),
            settled: Notify::new(),
            executed_passes: AtomicUsize::new(0),
        }
    }

    pub(super) fn policy(&self) -> &CleanupPolicy {
        &self.policy
    }

    /// Number of deletion passes that have run so far.
    #[cfg(test)]
    pub(super) fn executed_passes(&self) -> usize {
        self.executed_passes.load(Ordering::SeqCst)
    }

    /// Schedules a pass deleting every element of `owner` in the channel
    /// except the kept one. Never blocks on the pass itself.
    pub(super) async fn schedule(self: &Arc<Self>, request: CleanupRequest, delay: Duration) -> CleanupHandle {
        let (tx, rx) = oneshot::channel();
        let key = (request.channel_id, request.owner);
        let keep_message_id = request.keep_message_id;
        let start_task = {
            let mut passes = self.passes.lock().await;
            passes.protect(request.channel_id, keep_message_id);
            let owner = passes.owners.entry(key).or_default();
            match owner.pending.as_mut() {
                Some(pending) => {
                    let released = pending.absorb(request, tx);
                    for message_id in released {
                        passes.release(key.0, message_id);
                    }
                    false
                }
                None => {
                    owner.pending = Some(PendingPass {
                        fingerprint: request.fingerprint,
                        keep: BTreeSet::from([keep_message_id]),
                        protected: vec![keep_message_id],
                        candidates: request.candidates.into_iter().collect(),
                        waiters: vec![tx],
                    });
                    true
                }
            }
        };

        if start_task {
            let coordinator = Arc::clone(self);
            let wait = delay.max(self.policy.coalesce_window);
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                coordinator.run_pending(key).await;
            });
        } else {
            debug!(
                "cleanup for {} in {} coalesced, keeping {}",
                key.1, key.0, keep_message_id
            );
        }
        CleanupHandle { rx }
    }

    async fn run_pending(&self, key: PassKey) {
        let pass = loop {
            let notified = self.settled.notified();
            {
                let mut passes = self.passes.lock().await;
                let Some(owner) = passes.owners.get_mut(&key) else {
                    return;
                };
                if !owner.running {
                    let Some(pass) = owner.pending.take() else {
                        return;
                    };
                    owner.running = true;
                    break pass;
                }
            }
            notified.await;
        };

        let report = self.execute(key, &pass).await;
        self.executed_passes.fetch_add(1, Ordering::SeqCst);

        {
            let mut passes = self.passes.lock().await;
            for keep in &pass.protected {
                passes.release(key.0, *keep);
            }
            let finished = match passes.owners.get_mut(&key) {
                Some(owner) => {
                    owner.running = false;
                    owner.pending.is_none()
                }
                None => false,
            };
            if finished {
                passes.owners.remove(&key);
            }
        }
        self.settled.notify_waiters();

        if report.touched() > 0 {
            info!(
                "cleanup {} in {}: deleted {:?}, absent {:?}, pinned {:?}, kept {:?}, failed {:?}",
                key.1,
                key.0,
                report.deleted,
                report.already_absent,
                report.pinned,
                report.not_deletable.union(&report.protected).collect::<Vec<_>>(),
                report.failed
            );
        }
        for waiter in pass.waiters {
            let _ = waiter.send(report.clone());
        }
    }

    async fn execute(&self, key: PassKey, pass: &PendingPass) -> CleanupReport {
        let (channel_id, owner) = key;
        let mut report = CleanupReport::default();
        let Some(newest_keep) = pass.keep.iter().next_back().copied() else {
            return report;
        };

        let mut candidates = pass.candidates.clone();
        match self.store.list_message_ids_for_configuration(owner).await {
            Ok(ids) => candidates.extend(ids),
            Err(err) => warn!("listing elements of {} failed: {}", owner, err),
        }
        candidates.retain(|id| !pass.keep.contains(id) && *id < newest_keep);
        if candidates.is_empty() {
            return report;
        }
        if candidates.len() > SUSPICIOUS_CANDIDATE_COUNT {
            warn!(
                "{} has {} superseded elements in {}: {:?}",
                owner,
                candidates.len(),
                channel_id,
                candidates
            );
        }

        let ids: Vec<MessageId> = candidates.into_iter().collect();
        let statuses = match self.platform.query_message_status(channel_id, &ids).await {
            Ok(statuses) => statuses,
            Err(err) => {
                warn!("status query in {} failed: {}", channel_id, err);
                for message_id in &ids {
                    self.cache.mark_live(channel_id, *message_id, pass.fingerprint).await;
                }
                report.failed.extend(ids);
                return report;
            }
        };

        for status in statuses {
            let message_id = status.message_id;
            if self.passes.lock().await.is_protected(channel_id, message_id) {
                report.protected.insert(message_id);
                continue;
            }
            if !status.exists {
                self.settle_absent(channel_id, message_id).await;
                report.already_absent.insert(message_id);
            } else if status.pinned {
                if let Err(err) = self.store.mark_state_stale(channel_id, message_id, Utc::now()).await {
                    warn!("marking {}.{} stale failed: {}", channel_id, message_id, err);
                }
                report.pinned.insert(message_id);
            } else if !status.deletable {
                report.not_deletable.insert(message_id);
            } else {
                debug!("deleting {}.{} created {:?}", channel_id, message_id, status.created_at);
                match self.platform.delete_message(channel_id, message_id).await {
                    Ok(DeleteOutcome::Deleted) => {
                        self.settle_absent(channel_id, message_id).await;
                        report.deleted.insert(message_id);
                    }
                    Ok(DeleteOutcome::NotFound) => {
                        self.settle_absent(channel_id, message_id).await;
                        report.already_absent.insert(message_id);
                    }
                    Ok(DeleteOutcome::Forbidden) => {
                        warn!("no permission to delete {}.{}", channel_id, message_id);
                        report.not_deletable.insert(message_id);
                    }
                    Err(err) => {
                        // Stays live so the next supersede picks it up again.
                        warn!("deleting {}.{} failed: {}", channel_id, message_id, err);
                        self.cache.mark_live(channel_id, message_id, pass.fingerprint).await;
                        report.failed.insert(message_id);
                    }
                }
            }
        }
        if !report.deleted.is_empty() || !report.already_absent.is_empty() {
            self.drop_configuration_if_unused(owner).await;
        }
        report
    }

    /// Deletes the stored configuration of `owner` once no element state
    /// references it anymore.
    async fn drop_configuration_if_unused(&self, owner: Uuid) {
        match self.store.list_message_ids_for_configuration(owner).await {
            Ok(ids) if ids.is_empty() => {
                if let Err(err) = self.store.delete_configuration(owner).await {
                    warn!("deleting configuration {} failed: {}", owner, err);
                } else {
                    debug!("configuration {} has no elements left, deleted", owner);
                }
            }
            Ok(_) => {}
            Err(err) => warn!("listing elements of {} failed: {}", owner, err),
        }
    }

    async fn settle_absent(&self, channel_id: ChannelId, message_id: MessageId) {
        if let Err(err) = self.store.delete_state(channel_id, message_id).await {
            warn!("deleting state of {}.{} failed: {}", channel_id, message_id, err);
        }
        self.cache.forget(channel_id, message_id).await;
    }

    /// Deletes every tracked element and row of a channel, inline elements
    /// without a stored row included. Returns the number of messages removed
    /// from the platform.
    pub(super) async fn clear_channel(&self, channel_id: ChannelId) -> Result<usize> {
        let mut message_ids = self
            .store
            .delete_all_state_for_channel(channel_id)
            .await
            .context("delete channel state")?;
        self.store
            .delete_configurations_for_channel(channel_id)
            .await
            .context("delete channel configurations")?;
        message_ids.extend(self.cache.take_channel(channel_id).await);

        let mut deleted = 0;
        for message_id in message_ids {
            match self.platform.delete_message(channel_id, message_id).await {
                Ok(DeleteOutcome::Deleted) => deleted += 1,
                Ok(outcome) => debug!("clear {}.{}: {:?}", channel_id, message_id, outcome),
                Err(err) => warn!("clear {}.{} failed: {}", channel_id, message_id, err),
            }
        }
        Ok(deleted)
    }

    /// Removes rows of pinned elements that have been stale longer than
    /// the configured ttl, then the configurations left without rows.
    pub(super) async fn prune_stale_states(&self) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.policy.stale_ttl).context("stale ttl out of range")?;
        let removed = self
            .store
            .delete_stale_states(Utc::now() - ttl)
            .await
            .context("delete stale states")?;
        let owners: BTreeSet<Uuid> = removed.iter().copied().collect();
        for owner in owners {
            self.drop_configuration_if_unused(owner).await;
        }
        if !removed.is_empty() {
            info!("pruned {} stale element states", removed.len());
        }
        Ok(removed.len())
    }
}
