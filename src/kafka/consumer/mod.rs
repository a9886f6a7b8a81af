// Consumer
//
// Pulls records for the partitions this member owns in its group.
//
// - subscribe() names the topics and the group; the first poll joins
// - poll() rejoins when the group is rebalancing, resolves positions for
//   newly assigned partitions (committed offset, else the reset policy) and
//   runs fetch rounds until records arrive or the timeout passes; a join
//   still running at the timeout is dropped and sent again by the next poll
// - positions advance past every record poll returns; commit() stores them
//   with the group coordinator, and auto-commit does so at the start of the
//   next poll once the interval has elapsed
//
// Revoke-then-assign: before rejoining, progress on owned partitions is
// committed (auto-commit mode) and the partitions are released, so no record
// is returned from a partition this member no longer owns.

mod fetcher;
mod offsets;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::kafka::assignment::{AssignmentSnapshot, GroupSettings, PartitionAssigner, RebalanceEvent};
use crate::kafka::connection::{BrokerTransport, ConnectionManager};
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{ConsumerRecord, TopicPartition};

pub use fetcher::{FetchSettings, Fetcher, PartitionFetch};

/// Pause between rounds when nothing is fetchable yet
const IDLE_ROUND_WAIT: Duration = Duration::from_millis(100);

/// Records returned by one poll, in partition order; offsets ascend within
/// each partition
#[derive(Debug, Default, Clone)]
pub struct ConsumerRecords {
    records: Vec<ConsumerRecord>,
}

impl ConsumerRecords {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConsumerRecord> {
        self.records.iter()
    }

    /// Records of a single partition
    pub fn records_for<'a>(&'a self, tp: &'a TopicPartition) -> impl Iterator<Item = &'a ConsumerRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.topic == tp.topic && r.partition == tp.partition)
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<_> = self.records.iter().map(ConsumerRecord::topic_partition).collect();
        partitions.dedup();
        partitions
    }
}

impl IntoIterator for ConsumerRecords {
    type Item = ConsumerRecord;
    type IntoIter = std::vec::IntoIter<ConsumerRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConsumerRecords {
    type Item = &'a ConsumerRecord;
    type IntoIter = std::slice::Iter<'a, ConsumerRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Debug, Default, Clone)]
struct PartitionState {
    /// Next offset to fetch; None until resolved after assignment
    position: Option<i64>,
    /// Last offset this member committed (or found committed)
    committed: Option<i64>,
    /// Moved by seek() or a reset since the last commit; allows committing
    /// backwards
    seeked: bool,
    /// Position lost to out-of-range; resolve by the reset policy only
    reset: bool,
}

/// Group consumer. Methods take `&mut self`: one caller drives it.
pub struct Consumer {
    config: ConsumerConfig,
    manager: Arc<ConnectionManager>,
    owns_manager: bool,
    fetcher: Fetcher,
    group: Option<Arc<PartitionAssigner>>,
    topics: Vec<String>,
    partitions: BTreeMap<TopicPartition, PartitionState>,
    needs_join: bool,
    last_auto_commit: Instant,
    closed: bool,
}

impl Consumer {
    /// Bootstrap a dedicated connection manager and build a consumer on it
    pub async fn connect(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        let manager = ConnectionManager::connect(config.client.clone()).await?;
        Ok(Self::build(config, manager, true))
    }

    /// Consumer sharing an existing connection manager. close() leaves the
    /// manager open.
    pub fn with_manager(config: ConsumerConfig, manager: Arc<ConnectionManager>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, manager, false))
    }

    fn build(config: ConsumerConfig, manager: Arc<ConnectionManager>, owns_manager: bool) -> Self {
        let fetcher = Fetcher::new(manager.clone(), FetchSettings::from_consumer_config(&config));
        info!(
            "Consumer {} ready (auto.offset.reset={}, auto commit {})",
            config.client.client_id,
            config.auto_offset_reset.as_str(),
            if config.enable_auto_commit { "on" } else { "off" }
        );
        Self {
            config,
            manager,
            owns_manager,
            fetcher,
            group: None,
            topics: Vec::new(),
            partitions: BTreeMap::new(),
            needs_join: false,
            last_auto_commit: Instant::now(),
            closed: false,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed || self.manager.is_closed() {
            return Err(KafkaError::ClientClosed);
        }
        Ok(())
    }

    fn group(&self) -> Result<Arc<PartitionAssigner>> {
        self.group.clone().ok_or_else(|| {
            KafkaError::InvalidConfig("consumer is not subscribed to any topic".to_string())
        })
    }

    // ===== Subscription =====

    /// Subscribe to `topic` as a member of `group_id` (or the configured
    /// group.id). All topics of one consumer share one group. The group is
    /// joined, or rejoined with the new topic, on the next poll.
    pub fn subscribe(&mut self, topic: &str, group_id: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        if topic.is_empty() {
            return Err(KafkaError::InvalidConfig("topic name must not be empty".to_string()));
        }
        let group_id = group_id
            .map(str::to_string)
            .or_else(|| self.config.group_id.clone())
            .filter(|g| !g.is_empty())
            .ok_or_else(|| KafkaError::InvalidConfig("subscribe needs a group id".to_string()))?;

        match &self.group {
            Some(group) if group.group_id() != group_id => {
                return Err(KafkaError::InvalidConfig(format!(
                    "consumer already belongs to group '{}', cannot subscribe as '{}'",
                    group.group_id(),
                    group_id
                )));
            }
            Some(_) => {}
            None => {
                let transport: Arc<dyn BrokerTransport> = self.manager.clone();
                self.group = Some(Arc::new(PartitionAssigner::new(
                    transport,
                    GroupSettings::from_consumer_config(&self.config, &group_id),
                    self.manager.backoff(),
                )));
            }
        }

        if !self.topics.iter().any(|t| t == topic) {
            self.topics.push(topic.to_string());
            self.needs_join = true;
            info!("Subscribed to {} in group {}", topic, group_id);
        }
        Ok(())
    }

    pub fn subscription(&self) -> &[String] {
        &self.topics
    }

    // ===== Poll =====

    /// Wait up to `timeout` for records from owned partitions
    pub async fn poll(&mut self, timeout: Duration) -> Result<ConsumerRecords> {
        self.poll_with_cancellation(timeout, &CancellationToken::new()).await
    }

    /// Like [`poll`](Self::poll); cancellation returns an empty set and
    /// leaves positions where they were
    pub async fn poll_with_cancellation(
        &mut self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ConsumerRecords> {
        self.ensure_open()?;
        self.group()?;
        let deadline = Instant::now() + timeout;
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Poll cancelled");
                Ok(ConsumerRecords::default())
            }
            result = self.poll_until(deadline) => result,
        }
    }

    async fn poll_until(&mut self, deadline: Instant) -> Result<ConsumerRecords> {
        let group = self.group()?;
        self.maybe_auto_commit(&group).await;

        loop {
            if self.needs_join || group.needs_rejoin() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, self.rebalance(&group)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        // the join resumes on the next poll
                        debug!("Group {} still joining at poll deadline", group.group_id());
                        return Ok(ConsumerRecords::default());
                    }
                }
            }
            self.resolve_positions(&group).await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let fetchable: BTreeMap<TopicPartition, i64> = self
                .partitions
                .iter()
                .filter_map(|(tp, state)| state.position.map(|p| (tp.clone(), p)))
                .collect();

            if fetchable.is_empty() {
                if remaining.is_zero() {
                    return Ok(ConsumerRecords::default());
                }
                tokio::select! {
                    _ = group.rejoin_requested() => {}
                    _ = tokio::time::sleep(remaining.min(IDLE_ROUND_WAIT)) => {}
                }
                continue;
            }

            let wait = self.config.fetch_max_wait.min(remaining);
            let results = self.fetcher.fetch(&fetchable, wait).await;
            let (records, failed) = self.apply_fetch(results).await;
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }
            if failed {
                let pause = self
                    .config
                    .client
                    .retry_backoff
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::time::sleep(pause).await;
            }
        }
    }

    /// Fold one fetch round into positions. Returns the records and whether
    /// any partition failed.
    async fn apply_fetch(
        &mut self,
        results: BTreeMap<TopicPartition, PartitionFetch>,
    ) -> (ConsumerRecords, bool) {
        let mut records = Vec::new();
        let mut failed = false;
        for (tp, outcome) in results {
            let Some(state) = self.partitions.get_mut(&tp) else {
                continue;
            };
            match outcome {
                PartitionFetch::Records {
                    records: fetched,
                    next_offset,
                    ..
                } => {
                    let Some(position) = state.position else {
                        continue;
                    };
                    let fresh: Vec<_> = fetched.into_iter().filter(|r| r.offset >= position).collect();
                    let mut next = position;
                    if let Some(last) = fresh.last() {
                        next = next.max(last.offset + 1);
                    }
                    // batches of control records return nothing but are still consumed
                    if let Some(end) = next_offset {
                        next = next.max(end);
                    }
                    state.position = Some(next);
                    records.extend(fresh);
                }
                PartitionFetch::OutOfRange => {
                    warn!(
                        "Position {:?} out of range for {}, resetting to {}",
                        state.position,
                        tp,
                        self.config.auto_offset_reset.as_str()
                    );
                    state.position = None;
                    state.seeked = true;
                    state.reset = true;
                }
                PartitionFetch::Failed(e) => {
                    failed = true;
                    if e.invalidates_metadata() {
                        self.manager.invalidate_topic(&tp.topic);
                    }
                    debug!("Fetch for {} failed: {}", tp, e);
                }
            }
        }
        (ConsumerRecords { records }, failed)
    }

    // ===== Rebalance =====

    async fn rebalance(&mut self, group: &PartitionAssigner) -> Result<()> {
        if self.config.enable_auto_commit {
            if let Err(e) = self.commit_owned(group).await {
                warn!("Commit before rebalance of group {} failed: {}", group.group_id(), e);
            }
        }
        let revoked = group.revoke();
        if !revoked.is_empty() {
            info!("Revoked {} partition(s) from group {}", revoked.len(), group.group_id());
        }
        self.partitions.clear();
        // stays set until a join completes, so a failed or abandoned one is retried
        self.needs_join = true;

        let assignment = group.join(&self.topics).await?;
        self.needs_join = false;
        for tp in assignment.to_topic_partitions() {
            self.partitions.insert(tp, PartitionState::default());
        }
        info!(
            "Group {} generation {}: assigned {:?}",
            group.group_id(),
            group.generation(),
            assignment.topic_partitions
        );
        Ok(())
    }

    /// Resolve positions of partitions that have none: the committed offset
    /// if there is one, else the reset policy
    async fn resolve_positions(&mut self, group: &PartitionAssigner) -> Result<()> {
        let unresolved: Vec<TopicPartition> = self
            .partitions
            .iter()
            .filter(|(_, s)| s.position.is_none())
            .map(|(tp, _)| tp.clone())
            .collect();
        if unresolved.is_empty() {
            return Ok(());
        }

        let (reset, fresh): (Vec<_>, Vec<_>) = unresolved
            .into_iter()
            .partition(|tp| self.partitions.get(tp).is_some_and(|s| s.reset));

        let committed = match offsets::fetch_committed(&self.manager, group, &fresh).await {
            Ok(committed) => committed,
            Err(e) if e.is_retriable() => {
                warn!("Committed offsets for group {} unavailable: {}", group.group_id(), e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut to_reset = reset;
        for tp in fresh {
            match committed.get(&tp) {
                Some(&offset) => {
                    if let Some(state) = self.partitions.get_mut(&tp) {
                        debug!("{} resumes at committed offset {}", tp, offset);
                        state.position = Some(offset);
                        state.committed = Some(offset);
                    }
                }
                None => to_reset.push(tp),
            }
        }
        if to_reset.is_empty() {
            return Ok(());
        }

        let timestamp = self.config.auto_offset_reset.timestamp();
        match offsets::list_offsets(&self.manager, &to_reset, timestamp).await {
            Ok(found) => {
                for (tp, offset) in found {
                    if let Some(state) = self.partitions.get_mut(&tp) {
                        debug!(
                            "{} starts at {} offset {}",
                            tp,
                            self.config.auto_offset_reset.as_str(),
                            offset
                        );
                        state.position = Some(offset);
                        state.reset = false;
                    }
                }
                Ok(())
            }
            Err(e) if e.is_retriable() => {
                for tp in &to_reset {
                    self.manager.invalidate_topic(&tp.topic);
                }
                warn!("Offset reset failed, retrying next round: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ===== Commit =====

    /// Commit `offsets` (next offset to read, per partition) or, with None,
    /// the current position of every owned partition
    pub async fn commit(&mut self, offsets: Option<BTreeMap<TopicPartition, i64>>) -> Result<()> {
        self.commit_with_cancellation(offsets, &CancellationToken::new()).await
    }

    /// Like [`commit`](Self::commit); cancellation abandons the commit with
    /// `Cancelled` and leaves the committed state as it was
    pub async fn commit_with_cancellation(
        &mut self,
        offsets: Option<BTreeMap<TopicPartition, i64>>,
        token: &CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        let group = self.group()?;
        let requested = match offsets {
            Some(offsets) => {
                if let Some(tp) = offsets.keys().find(|tp| !self.partitions.contains_key(*tp)) {
                    return Err(KafkaError::Commit(format!("{} is not assigned to this consumer", tp)));
                }
                offsets
            }
            None => self.owned_positions(),
        };
        let pending = self.pending_commits(requested);
        if pending.is_empty() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(KafkaError::Cancelled),
            result = offsets::commit(&self.manager, &group, &pending) => result?,
        }
        self.mark_committed(&pending);
        Ok(())
    }

    async fn commit_owned(&mut self, group: &PartitionAssigner) -> Result<()> {
        let pending = self.pending_commits(self.owned_positions());
        if pending.is_empty() {
            return Ok(());
        }
        offsets::commit(&self.manager, group, &pending).await?;
        self.mark_committed(&pending);
        Ok(())
    }

    async fn maybe_auto_commit(&mut self, group: &PartitionAssigner) {
        if !self.config.enable_auto_commit
            || self.last_auto_commit.elapsed() < self.config.auto_commit_interval
            || group.generation() < 0
            || group.needs_rejoin()
        {
            return;
        }
        self.last_auto_commit = Instant::now();
        if let Err(e) = self.commit_owned(group).await {
            warn!("Auto-commit for group {} failed: {}", group.group_id(), e);
        }
    }

    fn owned_positions(&self) -> BTreeMap<TopicPartition, i64> {
        self.partitions
            .iter()
            .filter_map(|(tp, s)| s.position.map(|p| (tp.clone(), p)))
            .collect()
    }

    /// Drop offsets that are already committed, and offsets that would move
    /// the commit backwards unless the partition was seeked
    fn pending_commits(&self, offsets: BTreeMap<TopicPartition, i64>) -> BTreeMap<TopicPartition, i64> {
        offsets
            .into_iter()
            .filter(|(tp, offset)| {
                let Some(state) = self.partitions.get(tp) else {
                    return false;
                };
                match state.committed {
                    Some(committed) if *offset == committed => false,
                    Some(committed) if *offset < committed && !state.seeked => {
                        debug!(
                            "Skipping commit of {} at {}: behind committed {}",
                            tp, offset, committed
                        );
                        false
                    }
                    _ => true,
                }
            })
            .collect()
    }

    fn mark_committed(&mut self, committed: &BTreeMap<TopicPartition, i64>) {
        for (tp, offset) in committed {
            if let Some(state) = self.partitions.get_mut(tp) {
                state.committed = Some(*offset);
                state.seeked = false;
            }
        }
    }

    // ===== Positions =====

    /// Fetch from `offset` next. The partition must be assigned.
    pub fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(KafkaError::InvalidConfig(format!(
                "cannot seek {} to negative offset {}",
                tp, offset
            )));
        }
        let state = self.partitions.get_mut(tp).ok_or_else(|| {
            KafkaError::InvalidConfig(format!("cannot seek {}: not assigned to this consumer", tp))
        })?;
        debug!("Seek {} to {}", tp, offset);
        state.position = Some(offset);
        state.seeked = true;
        state.reset = false;
        Ok(())
    }

    /// Next offset poll will return for `tp`, once known
    pub fn position(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions.get(tp).and_then(|s| s.position)
    }

    /// The group's committed offset for `tp`, asked from the coordinator
    pub async fn committed(&self, tp: &TopicPartition) -> Result<Option<i64>> {
        self.ensure_open()?;
        let group = self.group()?;
        let committed = offsets::fetch_committed(&self.manager, &group, std::slice::from_ref(tp)).await?;
        Ok(committed.get(tp).copied())
    }

    /// Partitions owned right now
    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.partitions.keys().cloned().collect()
    }

    /// Follow assignment changes from another task
    pub fn watch_assignment(&self) -> Option<watch::Receiver<Arc<AssignmentSnapshot>>> {
        self.group.as_ref().map(|g| g.watch_assignment())
    }

    /// Revoked / Assigned events for one listener. None before subscribe or
    /// once taken.
    pub fn take_rebalance_events(&self) -> Option<mpsc::UnboundedReceiver<RebalanceEvent>> {
        self.group.as_ref().and_then(|g| g.take_events())
    }

    // ===== Shutdown =====

    /// Commit (auto-commit mode), leave the group and release connections.
    /// Dropping a consumer without close stops heartbeats only; the group
    /// notices after the session timeout.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(group) = self.group.clone() {
            if self.config.enable_auto_commit && group.generation() >= 0 {
                if let Err(e) = self.commit_owned(&group).await {
                    warn!("Final commit for group {} failed: {}", group.group_id(), e);
                }
            }
            group.leave().await;
        }
        self.partitions.clear();
        if self.owns_manager {
            self.manager.close();
        }
        info!("Consumer {} closed", self.config.client.client_id);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
