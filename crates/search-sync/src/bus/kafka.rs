use std::{
  collections::{BTreeSet, HashMap},
  sync::Arc,
  time::{Duration, Instant},
};

use async_trait::async_trait;
use exobook_config::Bus;
use rdkafka::{
  consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer},
  ClientConfig, Message, Offset, TopicPartitionList,
};
use tokio::{select, spawn, sync::Mutex, task::spawn_blocking, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Acknowledger, BusError, DeliveryTag, InboundMessage, MessageBus, Subscription};

/// Next offset to read per (topic, partition)
type Positions = HashMap<(String, i32), i64>;
type Progress = HashMap<(String, i32), PartitionProgress>;
type Consumers = HashMap<String, Arc<StreamConsumer>>;

/// Delivery bookkeeping for one partition. A delivery stays in flight until acked, so an
/// abandoned or panicked handler holds the committable position at its offset.
#[derive(Debug, Default)]
struct PartitionProgress {
  in_flight: BTreeSet<i64>,
  highest_acked: Option<i64>,
  committed: Option<i64>,
}

impl PartitionProgress {
  fn received(&mut self, offset: i64) {
    self.in_flight.insert(offset);
  }

  fn acked(&mut self, offset: i64) {
    self.in_flight.remove(&offset);
    if self.highest_acked.map_or(true, |highest| offset > highest) {
      self.highest_acked = Some(offset);
    }
  }

  /// Lowest offset not yet handled; everything below it has been acked
  fn watermark(&self) -> Option<i64> {
    self.in_flight.first().copied().or(self.highest_acked.map(|highest| highest + 1))
  }

  fn uncommitted(&self) -> Option<i64> {
    let watermark = self.watermark()?;
    match self.committed {
      Some(committed) if committed >= watermark => None,
      _ => Some(watermark),
    }
  }
}

/// Kafka-compatible bus. One consumer per subscribed topic, offsets committed manually.
pub struct KafkaBus {
  client_config: ClientConfig,
  group_id: String,
  consumers: Arc<Mutex<Consumers>>,
  progress: Arc<Mutex<Progress>>,
}

impl KafkaBus {
  /// Build the client from `settings` and check the cluster is reachable.
  pub async fn connect(settings: &Bus) -> Result<Self, BusError> {
    let props =
      settings.client_properties().map_err(|err| BusError::Credentials(err.to_string()))?;

    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", settings.brokers.join(","));
    for (key, value) in props {
      client_config.set(key, value);
    }

    let probe: BaseConsumer =
      client_config.create().map_err(|err| BusError::Connection(err.to_string()))?;
    let timeout = settings.connect_timeout();
    let start = Instant::now();
    let brokers = spawn_blocking(move || {
      probe.fetch_metadata(None, timeout).map(|metadata| metadata.brokers().len())
    })
    .await
    .map_err(|err| BusError::Connection(err.to_string()))?
    .map_err(|err| BusError::Connection(err.to_string()))?;

    info!("Connected to kafka cluster with {} brokers in {:?}", brokers, start.elapsed());

    Ok(Self {
      client_config,
      group_id: settings.group_id.clone(),
      consumers: Arc::new(Mutex::new(HashMap::new())),
      progress: Arc::new(Mutex::new(HashMap::new())),
    })
  }

  /// Start periodic commit of tracked offsets across all consumers
  pub fn periodic_commit(&self, every: Duration, shutdown: CancellationToken) {
    let progress = self.progress.clone();
    let consumers = self.consumers.clone();

    spawn(async move {
      let mut ticker = interval(every);
      loop {
        select! {
          _ = shutdown.cancelled() => break,
          _ = ticker.tick() => {}
        }

        // Snapshot positions that moved since the last commit
        let snapshot = pending_commits(&*progress.lock().await);
        if snapshot.is_empty() {
          continue;
        }

        let committed = {
          let consumers_guard = consumers.lock().await;
          commit_offsets(&consumers_guard, snapshot, CommitMode::Async)
        };

        // Failed positions stay uncommitted and are picked up by the next tick
        mark_committed(&mut *progress.lock().await, committed);
      }
      debug!("Periodic commit stopped");
    });
  }
}

fn pending_commits(progress: &Progress) -> Positions {
  progress
    .iter()
    .filter_map(|(key, partition)| partition.uncommitted().map(|position| (key.clone(), position)))
    .collect()
}

fn mark_committed(progress: &mut Progress, committed: Positions) {
  for (key, position) in committed {
    if let Some(partition) = progress.get_mut(&key) {
      partition.committed = Some(partition.committed.map_or(position, |prev| prev.max(position)));
    }
  }
}

/// Group positions by topic so each batch is committed through the consumer owning that topic
fn group_by_topic(positions: Positions) -> HashMap<String, Vec<(i32, i64)>> {
  let mut by_topic: HashMap<String, Vec<(i32, i64)>> = HashMap::new();
  for ((topic, partition), position) in positions {
    by_topic.entry(topic).or_default().push((partition, position));
  }
  by_topic
}

/// Commit `positions`; returns the entries the broker accepted
fn commit_offsets(consumers: &Consumers, positions: Positions, mode: CommitMode) -> Positions {
  let mut committed = Positions::new();

  for (topic, partitions) in group_by_topic(positions) {
    let Some(consumer) = consumers.get(&topic) else {
      error!("No consumer owns topic {}, skipping {} offsets", topic, partitions.len());
      continue;
    };

    let mut tpl = TopicPartitionList::new();
    for (partition, position) in partitions.iter() {
      let _ = tpl.add_partition_offset(&topic, *partition, Offset::Offset(*position));
    }

    match consumer.commit(&tpl, mode) {
      Ok(()) => {
        debug!("Committed {} offsets for topic {}", tpl.count(), topic);
        for (partition, position) in partitions {
          committed.insert((topic.clone(), partition), position);
        }
      }
      Err(err) => error!("Commit error for topic {}: {}, will retry", topic, err),
    }
  }

  committed
}

#[async_trait]
impl MessageBus for KafkaBus {
  async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError> {
    let sub_err =
      |reason: String| BusError::Subscribe { subject: subject.to_string(), reason };

    let mut config = self.client_config.clone();
    config
      .set("group.id", format!("{}.{}", self.group_id, subject))
      .set("enable.auto.commit", "false")
      .set("auto.offset.reset", "earliest");

    let consumer: StreamConsumer = config.create().map_err(|err| sub_err(err.to_string()))?;
    consumer.subscribe(&[subject]).map_err(|err| sub_err(err.to_string()))?;

    let consumer = Arc::new(consumer);
    self.consumers.lock().await.insert(subject.to_string(), consumer.clone());
    info!("Kafka consumer subscribed to {}", subject);

    Ok(Box::new(KafkaSubscription {
      subject: subject.to_string(),
      consumer,
      progress: self.progress.clone(),
      acker: Arc::new(KafkaAcker { progress: self.progress.clone() }),
    }))
  }

  async fn flush(&self) -> Result<(), BusError> {
    let mut progress = self.progress.lock().await;
    let positions = pending_commits(&progress);
    if positions.is_empty() {
      info!("No offsets to commit");
      return Ok(());
    }

    let wanted = positions.len();
    info!("Flushing {} final offsets before shutdown...", wanted);
    let committed = commit_offsets(&*self.consumers.lock().await, positions, CommitMode::Sync);
    let failed = wanted - committed.len();
    mark_committed(&mut progress, committed);
    if failed > 0 {
      return Err(BusError::Commit(format!("{} offsets could not be committed", failed)));
    }
    Ok(())
  }
}

struct KafkaSubscription {
  subject: String,
  consumer: Arc<StreamConsumer>,
  progress: Arc<Mutex<Progress>>,
  acker: Arc<KafkaAcker>,
}

#[async_trait]
impl Subscription for KafkaSubscription {
  fn subject(&self) -> &str {
    &self.subject
  }

  async fn next_message(&mut self) -> Option<Result<InboundMessage, BusError>> {
    let inbound = match self.consumer.recv().await {
      Ok(msg) => InboundMessage {
        subject: self.subject.clone(),
        // an empty payload fails decoding like any other malformed one
        payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        tag: DeliveryTag {
          topic: msg.topic().to_string(),
          partition: msg.partition(),
          offset: msg.offset(),
        },
      },
      Err(err) => {
        let reason = err.to_string();
        return Some(Err(BusError::Receive { subject: self.subject.clone(), reason }));
      }
    };

    track_delivery(&mut *self.progress.lock().await, &inbound.tag);
    Some(Ok(inbound))
  }

  fn acker(&self) -> Arc<dyn Acknowledger> {
    self.acker.clone()
  }

  async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
    self.consumer.unsubscribe();
    info!("Unsubscribed consumer for {}", self.subject);
    Ok(())
  }
}

fn track_delivery(progress: &mut Progress, tag: &DeliveryTag) {
  progress.entry((tag.topic.clone(), tag.partition)).or_default().received(tag.offset);
}

/// Records processed offsets; the commit coordinator pushes them to the broker
struct KafkaAcker {
  progress: Arc<Mutex<Progress>>,
}

#[async_trait]
impl Acknowledger for KafkaAcker {
  async fn ack(&self, tag: &DeliveryTag) {
    let mut guard = self.progress.lock().await;
    guard.entry((tag.topic.clone(), tag.partition)).or_default().acked(tag.offset);
    debug!("Marked processed offset {} for {}[{}]", tag.offset, tag.topic, tag.partition);
  }
}
