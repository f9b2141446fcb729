use std::{fmt, sync::Arc};

use async_trait::async_trait;
use exobook_config::{BusSubjects, Settings};
use exobook_result::errors::{BoxedErr, ErrorType, InternalError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
  bus::{InboundMessage, MessageBus},
  controller::{
    decoder::{decode, DecodeError},
    dispatcher::{DispatchError, Dispatcher, DispatcherArgs, MessageHandler},
    mapper::{post_to_document, user_to_document},
  },
  index::{IndexBackend, IndexClient, IndexClientArgs, IndexError, RetryPolicy},
  models::{
    documents::{PostDocument, UserDocument},
    records::{DeletionReference, PostRecord, RecordKind, UserRecord},
  },
  server::observability::{FailureStage, MetricsCollector},
};

pub mod decoder;
pub mod dispatcher;
pub mod mapper;
pub mod shutdown;

/// The logical event subjects this service listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
  UserCreated,
  UserUpdated,
  UserDeleted,
  PostUpsert,
  PostDeleted,
}

impl Subject {
  pub const ALL: [Subject; 5] = [
    Subject::UserCreated,
    Subject::UserUpdated,
    Subject::UserDeleted,
    Subject::PostUpsert,
    Subject::PostDeleted,
  ];

  pub fn kind(&self) -> RecordKind {
    match self {
      Subject::UserCreated | Subject::UserUpdated => RecordKind::User,
      Subject::PostUpsert => RecordKind::Post,
      Subject::UserDeleted | Subject::PostDeleted => RecordKind::Deletion,
    }
  }

  /// Bus topic carrying this subject
  pub fn topic<'a>(&self, subjects: &'a BusSubjects) -> &'a str {
    match self {
      Subject::UserCreated => &subjects.user_created,
      Subject::UserUpdated => &subjects.user_updated,
      Subject::UserDeleted => &subjects.user_deleted,
      Subject::PostUpsert => &subjects.post_upsert,
      Subject::PostDeleted => &subjects.post_deleted,
    }
  }
}

impl fmt::Display for Subject {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Subject::UserCreated => write!(f, "user-created"),
      Subject::UserUpdated => write!(f, "user-updated"),
      Subject::UserDeleted => write!(f, "user-deleted"),
      Subject::PostUpsert => write!(f, "post-upsert"),
      Subject::PostDeleted => write!(f, "post-deleted"),
    }
  }
}

/// How a single message ended. Every outcome counts as handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Applied,
  /// `create` hit an existing id; the stored document is left as is
  DuplicateCreate,
  DecodeFailed,
  ApplyFailed,
}

enum Failure {
  Decode(DecodeError),
  Apply { id: String, err: IndexError },
}

impl From<DecodeError> for Failure {
  fn from(err: DecodeError) -> Self {
    Failure::Decode(err)
  }
}

fn apply_failed(id: &str) -> impl FnOnce(IndexError) -> Failure + '_ {
  move |err| Failure::Apply { id: id.to_string(), err }
}

/// decode -> map -> apply, one fixed pipeline per subject
pub struct Synchronizer {
  users: IndexClient<UserDocument>,
  posts: IndexClient<PostDocument>,
  metrics: Arc<MetricsCollector>,
}

impl Synchronizer {
  pub fn new(
    users: IndexClient<UserDocument>,
    posts: IndexClient<PostDocument>,
    metrics: Arc<MetricsCollector>,
  ) -> Self {
    Self { users, posts, metrics }
  }

  /// Run the pipeline of `subject` on a payload received on `topic`.
  /// Failures are logged and dropped, never retried from here.
  pub async fn process(&self, subject: Subject, topic: &str, payload: &[u8]) -> Outcome {
    match self.apply(subject, topic, payload).await {
      Ok(()) => {
        self.metrics.record_message_processed(topic);
        Outcome::Applied
      }
      Err(Failure::Decode(err)) => {
        error!("Dropping {} message: {}", subject, err);
        self.metrics.record_message_failed(topic, FailureStage::Decode);
        Outcome::DecodeFailed
      }
      Err(Failure::Apply { id, err: IndexError::AlreadyExists { collection, .. } }) => {
        warn!("{} {} already exists in {}, leaving it as is", subject.kind(), id, collection);
        self.metrics.record_message_failed(topic, FailureStage::Apply);
        Outcome::DuplicateCreate
      }
      Err(Failure::Apply { id, err }) => {
        error!("Failed to apply {} for {} {}: {}", subject, subject.kind(), id, err);
        self.metrics.record_message_failed(topic, FailureStage::Apply);
        Outcome::ApplyFailed
      }
    }
  }

  async fn apply(&self, subject: Subject, topic: &str, payload: &[u8]) -> Result<(), Failure> {
    match subject {
      Subject::UserCreated => {
        let user: UserRecord = decode(topic, payload)?;
        self.users.create(&user_to_document(&user)).await.map_err(apply_failed(&user.id))?;
        info!("created user in search index: {} ({})", user.id, user.name);
      }
      Subject::UserUpdated => {
        let user: UserRecord = decode(topic, payload)?;
        self.users.upsert(&user_to_document(&user)).await.map_err(apply_failed(&user.id))?;
        info!("updated user in search index: {} ({})", user.id, user.name);
      }
      Subject::UserDeleted => {
        let reference: DeletionReference = decode(topic, payload)?;
        self.users.delete_by_id(&reference.id).await.map_err(apply_failed(&reference.id))?;
        info!("deleted user from search index: {}", reference.id);
      }
      Subject::PostUpsert => {
        let post: PostRecord = decode(topic, payload)?;
        self.posts.upsert(&post_to_document(&post)).await.map_err(apply_failed(&post.id))?;
        info!("upserted post in search index: {} ({})", post.id, post.title);
      }
      Subject::PostDeleted => {
        let reference: DeletionReference = decode(topic, payload)?;
        self.posts.delete_by_id(&reference.id).await.map_err(apply_failed(&reference.id))?;
        info!("deleted post from search index: {}", reference.id);
      }
    }
    Ok(())
  }
}

struct SubjectHandler {
  subject: Subject,
  synchronizer: Arc<Synchronizer>,
}

#[async_trait]
impl MessageHandler for SubjectHandler {
  async fn handle(&self, msg: InboundMessage) {
    self.synchronizer.process(self.subject, &msg.subject, &msg.payload).await;
  }
}

pub struct SearchSyncControllerArgs {
  pub config: Arc<Settings>,
  pub bus: Arc<dyn MessageBus>,
  pub users_backend: Arc<dyn IndexBackend>,
  pub posts_backend: Arc<dyn IndexBackend>,
  pub metrics: Arc<MetricsCollector>,
}

pub struct SearchSyncController {
  config: Arc<Settings>,
  dispatcher: Dispatcher,
  synchronizer: Arc<Synchronizer>,
}

impl SearchSyncController {
  pub fn new(args: SearchSyncControllerArgs) -> SearchSyncController {
    // fired when the shutdown grace period runs out
    let in_flight = CancellationToken::new();
    let retry = RetryPolicy::from(&args.config.worker.retry);

    let users = IndexClient::new(IndexClientArgs {
      backend: args.users_backend,
      collection: args.config.search.users_collection.clone(),
      retry,
      cancel: in_flight.clone(),
      metrics: args.metrics.clone(),
    });
    let posts = IndexClient::new(IndexClientArgs {
      backend: args.posts_backend,
      collection: args.config.search.posts_collection.clone(),
      retry,
      cancel: in_flight.clone(),
      metrics: args.metrics.clone(),
    });

    let dispatcher = Dispatcher::new(DispatcherArgs {
      bus: args.bus,
      max_in_flight: args.config.worker.max_in_flight,
      cancel_in_flight: in_flight,
    });

    SearchSyncController {
      config: args.config,
      dispatcher,
      synchronizer: Arc::new(Synchronizer::new(users, posts, args.metrics)),
    }
  }

  /// Bind all five subjects. Stops at the first subject that cannot be bound.
  pub async fn bind_all(&self) -> Result<(), DispatchError> {
    let subjects = &self.config.bus.subjects;
    for subject in Subject::ALL {
      let handler = SubjectHandler { subject, synchronizer: self.synchronizer.clone() };
      self.dispatcher.bind(subject.topic(subjects), Arc::new(handler)).await?;
    }

    info!("Search sync listening on:");
    for subject in Subject::ALL {
      info!("  {} <- {}", subject, subject.topic(subjects));
    }
    Ok(())
  }

  /// Bind, then block until `shutdown` fires and the dispatcher has drained
  pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BoxedErr> {
    let ie = |msg: &str, err: BoxedErr, err_type: ErrorType| {
      let path = "search-sync.controller.run";
      InternalError::new(path, err, err_type, false, msg)
    };

    let grace = self.config.worker.shutdown_grace();

    if let Err(err) = self.bind_all().await {
      // release whatever did get bound before failing startup
      let _ = self.dispatcher.shutdown(grace).await;
      let msg = "failed to bind subjects";
      return Err(Box::new(ie(msg, Box::new(err), ErrorType::BrokerSubscription)));
    }

    shutdown.cancelled().await;
    info!("Shutdown requested. Draining search sync...");

    if let Err(err) = self.dispatcher.shutdown(grace).await {
      let msg = "failed to flush acknowledgements";
      return Err(Box::new(ie(msg, Box::new(err), ErrorType::BrokerConnection)));
    }
    Ok(())
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }
}
