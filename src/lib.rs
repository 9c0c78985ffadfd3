//! Job-dispatch and result-aggregation core for a remote-execution
//! controller.
//!
//! One logical command is published to a dynamically-sized set of remote
//! agents; the crate tracks which agents are expected to answer and collects
//! their results under a deadline that extends adaptively while remote work
//! is known to still be running, with guaranteed eventual termination.
//!
//! The wire transport, authentication backends, CLI option parsing, and
//! output rendering are external collaborators: transports feed raw frames
//! into an [`channel::EventBus`] and implement [`publish::ControlPlane`];
//! everything in between is this crate.

pub mod channel;
pub mod client;
pub mod collect;
pub mod config;
pub mod error;
pub mod jid;
pub mod job;
pub mod probe;
pub mod publish;
pub mod registry;
pub mod target;

pub use channel::{ChannelEvent, EventBus, Subscription};
pub use client::Client;
pub use collect::{CollectOptions, Collection, CollectionEvent, CollectionState};
pub use config::ClientConfig;
pub use error::{MusterError, Result};
pub use job::{AgentResult, FunctionCall, JobHandle, JobRequest, ResultValue};
pub use probe::LiveProbe;
pub use publish::{ControlPlane, FileKeySource, KeySource, PublishAck, PublishLoad, Publisher};
pub use registry::{JobRecord, JobRunRegistry};
pub use target::{RangeService, Target, TargetType};
