//! Wire protocol shared by tasks and nodes.
//!
//! Every message travels as a [`Frame`]: a performative, an optional topic
//! (the "ontology" that distinguishes the various `inform` messages), an
//! optional conversation id and a plain-text content field. [`Message`] is the
//! typed view that agents work with; the two conversions below are the codec.
//!
//! | Message            | Performative       | Topic               | Content                 |
//! |--------------------|--------------------|---------------------|-------------------------|
//! | `CallForProposal`  | `cfp`              |                     | complexity              |
//! | `Propose`          | `propose`          |                     | completion time         |
//! | `AcceptProposal`   | `accept-proposal`  |                     | complexity              |
//! | `RejectProposal`   | `reject-proposal`  |                     |                         |
//! | `StatusQuery`      | `inform`           | `Question`          |                         |
//! | `StatusReply`      | `inform`           | `Answer`            | `true` / `false`        |
//! | `LoadSnapshot`     | `inform`           | `Computer-info`     | `totalTime capacity`    |
//! | `PairRequest`      | `request`          | `Pair-request`      | fleet average           |
//! | `PairAccept`       | `agree`            | `Pair-accept`       |                         |
//! | `PairRefuse`       | `refuse`           | `Pair-request`      |                         |
//! | `TaskExchange`     | `inform`           | `Task-exchange`     | `taskId complexity`     |
//! | `ExchangeComplete` | `inform`           | `Exchange-complete` |                         |
//! | `Evict`            | `inform`           | `Remove`            |                         |
//!
//! Bidding messages carry the task's bid round in `conversation` so late
//! proposals from an abandoned round can be told apart.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bus::address::{EntityId, TaskId};
use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Performative {
    CallForProposal,
    Propose,
    AcceptProposal,
    RejectProposal,
    Inform,
    Request,
    Agree,
    Refuse,
}

impl std::fmt::Display for Performative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Performative::CallForProposal => write!(f, "cfp"),
            Performative::Propose => write!(f, "propose"),
            Performative::AcceptProposal => write!(f, "accept-proposal"),
            Performative::RejectProposal => write!(f, "reject-proposal"),
            Performative::Inform => write!(f, "inform"),
            Performative::Request => write!(f, "request"),
            Performative::Agree => write!(f, "agree"),
            Performative::Refuse => write!(f, "refuse"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topic {
    Question,
    Answer,
    ComputerInfo,
    PairRequest,
    PairAccept,
    TaskExchange,
    ExchangeComplete,
    Remove,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Question => write!(f, "Question"),
            Topic::Answer => write!(f, "Answer"),
            Topic::ComputerInfo => write!(f, "Computer-info"),
            Topic::PairRequest => write!(f, "Pair-request"),
            Topic::PairAccept => write!(f, "Pair-accept"),
            Topic::TaskExchange => write!(f, "Task-exchange"),
            Topic::ExchangeComplete => write!(f, "Exchange-complete"),
            Topic::Remove => write!(f, "Remove"),
        }
    }
}

/// One message as it travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub sender: EntityId,
    pub performative: Performative,
    pub topic: Option<Topic>,
    pub conversation: Option<u64>,
    pub content: String,
}

impl Frame {
    fn new(sender: EntityId, performative: Performative, topic: Option<Topic>) -> Self {
        Self {
            sender,
            performative,
            topic,
            conversation: None,
            content: String::new(),
        }
    }

    fn with_conversation(mut self, conversation: u64) -> Self {
        self.conversation = Some(conversation);
        self
    }

    fn with_content(mut self, content: impl ToString) -> Self {
        self.content = content.to_string();
        self
    }

    fn kind(&self) -> String {
        match self.topic {
            Some(topic) => format!("{}/{}", self.performative, topic),
            None => self.performative.to_string(),
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> FleetError {
        FleetError::MalformedMessage {
            sender: self.sender.clone(),
            kind: self.kind(),
            reason: reason.into(),
        }
    }

    fn round(&self) -> Result<u64> {
        self.conversation
            .ok_or_else(|| self.malformed("missing conversation id"))
    }

    fn parse<T>(&self, field: &str, raw: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        raw.trim()
            .parse()
            .map_err(|e| self.malformed(format!("invalid {} {:?}: {}", field, raw, e)))
    }

    fn positive(&self, field: &str, raw: &str) -> Result<u32> {
        match self.parse::<u32>(field, raw)? {
            0 => Err(self.malformed(format!("{} must be positive", field))),
            value => Ok(value),
        }
    }

    fn finite(&self, field: &str, raw: &str) -> Result<f64> {
        let value: f64 = self.parse(field, raw)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(self.malformed(format!("{} must be finite, got {}", field, value)))
        }
    }

    /// Splits `content` into a leading part and a trailing whitespace-separated field.
    fn split_last<'a>(&'a self, what: &str) -> Result<(&'a str, &'a str)> {
        self.content
            .trim()
            .rsplit_once(' ')
            .map(|(head, tail)| (head.trim_end(), tail))
            .filter(|(head, _)| !head.is_empty())
            .ok_or_else(|| self.malformed(format!("expected {}", what)))
    }
}

/// Typed view of a [`Frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    CallForProposal { round: u64, complexity: u32 },
    Propose { round: u64, completion_time: f64 },
    AcceptProposal { round: u64, complexity: u32 },
    RejectProposal { round: u64 },
    StatusQuery,
    StatusReply { assigned: bool },
    LoadSnapshot { total_time: f64, capacity: u32 },
    PairRequest { average: f64 },
    PairAccept,
    PairRefuse,
    TaskExchange { task: TaskId, complexity: u32 },
    ExchangeComplete,
    Evict,
}

impl Message {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::CallForProposal { .. } => "call-for-proposal",
            Message::Propose { .. } => "propose",
            Message::AcceptProposal { .. } => "accept-proposal",
            Message::RejectProposal { .. } => "reject-proposal",
            Message::StatusQuery => "status-query",
            Message::StatusReply { .. } => "status-reply",
            Message::LoadSnapshot { .. } => "load-snapshot",
            Message::PairRequest { .. } => "pair-request",
            Message::PairAccept => "pair-accept",
            Message::PairRefuse => "pair-refuse",
            Message::TaskExchange { .. } => "task-exchange",
            Message::ExchangeComplete => "exchange-complete",
            Message::Evict => "evict",
        }
    }

    pub fn into_frame(self, sender: EntityId) -> Frame {
        use Performative as P;

        match self {
            Message::CallForProposal { round, complexity } => {
                Frame::new(sender, P::CallForProposal, None)
                    .with_conversation(round)
                    .with_content(complexity)
            }
            Message::Propose {
                round,
                completion_time,
            } => Frame::new(sender, P::Propose, None)
                .with_conversation(round)
                .with_content(completion_time),
            Message::AcceptProposal { round, complexity } => {
                Frame::new(sender, P::AcceptProposal, None)
                    .with_conversation(round)
                    .with_content(complexity)
            }
            Message::RejectProposal { round } => {
                Frame::new(sender, P::RejectProposal, None).with_conversation(round)
            }
            Message::StatusQuery => Frame::new(sender, P::Inform, Some(Topic::Question)),
            Message::StatusReply { assigned } => {
                Frame::new(sender, P::Inform, Some(Topic::Answer)).with_content(assigned)
            }
            Message::LoadSnapshot {
                total_time,
                capacity,
            } => Frame::new(sender, P::Inform, Some(Topic::ComputerInfo))
                .with_content(format!("{} {}", total_time, capacity)),
            Message::PairRequest { average } => {
                Frame::new(sender, P::Request, Some(Topic::PairRequest)).with_content(average)
            }
            Message::PairAccept => Frame::new(sender, P::Agree, Some(Topic::PairAccept)),
            Message::PairRefuse => Frame::new(sender, P::Refuse, Some(Topic::PairRequest)),
            Message::TaskExchange { task, complexity } => {
                Frame::new(sender, P::Inform, Some(Topic::TaskExchange))
                    .with_content(format!("{} {}", task, complexity))
            }
            Message::ExchangeComplete => {
                Frame::new(sender, P::Inform, Some(Topic::ExchangeComplete))
            }
            Message::Evict => Frame::new(sender, P::Inform, Some(Topic::Remove)),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        use Performative as P;

        let message = match (frame.performative, frame.topic) {
            (P::CallForProposal, None) => Message::CallForProposal {
                round: frame.round()?,
                complexity: frame.positive("complexity", &frame.content)?,
            },
            (P::Propose, None) => Message::Propose {
                round: frame.round()?,
                completion_time: frame.finite("completion time", &frame.content)?,
            },
            (P::AcceptProposal, None) => Message::AcceptProposal {
                round: frame.round()?,
                complexity: frame.positive("complexity", &frame.content)?,
            },
            (P::RejectProposal, None) => Message::RejectProposal {
                round: frame.round()?,
            },
            (P::Inform, Some(Topic::Question)) => Message::StatusQuery,
            (P::Inform, Some(Topic::Answer)) => Message::StatusReply {
                assigned: frame.parse("assignment flag", &frame.content)?,
            },
            (P::Inform, Some(Topic::ComputerInfo)) => {
                let (total_time, capacity) = frame.split_last("`totalTime capacity`")?;
                Message::LoadSnapshot {
                    total_time: frame.finite("total time", total_time)?,
                    capacity: frame.positive("capacity", capacity)?,
                }
            }
            (P::Request, Some(Topic::PairRequest)) => Message::PairRequest {
                average: frame.finite("average", &frame.content)?,
            },
            (P::Agree, Some(Topic::PairAccept)) => Message::PairAccept,
            (P::Refuse, _) => Message::PairRefuse,
            (P::Inform, Some(Topic::TaskExchange)) => {
                let (task, complexity) = frame.split_last("`taskId complexity`")?;
                Message::TaskExchange {
                    task: TaskId::new(task),
                    complexity: frame.positive("complexity", complexity)?,
                }
            }
            (P::Inform, Some(Topic::ExchangeComplete)) => Message::ExchangeComplete,
            (P::Inform, Some(Topic::Remove)) => Message::Evict,
            _ => return Err(frame.malformed("unexpected performative/topic combination")),
        };

        Ok(message)
    }
}
