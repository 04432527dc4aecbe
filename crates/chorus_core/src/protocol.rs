//! Cluster bus wire protocol
//!
//! Every frame on the bus is a JSON object `{"c": command, "a": args, "t":
//! target}`. The target is `"*"` for every worker, an integer cluster id, the
//! logical group `"support"`, or a request nonce for responses.

pub mod pending;

use std::fmt;
use std::str::FromStr;

use miette::Diagnostic;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::shard::ClusterId;

pub use pending::{GatheredResponse, PendingGuard, PendingRequests};

/// Closed set of bus commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Relay the wrapped command to the target (worker to launcher)
    Send,
    /// Scatter request, answered with `Response`
    Request,
    /// Gather reply, targeted at the request nonce
    Response,
    /// Signal a cluster's process directly
    Kill,
    /// Disconnect and exit cleanly
    Close,
    /// Exit so the supervisor respawns the cluster
    Restart,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Send => "send",
            Self::Request => "request",
            Self::Response => "response",
            Self::Kill => "kill",
            Self::Close => "close",
            Self::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// Who an envelope is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    All,
    Cluster(ClusterId),
    /// The cluster hosting the support guild
    Support,
    Nonce(Uuid),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Cluster(id) => write!(f, "{id}"),
            Self::Support => f.write_str("support"),
            Self::Nonce(nonce) => write!(f, "{nonce}"),
        }
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Cluster(id) => serializer.serialize_u32(id.0),
            other => serializer.collect_str(other),
        }
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TargetVisitor;

        impl Visitor<'_> for TargetVisitor {
            type Value = Target;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#""*", "support", a cluster id or a nonce"#)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Target, E> {
                u32::try_from(v)
                    .map(|id| Target::Cluster(ClusterId(id)))
                    .map_err(|_| E::custom(format!("cluster id {v} out of range")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Target, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("negative cluster id {v}")))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Target, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(TargetVisitor)
    }
}

impl FromStr for Target {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => Ok(Self::All),
            "support" => Ok(Self::Support),
            other => {
                if let Ok(id) = other.parse::<u32>() {
                    return Ok(Self::Cluster(ClusterId(id)));
                }
                Uuid::parse_str(other)
                    .map(Self::Nonce)
                    .map_err(|_| ProtocolError::UnknownTarget {
                        target: other.to_string(),
                    })
            }
        }
    }
}

impl From<ClusterId> for Target {
    fn from(id: ClusterId) -> Self {
        Self::Cluster(id)
    }
}

/// Information a scatter request can ask a worker for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoKind {
    Ping,
    GuildCount,
    VoiceCount,
    HasSupport,
    Shards,
    #[serde(other)]
    Unknown,
}

impl InfoKind {
    /// Key used for this info in a response object
    pub fn key(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::GuildCount => "guild_count",
            Self::VoiceCount => "voice_count",
            Self::HasSupport => "has_support",
            Self::Shards => "shards",
            Self::Unknown => "unknown",
        }
    }
}

/// One bus frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "c")]
    pub command: Command,
    #[serde(rename = "a", default)]
    pub args: Value,
    #[serde(rename = "t")]
    pub target: Target,
}

/// Args of a `send` envelope: the command to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendArgs {
    #[serde(rename = "c")]
    pub command: Command,
    #[serde(rename = "a", default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestArgs {
    pub info: Vec<InfoKind>,
    pub nonce: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

#[derive(Error, Diagnostic, Debug)]
pub enum ProtocolError {
    #[error("Malformed bus frame")]
    #[diagnostic(
        code(chorus_core::protocol::malformed_frame),
        help("Bus frames are JSON objects of the form {{\"c\": ..., \"a\": ..., \"t\": ...}}")
    )]
    Malformed {
        #[source]
        cause: serde_json::Error,
    },

    #[error("Unknown target '{target}'")]
    #[diagnostic(
        code(chorus_core::protocol::unknown_target),
        help("Targets are \"*\", \"support\", a cluster id or a request nonce")
    )]
    UnknownTarget { target: String },

    #[error("Target {target} is not valid for command '{command}'")]
    #[diagnostic(code(chorus_core::protocol::invalid_target))]
    InvalidTarget { command: Command, target: Target },

    #[error("Invalid args for command '{command}'")]
    #[diagnostic(code(chorus_core::protocol::invalid_args))]
    InvalidArgs {
        command: Command,
        #[source]
        cause: serde_json::Error,
    },
}

impl Envelope {
    pub fn new(command: Command, args: Value, target: impl Into<Target>) -> Self {
        Self {
            command,
            args,
            target: target.into(),
        }
    }

    /// A bare directive such as `close` or `restart`
    pub fn directive(command: Command, target: impl Into<Target>) -> Self {
        Self::new(command, Value::Object(Map::new()), target)
    }

    pub fn request(info: Vec<InfoKind>, nonce: Uuid, target: impl Into<Target>) -> Self {
        Self::new(Command::Request, json!(RequestArgs { info, nonce }), target)
    }

    pub fn response(nonce: Uuid, data: Value) -> Self {
        Self::new(Command::Response, data, Target::Nonce(nonce))
    }

    pub fn kill(cluster_id: ClusterId, signal: Option<i32>) -> Self {
        Self::new(Command::Kill, json!(KillArgs { signal }), cluster_id)
    }

    /// Ask the launcher to relay `command` to `target`
    pub fn relay(command: Command, args: Value, target: impl Into<Target>) -> Self {
        Self::new(Command::Send, json!(SendArgs { command, args }), target)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Self =
            serde_json::from_str(text).map_err(|cause| ProtocolError::Malformed { cause })?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn encode(&self) -> String {
        // Envelope only holds JSON-representable data
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Check that the target makes sense for the command.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let valid = match self.command {
            Command::Response => matches!(self.target, Target::Nonce(_)),
            Command::Kill => matches!(self.target, Target::Cluster(_)),
            Command::Send | Command::Request | Command::Close | Command::Restart => {
                !matches!(self.target, Target::Nonce(_))
            }
        };

        if valid {
            Ok(())
        } else {
            Err(ProtocolError::InvalidTarget {
                command: self.command,
                target: self.target,
            })
        }
    }

    /// Deserialize the args into a command-specific type. A frame without
    /// `a` reads as an empty object.
    pub fn args_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        let empty = Value::Object(Default::default());
        let args = if self.args.is_null() { &empty } else { &self.args };
        T::deserialize(args).map_err(|cause| ProtocolError::InvalidArgs {
            command: self.command,
            cause,
        })
    }
}
