//! Coordinator and participant addresses
//!
//! Both are positional, pipe-delimited strings.
//!
//! ```text
//! coordinator, http:  baseURL|beginPath|joinPath|endPath
//! coordinator, mesh:  org|workspace|env|unit|nodeID|instanceID|beginTopic|joinTopic|endTopic
//! participant, http:  http|participantBaseURL|confirmURL|cancelURL
//! participant, mesh:  mesh|confirmEventID|cancelEventID
//! ```
//!
//! A participant sub-address is empty when the service has no such method.

use crate::config::{CommMode, TxnConfig};
use crate::descriptor::CompensableFlags;
use crate::error::{Result, TxnError};
use crate::rpc::{CallTarget, MeshRoute};

pub const FIELD_SEPARATOR: char = '|';

const HTTP_COORDINATOR_FIELDS: usize = 4;
const MESH_COORDINATOR_FIELDS: usize = 9;

/// Coordinator operation being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Begin,
    Join,
    End,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Begin => "begin",
            Operation::Join => "join",
            Operation::End => "end",
        }
    }
}

/// Parsed coordinator address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorAddress {
    Http {
        base_url: String,
        begin_path: String,
        join_path: String,
        end_path: String,
    },
    Mesh {
        route: MeshRoute,
        begin_topic: String,
        join_topic: String,
        end_topic: String,
    },
}

impl CoordinatorAddress {
    /// Parse `raw` for the given mode. The field count must match the mode
    /// exactly and no field may be empty.
    pub fn parse(raw: &str, mode: CommMode) -> Result<Self> {
        let fields: Vec<&str> = raw.split(FIELD_SEPARATOR).map(str::trim).collect();
        let expected = match mode {
            CommMode::Http => HTTP_COORDINATOR_FIELDS,
            CommMode::Mesh => MESH_COORDINATOR_FIELDS,
        };
        if fields.len() != expected {
            return Err(TxnError::structural(format!(
                "{} coordinator address needs {} fields, got {}: {:?}",
                mode,
                expected,
                fields.len(),
                raw
            )));
        }
        if let Some(position) = fields.iter().position(|f| f.is_empty()) {
            return Err(TxnError::structural(format!(
                "coordinator address field {} is empty: {:?}",
                position, raw
            )));
        }

        let owned: Vec<String> = fields.into_iter().map(str::to_string).collect();
        Ok(match mode {
            CommMode::Http => {
                let [base_url, begin_path, join_path, end_path]: [String; 4] =
                    owned.try_into().map_err(|_| TxnError::structural("field count"))?;
                CoordinatorAddress::Http {
                    base_url,
                    begin_path,
                    join_path,
                    end_path,
                }
            }
            CommMode::Mesh => {
                let [org, workspace, env, unit, node_id, instance_id, begin_topic, join_topic, end_topic]: [String; 9] =
                    owned.try_into().map_err(|_| TxnError::structural("field count"))?;
                CoordinatorAddress::Mesh {
                    route: MeshRoute {
                        org,
                        workspace,
                        env,
                        unit,
                        node_id,
                        instance_id,
                    },
                    begin_topic,
                    join_topic,
                    end_topic,
                }
            }
        })
    }

    pub fn mode(&self) -> CommMode {
        match self {
            CoordinatorAddress::Http { .. } => CommMode::Http,
            CoordinatorAddress::Mesh { .. } => CommMode::Mesh,
        }
    }

    pub fn encode(&self) -> String {
        let fields: Vec<&str> = match self {
            CoordinatorAddress::Http {
                base_url,
                begin_path,
                join_path,
                end_path,
            } => vec![base_url, begin_path, join_path, end_path],
            CoordinatorAddress::Mesh {
                route,
                begin_topic,
                join_topic,
                end_topic,
            } => vec![
                &route.org,
                &route.workspace,
                &route.env,
                &route.unit,
                &route.node_id,
                &route.instance_id,
                begin_topic,
                join_topic,
                end_topic,
            ],
        };
        fields.join("|")
    }

    /// Instance hosting the coordinator, known only in mesh mode.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            CoordinatorAddress::Mesh { route, .. } => Some(&route.instance_id),
            CoordinatorAddress::Http { .. } => None,
        }
    }

    /// Path (http) or topic (mesh) of an operation.
    pub fn endpoint(&self, operation: Operation) -> &str {
        match (self, operation) {
            (CoordinatorAddress::Http { begin_path, .. }, Operation::Begin) => begin_path,
            (CoordinatorAddress::Http { join_path, .. }, Operation::Join) => join_path,
            (CoordinatorAddress::Http { end_path, .. }, Operation::End) => end_path,
            (CoordinatorAddress::Mesh { begin_topic, .. }, Operation::Begin) => begin_topic,
            (CoordinatorAddress::Mesh { join_topic, .. }, Operation::Join) => join_topic,
            (CoordinatorAddress::Mesh { end_topic, .. }, Operation::End) => end_topic,
        }
    }

    pub fn target(&self, operation: Operation) -> CallTarget {
        let endpoint = self.endpoint(operation).to_string();
        match self {
            CoordinatorAddress::Http { base_url, .. } => CallTarget::Http {
                url: join_url(base_url, &endpoint),
            },
            CoordinatorAddress::Mesh { route, .. } => CallTarget::Topic {
                route: route.clone(),
                topic: endpoint,
            },
        }
    }
}

/// Join a base URL and a path without doubling or dropping the slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Where the coordinator calls this service back for Confirm/Cancel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantAddress {
    pub mode: CommMode,
    /// Empty in mesh mode.
    pub base_url: String,
    /// Confirm URL path (http) or event ID (mesh); empty without Confirm.
    pub confirm: String,
    /// Cancel URL path (http) or event ID (mesh); empty without Cancel.
    pub cancel: String,
}

impl ParticipantAddress {
    /// Address advertised for a service with the given capability flags.
    ///
    /// `force_direct` selects the http shape against the macro-service base
    /// URL regardless of the configured mode.
    pub fn build(config: &TxnConfig, flags: CompensableFlags, force_direct: bool) -> Self {
        let pick = |present: bool, value: &str| {
            if present {
                value.to_string()
            } else {
                String::new()
            }
        };

        if force_direct || config.comm_mode == CommMode::Http {
            let base_url = if force_direct {
                config.macro_service_base_url.clone()
            } else {
                config.participant_base_url.clone()
            };
            Self {
                mode: CommMode::Http,
                base_url,
                confirm: pick(flags.has_confirm(), &config.confirm_path),
                cancel: pick(flags.has_cancel(), &config.cancel_path),
            }
        } else {
            Self {
                mode: CommMode::Mesh,
                base_url: String::new(),
                confirm: pick(flags.has_confirm(), &config.confirm_event_id),
                cancel: pick(flags.has_cancel(), &config.cancel_event_id),
            }
        }
    }

    pub fn encode(&self) -> String {
        match self.mode {
            CommMode::Http => format!(
                "{}|{}|{}|{}",
                self.mode, self.base_url, self.confirm, self.cancel
            ),
            CommMode::Mesh => format!("{}|{}|{}", self.mode, self.confirm, self.cancel),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split(FIELD_SEPARATOR).collect();
        let mode: CommMode = fields
            .first()
            .copied()
            .unwrap_or_default()
            .parse()
            .map_err(|e| TxnError::structural(format!("participant address {:?}: {}", raw, e)))?;

        match (mode, fields.as_slice()) {
            (CommMode::Http, [_, base_url, confirm, cancel]) => Ok(Self {
                mode,
                base_url: base_url.to_string(),
                confirm: confirm.to_string(),
                cancel: cancel.to_string(),
            }),
            (CommMode::Mesh, [_, confirm, cancel]) => Ok(Self {
                mode,
                base_url: String::new(),
                confirm: confirm.to_string(),
                cancel: cancel.to_string(),
            }),
            _ => Err(TxnError::structural(format!(
                "{} participant address has {} fields: {:?}",
                mode,
                fields.len(),
                raw
            ))),
        }
    }

    /// Full callback URL for Confirm, if advertised over http.
    pub fn confirm_url(&self) -> Option<String> {
        self.callback_url(&self.confirm)
    }

    /// Full callback URL for Cancel, if advertised over http.
    pub fn cancel_url(&self) -> Option<String> {
        self.callback_url(&self.cancel)
    }

    fn callback_url(&self, path: &str) -> Option<String> {
        (self.mode == CommMode::Http && !path.is_empty()).then(|| join_url(&self.base_url, path))
    }
}
