use crate::errors::CqlResponseKind;
use crate::frame::frame_errors::{LowLevelDeserializationError, ResponseParseError};
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use std::net::SocketAddr;

/// A push notification sent on stream -1 of a connection registered for events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

/// Kind of schema object a change refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table(String),
    Type(String),
    Function { name: String, arguments: Vec<String> },
    Aggregate { name: String, arguments: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub keyspace_name: String,
    pub target: SchemaChangeTarget,
}

fn malformed(err: impl Into<LowLevelDeserializationError>) -> ResponseParseError {
    ResponseParseError::malformed(CqlResponseKind::Event, err)
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let event_type: EventType = types::read_string(buf).map_err(malformed)?.parse()?;
        match event_type {
            EventType::TopologyChange => Ok(Self::TopologyChange(
                TopologyChangeEvent::deserialize(buf)?,
            )),
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        match self {
            Event::TopologyChange(change) => {
                types::write_string(&EventType::TopologyChange.to_string(), buf)?;
                let (kind, addr) = match change {
                    TopologyChangeEvent::NewNode(addr) => ("NEW_NODE", addr),
                    TopologyChangeEvent::RemovedNode(addr) => ("REMOVED_NODE", addr),
                };
                types::write_string(kind, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::StatusChange(change) => {
                types::write_string(&EventType::StatusChange.to_string(), buf)?;
                let (kind, addr) = match change {
                    StatusChangeEvent::Up(addr) => ("UP", addr),
                    StatusChangeEvent::Down(addr) => ("DOWN", addr),
                };
                types::write_string(kind, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::SchemaChange(change) => {
                types::write_string(&EventType::SchemaChange.to_string(), buf)?;
                change.serialize(buf)?;
            }
        }
        Ok(())
    }
}

impl SchemaChangeEvent {
    /// Also used for the body of a `RESULT` of kind schema change.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let change_type = match types::read_string(buf).map_err(malformed)? {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target = types::read_string(buf).map_err(malformed)?;
        let keyspace_name = types::read_string(buf).map_err(malformed)?.to_string();

        let target = match target {
            "KEYSPACE" => SchemaChangeTarget::Keyspace,
            "TABLE" => SchemaChangeTarget::Table(types::read_string(buf).map_err(malformed)?.to_string()),
            "TYPE" => SchemaChangeTarget::Type(types::read_string(buf).map_err(malformed)?.to_string()),
            "FUNCTION" | "AGGREGATE" => {
                let name = types::read_string(buf).map_err(malformed)?.to_string();
                let arguments = types::read_string_list(buf).map_err(malformed)?;
                if target == "FUNCTION" {
                    SchemaChangeTarget::Function { name, arguments }
                } else {
                    SchemaChangeTarget::Aggregate { name, arguments }
                }
            }
            other => return Err(ResponseParseError::UnknownSchemaChangeTarget(other.to_string())),
        };

        Ok(Self {
            change_type,
            keyspace_name,
            target,
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        let change_type = match self.change_type {
            SchemaChangeType::Created => "CREATED",
            SchemaChangeType::Updated => "UPDATED",
            SchemaChangeType::Dropped => "DROPPED",
            SchemaChangeType::Invalid => "INVALID",
        };
        types::write_string(change_type, buf)?;
        let target = match &self.target {
            SchemaChangeTarget::Keyspace => "KEYSPACE",
            SchemaChangeTarget::Table(_) => "TABLE",
            SchemaChangeTarget::Type(_) => "TYPE",
            SchemaChangeTarget::Function { .. } => "FUNCTION",
            SchemaChangeTarget::Aggregate { .. } => "AGGREGATE",
        };
        types::write_string(target, buf)?;
        types::write_string(&self.keyspace_name, buf)?;
        match &self.target {
            SchemaChangeTarget::Keyspace => {}
            SchemaChangeTarget::Table(name) | SchemaChangeTarget::Type(name) => {
                types::write_string(name, buf)?
            }
            SchemaChangeTarget::Function { name, arguments }
            | SchemaChangeTarget::Aggregate { name, arguments } => {
                types::write_string(name, buf)?;
                types::write_string_list(arguments, buf)?;
            }
        }
        Ok(())
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let type_of_change = types::read_string(buf).map_err(malformed)?;
        let addr = types::read_inet(buf).map_err(malformed)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            // MOVED_NODE is a token movement, which a refresh picks up anyway.
            _ => Err(ResponseParseError::UnknownTopologyChangeType(
                type_of_change.to_string(),
            )),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let type_of_change = types::read_string(buf).map_err(malformed)?;
        let addr = types::read_inet(buf).map_err(malformed)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ResponseParseError::UnknownStatusChangeType(
                type_of_change.to_string(),
            )),
        }
    }
}
