//! Agent protocol — framed JSON messages exchanged between the server's
//! agent gateway and an agent's client runtime.
//!
//! Every payload on the wire is `{"type": <string>, "data": <object>}`.
//! Unlike an internally-tagged serde enum (which would flatten `data`'s
//! fields up into the envelope), the envelope and the payload are kept as
//! two separate types so the wire shape in spec stays literal. Unknown
//! `type` values are ignored by both sides for forward compatibility.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wire envelope: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub version: String,
    pub build_time: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub auto_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAckData {
    pub agent_id: String,
    pub name: String,
    pub need_update: bool,
    pub force_update: bool,
    pub latest_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedData {
    pub agent_id: String,
    pub name: String,
    pub is_new_agent: bool,
    pub machine_id: String,
}

/// A task as seen by an agent: just enough to run and reschedule it
/// locally. Carries no retention/log metadata — that stays server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskWire {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub schedule: String,
    pub timeout_minutes: i64,
    pub work_dir: String,
    #[serde(default)]
    pub env_ids: Vec<i64>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksData {
    pub tasks: Vec<TaskWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultData {
    pub task_id: i64,
    pub command: String,
    pub output: String,
    pub status: String,
    pub duration: i64,
    pub exit_code: i32,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteData {
    pub task_id: i64,
}

/// Typed view over a [`Frame`], used so both sides can `match` instead of
/// re-parsing `data` by hand at every call site.
#[derive(Debug, Clone)]
pub enum Message {
    Heartbeat(HeartbeatData),
    HeartbeatAck(HeartbeatAckData),
    Connected(ConnectedData),
    FetchTasks,
    Tasks(TasksData),
    TaskResult(TaskResultData),
    Execute(ExecuteData),
    Enabled,
    Disabled,
    Update,
    /// Any `type` this build doesn't recognize. Forward-compatible: the
    /// receiver simply ignores it rather than erroring out.
    Unknown(String),
}

impl Message {
    pub fn kind(&self) -> &str {
        match self {
            Message::Heartbeat(_) => "heartbeat",
            Message::HeartbeatAck(_) => "heartbeat_ack",
            Message::Connected(_) => "connected",
            Message::FetchTasks => "fetch_tasks",
            Message::Tasks(_) => "tasks",
            Message::TaskResult(_) => "task_result",
            Message::Execute(_) => "execute",
            Message::Enabled => "enabled",
            Message::Disabled => "disabled",
            Message::Update => "update",
            Message::Unknown(k) => k.as_str(),
        }
    }

    pub fn into_frame(self) -> anyhow::Result<Frame> {
        let data = match &self {
            Message::Heartbeat(d) => serde_json::to_value(d)?,
            Message::HeartbeatAck(d) => serde_json::to_value(d)?,
            Message::Connected(d) => serde_json::to_value(d)?,
            Message::Tasks(d) => serde_json::to_value(d)?,
            Message::TaskResult(d) => serde_json::to_value(d)?,
            Message::Execute(d) => serde_json::to_value(d)?,
            Message::FetchTasks
            | Message::Enabled
            | Message::Disabled
            | Message::Update
            | Message::Unknown(_) => Value::Object(Default::default()),
        };
        Ok(Frame::new(self.kind().to_string(), data))
    }

    pub fn from_frame(frame: Frame) -> anyhow::Result<Message> {
        let msg = match frame.kind.as_str() {
            "heartbeat" => Message::Heartbeat(serde_json::from_value(frame.data)?),
            "heartbeat_ack" => Message::HeartbeatAck(serde_json::from_value(frame.data)?),
            "connected" => Message::Connected(serde_json::from_value(frame.data)?),
            "fetch_tasks" => Message::FetchTasks,
            "tasks" => Message::Tasks(serde_json::from_value(frame.data)?),
            "task_result" => Message::TaskResult(serde_json::from_value(frame.data)?),
            "execute" => Message::Execute(serde_json::from_value(frame.data)?),
            "enabled" => Message::Enabled,
            "disabled" => Message::Disabled,
            "update" => Message::Update,
            other => Message::Unknown(other.to_string()),
        };
        Ok(msg)
    }

    pub fn from_json_text(text: &str) -> anyhow::Result<Message> {
        let frame: Frame = serde_json::from_str(text)?;
        Message::from_frame(frame)
    }

    pub fn to_json_text(self) -> anyhow::Result<String> {
        let frame = self.into_frame()?;
        Ok(serde_json::to_string(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips_through_the_wire_envelope() {
        let msg = Message::Heartbeat(HeartbeatData {
            version: "1.2.3".into(),
            build_time: "2025-01-01T00:00:00Z".into(),
            hostname: "box".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            auto_update: true,
        });
        let text = msg.clone().to_json_text().unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "heartbeat");
        assert_eq!(parsed["data"]["hostname"], "box");

        match Message::from_json_text(&text).unwrap() {
            Message::Heartbeat(d) => assert_eq!(d.version, "1.2.3"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_types_do_not_error() {
        let msg = Message::from_json_text(r#"{"type":"future_feature","data":{}}"#).unwrap();
        assert!(matches!(msg, Message::Unknown(k) if k == "future_feature"));
    }

    #[test]
    fn fetch_tasks_has_no_payload() {
        let frame = Message::FetchTasks.into_frame().unwrap();
        assert_eq!(frame.kind, "fetch_tasks");
        assert_eq!(frame.data, Value::Object(Default::default()));
    }
}
