//! rosbridge-compatible WebSocket bridge.
//!
//! This module provides [`RosBridge`], which:
//!
//! 1. **Ingests** rosbridge `publish` operations from connected clients and
//!    turns them into events on the internal [`EventBus`]:
//!
//!    | ROS topic | Message | Bus lane |
//!    |---|---|---|
//!    | `/aruco_markers` | `ros2_aruco_interfaces/ArucoMarkers` | [`Topic::Markers`] |
//!    | `/mage/advanced_logical_camera/image` | `mage_msgs/AdvancedLogicalCameraImage` | [`Topic::PartImages`] |
//!    | `/tf` | `tf2_msgs/TFMessage` | [`Topic::Tf`] |
//!    | `/tf_static` | `tf2_msgs/TFMessage` | [`Topic::TfStatic`] (latched) |
//!
//! 2. **Forwards** velocity commands (`/cmd_vel`, `geometry_msgs/Twist`) and
//!    transform traffic (`/tf`, `/tf_static`) as rosbridge `publish`
//!    operations to each client that sent a `subscribe` for the topic, until
//!    it sends the matching `unsubscribe`.  Events a client published itself
//!    are not sent back to it.
//!
//! Other operations and topics are ignored.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use markernav_hal::Clock;
use markernav_types::{
    Event, EventPayload, LogicalCameraImage, MarkerArray, MarkerDetection, NavError,
    PartDetection, PoseMsg, StampedTransform, Timestamp, Transform3D, VelocityCommand,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic, TopicReceiver};
use crate::transport::latch_key;

pub const ARUCO_TOPIC: &str = "/aruco_markers";
pub const LOGICAL_CAMERA_TOPIC: &str = "/mage/advanced_logical_camera/image";
pub const TF_TOPIC: &str = "/tf";
pub const TF_STATIC_TOPIC: &str = "/tf_static";
pub const CMD_VEL_TOPIC: &str = "/cmd_vel";

const SOURCE: &str = "markernav-middleware::rosbridge";

/// Event source for everything published on behalf of one client.
fn client_source(peer: SocketAddr) -> String {
    format!("{SOURCE}@{peer}")
}

// ────────────────────────────────────────────────────────────────────────────
// ROS message shapes
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct RosTime {
    #[serde(default)]
    sec: i64,
    #[serde(default)]
    nanosec: u32,
}

impl From<Timestamp> for RosTime {
    fn from(stamp: Timestamp) -> Self {
        let (sec, nanosec) = stamp.to_sec_nanosec();
        Self {
            sec: sec as i64,
            nanosec,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RosHeader {
    #[serde(default)]
    stamp: RosTime,
    #[serde(default)]
    frame_id: String,
}

#[derive(Debug, Deserialize)]
struct ArucoMarkersMsg {
    #[serde(default)]
    header: RosHeader,
    #[serde(default)]
    marker_ids: Vec<i64>,
    #[serde(default)]
    poses: Vec<Option<PoseMsg>>,
}

#[derive(Debug, Deserialize)]
struct PartMsg {
    color: u8,
    #[serde(rename = "type")]
    part_type: u8,
}

#[derive(Debug, Deserialize)]
struct PartPoseMsg {
    part: PartMsg,
    #[serde(default)]
    pose: Option<PoseMsg>,
}

#[derive(Debug, Deserialize)]
struct LogicalCameraMsg {
    #[serde(default)]
    part_poses: Vec<PartPoseMsg>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransformStampedMsg {
    header: RosHeader,
    child_frame_id: String,
    transform: Transform3D,
}

#[derive(Debug, Serialize, Deserialize)]
struct TfMsg {
    transforms: Vec<TransformStampedMsg>,
}

impl From<TransformStampedMsg> for StampedTransform {
    fn from(msg: TransformStampedMsg) -> Self {
        StampedTransform::new(
            msg.header.frame_id,
            msg.child_frame_id,
            Timestamp::from_sec_nanosec(msg.header.stamp.sec, msg.header.stamp.nanosec),
            msg.transform,
        )
    }
}

impl From<&StampedTransform> for TransformStampedMsg {
    fn from(t: &StampedTransform) -> Self {
        Self {
            header: RosHeader {
                stamp: t.stamp.into(),
                frame_id: t.parent_frame.clone(),
            },
            child_frame_id: t.child_frame.clone(),
            transform: t.transform,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RosbridgeOp {
    op: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    msg: serde_json::Value,
}

fn parse_op(text: &str) -> Result<RosbridgeOp, NavError> {
    serde_json::from_str(text)
        .map_err(|e| NavError::Serialization(format!("bad rosbridge frame: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(topic: &str, msg: serde_json::Value) -> Result<T, NavError> {
    serde_json::from_value(msg)
        .map_err(|e| NavError::Serialization(format!("bad {topic} message: {e}")))
}

// ────────────────────────────────────────────────────────────────────────────
// Bridge
// ────────────────────────────────────────────────────────────────────────────

/// Bridge between rosbridge WebSocket clients and the internal [`EventBus`].
#[derive(Clone)]
pub struct RosBridge {
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl RosBridge {
    /// Create a new bridge backed by `bus`.  `clock` stamps logical-camera
    /// images, which carry no header of their own.
    pub fn new(bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self { bus, clock }
    }

    /// Bind `addr` and serve clients until the task is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`NavError::TransportDisconnected`] if the TCP listener cannot
    /// be bound.
    pub async fn run_ws_server(self, addr: SocketAddr) -> Result<(), NavError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            NavError::TransportDisconnected(format!("ws bind error on {addr}: {e}"))
        })?;
        info!(%addr, "rosbridge listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept clients on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_ws_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "ws accept error");
                }
            }
        }
    }

    async fn handle_ws_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), NavError> {
        let ws_stream = accept_async(stream).await.map_err(|e| {
            NavError::TransportDisconnected(format!("ws handshake from {peer}: {e}"))
        })?;
        info!(peer = %peer, "rosbridge client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let origin = client_source(peer);
        let mut subs = ClientSubscriptions::default();

        loop {
            let step = tokio::select! {
                result = next_on(&mut subs.cmd_vel) => Step::Bus(Topic::CmdVel, result),
                result = next_on(&mut subs.tf) => Step::Bus(Topic::Tf, result),
                result = next_on(&mut subs.tf_static) => Step::Bus(Topic::TfStatic, result),
                msg = ws_rx.next() => Step::Client(msg),
            };
            let outbound = match step {
                Step::Bus(topic, result) => forward(topic, result, &origin, peer)?,
                Step::Client(Some(Ok(Message::Text(text)))) => {
                    if let Err(e) = self.handle_client_frame(text.as_str(), &origin, &mut subs) {
                        warn!(peer = %peer, error = %e, "rejected rosbridge message");
                    }
                    None
                }
                Step::Client(Some(Ok(Message::Close(_))) | None) => break,
                Step::Client(Some(Err(e))) => {
                    debug!(peer = %peer, error = %e, "ws read error");
                    break;
                }
                Step::Client(Some(Ok(_))) => None,
            };
            if let Some(json) = outbound {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }

        info!(peer = %peer, "rosbridge client disconnected");
        Ok(())
    }

    fn handle_client_frame(
        &self,
        text: &str,
        origin: &str,
        subs: &mut ClientSubscriptions,
    ) -> Result<usize, NavError> {
        let op = parse_op(text)?;
        match op.op.as_str() {
            "subscribe" => {
                subs.subscribe(&self.bus, &op.topic);
                Ok(0)
            }
            "unsubscribe" => {
                subs.unsubscribe(&op.topic);
                Ok(0)
            }
            _ => self.route(op, origin),
        }
    }

    /// Route one rosbridge text frame onto the bus.
    ///
    /// Returns the number of bus receivers reached; `0` for ignored messages.
    pub fn handle_incoming_ws_message(&self, text: &str) -> Result<usize, NavError> {
        self.route(parse_op(text)?, SOURCE)
    }

    fn route(&self, op: RosbridgeOp, origin: &str) -> Result<usize, NavError> {
        if op.op != "publish" {
            debug!(op = %op.op, topic = %op.topic, "ignoring rosbridge op");
            return Ok(0);
        }

        match op.topic.as_str() {
            ARUCO_TOPIC => {
                let markers: ArucoMarkersMsg = decode(ARUCO_TOPIC, op.msg)?;
                self.ingest_markers(markers, origin)
            }
            LOGICAL_CAMERA_TOPIC => {
                let image: LogicalCameraMsg = decode(LOGICAL_CAMERA_TOPIC, op.msg)?;
                self.ingest_part_image(image, origin)
            }
            TF_TOPIC | TF_STATIC_TOPIC => {
                let tf: TfMsg = decode(&op.topic, op.msg)?;
                let latched = op.topic == TF_STATIC_TOPIC;
                tf.transforms.into_iter().try_fold(0, |sent, t| -> Result<usize, NavError> {
                    Ok(sent + self.publish_transform(t.into(), latched, origin)?)
                })
            }
            other => {
                debug!(topic = %other, "ignoring rosbridge publish");
                Ok(0)
            }
        }
    }

    fn publish_transform(
        &self,
        transform: StampedTransform,
        latched: bool,
        origin: &str,
    ) -> Result<usize, NavError> {
        if latched {
            let key = latch_key(&transform.parent_frame, &transform.child_frame);
            let event = Event::new(origin, EventPayload::Transform(transform));
            self.bus.publish_latched(Topic::TfStatic, key, event)
        } else {
            let event = Event::new(origin, EventPayload::Transform(transform));
            self.bus.publish_to(Topic::Tf, event)
        }
    }

    fn ingest_markers(&self, msg: ArucoMarkersMsg, origin: &str) -> Result<usize, NavError> {
        let mut poses = msg.poses.into_iter();
        let markers = msg
            .marker_ids
            .into_iter()
            .map(|marker_id| MarkerDetection {
                marker_id,
                pose: poses.next().flatten(),
            })
            .collect();
        let array = MarkerArray {
            stamp: Timestamp::from_sec_nanosec(msg.header.stamp.sec, msg.header.stamp.nanosec),
            markers,
        };
        self.bus
            .publish_to(Topic::Markers, Event::new(origin, EventPayload::Markers(array)))
    }

    fn ingest_part_image(&self, msg: LogicalCameraMsg, origin: &str) -> Result<usize, NavError> {
        let image = LogicalCameraImage {
            stamp: self.clock.now(),
            parts: msg
                .part_poses
                .into_iter()
                .map(|p| PartDetection {
                    color: p.part.color,
                    part_type: p.part.part_type,
                    pose: p.pose,
                })
                .collect(),
        };
        self.bus
            .publish_to(Topic::PartImages, Event::new(origin, EventPayload::PartImage(image)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-client state
// ────────────────────────────────────────────────────────────────────────────

/// Outbound topics one client asked for.  `None` means not subscribed.
#[derive(Default)]
struct ClientSubscriptions {
    cmd_vel: Option<TopicReceiver>,
    tf: Option<TopicReceiver>,
    tf_static: Option<TopicReceiver>,
}

impl ClientSubscriptions {
    fn slot(&mut self, ros_topic: &str) -> Option<(Topic, &mut Option<TopicReceiver>)> {
        match ros_topic {
            CMD_VEL_TOPIC => Some((Topic::CmdVel, &mut self.cmd_vel)),
            TF_TOPIC => Some((Topic::Tf, &mut self.tf)),
            TF_STATIC_TOPIC => Some((Topic::TfStatic, &mut self.tf_static)),
            _ => None,
        }
    }

    /// Start forwarding `ros_topic`.  Repeated subscribes keep the existing
    /// receiver, so a latched backlog is replayed once.
    fn subscribe(&mut self, bus: &EventBus, ros_topic: &str) {
        match self.slot(ros_topic) {
            Some((topic, slot)) => {
                if slot.is_none() {
                    *slot = Some(bus.subscribe_to(topic));
                }
            }
            None => debug!(topic = %ros_topic, "ignoring subscribe to unbridged topic"),
        }
    }

    fn unsubscribe(&mut self, ros_topic: &str) {
        if let Some((_, slot)) = self.slot(ros_topic) {
            *slot = None;
        }
    }
}

enum Step {
    Bus(Topic, Result<Event, RecvError>),
    Client(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

/// Next event on a subscription slot; never resolves while unsubscribed.
async fn next_on(rx: &mut Option<TopicReceiver>) -> Result<Event, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Turn a bus event into an outbound rosbridge frame, if it has one.
/// Events published by `origin` are not echoed back.
fn forward(
    topic: Topic,
    result: Result<Event, RecvError>,
    origin: &str,
    peer: SocketAddr,
) -> Result<Option<String>, NavError> {
    match result {
        Ok(event) if event.source == origin => Ok(None),
        Ok(event) => Ok(encode_outbound(topic, &event.payload)),
        Err(RecvError::Lagged(n)) => {
            warn!(peer = %peer, topic = ?topic, lagged_by = n, "ws client lagged");
            Ok(None)
        }
        Err(RecvError::Closed) => Err(NavError::Channel("event bus closed".into())),
    }
}

fn encode_outbound(topic: Topic, payload: &EventPayload) -> Option<String> {
    let (ros_topic, msg) = match (topic, payload) {
        (Topic::CmdVel, EventPayload::Velocity(cmd)) => (CMD_VEL_TOPIC, twist(cmd)),
        (Topic::Tf, EventPayload::Transform(t)) => (TF_TOPIC, tf_message(t)),
        (Topic::TfStatic, EventPayload::Transform(t)) => (TF_STATIC_TOPIC, tf_message(t)),
        _ => return None,
    };
    Some(json!({ "op": "publish", "topic": ros_topic, "msg": msg }).to_string())
}

fn twist(cmd: &VelocityCommand) -> serde_json::Value {
    json!({
        "linear": { "x": cmd.linear, "y": 0.0, "z": 0.0 },
        "angular": { "x": 0.0, "y": 0.0, "z": cmd.angular },
    })
}

fn tf_message(t: &StampedTransform) -> serde_json::Value {
    json!({ "transforms": [TransformStampedMsg::from(t)] })
}
