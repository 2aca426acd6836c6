//! [`FollowerNode`] – wires the buffer, transport, ingests and control loop.
//!
//! ```text
//! Markers ─► MarkerIngest ─► Broadcaster ─► Tf lane ─► Listener ─► TransformBuffer
//!                                                                        │
//!                              CmdVel lane ◄─ ControlLoop (every tick) ◄─┘
//! ```
//!
//! Construction is the only fallible part: an invalid configuration or a
//! transport that refuses the listener's first subscription is returned as an
//! error.  Listener disconnects and reconnects are reported as
//! [`EventPayload::Fault`] events on [`Topic::SystemAlerts`].  Once [`FollowerNode::run`] starts it keeps ticking until the
//! shutdown future resolves, then publishes a final stop command.

use std::future::Future;
use std::sync::Arc;

use markernav_hal::{Clock, StampMapper};
use markernav_middleware::{
    EventBus, Topic, TransformBroadcaster, TransformListener, Transport,
};
use markernav_perception::TransformBuffer;
use markernav_types::{Event, EventPayload, NavError, VelocityCommand};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::NodeConfig;
use crate::control_loop::ControlLoop;
use crate::marker_ingest::MarkerIngest;
use crate::part_ingest::PartIngest;

pub const SOURCE: &str = "markernav-runtime::node";

pub struct FollowerNode {
    config: NodeConfig,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    buffer: TransformBuffer,
    broadcaster: Arc<TransformBroadcaster>,
    listener: TransformListener,
}

impl FollowerNode {
    /// Build a node whose transforms travel over `bus` itself.
    pub async fn new(
        config: NodeConfig,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NavError> {
        let transport: Arc<dyn Transport> = Arc::new(bus.clone());
        Self::with_transport(config, bus, transport, clock).await
    }

    /// Validate `config`, start the transform listener on `transport` and
    /// latch the configured static transforms.  `bus` still carries
    /// detections, commands and alerts.
    #[instrument(skip_all, fields(marker = %config.marker_frame()))]
    pub async fn with_transport(
        config: NodeConfig,
        bus: EventBus,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NavError> {
        config.validate()?;

        let buffer = TransformBuffer::new(config.retention(), config.tolerance());
        let broadcaster = Arc::new(TransformBroadcaster::new(Arc::clone(&transport)));
        let listener = TransformListener::new(transport, buffer.clone()).await?;

        let now = clock.now();
        for fixture in &config.static_transforms {
            broadcaster.send_static_transform(fixture.to_transform(now))?;
            info!(
                parent = %fixture.parent_frame,
                child = %fixture.child_frame,
                "static transform latched"
            );
        }

        Ok(Self {
            config,
            bus,
            clock,
            buffer,
            broadcaster,
            listener,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The node's transform buffer.  Clones share state.
    pub fn buffer(&self) -> &TransformBuffer {
        &self.buffer
    }

    pub fn listener(&self) -> &TransformListener {
        &self.listener
    }

    /// Run ingest and the control timer until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), NavError>
    where
        F: Future<Output = ()>,
    {
        let marker_ingest = Arc::new(MarkerIngest::new(
            Arc::clone(&self.broadcaster),
            self.config.camera_frame.clone(),
            self.config.marker_frame_prefix.clone(),
            StampMapper::new(self.config.stamp_policy, Arc::clone(&self.clock)),
        ));
        let mut tasks = vec![tokio::spawn(
            Arc::clone(&marker_ingest).run(self.bus.subscribe_to(Topic::Markers)),
        )];
        if let Some(part_camera) = &self.config.part_camera {
            let part_ingest = Arc::new(PartIngest::new(
                Arc::clone(&self.broadcaster),
                part_camera.camera_frame.clone(),
                part_camera.frame_prefix.clone(),
            ));
            tasks.push(tokio::spawn(
                part_ingest.run(self.bus.subscribe_to(Topic::PartImages)),
            ));
        }

        let mut control = ControlLoop::new(&self.config, self.buffer.clone());
        let mut interval = tokio::time::interval(self.config.tick_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut listener_up = self.listener.is_connected();
        info!(
            period_ms = self.config.tick_period_ms,
            marker = %control.marker_frame(),
            "control loop started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let outcome = control.tick(self.clock.now());
                    debug!(state = ?outcome.state, linear = outcome.command.linear, angular = outcome.command.angular, "tick");
                    self.publish_command(outcome.command)?;

                    let up = self.listener.is_connected();
                    if up != listener_up {
                        listener_up = up;
                        self.alert_listener(up)?;
                    }
                }
            }
        }

        for task in &tasks {
            task.abort();
        }
        self.publish_command(VelocityCommand::stop())?;
        self.listener.shutdown();
        info!(
            markers_published = marker_ingest.published(),
            markers_malformed = marker_ingest.malformed(),
            transforms_received = self.listener.received(),
            "follower node stopped"
        );
        Ok(())
    }

    fn publish_command(&self, command: VelocityCommand) -> Result<usize, NavError> {
        self.bus.publish_to(
            Topic::CmdVel,
            Event::new(SOURCE, EventPayload::Velocity(command)),
        )
    }

    fn alert_listener(&self, connected: bool) -> Result<usize, NavError> {
        let message = if connected {
            "transform listener reconnected"
        } else {
            "transform listener disconnected"
        };
        warn!(connected, "{message}");
        self.bus.publish_to(
            Topic::SystemAlerts,
            Event::new(
                SOURCE,
                EventPayload::Fault {
                    component: "transform_listener".to_string(),
                    message: message.to_string(),
                },
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use futures_util::stream::{self, BoxStream};
    use markernav_hal::{ManualClock, StampPolicy};
    use markernav_middleware::RosBridge;
    use markernav_types::{
        MarkerArray, MarkerDetection, PoseMsg, Quaternion, Timestamp, TransformMessage, Vec3,
    };
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    const EPOCH_MS: u64 = 1_700_000_000_000;

    /// The first subscription ends after a short while; later ones stay open.
    #[derive(Default)]
    struct DroppingTransport {
        subscriptions: AtomicU64,
    }

    #[async_trait]
    impl Transport for DroppingTransport {
        fn publish_transform(&self, _msg: TransformMessage) -> Result<usize, NavError> {
            Ok(0)
        }

        async fn subscribe_transforms(
            &self,
        ) -> Result<BoxStream<'static, TransformMessage>, NavError> {
            if self.subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(stream::unfold((), |()| async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    None::<(TransformMessage, ())>
                })
                .boxed())
            } else {
                Ok(stream::pending().boxed())
            }
        }
    }

    async fn next_alert(rx: &mut markernav_middleware::TopicReceiver) -> (String, String) {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("alert within timeout")
            .expect("bus open");
        match event.payload {
            EventPayload::Fault { component, message } => (component, message),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    fn sim_time_markers(sim_ms: u64) -> String {
        let (sec, nanosec) = (sim_ms / 1000, (sim_ms % 1000) * 1_000_000);
        format!(
            r#"{{"op":"publish","topic":"/aruco_markers","msg":{{
                "header":{{"stamp":{{"sec":{sec},"nanosec":{nanosec}}},"frame_id":"camera_link"}},
                "marker_ids":[5],
                "poses":[{{"position":{{"x":1.0,"y":0.0,"z":0.0}},
                           "orientation":{{"x":0.0,"y":0.0,"z":0.0,"w":1.0}}}}]}}}}"#
        )
    }

    /// Feed sim-time detections through the bridge and collect commands.
    async fn commands_for_sim_time_markers(policy: StampPolicy, ticks: usize) -> Vec<VelocityCommand> {
        let bus = EventBus::default();
        let clock = ManualClock::new(Timestamp::from_millis(EPOCH_MS));
        let config = NodeConfig {
            stamp_policy: policy,
            ..test_config()
        };
        let node = FollowerNode::new(config, bus.clone(), Arc::new(clock.clone()))
            .await
            .unwrap();
        let bridge = RosBridge::new(bus.clone(), Arc::new(clock.clone()));

        let mut cmd_rx = bus.subscribe_to(Topic::CmdVel);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(node.run(async {
            let _ = stop_rx.await;
        }));
        // First command means the ingest task is subscribed.
        next_command(&mut cmd_rx).await;

        let mut commands = Vec::new();
        for i in 0..ticks {
            bridge
                .handle_incoming_ws_message(&sim_time_markers(12_000 + 100 * i as u64))
                .unwrap();
            clock.advance(Duration::from_millis(100));
            commands.push(next_command(&mut cmd_rx).await);
        }
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        commands
    }

    fn test_config() -> NodeConfig {
        NodeConfig {
            target_marker_id: 5,
            tick_period_ms: 10,
            ..NodeConfig::default()
        }
    }

    async fn next_command(rx: &mut markernav_middleware::TopicReceiver) -> VelocityCommand {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("command within timeout")
            .expect("bus open");
        match event.payload {
            EventPayload::Velocity(cmd) => cmd,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = NodeConfig {
            tick_period_ms: 0,
            ..NodeConfig::default()
        };
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let result = FollowerNode::new(config, EventBus::default(), clock).await;
        assert!(matches!(result, Err(NavError::Config(_))));
    }

    #[tokio::test]
    async fn static_mounts_reach_the_buffer() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let node = FollowerNode::new(test_config(), EventBus::default(), clock)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !node.buffer().has_frame("camera_link") && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Static edges are valid at any time.
        assert!(node.buffer().can_transform("base_link", "camera_link", Timestamp::from_millis(123)));
    }

    #[tokio::test]
    async fn follows_marker_and_stops_on_shutdown() {
        let bus = EventBus::default();
        let clock = ManualClock::new(Timestamp::from_millis(5_000));
        let node = FollowerNode::new(test_config(), bus.clone(), Arc::new(clock.clone()))
            .await
            .unwrap();

        let mut cmd_rx = bus.subscribe_to(Topic::CmdVel);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(node.run(async {
            let _ = stop_rx.await;
        }));

        // Nothing seen yet: searching, which defaults to a stop.
        assert!(next_command(&mut cmd_rx).await.is_stop());

        let markers = MarkerArray {
            stamp: clock.now(),
            markers: vec![MarkerDetection {
                marker_id: 5,
                pose: Some(PoseMsg::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::identity())),
            }],
        };
        bus.publish_to(Topic::Markers, Event::new("test", EventPayload::Markers(markers)))
            .unwrap();

        let mut tracking = None;
        for _ in 0..200 {
            let cmd = next_command(&mut cmd_rx).await;
            if !cmd.is_stop() {
                tracking = Some(cmd);
                break;
            }
        }
        let cmd = tracking.expect("node should start tracking");
        assert!((cmd.linear - 0.5).abs() < 1e-9);
        assert!(cmd.angular.abs() < 1e-12);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        // The last command on the lane is a stop.
        let mut last = None;
        while let Some(event) = cmd_rx.try_recv() {
            last = Some(event);
        }
        match last.map(|e| e.payload) {
            Some(EventPayload::Velocity(cmd)) => assert!(cmd.is_stop()),
            other => panic!("expected a final stop command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tracks_markers_stamped_on_another_clock() {
        let commands = commands_for_sim_time_markers(StampPolicy::Offset, 40).await;
        assert!(
            commands.iter().any(|c| !c.is_stop()),
            "sim-time detections never produced motion"
        );
    }

    #[tokio::test]
    async fn header_policy_ignores_foreign_clock_markers() {
        let commands = commands_for_sim_time_markers(StampPolicy::Header, 10).await;
        assert!(commands.iter().all(VelocityCommand::is_stop));
    }

    #[tokio::test]
    async fn listener_disconnect_and_reconnect_raise_alerts() {
        let bus = EventBus::default();
        let transport = Arc::new(DroppingTransport::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let node = FollowerNode::with_transport(test_config(), bus.clone(), transport.clone(), clock)
            .await
            .unwrap();

        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(node.run(async {
            let _ = stop_rx.await;
        }));

        let (component, message) = next_alert(&mut alerts).await;
        assert_eq!(component, "transform_listener");
        assert!(message.contains("disconnected"), "got {message}");

        let (component, message) = next_alert(&mut alerts).await;
        assert_eq!(component, "transform_listener");
        assert!(message.contains("reconnected"), "got {message}");
        assert_eq!(transport.subscriptions.load(Ordering::SeqCst), 2);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
