//! Headset service behaviour against scripted vendor engines

use async_trait::async_trait;
use headset_bridge::core::config::ServiceConfig;
use headset_bridge::core::conversations::ConversationState;
use headset_bridge::core::events::VendorEmitter;
use headset_bridge::vendor::{VendorBase, VendorState};
use headset_bridge::{
    CallInfo, ConnectionStatus, HeadsetError, HeadsetEvent, HeadsetService, Result,
    VendorEventBus, VendorId, VendorImplementation,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

/// Engine that records every call and connects instantly unless told to fail
struct MockVendor {
    base: VendorBase,
    keyword: &'static str,
    fail_connect: bool,
    calls: Mutex<Vec<String>>,
}

impl MockVendor {
    fn new(emitter: VendorEmitter, keyword: &'static str) -> Self {
        Self {
            base: VendorBase::new(emitter),
            keyword,
            fail_connect: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(emitter: VendorEmitter, keyword: &'static str) -> Self {
        Self {
            fail_connect: true,
            ..Self::new(emitter, keyword)
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(name)).count()
    }

    fn emitter(&self) -> &VendorEmitter {
        self.base.emitter()
    }
}

#[async_trait]
impl VendorImplementation for MockVendor {
    fn vendor(&self) -> VendorId {
        self.base.vendor()
    }

    fn state(&self) -> VendorState {
        self.base.snapshot()
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn device_label_matches_vendor(&self, label: &str) -> bool {
        label.to_lowercase().contains(self.keyword)
    }

    async fn connect(&self, _device_label: &str) -> Result<()> {
        self.record("connect");
        self.base.set_connecting();
        if self.fail_connect {
            self.base.set_disconnected();
            return Err(HeadsetError::ConnectionTimeout {
                vendor: self.vendor(),
                waited: Duration::from_millis(10),
            });
        }
        self.base.set_connected(None);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect");
        self.base.set_disconnected();
        Ok(())
    }

    async fn incoming_call(&self, info: &CallInfo, _has_other_active_calls: bool) -> Result<()> {
        self.record(format!("incoming_call {}", info.conversation_id));
        Ok(())
    }

    async fn outgoing_call(&self, info: &CallInfo) -> Result<()> {
        self.record(format!("outgoing_call {}", info.conversation_id));
        Ok(())
    }

    async fn answer_call(&self, conversation_id: &str, _auto_answer: bool) -> Result<()> {
        self.record(format!("answer_call {}", conversation_id));
        Ok(())
    }

    async fn reject_call(&self, conversation_id: &str) -> Result<()> {
        self.record(format!("reject_call {}", conversation_id));
        Ok(())
    }

    async fn end_call(&self, conversation_id: &str, _has_other_active_calls: bool) -> Result<()> {
        self.record(format!("end_call {}", conversation_id));
        Ok(())
    }

    async fn end_all_calls(&self) -> Result<()> {
        self.record("end_all_calls");
        Ok(())
    }

    async fn set_mute(&self, value: bool) -> Result<()> {
        self.record(format!("set_mute {}", value));
        self.base.set_muted(value);
        Ok(())
    }

    async fn set_hold(&self, conversation_id: &str, value: bool) -> Result<()> {
        self.record(format!("set_hold {} {}", conversation_id, value));
        self.base.set_held(value);
        Ok(())
    }
}

struct Harness {
    service: HeadsetService,
    events: broadcast::Receiver<HeadsetEvent>,
    yealink: Arc<MockVendor>,
    jabra: Arc<MockVendor>,
}

fn harness() -> Harness {
    let bus = VendorEventBus::new();
    let yealink = Arc::new(MockVendor::new(bus.emitter(VendorId::Yealink), "yealink"));
    let jabra = Arc::new(MockVendor::new(bus.emitter(VendorId::Jabra), "jabra"));
    let implementations: Vec<Arc<dyn VendorImplementation>> =
        vec![yealink.clone(), jabra.clone()];
    let service = HeadsetService::new(&ServiceConfig::default(), bus, implementations);
    let events = service.subscribe();
    Harness {
        service,
        events,
        yealink,
        jabra,
    }
}

/// Let the reconciler drain the vendor bus
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn drain(events: &mut broadcast::Receiver<HeadsetEvent>) -> Vec<HeadsetEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ── Selection ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_mic_change_selects_matching_vendor() {
    let mut h = harness();
    h.service.active_mic_change("Yealink WH62 Mono").await.unwrap();
    settle().await;

    assert_eq!(h.service.selected_vendor(), Some(VendorId::Yealink));
    assert_eq!(h.service.connection_status(), ConnectionStatus::Running);
    let events = drain(&mut h.events);
    assert!(events.contains(&HeadsetEvent::ImplementationChanged(Some(VendorId::Yealink))));
    assert!(events.contains(&HeadsetEvent::DeviceConnectionStatusChanged(
        ConnectionStatus::Running
    )));
}

#[tokio::test]
async fn test_same_implementation_is_noop() {
    let mut h = harness();
    h.service.active_mic_change("Yealink WH62").await.unwrap();
    drain(&mut h.events);

    h.service.active_mic_change("Yealink UH36").await.unwrap();
    settle().await;
    assert_eq!(h.yealink.count("connect"), 1);
    assert!(!drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, HeadsetEvent::ImplementationChanged(_))));
}

#[tokio::test]
async fn test_unmatched_label_clears_selection() {
    let mut h = harness();
    h.service.active_mic_change("Jabra Evolve2").await.unwrap();
    drain(&mut h.events);

    h.service.active_mic_change("Built-in Microphone").await.unwrap();
    settle().await;

    assert_eq!(h.jabra.calls(), vec!["connect", "disconnect"]);
    assert_eq!(h.service.selected_vendor(), None);
    assert_eq!(h.service.connection_status(), ConnectionStatus::NoVendor);

    let events = drain(&mut h.events);
    let changed = events
        .iter()
        .find(|e| matches!(e, HeadsetEvent::ImplementationChanged(_)))
        .unwrap();
    assert_eq!(
        serde_json::to_value(changed).unwrap(),
        serde_json::json!({ "eventName": "implementationChanged", "payload": null })
    );
}

#[tokio::test]
async fn test_switching_vendors_disconnects_previous() {
    let h = harness();
    h.service.active_mic_change("Yealink WH62").await.unwrap();
    h.service.active_mic_change("Jabra Evolve2").await.unwrap();
    assert_eq!(h.yealink.calls(), vec!["connect", "disconnect"]);
    assert_eq!(h.jabra.calls(), vec!["connect"]);
    assert_eq!(h.service.selected_vendor(), Some(VendorId::Jabra));
}

#[tokio::test]
async fn test_clearing_implementation_disconnects() {
    let mut h = harness();
    h.service.active_mic_change("Jabra Evolve2").await.unwrap();
    drain(&mut h.events);

    assert_ok!(h.service.change_implementation(None, "").await);
    assert_eq!(h.jabra.calls(), vec!["connect", "disconnect"]);
    assert_eq!(h.service.selected_vendor(), None);
    assert_eq!(h.service.connection_status(), ConnectionStatus::NoVendor);
    assert_eq!(
        drain(&mut h.events),
        vec![HeadsetEvent::ImplementationChanged(None)]
    );

    // Already cleared
    assert_ok!(h.service.change_implementation(None, "").await);
    assert_eq!(h.jabra.count("disconnect"), 1);
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn test_failed_connect_reports_not_running() {
    let bus = VendorEventBus::new();
    let vendor = Arc::new(MockVendor::failing(bus.emitter(VendorId::Poly), "poly"));
    let implementations: Vec<Arc<dyn VendorImplementation>> = vec![vendor.clone()];
    let service = HeadsetService::new(&ServiceConfig::default(), bus, implementations);

    // Recoverable connect failures do not fail the selection
    assert_ok!(service.active_mic_change("Poly Voyager").await);
    assert_eq!(service.connection_status(), ConnectionStatus::NotRunning);

    // Commands are ignored while not connected
    service.incoming_call(&CallInfo::new("c1"), false).await.unwrap();
    assert_eq!(vendor.calls(), vec!["connect"]);
    assert!(service.conversation_state("c1").is_none());

    assert_ok!(service.retry_connection("Poly Voyager").await);
    assert_eq!(vendor.count("connect"), 2);
}

#[tokio::test]
async fn test_retry_without_selection() {
    let h = harness();
    let err = assert_err!(h.service.retry_connection("anything").await);
    assert!(matches!(err, HeadsetError::NoActiveHeadset));
}

#[test]
fn test_connection_status_truth_table() {
    let state = |is_connected, is_connecting| VendorState {
        is_connected,
        is_connecting,
        ..VendorState::default()
    };
    assert_eq!(ConnectionStatus::from_state(None), ConnectionStatus::NoVendor);
    assert_eq!(
        ConnectionStatus::from_state(Some(&state(false, true))),
        ConnectionStatus::Checking
    );
    assert_eq!(
        ConnectionStatus::from_state(Some(&state(true, false))),
        ConnectionStatus::Running
    );
    assert_eq!(
        ConnectionStatus::from_state(Some(&state(false, false))),
        ConnectionStatus::NotRunning
    );
}

// ── Call control ──────────────────────────────────────────────────

#[tokio::test]
async fn test_incoming_call_rings_once() {
    let h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();

    let info = CallInfo::new("c1").with_contact("Ada");
    h.service.incoming_call(&info, false).await.unwrap();
    h.service.incoming_call(&info, false).await.unwrap();

    assert_eq!(h.yealink.count("incoming_call"), 1);
    assert_eq!(
        h.service.conversation_state("c1"),
        Some(ConversationState::ringing())
    );
}

#[tokio::test]
async fn test_missing_conversation_id() {
    let h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();
    let err = assert_err!(h.service.incoming_call(&CallInfo::new(""), false).await);
    assert!(matches!(err, HeadsetError::MissingConversationId));
    let err = assert_err!(h.service.outgoing_call(&CallInfo::new("  ")).await);
    assert!(matches!(err, HeadsetError::MissingConversationId));
    assert!(h.yealink.calls().iter().all(|c| c == "connect"));
}

#[tokio::test]
async fn test_answer_and_mute_are_idempotent() {
    let h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();
    h.service.incoming_call(&CallInfo::new("c1"), false).await.unwrap();

    h.service.answer_call("c1", false).await.unwrap();
    h.service.answer_call("c1", false).await.unwrap();
    assert_eq!(h.yealink.count("answer_call"), 1);

    h.service.set_mute(true).await.unwrap();
    h.service.set_mute(true).await.unwrap();
    assert_eq!(h.yealink.count("set_mute"), 1);
    assert!(h.service.conversation_state("c1").unwrap().muted);

    h.service.set_mute(false).await.unwrap();
    assert_eq!(h.yealink.count("set_mute"), 2);
}

#[tokio::test]
async fn test_hold_toggles_once_per_value() {
    let h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();
    h.service.outgoing_call(&CallInfo::new("c1")).await.unwrap();

    h.service.set_hold("c1", true).await.unwrap();
    h.service.set_hold("c1", true).await.unwrap();
    h.service.set_hold("c1", false).await.unwrap();
    assert_eq!(h.yealink.calls()[2..], ["set_hold c1 true", "set_hold c1 false"]);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_cleanup_after_delay() {
    let h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();
    h.service.outgoing_call(&CallInfo::new("c1")).await.unwrap();
    h.service.end_call("c1", false).await.unwrap();

    // Kept, idle, until the cleanup delay passes
    assert!(h.service.conversation_state("c1").unwrap().is_idle());
    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert!(h.service.conversation_state("c1").is_some());

    // A second end is suppressed
    h.service.end_call("c1", false).await.unwrap();
    assert_eq!(h.yealink.count("end_call"), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    settle().await;
    assert!(h.service.conversation_state("c1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_new_activity_cancels_cleanup() {
    let h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();
    h.service.outgoing_call(&CallInfo::new("c1")).await.unwrap();
    h.service.end_call("c1", false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    h.service.outgoing_call(&CallInfo::new("c1")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5000)).await;
    settle().await;
    let state = h.service.conversation_state("c1").unwrap();
    assert!(state.off_hook);
}

#[tokio::test]
async fn test_end_all_calls() {
    let h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();
    h.service.outgoing_call(&CallInfo::new("c1")).await.unwrap();
    h.service.incoming_call(&CallInfo::new("c2"), true).await.unwrap();

    h.service.end_all_calls().await.unwrap();
    assert!(h.service.conversation_state("c1").unwrap().is_idle());
    assert!(h.service.conversation_state("c2").unwrap().is_idle());

    h.service.end_all_calls().await.unwrap();
    assert_eq!(h.yealink.count("end_all_calls"), 1);
}

// ── Vendor events ─────────────────────────────────────────────────

#[tokio::test]
async fn test_events_from_unselected_vendor_are_dropped() {
    let mut h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();
    h.service.incoming_call(&CallInfo::new("c1"), false).await.unwrap();
    settle().await;
    drain(&mut h.events);

    h.jabra.emitter().answered("HookSwitch", "c1");
    settle().await;
    assert!(drain(&mut h.events).is_empty());
    assert!(h.service.conversation_state("c1").unwrap().ringing);

    h.yealink.emitter().answered("HookSwitchOff", "c1");
    settle().await;
    let events = drain(&mut h.events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_name(), "deviceAnsweredCall");
    let state = h.service.conversation_state("c1").unwrap();
    assert!(state.off_hook && !state.ringing);

    // Subsequent software answer is suppressed
    h.service.answer_call("c1", false).await.unwrap();
    assert_eq!(h.yealink.count("answer_call"), 0);
}

#[tokio::test]
async fn test_device_mute_updates_conversation() {
    let mut h = harness();
    h.service.active_mic_change("Yealink").await.unwrap();
    h.service.outgoing_call(&CallInfo::new("c1")).await.unwrap();
    settle().await;
    drain(&mut h.events);

    h.yealink.emitter().mute_changed(true, "MuteToggle", Some("c1"));
    settle().await;
    assert!(h.service.conversation_state("c1").unwrap().muted);

    let events = drain(&mut h.events);
    assert_eq!(
        serde_json::to_value(&events[0]).unwrap(),
        serde_json::json!({
            "eventName": "deviceMuteStatusChanged",
            "payload": { "isMuted": true, "name": "MuteToggle", "conversationId": "c1" }
        })
    );

    // Already muted, so the software request is suppressed
    h.service.set_mute(true).await.unwrap();
    assert_eq!(h.yealink.count("set_mute"), 0);
}

#[tokio::test]
async fn test_loggable_and_permission_events_pass_through() {
    let mut h = harness();
    h.jabra.emitter().loggable("lock conflict");
    h.yealink.emitter().permission_requested();
    settle().await;

    let names: Vec<&str> = drain(&mut h.events).iter().map(|e| e.event_name()).collect();
    assert_eq!(names, vec!["loggableEvent", "webHidPermissionRequested"]);
}
