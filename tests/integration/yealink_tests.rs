//! End-to-end Yealink scenarios: mock HID device → engine → service events

use headset_bridge::core::config::{ServiceConfig, YealinkConfig};
use headset_bridge::engines::yealink::state_machine::CallState;
use headset_bridge::engines::YealinkHeadset;
use headset_bridge::hid::mock::{device_info, MockHidProvider};
use headset_bridge::{
    CallInfo, ConnectionStatus, HeadsetEvent, HeadsetService, VendorEventBus, VendorId,
    VendorImplementation,
};
use headset_protocol::{FLAG_HOOK, FLAG_MUTE, FLAG_RING};
use std::sync::Arc;
use tokio::sync::broadcast;

const LABEL: &str = "Yealink UH36 Mono";

struct Rig {
    service: HeadsetService,
    provider: MockHidProvider,
    engine: Arc<YealinkHeadset>,
    events: broadcast::Receiver<HeadsetEvent>,
}

async fn rig() -> Rig {
    let provider = MockHidProvider::new().with_permitted(device_info(0x6993, 0x0001, "UH36"));
    let bus = VendorEventBus::new();
    let engine = Arc::new(YealinkHeadset::new(
        YealinkConfig::default(),
        Arc::new(provider.clone()),
        bus.emitter(VendorId::Yealink),
    ));
    let implementations: Vec<Arc<dyn VendorImplementation>> = vec![engine.clone()];
    let service = HeadsetService::new(&ServiceConfig::default(), bus, implementations);
    let mut events = service.subscribe();

    service.active_mic_change(LABEL).await.unwrap();
    settle().await;
    drain(&mut events);

    Rig {
        service,
        provider,
        engine,
        events,
    }
}

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

#[tokio::test]
async fn test_connects_through_service() {
    let rig = rig().await;
    assert_eq!(rig.service.selected_vendor(), Some(VendorId::Yealink));
    assert_eq!(rig.service.connection_status(), ConnectionStatus::Running);
    assert_eq!(rig.provider.open_count(), 1);
}

#[tokio::test]
async fn test_hookswitch_off_while_ringing_rejects_then_ends() {
    let mut rig = rig().await;
    rig.service
        .incoming_call(&CallInfo::new("c1"), false)
        .await
        .unwrap();
    assert_eq!(rig.engine.device_status(), FLAG_RING);

    rig.provider.push_report(0x01, &[0x10]);
    settle().await;

    let names: Vec<&str> = drain(&mut rig.events)
        .iter()
        .map(|e| e.event_name())
        .collect();
    assert_eq!(names, vec!["deviceRejectedCall", "deviceEndedCall"]);
    assert_eq!(rig.engine.call_state(), CallState::Idle);
    assert!(rig.service.conversation_state("c1").unwrap().is_idle());
}

#[tokio::test]
async fn test_application_reject_is_signalled() {
    let mut rig = rig().await;
    rig.service
        .incoming_call(&CallInfo::new("c1"), false)
        .await
        .unwrap();
    settle().await;
    drain(&mut rig.events);

    rig.service.reject_call("c1").await.unwrap();
    settle().await;

    let names: Vec<&str> = drain(&mut rig.events)
        .iter()
        .map(|e| e.event_name())
        .collect();
    assert_eq!(names, vec!["deviceRejectedCall", "deviceEndedCall"]);
    assert_eq!(rig.engine.device_status() & FLAG_RING, 0);
    assert!(rig.service.conversation_state("c1").unwrap().is_idle());
}

#[tokio::test]
async fn test_device_answer_reaches_application() {
    let mut rig = rig().await;
    rig.service
        .incoming_call(&CallInfo::new("c1"), false)
        .await
        .unwrap();

    rig.provider.push_report(0x01, &[0x11]);
    rig.provider.push_report(0x02, &[0x01]);
    settle().await;

    let events = drain(&mut rig.events);
    match &events[..] {
        [HeadsetEvent::DeviceAnsweredCall(signal)] => assert_eq!(signal.conversation_id, "c1"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rig.engine.device_status(), FLAG_HOOK);

    // The application's own answer is now redundant
    rig.provider.clear_writes();
    rig.service.answer_call("c1", false).await.unwrap();
    assert!(rig.provider.writes().is_empty());
}

#[tokio::test]
async fn test_mute_button_unmutes_active_call() {
    let mut rig = rig().await;
    rig.service
        .outgoing_call(&CallInfo::new("c1"))
        .await
        .unwrap();
    rig.service.set_mute(true).await.unwrap();
    assert_eq!(rig.engine.device_status(), FLAG_HOOK | FLAG_MUTE);
    settle().await;
    drain(&mut rig.events);

    rig.provider.push_report(0x01, &[0x13]);
    settle().await;

    let events = drain(&mut rig.events);
    assert_eq!(
        serde_json::to_value(&events[0]).unwrap(),
        serde_json::json!({
            "eventName": "deviceMuteStatusChanged",
            "payload": { "isMuted": false, "name": "MuteToggle", "conversationId": "c1" }
        })
    );
    assert_eq!(rig.engine.device_status(), FLAG_HOOK);
    assert!(!rig.service.conversation_state("c1").unwrap().muted);
}

#[tokio::test]
async fn test_unplug_reports_not_running() {
    let mut rig = rig().await;
    rig.provider.unplug();
    settle().await;

    assert_eq!(rig.service.connection_status(), ConnectionStatus::NotRunning);
    assert!(drain(&mut rig.events).contains(&HeadsetEvent::DeviceConnectionStatusChanged(
        ConnectionStatus::NotRunning
    )));
    assert!(!rig.engine.state().is_connected);
}
