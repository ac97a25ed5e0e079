//! Sennheiser / EPOS headsets through the vendor's local WebSocket SDK
//!
//! Every frame is JSON `{Event, EventType, CallID?}`. The engine sends Requests, the SDK
//! answers with Acks and pushes Notifications for button presses on the headset.

pub mod socket;

use self::socket::SocketFactory;
use crate::core::config::SennheiserConfig;
use crate::core::error::{HeadsetError, Result};
use crate::core::events::VendorEmitter;
use crate::vendor::call_ids::CallIdTable;
use crate::vendor::{
    label_contains_any, CallInfo, DeviceMetadata, VendorBase, VendorId, VendorImplementation,
    VendorState,
};
use anyhow::anyhow;
use async_trait::async_trait;
use headset_protocol::{socket_events as events, SocketEventType, SocketFrame};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LABEL_KEYWORDS: &[&str] = &["sennheiser", "epos"];

struct Session {
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
}

struct Inner {
    config: SennheiserConfig,
    factory: Arc<dyn SocketFactory>,
    base: VendorBase,
    calls: Mutex<CallIdTable>,
    session: Mutex<Option<Session>>,
    /// Completed by the SPEstablishConnection ack
    established: Mutex<Option<oneshot::Sender<()>>>,
    /// Name reported by SystemInformation / HeadsetConnected
    headset_name: Mutex<Option<String>>,
}

/// WebSocket SDK engine
pub struct SennheiserHeadset {
    inner: Arc<Inner>,
}

impl SennheiserHeadset {
    pub fn new(config: SennheiserConfig, factory: Arc<dyn SocketFactory>, emitter: VendorEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                base: VendorBase::new(emitter),
                calls: Mutex::new(CallIdTable::new()),
                session: Mutex::new(None),
                established: Mutex::new(None),
                headset_name: Mutex::new(None),
            }),
        }
    }

    /// Wire call id currently assigned to a conversation
    pub fn call_id(&self, conversation_id: &str) -> Option<u32> {
        self.inner.calls.lock().call_id(conversation_id)
    }
}

impl Drop for SennheiserHeadset {
    fn drop(&mut self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.reader.abort();
        }
    }
}

#[async_trait]
impl VendorImplementation for SennheiserHeadset {
    fn vendor(&self) -> VendorId {
        VendorId::Sennheiser
    }

    fn state(&self) -> VendorState {
        self.inner.base.snapshot()
    }

    fn is_supported(&self) -> bool {
        self.inner.config.enabled
    }

    fn device_label_matches_vendor(&self, label: &str) -> bool {
        label_contains_any(label, LABEL_KEYWORDS)
    }

    async fn connect(&self, device_label: &str) -> Result<()> {
        if self.inner.base.is_connected() {
            debug!("Sennheiser already connected");
            return Ok(());
        }
        self.inner.close_session();
        self.inner.base.set_connecting();

        let result = self.inner.establish(device_label).await;
        if result.is_err() {
            self.inner.close_session();
            self.inner.base.set_disconnected();
        }
        result
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.close_session();
        self.inner.calls.lock().clear();
        self.inner.base.set_disconnected();
        info!("Sennheiser disconnected");
        Ok(())
    }

    async fn incoming_call(&self, info: &CallInfo, _has_other_active_calls: bool) -> Result<()> {
        let call_id = self.inner.calls.lock().assign(&info.conversation_id);
        self.inner
            .send(SocketFrame::request(events::INCOMING_CALL).with_call_id(call_id))
    }

    async fn outgoing_call(&self, info: &CallInfo) -> Result<()> {
        let call_id = self.inner.calls.lock().assign(&info.conversation_id);
        self.inner
            .send(SocketFrame::request(events::OUTGOING_CALL).with_call_id(call_id))
    }

    async fn answer_call(&self, conversation_id: &str, _auto_answer: bool) -> Result<()> {
        let call_id = self.inner.calls.lock().assign(conversation_id);
        self.inner
            .send(SocketFrame::request(events::INCOMING_CALL_ACCEPTED).with_call_id(call_id))
    }

    async fn reject_call(&self, conversation_id: &str) -> Result<()> {
        let Some(call_id) = self.inner.calls.lock().release(conversation_id) else {
            debug!("No call id for {}, nothing to reject", conversation_id);
            return Ok(());
        };
        self.inner
            .send(SocketFrame::request(events::INCOMING_CALL_REJECTED).with_call_id(call_id))
    }

    async fn end_call(&self, conversation_id: &str, _has_other_active_calls: bool) -> Result<()> {
        let Some(call_id) = self.inner.calls.lock().release(conversation_id) else {
            debug!("No call id for {}, nothing to end", conversation_id);
            return Ok(());
        };
        self.inner
            .send(SocketFrame::request(events::CALL_ENDED).with_call_id(call_id))
    }

    async fn end_all_calls(&self) -> Result<()> {
        let call_ids: Vec<u32> = {
            let mut calls = self.inner.calls.lock();
            let ids = calls
                .conversation_ids()
                .iter()
                .filter_map(|conversation| calls.call_id(conversation))
                .collect();
            calls.clear();
            ids
        };
        for call_id in call_ids {
            self.inner
                .send(SocketFrame::request(events::CALL_ENDED).with_call_id(call_id))?;
        }
        Ok(())
    }

    async fn set_mute(&self, value: bool) -> Result<()> {
        let event = if value {
            events::MUTE_HEADSET
        } else {
            events::UNMUTE_HEADSET
        };
        self.inner.send(SocketFrame::request(event))?;
        self.inner.base.set_muted(value);
        Ok(())
    }

    async fn set_hold(&self, conversation_id: &str, value: bool) -> Result<()> {
        let Some(call_id) = self.inner.calls.lock().call_id(conversation_id) else {
            debug!("No call id for {}, hold ignored", conversation_id);
            return Ok(());
        };
        let event = if value { events::HOLD } else { events::RESUME };
        self.inner
            .send(SocketFrame::request(event).with_call_id(call_id))?;
        self.inner.base.set_held(value);
        Ok(())
    }
}

impl Inner {
    async fn establish(self: &Arc<Self>, device_label: &str) -> Result<()> {
        let channel = self.factory.open(&self.config.url).await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        *self.established.lock() = Some(ack_tx);
        let reader = tokio::spawn(read_frames(Arc::clone(self), channel.inbound));
        *self.session.lock() = Some(Session {
            outbound: channel.outbound,
            reader,
        });

        self.send(SocketFrame::request(events::ESTABLISH_CONNECTION))?;

        let wait = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(wait, ack_rx).await {
            Ok(Ok(())) => {
                let name = self
                    .headset_name
                    .lock()
                    .clone()
                    .unwrap_or_else(|| device_label.to_string());
                info!("Sennheiser SDK session established ({})", name);
                self.base.set_connected(Some(DeviceMetadata::named(name)));
                Ok(())
            }
            Ok(Err(_)) => Err(anyhow!("SDK closed the connection before acknowledging").into()),
            Err(_) => Err(HeadsetError::ConnectionTimeout {
                vendor: VendorId::Sennheiser,
                waited: wait,
            }),
        }
    }

    fn send(&self, frame: SocketFrame) -> Result<()> {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            return Err(HeadsetError::NotConnected);
        };
        debug!("-> {} {:?}", frame.event, frame.call_id);
        session
            .outbound
            .send(frame.to_json())
            .map_err(|_| anyhow!("SDK connection closed"))?;
        Ok(())
    }

    fn close_session(&self) {
        self.established.lock().take();
        if let Some(session) = self.session.lock().take() {
            session.reader.abort();
        }
    }

    fn session_lost(&self) {
        self.established.lock().take();
        if self.session.lock().take().is_some() {
            warn!("Sennheiser SDK connection lost");
            self.calls.lock().clear();
            self.base.set_disconnected();
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{}", e);
                return;
            }
        };

        match frame.event_type {
            SocketEventType::Ack => {
                debug!("<- Ack {} (return code {:?})", frame.event, frame.return_code);
                if frame.event == events::ESTABLISH_CONNECTION {
                    if let Some(tx) = self.established.lock().take() {
                        let _ = tx.send(());
                    }
                }
                self.base.emitter().loggable(format!("Ack {}", frame.event));
            }
            SocketEventType::Notification => self.handle_notification(frame),
            SocketEventType::Request => debug!("Ignoring request frame {}", frame.event),
        }
    }

    fn handle_notification(&self, frame: SocketFrame) {
        let event = frame.event.as_str();
        debug!("<- Notification {} {:?}", event, frame.call_id);
        let emitter = self.base.emitter();
        let conversation = frame
            .call_id
            .and_then(|id| self.calls.lock().conversation_id(id));

        match event {
            events::INCOMING_CALL_ACCEPTED => match &conversation {
                Some(id) => emitter.answered(event, id),
                None => debug!("{} for unknown call {:?}", event, frame.call_id),
            },
            events::INCOMING_CALL_REJECTED | events::CALL_ENDED => {
                let Some(id) = conversation else {
                    debug!("{} for unknown call {:?}", event, frame.call_id);
                    return;
                };
                self.calls.lock().release(&id);
                if event == events::CALL_ENDED {
                    emitter.ended(event, &id);
                } else {
                    emitter.rejected(event, &id);
                }
            }
            events::MUTE_FROM_HEADSET | events::UNMUTE_FROM_HEADSET => {
                let muted = event == events::MUTE_FROM_HEADSET;
                self.base.set_muted(muted);
                emitter.mute_changed(muted, event, conversation.as_deref());
            }
            events::HOLD_FROM_HEADSET | events::RESUME_FROM_HEADSET => {
                let held = event == events::HOLD_FROM_HEADSET;
                self.base.set_held(held);
                emitter.hold_changed(held, event, conversation.as_deref());
            }
            events::HEADSET_CONNECTED => {
                if let Some(name) = frame.headset_name {
                    *self.headset_name.lock() = Some(name);
                }
                // Only meaningful once the SDK session is up
                if self.session.lock().is_some() && self.established.lock().is_none() {
                    let name = self.headset_name.lock().clone().unwrap_or_default();
                    info!("Headset connected: {}", name);
                    self.base.set_connected(Some(DeviceMetadata::named(name)));
                }
            }
            events::HEADSET_DISCONNECTED => {
                info!("Headset disconnected from the SDK");
                self.base.set_disconnected();
            }
            events::SYSTEM_INFORMATION => {
                if let Some(name) = frame.headset_name {
                    *self.headset_name.lock() = Some(name);
                }
            }
            _ => debug!("Ignoring notification {}", event),
        }
    }
}

fn decode_frame(text: &str) -> Result<SocketFrame> {
    SocketFrame::from_json(text)
        .ok_or_else(|| HeadsetError::ProtocolDecode(format!("undecodable frame {}", text)))
}

async fn read_frames(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbound.recv().await {
        inner.handle_frame(&text);
    }
    inner.session_lost();
}
