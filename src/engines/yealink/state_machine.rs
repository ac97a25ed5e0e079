//! Call-state machine of the binary-HID headset
//!
//! Pure transition table: the engine feeds it events and performs the returned effects
//! in order. Events not listed for a state are ignored.

use headset_protocol::{FLAG_HOOK, FLAG_RING};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Incoming,
    Answering,
    Rejecting,
    Active,
    End,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    IncomingCall,
    OutgoingCall,
    HookSwitchOn,
    HookSwitchOff,
    UiAnswer,
    UiEnd,
    AnswerConfirm,
    CallEnd,
    Busy,
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::IncomingCall => "IncomingCall",
            CallEvent::OutgoingCall => "OutgoingCall",
            CallEvent::HookSwitchOn => "HookSwitchOn",
            CallEvent::HookSwitchOff => "HookSwitchOff",
            CallEvent::UiAnswer => "UiAnswer",
            CallEvent::UiEnd => "UiEnd",
            CallEvent::AnswerConfirm => "AnswerConfirm",
            CallEvent::CallEnd => "CallEnd",
            CallEvent::Busy => "Busy",
        }
    }
}

/// Side effect of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Set or clear a device status flag
    SetFlag(u16, bool),
    /// Clear the mute flag if it is set
    Unmute,
    EmitAnswered,
    EmitRejected,
    EmitEnded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// States entered, in order. The last one is the resulting state.
    pub states: Vec<CallState>,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn new(states: &[CallState], effects: &[Effect]) -> Self {
        Self {
            states: states.to_vec(),
            effects: effects.to_vec(),
        }
    }

    pub fn target(&self) -> CallState {
        self.states.last().copied().unwrap_or_default()
    }
}

/// Look up the transition for `event` in `state`.
///
/// Chips without an answer-confirm report (`confirm_required == false`) pass
/// through `Answering` straight to `Active`.
pub fn transition(state: CallState, event: CallEvent, confirm_required: bool) -> Option<Transition> {
    use CallEvent as E;
    use CallState as S;

    let t = match (state, event) {
        (S::Idle, E::IncomingCall) => Transition::new(&[S::Incoming], &[Effect::SetFlag(FLAG_RING, true)]),
        (S::Idle, E::OutgoingCall) => Transition::new(&[S::Outgoing], &[]),

        (S::Incoming, E::HookSwitchOn | E::UiAnswer) if confirm_required => {
            Transition::new(&[S::Answering], &[Effect::SetFlag(FLAG_HOOK, true), Effect::Unmute])
        }
        (S::Incoming, E::HookSwitchOn | E::UiAnswer) => Transition::new(
            &[S::Answering, S::Active],
            &[
                Effect::SetFlag(FLAG_HOOK, true),
                Effect::Unmute,
                Effect::SetFlag(FLAG_RING, false),
                Effect::EmitAnswered,
            ],
        ),
        (S::Incoming, E::HookSwitchOff | E::UiEnd) => Transition::new(
            &[S::Rejecting, S::End, S::Idle],
            &[
                Effect::SetFlag(FLAG_RING, false),
                Effect::EmitRejected,
                Effect::EmitEnded,
            ],
        ),

        (S::Answering, E::AnswerConfirm) => Transition::new(
            &[S::Active],
            &[Effect::SetFlag(FLAG_RING, false), Effect::EmitAnswered],
        ),
        // Ring is still on until the confirm arrives
        (S::Answering, E::CallEnd | E::Busy | E::HookSwitchOff | E::UiEnd) => Transition::new(
            &[S::End, S::Idle],
            &[
                Effect::SetFlag(FLAG_RING, false),
                Effect::SetFlag(FLAG_HOOK, false),
                Effect::EmitEnded,
            ],
        ),
        (S::Active | S::Outgoing, E::CallEnd | E::Busy | E::HookSwitchOff | E::UiEnd) => {
            Transition::new(&[S::End, S::Idle], &[Effect::SetFlag(FLAG_HOOK, false), Effect::EmitEnded])
        }

        _ => return None,
    };
    Some(t)
}
