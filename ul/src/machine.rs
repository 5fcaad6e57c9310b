//! The upper layer protocol state machine.
//!
//! The machine is a pure value:
//! [`transition`] maps a state and an event
//! to the next state and an ordered list of actions,
//! and never performs I/O itself.
//! The association runtime owns the side effects,
//! including the ARTIM timer,
//! which runs whenever the machine sits in
//! [`State::Sta5AwaitingAssociateResponse`] or
//! [`State::Sta8AwaitingRemoteReleaseResponse`].
//!
//! Pairs of state and event with no entry in the table
//! leave the state unchanged and produce no actions;
//! the runtime treats those as protocol violations.

use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource};

/// A state of the upper layer protocol machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Sta1: idle, no transport connection
    Sta1Idle,
    /// Sta2: transport open, awaiting an associate request (acceptor side)
    Sta2TransportOpen,
    /// Sta5: associate request sent, awaiting the response
    Sta5AwaitingAssociateResponse,
    /// Sta6: association established, data transfer permitted
    Sta6Established,
    /// Sta7: release requested by the peer, awaiting the local response
    Sta7AwaitingLocalReleaseResponse,
    /// Sta8: release requested locally, awaiting the remote response
    Sta8AwaitingRemoteReleaseResponse,
    /// Sta9-Sta11: both sides requested release at once
    ReleaseCollision,
    /// Sta12: awaiting the transport connection to close
    Sta12AwaitingTransportClose,
    /// Sta13: transport connected, association not yet requested
    Sta13AwaitingTransportOpen,
}

/// An event observed by the upper layer protocol machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    TransportConnected,
    TransportConnectionFailed,
    TransportConnectionClosed,
    AssociateRequestSent,
    AssociateRequestReceived,
    AssociateAcceptReceived,
    AssociateRejectReceived,
    AssociateAcceptSent,
    AssociateRejectSent,
    ReleaseRequestSent,
    ReleaseRequestReceived,
    ReleaseResponseReceived,
    ReleaseResponseSent,
    AbortReceived,
    AbortSent,
    DataTransferReceived,
    DataTransferSent,
    LocalAbortRequest,
    LocalReleaseRequest,
    ArtimTimerExpired,
}

/// A side effect requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    IssueAssociateConfirmAccept,
    IssueAssociateConfirmReject,
    IssueAbortIndication,
    IssueDataIndication,
    IssueReleaseIndication,
    IssueReleaseConfirm,
    SendAbort { source: AbortRQSource },
    SendReleaseRequest,
    SendReleaseResponse,
    CloseTransport,
}

/// The outcome of feeding one event to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// the state the machine moves to
    pub next: State,
    /// side effects to execute, in order
    pub actions: Vec<Action>,
    /// whether the pair of state and event is part of the protocol;
    /// unhandled pairs keep the state and carry no actions
    pub handled: bool,
}

impl Transition {
    fn to(next: State, actions: Vec<Action>) -> Self {
        Transition {
            next,
            actions,
            handled: true,
        }
    }

    fn violation(state: State) -> Self {
        Transition {
            next: state,
            actions: vec![],
            handled: false,
        }
    }
}

fn provider_abort() -> Action {
    Action::SendAbort {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::ReasonNotSpecified),
    }
}

/// The total transition function of the upper layer state machine.
pub fn transition(state: State, event: Event) -> Transition {
    use Action::*;
    use Event::*;
    use State::*;

    // a lost transport connection resets the machine from any state
    if event == TransportConnectionFailed {
        return Transition::to(Sta1Idle, vec![IssueAbortIndication]);
    }

    match (state, event) {
        (Sta1Idle, TransportConnected) => Transition::to(Sta13AwaitingTransportOpen, vec![]),

        (Sta13AwaitingTransportOpen, AssociateRequestSent) => {
            Transition::to(Sta5AwaitingAssociateResponse, vec![])
        }
        (Sta13AwaitingTransportOpen, LocalAbortRequest) => {
            Transition::to(Sta1Idle, vec![CloseTransport])
        }

        (Sta5AwaitingAssociateResponse, AssociateAcceptReceived) => {
            Transition::to(Sta6Established, vec![IssueAssociateConfirmAccept])
        }
        (Sta5AwaitingAssociateResponse, AssociateRejectReceived) => Transition::to(
            Sta1Idle,
            vec![IssueAssociateConfirmReject, CloseTransport],
        ),
        (Sta5AwaitingAssociateResponse, AbortReceived) => {
            Transition::to(Sta1Idle, vec![IssueAbortIndication, CloseTransport])
        }
        (Sta5AwaitingAssociateResponse, ArtimTimerExpired) => {
            Transition::to(Sta12AwaitingTransportClose, vec![provider_abort()])
        }
        (Sta5AwaitingAssociateResponse, LocalAbortRequest) => Transition::to(
            Sta12AwaitingTransportClose,
            vec![SendAbort {
                source: AbortRQSource::ServiceUser,
            }],
        ),

        (Sta6Established, DataTransferReceived) => {
            Transition::to(Sta6Established, vec![IssueDataIndication])
        }
        (Sta6Established, DataTransferSent) => Transition::to(Sta6Established, vec![]),
        (Sta6Established, LocalReleaseRequest) => Transition::to(
            Sta8AwaitingRemoteReleaseResponse,
            vec![SendReleaseRequest],
        ),
        (Sta6Established, ReleaseRequestReceived) => Transition::to(
            Sta7AwaitingLocalReleaseResponse,
            vec![IssueReleaseIndication],
        ),
        (Sta6Established, AbortReceived) => {
            Transition::to(Sta1Idle, vec![IssueAbortIndication, CloseTransport])
        }
        (Sta6Established, LocalAbortRequest) => Transition::to(
            Sta12AwaitingTransportClose,
            vec![SendAbort {
                source: AbortRQSource::ServiceUser,
            }],
        ),

        (Sta7AwaitingLocalReleaseResponse, ReleaseResponseSent) => {
            Transition::to(Sta12AwaitingTransportClose, vec![SendReleaseResponse])
        }
        (Sta7AwaitingLocalReleaseResponse, AbortReceived) => {
            Transition::to(Sta1Idle, vec![IssueAbortIndication, CloseTransport])
        }
        (Sta7AwaitingLocalReleaseResponse, LocalAbortRequest) => Transition::to(
            Sta12AwaitingTransportClose,
            vec![SendAbort {
                source: AbortRQSource::ServiceUser,
            }],
        ),

        // the peer may flush pending data before answering a release
        (Sta8AwaitingRemoteReleaseResponse, DataTransferReceived) => Transition::to(
            Sta8AwaitingRemoteReleaseResponse,
            vec![IssueDataIndication],
        ),
        (Sta8AwaitingRemoteReleaseResponse, ReleaseResponseReceived) => {
            Transition::to(Sta1Idle, vec![IssueReleaseConfirm, CloseTransport])
        }
        (Sta8AwaitingRemoteReleaseResponse, ReleaseRequestReceived) => {
            Transition::to(ReleaseCollision, vec![IssueReleaseIndication])
        }
        (Sta8AwaitingRemoteReleaseResponse, AbortReceived) => {
            Transition::to(Sta1Idle, vec![IssueAbortIndication, CloseTransport])
        }
        (Sta8AwaitingRemoteReleaseResponse, ArtimTimerExpired) => {
            Transition::to(Sta12AwaitingTransportClose, vec![provider_abort()])
        }
        (Sta8AwaitingRemoteReleaseResponse, LocalAbortRequest) => Transition::to(
            Sta12AwaitingTransportClose,
            vec![SendAbort {
                source: AbortRQSource::ServiceUser,
            }],
        ),

        (ReleaseCollision, ReleaseResponseSent) => Transition::to(
            Sta8AwaitingRemoteReleaseResponse,
            vec![SendReleaseResponse],
        ),
        (ReleaseCollision, ReleaseResponseReceived) => Transition::to(
            Sta7AwaitingLocalReleaseResponse,
            vec![IssueReleaseConfirm],
        ),
        (ReleaseCollision, AbortReceived) => {
            Transition::to(Sta1Idle, vec![IssueAbortIndication, CloseTransport])
        }

        (Sta12AwaitingTransportClose, TransportConnectionClosed) => {
            Transition::to(Sta1Idle, vec![])
        }
        // everything else in Sta12 is ignored while the close completes
        (Sta12AwaitingTransportClose, _) => Transition::to(Sta12AwaitingTransportClose, vec![]),

        (state, _) => Transition::violation(state),
    }
}

/// Whether the ARTIM timer must run while the machine sits in this state.
pub fn artim_runs_in(state: State) -> bool {
    matches!(
        state,
        State::Sta5AwaitingAssociateResponse | State::Sta8AwaitingRemoteReleaseResponse
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALL_STATES: [State; 9] = [
        State::Sta1Idle,
        State::Sta2TransportOpen,
        State::Sta5AwaitingAssociateResponse,
        State::Sta6Established,
        State::Sta7AwaitingLocalReleaseResponse,
        State::Sta8AwaitingRemoteReleaseResponse,
        State::ReleaseCollision,
        State::Sta12AwaitingTransportClose,
        State::Sta13AwaitingTransportOpen,
    ];

    const ALL_EVENTS: [Event; 20] = [
        Event::TransportConnected,
        Event::TransportConnectionFailed,
        Event::TransportConnectionClosed,
        Event::AssociateRequestSent,
        Event::AssociateRequestReceived,
        Event::AssociateAcceptReceived,
        Event::AssociateRejectReceived,
        Event::AssociateAcceptSent,
        Event::AssociateRejectSent,
        Event::ReleaseRequestSent,
        Event::ReleaseRequestReceived,
        Event::ReleaseResponseReceived,
        Event::ReleaseResponseSent,
        Event::AbortReceived,
        Event::AbortSent,
        Event::DataTransferReceived,
        Event::DataTransferSent,
        Event::LocalAbortRequest,
        Event::LocalReleaseRequest,
        Event::ArtimTimerExpired,
    ];

    #[test]
    fn transition_is_total_and_deterministic() {
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                let a = transition(state, event);
                let b = transition(state, event);
                assert_eq!(a, b, "{:?} x {:?}", state, event);
                if !a.handled {
                    assert_eq!(a.next, state);
                    assert!(a.actions.is_empty());
                }
            }
        }
    }

    #[rstest]
    #[case(State::Sta1Idle, Event::TransportConnected, State::Sta13AwaitingTransportOpen)]
    #[case(
        State::Sta13AwaitingTransportOpen,
        Event::AssociateRequestSent,
        State::Sta5AwaitingAssociateResponse
    )]
    #[case(
        State::Sta5AwaitingAssociateResponse,
        Event::AssociateAcceptReceived,
        State::Sta6Established
    )]
    #[case(
        State::Sta6Established,
        Event::LocalReleaseRequest,
        State::Sta8AwaitingRemoteReleaseResponse
    )]
    #[case(
        State::Sta6Established,
        Event::ReleaseRequestReceived,
        State::Sta7AwaitingLocalReleaseResponse
    )]
    #[case(
        State::Sta8AwaitingRemoteReleaseResponse,
        Event::ReleaseResponseReceived,
        State::Sta1Idle
    )]
    #[case(
        State::Sta8AwaitingRemoteReleaseResponse,
        Event::ReleaseRequestReceived,
        State::ReleaseCollision
    )]
    #[case(
        State::ReleaseCollision,
        Event::ReleaseResponseSent,
        State::Sta8AwaitingRemoteReleaseResponse
    )]
    #[case(
        State::ReleaseCollision,
        Event::ReleaseResponseReceived,
        State::Sta7AwaitingLocalReleaseResponse
    )]
    #[case(
        State::Sta12AwaitingTransportClose,
        Event::TransportConnectionClosed,
        State::Sta1Idle
    )]
    fn canonical_transitions(
        #[case] from: State,
        #[case] event: Event,
        #[case] to: State,
    ) {
        let t = transition(from, event);
        assert!(t.handled);
        assert_eq!(t.next, to);
    }

    #[test]
    fn artim_expiry_aborts_with_provider_source() {
        for state in [
            State::Sta5AwaitingAssociateResponse,
            State::Sta8AwaitingRemoteReleaseResponse,
        ] {
            let t = transition(state, Event::ArtimTimerExpired);
            assert_eq!(t.next, State::Sta12AwaitingTransportClose);
            assert_eq!(
                t.actions,
                vec![Action::SendAbort {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::ReasonNotSpecified
                    )
                }]
            );
        }
    }

    #[test]
    fn transport_failure_resets_from_any_state() {
        for state in ALL_STATES {
            let t = transition(state, Event::TransportConnectionFailed);
            assert!(t.handled);
            assert_eq!(t.next, State::Sta1Idle);
            assert_eq!(t.actions, vec![Action::IssueAbortIndication]);
        }
    }

    #[test]
    fn sta12_ignores_other_events() {
        for event in ALL_EVENTS {
            if matches!(
                event,
                Event::TransportConnectionClosed | Event::TransportConnectionFailed
            ) {
                continue;
            }
            let t = transition(State::Sta12AwaitingTransportClose, event);
            assert!(t.handled);
            assert_eq!(t.next, State::Sta12AwaitingTransportClose);
            assert!(t.actions.is_empty());
        }
    }

    #[test]
    fn unhandled_pairs_keep_state_without_actions() {
        let t = transition(State::Sta1Idle, Event::DataTransferReceived);
        assert!(!t.handled);
        assert_eq!(t.next, State::Sta1Idle);
        assert!(t.actions.is_empty());

        let t = transition(State::Sta6Established, Event::AssociateAcceptReceived);
        assert!(!t.handled);
        assert_eq!(t.next, State::Sta6Established);
    }

    #[test]
    fn artim_window_states() {
        assert!(artim_runs_in(State::Sta5AwaitingAssociateResponse));
        assert!(artim_runs_in(State::Sta8AwaitingRemoteReleaseResponse));
        assert!(!artim_runs_in(State::Sta6Established));
        assert!(!artim_runs_in(State::ReleaseCollision));
        assert!(!artim_runs_in(State::Sta1Idle));
    }
}
