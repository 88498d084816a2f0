use super::message::CPG_EVENT_INBAND;
use super::{Cic, CicPool, IsupEvent, IsupEventSender, IsupMessage, IsupSender};
use crate::q850;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Default backward call indicators for ACM: subscriber free, ISDN access.
const BCI_SUBSCRIBER_FREE: u16 = 0x1404;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    OutgoingSetup,
    IncomingSetup,
    CallProgress,
    Answered,
    Releasing,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

struct Circuit {
    state: CircuitState,
    outgoing: bool,
    calling: Option<String>,
    called: String,
}

/// ISUP call handling: one state machine per active circuit.
///
/// A circuit is absent from `circuits` exactly when its CIC is free in the
/// pool (state Idle).
pub struct IsupHandler {
    pool: CicPool,
    circuits: HashMap<Cic, Circuit>,
    local_pc: u32,
    remote_pc: u32,
    out_tx: IsupSender,
    event_tx: IsupEventSender,
}

impl IsupHandler {
    pub fn new(
        pool: CicPool,
        local_pc: u32,
        remote_pc: u32,
        out_tx: IsupSender,
        event_tx: IsupEventSender,
    ) -> Self {
        IsupHandler {
            pool,
            circuits: HashMap::new(),
            local_pc,
            remote_pc,
            out_tx,
            event_tx,
        }
    }

    pub fn active_circuits(&self) -> usize {
        self.circuits.len()
    }

    pub fn circuit_state(&self, cic: Cic) -> Option<CircuitState> {
        self.circuits.get(&cic).map(|c| c.state)
    }

    /// Allocate a circuit and send an IAM.
    pub fn originate(&mut self, calling: Option<String>, called: String) -> Result<Cic> {
        let cic = self.pool.allocate()?;
        self.circuits.insert(
            cic,
            Circuit {
                state: CircuitState::OutgoingSetup,
                outgoing: true,
                calling: calling.clone(),
                called: called.clone(),
            },
        );
        self.send(IsupMessage::Iam {
            cic,
            called,
            calling,
            optional: Vec::new(),
        });
        info!(cic, "ISUP origination");
        Ok(cic)
    }

    /// Send ACM for an incoming call.
    pub fn send_progress(&mut self, cic: Cic) -> Result<()> {
        let circuit = self.circuit_mut(cic)?;
        if circuit.state == CircuitState::IncomingSetup {
            circuit.state = CircuitState::CallProgress;
            self.send(IsupMessage::Acm {
                cic,
                backward_indicators: BCI_SUBSCRIBER_FREE,
            });
        }
        Ok(())
    }

    /// Send ANM for an incoming call.
    pub fn send_answer(&mut self, cic: Cic) -> Result<()> {
        let circuit = self.circuit_mut(cic)?;
        match circuit.state {
            CircuitState::IncomingSetup | CircuitState::CallProgress => {
                circuit.state = CircuitState::Answered;
                self.send(IsupMessage::Anm { cic });
                Ok(())
            }
            state => Err(Error::IsupError(
                format!("cannot answer in state {}", state),
                cic,
            )),
        }
    }

    /// Release the circuit with a Q.850 cause; the CIC returns to the pool
    /// when the peer answers with RLC.
    pub fn release(&mut self, cic: Cic, cause: u8) -> Result<()> {
        let circuit = self.circuit_mut(cic)?;
        if circuit.state == CircuitState::Releasing {
            return Ok(());
        }
        circuit.state = CircuitState::Releasing;
        self.send(IsupMessage::Rel {
            cic,
            cause,
            optional: Vec::new(),
        });
        Ok(())
    }

    pub fn on_wire(&mut self, octets: &[u8]) {
        let msg = match IsupMessage::decode(octets) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping ISUP message: {}", e);
                return;
            }
        };
        self.on_message(msg, Bytes::copy_from_slice(octets));
    }

    pub fn on_message(&mut self, msg: IsupMessage, raw: Bytes) {
        let cic = msg.cic();
        match msg {
            IsupMessage::Iam {
                called, calling, ..
            } => self.on_iam(cic, calling, called, raw),
            IsupMessage::Acm { .. } => {
                if let Some(circuit) = self.circuits.get_mut(&cic) {
                    if circuit.state == CircuitState::OutgoingSetup {
                        circuit.state = CircuitState::CallProgress;
                        self.emit(IsupEvent::Progress { cic, inband: false });
                    }
                }
            }
            IsupMessage::Cpg { event, .. } => {
                self.emit(IsupEvent::Progress {
                    cic,
                    inband: event == CPG_EVENT_INBAND,
                });
            }
            IsupMessage::Anm { .. } | IsupMessage::Con { .. } => {
                if let Some(circuit) = self.circuits.get_mut(&cic) {
                    match circuit.state {
                        CircuitState::OutgoingSetup | CircuitState::CallProgress => {
                            circuit.state = CircuitState::Answered;
                            self.emit(IsupEvent::Answered { cic });
                        }
                        state => warn!(cic, %state, "unexpected ANM"),
                    }
                }
            }
            IsupMessage::Rel { cause, .. } => {
                self.send(IsupMessage::Rlc { cic });
                if self.circuits.remove(&cic).is_some() {
                    self.free(cic);
                    self.emit(IsupEvent::Released { cic, cause });
                }
            }
            IsupMessage::Rlc { .. } => match self.circuits.get(&cic).map(|c| c.state) {
                Some(CircuitState::Releasing) => {
                    self.circuits.remove(&cic);
                    self.free(cic);
                }
                Some(state) => warn!(cic, %state, "RLC in unexpected state"),
                None => debug!(cic, "RLC for idle circuit"),
            },
            IsupMessage::Cfn { cause, .. } => {
                warn!(cic, cause, "peer reported confusion");
            }
            IsupMessage::Other { message_type, .. } => {
                debug!(cic, message_type, "unknown ISUP message");
                self.emit(IsupEvent::UnknownMessage { cic, message_type });
                self.send(IsupMessage::Cfn {
                    cic,
                    cause: q850::MESSAGE_TYPE_NONEXISTENT,
                });
            }
        }
    }

    fn on_iam(&mut self, cic: Cic, calling: Option<String>, called: String, raw: Bytes) {
        if let Some(existing) = self.circuits.get(&cic) {
            if existing.state == CircuitState::OutgoingSetup && existing.outgoing {
                self.resolve_glare(cic, calling, called, raw);
            } else {
                warn!(cic, state = %existing.state, "IAM on busy circuit ignored");
            }
            return;
        }

        if let Err(e) = self.pool.reserve(cic) {
            warn!(cic, "cannot reserve circuit for inbound IAM: {}", e);
            self.send(IsupMessage::Rel {
                cic,
                cause: q850::NO_CIRCUIT_AVAILABLE,
                optional: Vec::new(),
            });
            return;
        }
        self.circuits.insert(
            cic,
            Circuit {
                state: CircuitState::IncomingSetup,
                outgoing: false,
                calling: calling.clone(),
                called: called.clone(),
            },
        );
        self.emit(IsupEvent::IncomingCall {
            cic,
            calling,
            called,
            raw,
        });
    }

    /// Dual seizure: the exchange with the higher point code controls the
    /// circuit. The loser backs off with REL cause 44 and re-originates on
    /// a fresh circuit.
    fn resolve_glare(&mut self, cic: Cic, calling: Option<String>, called: String, raw: Bytes) {
        if self.local_pc > self.remote_pc {
            info!(cic, "glare won, inbound IAM discarded");
            return;
        }

        info!(cic, "glare lost, backing off");
        let ours = match self.circuits.get_mut(&cic) {
            Some(circuit) => {
                let lost = (circuit.calling.clone(), circuit.called.clone());
                circuit.state = CircuitState::IncomingSetup;
                circuit.outgoing = false;
                circuit.calling = calling.clone();
                circuit.called = called.clone();
                lost
            }
            None => return,
        };
        self.send(IsupMessage::Rel {
            cic,
            cause: q850::REQUESTED_CHANNEL_UNAVAILABLE,
            optional: Vec::new(),
        });
        self.emit(IsupEvent::GlareLost {
            cic,
            calling: ours.0,
            called: ours.1,
        });
        self.emit(IsupEvent::IncomingCall {
            cic,
            calling,
            called,
            raw,
        });
    }

    fn circuit_mut(&mut self, cic: Cic) -> Result<&mut Circuit> {
        self.circuits
            .get_mut(&cic)
            .ok_or_else(|| Error::IsupError("no such circuit".to_string(), cic))
    }

    fn free(&mut self, cic: Cic) {
        if let Err(e) = self.pool.release(cic) {
            warn!(cic, "release failed: {}", e);
        }
        self.emit(IsupEvent::CircuitFreed { cic });
    }

    fn send(&self, msg: IsupMessage) {
        if self.out_tx.send(msg).is_err() {
            debug!("ISUP sink closed");
        }
    }

    fn emit(&self, event: IsupEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("ISUP event receiver gone");
        }
    }
}
