//! Gateway supervisor.
//!
//! Owns every component and wires typed event streams upward and commands
//! downward: TDM link → LAPD engines → (NFAS groups) → call control →
//! translator → SIP collaborator, with the ISUP handler running beside the
//! Q.931 path. Components never hold a reference back into the gateway.

use crate::call::{CallCommand, CallControl, CallEvent};
use crate::config::GatewayConfig;
use crate::isup::{CicPool, IsupEvent, IsupHandler, IsupMessage};
use crate::lapd::{
    LapdCommand, LapdConfig, LapdEngine, LapdEvent, LapdInput, LapdInputSender,
};
use crate::nfas::{NfasEvent, NfasGroup, SpanMember};
use crate::q850;
use crate::q931::{CallRef, Q931Message};
use crate::rtp::PortPool;
use crate::session::{SessionKey, SessionRegistry};
use crate::tdm::{SpanId, TdmConnection, TdmEvent, TdmoeLink};
use crate::translate::{
    isup_sip::IsupSipTranslator,
    q931_sip::{new_call_id, ClearingAction, Q931SipTranslator},
    rules::RuleSet,
    TranslationContext,
};
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rsip::prelude::HeadersExt;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Usage record emitted when a call ends; external subsystems persist it.
#[derive(Debug, Clone, Serialize)]
pub struct CallEventRecord {
    pub endpoint: String,
    pub calling: Option<String>,
    pub called: Option<String>,
    pub sip_call_id: String,
    pub cic: Option<u16>,
    pub setup_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub released_at: DateTime<Utc>,
    pub cause: u8,
}

/// Operational events for external subsystems; nothing is persisted here.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Started,
    Stopped,
    SpanUp { span: SpanId },
    SpanDown { span: SpanId },
    Switchover { group: u32, from: SpanId, to: SpanId },
    GroupDown { group: u32 },
    CallStarted { sip_call_id: String },
    CallEnded(CallEventRecord),
}

enum CallDirection {
    TdmToSip,
    SipToTdm,
}

/// Per-call bookkeeping beyond the session registry's key correlation.
struct CallLeg {
    endpoint: String,
    direction: CallDirection,
    invite: rsip::Request,
    call_ref: Option<CallRef>,
    cic: Option<u16>,
    rtp_port: u16,
    calling: Option<String>,
    called: Option<String>,
    answered_at: Option<DateTime<Utc>>,
    setup_at: DateTime<Utc>,
}

/// How Q.931 traffic reaches the wire for one endpoint.
enum EndpointLink {
    Fas(SpanId),
    Nfas(u32),
}

pub struct GatewayBuilder {
    config: Option<GatewayConfig>,
    tdm: Option<TdmConnection>,
    cancel_token: Option<CancellationToken>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        GatewayBuilder {
            config: None,
            tdm: None,
            cancel_token: None,
        }
    }

    pub fn config(&mut self, config: GatewayConfig) -> &mut Self {
        self.config.replace(config);
        self
    }

    /// Override the TDM transport; tests pass a `ChannelLink` half.
    pub fn tdm_connection(&mut self, tdm: TdmConnection) -> &mut Self {
        self.tdm.replace(tdm);
        self
    }

    pub fn cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub async fn build(&mut self) -> Result<Gateway> {
        let config = self.config.take().unwrap_or_default();
        config.validate()?;
        let tdm = match self.tdm.take() {
            Some(tdm) => tdm,
            None => TdmConnection::Tdmoe(
                TdmoeLink::create_connection(
                    config.tdm.bind_addr,
                    config.tdm.remote_addr,
                    Duration::from_secs(config.tdm.keepalive_secs.max(1)),
                )
                .await?,
            ),
        };
        Gateway::assemble(config, tdm, self.cancel_token.take().unwrap_or_default())
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Gateway {
    config: GatewayConfig,
    cancel_token: CancellationToken,

    tdm: TdmConnection,
    tdm_events: Option<UnboundedReceiver<TdmEvent>>,
    /// D-channel slot → span.
    dchannel_spans: HashMap<u16, SpanId>,
    engines: HashMap<SpanId, LapdInputSender>,
    engine_events: Option<UnboundedReceiver<(SpanId, LapdEvent)>>,

    groups: HashMap<u32, NfasGroup>,
    group_events: Option<UnboundedReceiver<(u32, NfasEvent)>>,
    /// Span → owning NFAS group.
    span_groups: HashMap<SpanId, u32>,

    endpoints: HashMap<String, CallControl>,
    endpoint_links: HashMap<String, EndpointLink>,
    call_events: Option<UnboundedReceiver<(String, CallEvent)>>,
    q931_out: Option<UnboundedReceiver<(String, Q931Message)>>,
    /// Endpoint that inbound SIP calls are routed to.
    default_endpoint: String,

    isup: Option<IsupHandler>,
    isup_events: Option<UnboundedReceiver<IsupEvent>>,
    sigtran_in: Option<UnboundedReceiver<Bytes>>,
    sigtran_in_tx: UnboundedSender<Bytes>,
    sigtran_out: Option<UnboundedReceiver<IsupMessage>>,

    q931_translator: Q931SipTranslator,
    isup_translator: IsupSipTranslator,

    sip_out_tx: UnboundedSender<rsip::SipMessage>,
    sip_out: Option<UnboundedReceiver<rsip::SipMessage>>,
    sip_in: Option<UnboundedReceiver<rsip::SipMessage>>,
    sip_in_tx: UnboundedSender<rsip::SipMessage>,

    registry: SessionRegistry,
    ports: PortPool,
    legs: HashMap<String, CallLeg>,
    /// Endpoint-scoped call-ref → SIP Call-ID, the reverse of `legs`.
    ref_index: HashMap<(String, u16), String>,
    cic_index: HashMap<u16, String>,

    event_tx: UnboundedSender<GatewayEvent>,
    events: Option<UnboundedReceiver<GatewayEvent>>,
}

impl Gateway {
    fn assemble(
        config: GatewayConfig,
        tdm: TdmConnection,
        cancel_token: CancellationToken,
    ) -> Result<Gateway> {
        let tdm_events = tdm.take_events();

        // The TDMoE transport needs its receive/keepalive loop driven; the
        // in-memory channel link delivers events on its own.
        if let TdmConnection::Tdmoe(link) = &tdm {
            let link = link.clone();
            let token = cancel_token.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = link.serve_loop() => {
                        if let Err(e) = result {
                            warn!("TDMoE serve loop ended: {}", e);
                        }
                    }
                }
            });
        }

        let (engine_event_tx, engine_event_rx) = unbounded_channel();
        let mut engines = HashMap::new();
        let mut dchannel_spans = HashMap::new();

        for span in &config.tdm.spans {
            let span_id = span.span_id;
            dchannel_spans.insert(span.d_channel, span_id);

            let (wire_tx, mut wire_rx) = unbounded_channel::<Bytes>();
            let (event_tx, mut event_rx) = unbounded_channel::<LapdEvent>();
            let (input_tx, input_rx) = unbounded_channel::<LapdInput>();

            let lapd_config = LapdConfig {
                sapi: config.pri.sapi,
                tei: config.pri.tei,
                ces: span_id as u8,
                network_side: false,
                t200: Duration::from_millis(config.pri.t200_ms),
                t203: Duration::from_millis(config.pri.t203_ms),
                n200: config.pri.n200,
                window: config.pri.window,
            };
            let engine = LapdEngine::new(span_id, lapd_config, wire_tx, event_tx);
            tokio::spawn(engine.run(input_rx, cancel_token.child_token()));
            engines.insert(span_id, input_tx);

            // Encoded frames go out on the span's D-channel slot.
            let tdm_out = tdm.clone();
            let d_channel = span.d_channel;
            tokio::spawn(async move {
                while let Some(octets) = wire_rx.recv().await {
                    if let Err(e) = tdm_out.send(d_channel, octets).await {
                        debug!(span = span_id, "TDM send failed: {}", e);
                    }
                }
            });

            // Merge engine events into one stream, tagged by span.
            let merged = engine_event_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if merged.send((span_id, event)).is_err() {
                        break;
                    }
                }
            });
        }

        // NFAS groups own their member spans; every other span is FAS.
        // Each group's events are tagged with its id on the way into the
        // shared stream.
        let (group_event_tx, group_event_rx) = unbounded_channel::<(u32, NfasEvent)>();
        let mut groups = HashMap::new();
        let mut span_groups = HashMap::new();
        if config.nfas.enabled {
            for group_config in &config.nfas.groups {
                let members = group_config
                    .spans
                    .iter()
                    .filter_map(|span_id| {
                        engines.get(span_id).map(|input_tx| SpanMember {
                            span_id: *span_id,
                            input_tx: input_tx.clone(),
                        })
                    })
                    .collect();
                for span_id in &group_config.spans {
                    span_groups.insert(*span_id, group_config.group_id);
                }
                let (raw_tx, mut raw_rx) = unbounded_channel();
                let tagged = group_event_tx.clone();
                let group_id = group_config.group_id;
                tokio::spawn(async move {
                    while let Some(event) = raw_rx.recv().await {
                        if tagged.send((group_id, event)).is_err() {
                            break;
                        }
                    }
                });
                groups.insert(
                    group_id,
                    NfasGroup::new(group_id, config.nfas.clone(), members, raw_tx),
                );
            }
        }

        let (call_event_tx, call_event_rx) = unbounded_channel::<(String, CallEvent)>();
        let (q931_out_tx, q931_out_rx) = unbounded_channel();
        let mut endpoints = HashMap::new();
        let mut endpoint_links = HashMap::new();

        // One call-control instance per logical D-channel endpoint; its
        // message and event streams are tagged with the endpoint name.
        let mut add_endpoint = |endpoint: String, link: EndpointLink| {
            let (q931_tx, mut q931_rx) = unbounded_channel::<Q931Message>();
            let (event_tx, mut event_rx) = unbounded_channel::<CallEvent>();
            let tagged_out = q931_out_tx.clone();
            let tag = endpoint.clone();
            tokio::spawn(async move {
                while let Some(msg) = q931_rx.recv().await {
                    if tagged_out.send((tag.clone(), msg)).is_err() {
                        break;
                    }
                }
            });
            let tagged_events = call_event_tx.clone();
            let tag = endpoint.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if tagged_events.send((tag.clone(), event)).is_err() {
                        break;
                    }
                }
            });
            endpoints.insert(
                endpoint.clone(),
                CallControl::new(endpoint.clone(), config.pri.variant, q931_tx, event_tx),
            );
            endpoint_links.insert(endpoint, link);
        };

        for group_id in groups.keys() {
            add_endpoint(format!("group-{}", group_id), EndpointLink::Nfas(*group_id));
        }
        for span in &config.tdm.spans {
            if span_groups.contains_key(&span.span_id) {
                continue;
            }
            add_endpoint(
                format!("span-{}", span.span_id),
                EndpointLink::Fas(span.span_id),
            );
        }
        drop(add_endpoint);

        let default_endpoint = endpoints
            .keys()
            .min()
            .cloned()
            .ok_or_else(|| Error::ConfigError("no signaling endpoints".to_string()))?;

        let (sigtran_out_tx, sigtran_out_rx) = unbounded_channel::<IsupMessage>();
        let (isup_event_tx, isup_event_rx) = unbounded_channel();
        let (sigtran_in_tx, sigtran_in_rx) = unbounded_channel();
        let isup = if config.isup.enabled {
            let pool = CicPool::new(config.isup.cic_min, config.isup.cic_max)?;
            Some(IsupHandler::new(
                pool,
                config.isup.local_point_code,
                config.isup.remote_point_code,
                sigtran_out_tx,
                isup_event_tx,
            ))
        } else {
            None
        };

        let rules = RuleSet::for_variant(config.pri.variant);
        let (sip_out_tx, sip_out_rx) = unbounded_channel();
        let (sip_in_tx, sip_in_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();

        let ports = PortPool::new(config.rtp.port_min, config.rtp.port_max)?;

        Ok(Gateway {
            q931_translator: Q931SipTranslator::new(rules.clone()),
            isup_translator: IsupSipTranslator::new(rules),
            config,
            cancel_token,
            tdm,
            tdm_events,
            dchannel_spans,
            engines,
            engine_events: Some(engine_event_rx),
            groups,
            group_events: Some(group_event_rx),
            span_groups,
            endpoints,
            endpoint_links,
            call_events: Some(call_event_rx),
            q931_out: Some(q931_out_rx),
            default_endpoint,
            isup,
            isup_events: Some(isup_event_rx),
            sigtran_in: Some(sigtran_in_rx),
            sigtran_in_tx,
            sigtran_out: Some(sigtran_out_rx),
            sip_out_tx,
            sip_out: Some(sip_out_rx),
            sip_in: Some(sip_in_rx),
            sip_in_tx,
            registry: SessionRegistry::new(),
            ports,
            legs: HashMap::new(),
            ref_index: HashMap::new(),
            cic_index: HashMap::new(),
            event_tx,
            events: Some(event_rx),
        })
    }

    /// Operational event stream; callable once.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<GatewayEvent>> {
        self.events.take()
    }

    /// Sender the SIP collaborator uses to deliver parsed messages.
    pub fn sip_ingress(&self) -> UnboundedSender<rsip::SipMessage> {
        self.sip_in_tx.clone()
    }

    /// Messages the gateway wants sent on the SIP side; callable once.
    pub fn take_sip_outgoing(&mut self) -> Option<UnboundedReceiver<rsip::SipMessage>> {
        self.sip_out.take()
    }

    /// Sender the SIGTRAN collaborator uses to deliver raw ISUP messages.
    pub fn sigtran_ingress(&self) -> UnboundedSender<Bytes> {
        self.sigtran_in_tx.clone()
    }

    /// ISUP messages the gateway wants sent on SIGTRAN; callable once.
    pub fn take_sigtran_outgoing(&mut self) -> Option<UnboundedReceiver<IsupMessage>> {
        self.sigtran_out.take()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn tdm_connection(&self) -> &TdmConnection {
        &self.tdm
    }

    pub fn shutdown(&self) {
        info!("gateway shutdown requested");
        self.cancel_token.cancel();
    }

    /// Run the gateway until cancelled.
    pub async fn serve(&mut self) -> Result<()> {
        let mut tdm_events = self
            .tdm_events
            .take()
            .ok_or_else(|| Error::Error("TDM events already taken".to_string()))?;
        let mut engine_events = self.engine_events.take().expect("engine events");
        let mut group_events = self.group_events.take().expect("group events");
        let mut call_events = self.call_events.take().expect("call events");
        let mut q931_out = self.q931_out.take().expect("q931 out");
        let mut isup_events = self.isup_events.take().expect("isup events");
        let mut sigtran_in = self.sigtran_in.take().expect("sigtran in");
        let mut sip_in = self.sip_in.take().expect("sip in");

        // Bring the links up.
        for group in self.groups.values_mut() {
            group.start()?;
        }
        for (span, input_tx) in &self.engines {
            if !self.span_groups.contains_key(span) {
                let _ = input_tx.send(LapdInput::Command(LapdCommand::Start));
            }
        }
        let _ = self.event_tx.send(GatewayEvent::Started);
        info!("gateway started");

        let cancel_token = self.cancel_token.clone();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                Some(event) = tdm_events.recv() => self.on_tdm_event(event),
                Some((span, event)) = engine_events.recv() => self.on_engine_event(span, event),
                Some((group, event)) = group_events.recv() => self.on_group_event(group, event),
                Some((endpoint, event)) = call_events.recv() => self.on_call_event(endpoint, event),
                Some((endpoint, msg)) = q931_out.recv() => self.on_q931_out(endpoint, msg),
                Some(event) = isup_events.recv() => self.on_isup_event(event),
                Some(octets) = sigtran_in.recv() => {
                    if let Some(ref mut isup) = self.isup {
                        isup.on_wire(&octets);
                    }
                }
                Some(msg) = sip_in.recv() => self.on_sip_message(msg),
                _ = tick.tick() => self.on_tick(),
            }
        }

        let _ = self.event_tx.send(GatewayEvent::Stopped);
        info!("gateway stopped");
        Ok(())
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        for control in self.endpoints.values_mut() {
            control.poll_timers(now);
        }
        for group in self.groups.values_mut() {
            group.poll_timers(now);
        }
    }

    // -- TDM side ---------------------------------------------------------

    fn on_tdm_event(&mut self, event: TdmEvent) {
        match event {
            TdmEvent::Frame { channel, payload } => {
                if let Some(span) = self.dchannel_spans.get(&channel) {
                    if let Some(input_tx) = self.engines.get(span) {
                        let _ = input_tx.send(LapdInput::Wire(payload));
                    }
                } else {
                    debug!(channel, "frame on unmapped channel");
                }
            }
            TdmEvent::ChannelUp { channel } => {
                debug!(channel, "TDM channel up");
            }
            TdmEvent::ChannelDown { channel } => {
                if let Some(span) = self.dchannel_spans.get(&channel).copied() {
                    let _ = self.event_tx.send(GatewayEvent::SpanDown { span });
                }
            }
        }
    }

    fn on_engine_event(&mut self, span: SpanId, event: LapdEvent) {
        if let Some(group_id) = self.span_groups.get(&span).copied() {
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.on_engine_event(span, event);
            }
            return;
        }

        let endpoint = format!("span-{}", span);
        match event {
            LapdEvent::Established => {
                let _ = self.event_tx.send(GatewayEvent::SpanUp { span });
            }
            LapdEvent::Released => {
                let _ = self.event_tx.send(GatewayEvent::SpanDown { span });
                if let Some(control) = self.endpoints.get_mut(&endpoint) {
                    control.clear_all(q850::TEMPORARY_FAILURE);
                }
            }
            LapdEvent::Error(kind) => {
                warn!(span, ?kind, "FAS link failed");
                let _ = self.event_tx.send(GatewayEvent::SpanDown { span });
                if let Some(control) = self.endpoints.get_mut(&endpoint) {
                    control.clear_all(q850::TEMPORARY_FAILURE);
                }
            }
            LapdEvent::Data(payload) => self.deliver_q931(&endpoint, &payload),
            LapdEvent::Management(_) => {}
        }
    }

    fn on_group_event(&mut self, group: u32, event: NfasEvent) {
        match event {
            NfasEvent::Data(payload) => {
                let endpoint = format!("group-{}", group);
                self.deliver_q931(&endpoint, &payload);
            }
            NfasEvent::GroupActive { span } => {
                let _ = self.event_tx.send(GatewayEvent::SpanUp { span });
            }
            NfasEvent::SwitchoverCompleted { from, to, reason } => {
                info!(group, from, to, %reason, "NFAS switchover");
                let _ = self
                    .event_tx
                    .send(GatewayEvent::Switchover { group, from, to });
            }
            NfasEvent::GroupInactive { reason } => {
                warn!(group, %reason, "NFAS group inactive");
                let endpoint = format!("group-{}", group);
                if let Some(control) = self.endpoints.get_mut(&endpoint) {
                    control.clear_all(q850::TEMPORARY_FAILURE);
                }
                let _ = self.event_tx.send(GatewayEvent::GroupDown { group });
            }
            NfasEvent::QueueOverflow { dropped } => {
                warn!(group, dropped, "NFAS replay queue overflow");
            }
        }
    }

    fn deliver_q931(&mut self, endpoint: &str, payload: &[u8]) {
        let msg = match Q931Message::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(endpoint, "dropping Q.931 message: {}", e);
                return;
            }
        };
        if let Some(control) = self.endpoints.get_mut(endpoint) {
            control.on_message(msg);
        }
    }

    fn on_q931_out(&mut self, endpoint: String, msg: Q931Message) {
        let payload = msg.encode();
        match self.endpoint_links.get(&endpoint) {
            Some(EndpointLink::Fas(span)) => {
                if let Some(input_tx) = self.engines.get(span) {
                    let _ = input_tx.send(LapdInput::Command(LapdCommand::Transmit(payload)));
                }
            }
            Some(EndpointLink::Nfas(group_id)) => {
                if let Some(group) = self.groups.get_mut(group_id) {
                    group.send(payload);
                }
            }
            None => debug!(%endpoint, "Q.931 for unknown endpoint"),
        }
    }

    // -- call events from the Q.931 layer ---------------------------------

    fn on_call_event(&mut self, endpoint: String, event: CallEvent) {
        match event {
            CallEvent::SetupIndication {
                call_ref,
                calling,
                called,
                bearer,
                channel: _,
            } => {
                if let Err(e) =
                    self.start_tdm_to_sip_call(endpoint, call_ref, calling, called, bearer)
                {
                    warn!("inbound call failed: {}", e);
                }
            }
            CallEvent::Proceeding { call_ref, .. }
            | CallEvent::Alerting { call_ref, .. }
            | CallEvent::Connected { call_ref } => {
                self.forward_progress_to_sip(&endpoint, call_ref, event.clone());
            }
            CallEvent::Disconnected { call_ref, cause } => {
                self.clear_sip_leg(&endpoint, call_ref, cause);
            }
            CallEvent::Released { call_ref, cause } => {
                self.finish_tdm_call(&endpoint, call_ref, cause);
            }
        }
    }

    fn start_tdm_to_sip_call(
        &mut self,
        endpoint: String,
        call_ref: CallRef,
        calling: Option<crate::q931::ie::PartyNumber>,
        called: Option<crate::q931::ie::PartyNumber>,
        bearer: Option<crate::q931::ie::BearerCapability>,
    ) -> Result<()> {
        let pair = match self.ports.allocate() {
            Ok(pair) => pair,
            Err(e) => {
                // No media port: refuse the call with no-circuit.
                if let Some(control) = self.endpoints.get_mut(&endpoint) {
                    let _ = control.disconnect(&call_ref, q850::NO_CIRCUIT_AVAILABLE);
                }
                return Err(e);
            }
        };

        let sip_call_id = new_call_id(&self.config.sip.domain);
        let keys = [
            SessionKey::CallRef {
                endpoint: endpoint.clone(),
                value: call_ref.value,
            },
            SessionKey::SipCallId(sip_call_id.clone()),
            SessionKey::RtpPort(pair.rtp),
        ];
        if let Err(e) = self.registry.insert(&keys) {
            let _ = self.ports.release(pair.rtp);
            if let Some(control) = self.endpoints.get_mut(&endpoint) {
                let _ = control.disconnect(&call_ref, q850::NO_CIRCUIT_AVAILABLE);
            }
            return Err(e);
        }

        let ctx = self.context(&endpoint, pair.rtp, &sip_call_id);
        let invite = self.q931_translator.setup_to_invite(
            &ctx,
            calling.as_ref(),
            called.as_ref(),
            bearer.as_ref(),
        )?;

        self.legs.insert(
            sip_call_id.clone(),
            CallLeg {
                endpoint: endpoint.clone(),
                direction: CallDirection::TdmToSip,
                invite: invite.clone(),
                call_ref: Some(call_ref),
                cic: None,
                rtp_port: pair.rtp,
                calling: calling.map(|n| n.digits),
                called: called.map(|n| n.digits),
                answered_at: None,
                setup_at: Utc::now(),
            },
        );
        self.ref_index
            .insert((endpoint.clone(), call_ref.value), sip_call_id.clone());

        let _ = self.event_tx.send(GatewayEvent::CallStarted {
            sip_call_id: sip_call_id.clone(),
        });
        let _ = self.sip_out_tx.send(rsip::SipMessage::Request(invite));

        // Acknowledge the SETUP right away so the peer's T303 stops.
        if let Some(control) = self.endpoints.get_mut(&endpoint) {
            control.handle_command(CallCommand::Proceed { call_ref });
        }
        Ok(())
    }

    /// TDM-side progress on a call the SIP side originated becomes a
    /// provisional or final response on the stored INVITE.
    fn forward_progress_to_sip(&mut self, endpoint: &str, call_ref: CallRef, event: CallEvent) {
        let call_id = match self.leg_id(endpoint, &call_ref) {
            Some(call_id) => call_id,
            None => return,
        };
        let (from_sip, endpoint, rtp_port, invite) = match self.legs.get(&call_id) {
            Some(leg) => (
                matches!(leg.direction, CallDirection::SipToTdm),
                leg.endpoint.clone(),
                leg.rtp_port,
                leg.invite.clone(),
            ),
            None => return,
        };
        if matches!(event, CallEvent::Connected { .. }) {
            if let Some(leg) = self.legs.get_mut(&call_id) {
                leg.answered_at = Some(Utc::now());
            }
        }
        if !from_sip {
            // We originated the INVITE; progress arrives as SIP responses
            // instead.
            return;
        }
        let ctx = self.context(&endpoint, rtp_port, &call_id);
        match self
            .q931_translator
            .progress_to_response(&ctx, &invite, &event)
        {
            Ok(Some(response)) => {
                let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
            }
            Ok(None) => {}
            Err(e) => warn!(%call_id, "progress translation failed: {}", e),
        }
    }

    fn clear_sip_leg(&mut self, endpoint: &str, call_ref: CallRef, cause: u8) {
        let call_id = match self.leg_id(endpoint, &call_ref) {
            Some(call_id) => call_id,
            None => return,
        };
        let Some(leg) = self.legs.get(&call_id) else {
            return;
        };
        let answered = leg.answered_at.is_some();

        // An unanswered INVITE we sent is withdrawn with CANCEL; everything
        // else follows the cause tables.
        if matches!(leg.direction, CallDirection::TdmToSip) && !answered {
            let cancel = crate::translate::q931_sip::make_cancel(&leg.invite);
            let _ = self.sip_out_tx.send(rsip::SipMessage::Request(cancel));
            return;
        }
        match self
            .q931_translator
            .clearing_to_sip(&leg.invite, cause, answered)
        {
            Ok(ClearingAction::Bye(bye)) => {
                let _ = self.sip_out_tx.send(rsip::SipMessage::Request(bye));
            }
            Ok(ClearingAction::Response(response)) => {
                let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
            }
            Err(e) => warn!("clearing translation failed: {}", e),
        }
    }

    fn finish_tdm_call(&mut self, endpoint: &str, call_ref: CallRef, cause: u8) {
        let call_id = match self.leg_id(endpoint, &call_ref) {
            Some(call_id) => call_id,
            None => return,
        };
        self.teardown(&call_id, cause);
    }

    /// Release every resource a call holds and emit its usage record.
    fn teardown(&mut self, call_id: &str, cause: u8) {
        let leg = match self.legs.remove(call_id) {
            Some(leg) => leg,
            None => return,
        };
        if let Some(call_ref) = leg.call_ref {
            self.ref_index.remove(&(leg.endpoint.clone(), call_ref.value));
        }
        if let Some(cic) = leg.cic {
            self.cic_index.remove(&cic);
        }
        let _ = self
            .registry
            .remove(&SessionKey::SipCallId(call_id.to_string()));
        let _ = self.ports.release(leg.rtp_port);

        let record = CallEventRecord {
            endpoint: leg.endpoint,
            calling: leg.calling,
            called: leg.called,
            sip_call_id: call_id.to_string(),
            cic: leg.cic,
            setup_at: leg.setup_at,
            answered_at: leg.answered_at,
            released_at: Utc::now(),
            cause,
        };
        info!(call_id, cause, "call ended");
        let _ = self.event_tx.send(GatewayEvent::CallEnded(record));
    }

    // -- ISUP events ------------------------------------------------------

    fn on_isup_event(&mut self, event: IsupEvent) {
        match event {
            IsupEvent::IncomingCall {
                cic,
                calling,
                called,
                raw,
            } => {
                if let Err(e) = self.start_isup_to_sip_call(cic, calling, called, raw) {
                    warn!(cic, "inbound ISUP call failed: {}", e);
                    if let Some(ref mut isup) = self.isup {
                        let _ = isup.release(cic, q850::NO_CIRCUIT_AVAILABLE);
                    }
                }
            }
            IsupEvent::Progress { cic, .. } => {
                if let Some(call_id) = self.cic_index.get(&cic).cloned() {
                    let leg_data = self.legs.get(&call_id).and_then(|leg| {
                        matches!(leg.direction, CallDirection::SipToTdm)
                            .then(|| (leg.endpoint.clone(), leg.rtp_port, leg.invite.clone()))
                    });
                    if let Some((endpoint, rtp_port, invite)) = leg_data {
                        let ctx = self.context(&endpoint, rtp_port, &call_id);
                        if let Ok(response) =
                            self.isup_translator.acm_to_response(&ctx, &invite)
                        {
                            let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
                        }
                    }
                }
            }
            IsupEvent::Answered { cic } => {
                if let Some(call_id) = self.cic_index.get(&cic).cloned() {
                    let ctx_data = self.legs.get_mut(&call_id).map(|leg| {
                        leg.answered_at = Some(Utc::now());
                        (leg.endpoint.clone(), leg.rtp_port, leg.invite.clone())
                    });
                    if let Some((endpoint, rtp_port, invite)) = ctx_data {
                        let ctx = self.context(&endpoint, rtp_port, &call_id);
                        if let Ok(response) = self.isup_translator.anm_to_response(&ctx, &invite)
                        {
                            let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
                        }
                    }
                }
            }
            IsupEvent::Released { cic, cause } => {
                if let Some(call_id) = self.cic_index.get(&cic).cloned() {
                    let message = self.legs.get(&call_id).and_then(|leg| {
                        let answered = leg.answered_at.is_some();
                        if answered {
                            self.isup_translator
                                .rel_to_bye(&leg.invite, cause)
                                .ok()
                                .map(rsip::SipMessage::Request)
                        } else if matches!(leg.direction, CallDirection::TdmToSip) {
                            // Our unanswered INVITE is withdrawn, not answered.
                            Some(rsip::SipMessage::Request(
                                crate::translate::q931_sip::make_cancel(&leg.invite),
                            ))
                        } else {
                            self.isup_translator
                                .rel_to_response(&leg.invite, cause)
                                .ok()
                                .map(rsip::SipMessage::Response)
                        }
                    });
                    if let Some(message) = message {
                        let _ = self.sip_out_tx.send(message);
                    }
                    self.teardown(&call_id, cause);
                }
            }
            IsupEvent::CircuitFreed { .. } => {}
            IsupEvent::GlareLost {
                calling, called, ..
            } => {
                // Re-originate the lost call on a fresh circuit.
                if let Some(ref mut isup) = self.isup {
                    match isup.originate(calling, called) {
                        Ok(new_cic) => info!(new_cic, "glare retry on fresh circuit"),
                        Err(e) => warn!("glare retry failed: {}", e),
                    }
                }
            }
            IsupEvent::UnknownMessage { cic, message_type } => {
                debug!(cic, message_type, "unknown ISUP message surfaced");
            }
        }
    }

    fn start_isup_to_sip_call(
        &mut self,
        cic: u16,
        calling: Option<String>,
        called: String,
        raw: Bytes,
    ) -> Result<()> {
        let pair = self.ports.allocate()?;
        let sip_call_id = new_call_id(&self.config.sip.domain);
        let keys = [
            SessionKey::Cic(cic),
            SessionKey::SipCallId(sip_call_id.clone()),
            SessionKey::RtpPort(pair.rtp),
        ];
        if let Err(e) = self.registry.insert(&keys) {
            let _ = self.ports.release(pair.rtp);
            return Err(e);
        }

        let endpoint = format!("cic-{}", cic);
        let ctx = self.context(&endpoint, pair.rtp, &sip_call_id);
        let invite =
            self.isup_translator
                .iam_to_invite(&ctx, calling.as_deref(), &called, &raw)?;

        self.legs.insert(
            sip_call_id.clone(),
            CallLeg {
                endpoint,
                direction: CallDirection::TdmToSip,
                invite: invite.clone(),
                call_ref: None,
                cic: Some(cic),
                rtp_port: pair.rtp,
                calling,
                called: Some(called),
                answered_at: None,
                setup_at: Utc::now(),
            },
        );
        self.cic_index.insert(cic, sip_call_id.clone());

        let _ = self.event_tx.send(GatewayEvent::CallStarted {
            sip_call_id: sip_call_id.clone(),
        });
        let _ = self.sip_out_tx.send(rsip::SipMessage::Request(invite));
        Ok(())
    }

    // -- SIP side ---------------------------------------------------------

    fn on_sip_message(&mut self, msg: rsip::SipMessage) {
        match msg {
            rsip::SipMessage::Request(request) => self.on_sip_request(request),
            rsip::SipMessage::Response(response) => self.on_sip_response(response),
        }
    }

    fn on_sip_request(&mut self, request: rsip::Request) {
        match request.method {
            rsip::Method::Invite => {
                if let Err(e) = self.start_sip_to_tdm_call(request) {
                    warn!("SIP origination failed: {}", e);
                }
            }
            rsip::Method::Bye => {
                let call_id = match request.call_id_header() {
                    Ok(header) => header.to_string(),
                    Err(_) => return,
                };
                let cause = self.isup_translator.bye_to_cause(&request);
                self.clear_tdm_leg(&call_id, cause);
                if let Ok(response) = self.q931_translator.make_response(&request, 200, None) {
                    let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
                }
                self.teardown(&call_id, cause);
            }
            rsip::Method::Cancel => {
                let call_id = match request.call_id_header() {
                    Ok(header) => header.to_string(),
                    Err(_) => return,
                };
                self.clear_tdm_leg(&call_id, q850::NORMAL_CLEARING);
                self.teardown(&call_id, q850::NORMAL_CLEARING);
            }
            rsip::Method::Ack => {}
            _ => {
                if let Ok(response) = self.q931_translator.make_response(&request, 405, None) {
                    let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
                }
            }
        }
    }

    fn start_sip_to_tdm_call(&mut self, invite: rsip::Request) -> Result<()> {
        let call_id = invite.call_id_header()?.to_string();

        // Re-INVITE on an existing call: answer with the current local
        // media description, renegotiation stays with the collaborator.
        if let Some(leg) = self.legs.get(&call_id) {
            let local = crate::translate::MediaDescription::offer(
                self.config.sip.media_addr,
                leg.rtp_port,
                None,
                self.config.pri.variant,
            );
            let body = local.render(2).into_bytes();
            if let Ok(response) = self.q931_translator.make_response(&invite, 200, Some(body)) {
                let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
            }
            return Ok(());
        }

        // SIP-T INVITEs carry a tunneled IAM and terminate on a trunk.
        let is_sip_t = self.isup.is_some()
            && invite.headers.iter().any(|h| {
                matches!(h, rsip::Header::ContentType(ct)
                    if ct.to_string().starts_with("multipart/"))
            });
        if is_sip_t {
            return self.start_sip_to_isup_call(invite, call_id);
        }

        let intent = self.q931_translator.invite_to_intent(&invite)?;
        let pair = self.ports.allocate()?;

        let endpoint = self.default_endpoint.clone();
        let control = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or_else(|| Error::Error("no endpoint for origination".to_string()))?;
        let call_ref = match control.originate(intent.calling.clone(), intent.called.clone(), None)
        {
            Ok(call_ref) => call_ref,
            Err(e) => {
                let _ = self.ports.release(pair.rtp);
                return Err(e);
            }
        };

        let keys = [
            SessionKey::CallRef {
                endpoint: endpoint.clone(),
                value: call_ref.value,
            },
            SessionKey::SipCallId(call_id.clone()),
            SessionKey::RtpPort(pair.rtp),
        ];
        if let Err(e) = self.registry.insert(&keys) {
            let _ = self.ports.release(pair.rtp);
            if let Some(control) = self.endpoints.get_mut(&endpoint) {
                let _ = control.disconnect(&call_ref, q850::NO_CIRCUIT_AVAILABLE);
            }
            // Refuse the INVITE outright.
            if let Ok(response) = self.q931_translator.make_response(&invite, 503, None) {
                let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
            }
            return Err(e);
        }

        self.legs.insert(
            call_id.clone(),
            CallLeg {
                endpoint: endpoint.clone(),
                direction: CallDirection::SipToTdm,
                invite: invite.clone(),
                call_ref: Some(call_ref),
                cic: None,
                rtp_port: pair.rtp,
                calling: intent.calling.map(|n| n.digits),
                called: Some(intent.called.digits),
                answered_at: None,
                setup_at: Utc::now(),
            },
        );
        self.ref_index
            .insert((endpoint, call_ref.value), call_id.clone());
        let _ = self
            .event_tx
            .send(GatewayEvent::CallStarted { sip_call_id: call_id });

        // 100 Trying immediately; real progress follows from the TDM leg.
        if let Ok(response) = self.q931_translator.make_response(&invite, 100, None) {
            let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
        }
        Ok(())
    }

    fn start_sip_to_isup_call(&mut self, invite: rsip::Request, call_id: String) -> Result<()> {
        let intent = self.isup_translator.invite_to_iam_intent(&invite)?;
        let pair = self.ports.allocate()?;

        let isup = self
            .isup
            .as_mut()
            .ok_or_else(|| Error::Error("ISUP not enabled".to_string()))?;
        let cic = match isup.originate(intent.calling.clone(), intent.called.clone()) {
            Ok(cic) => cic,
            Err(e) => {
                let _ = self.ports.release(pair.rtp);
                if let Ok(response) = self.q931_translator.make_response(&invite, 503, None) {
                    let _ = self.sip_out_tx.send(rsip::SipMessage::Response(response));
                }
                return Err(e);
            }
        };

        let keys = [
            SessionKey::Cic(cic),
            SessionKey::SipCallId(call_id.clone()),
            SessionKey::RtpPort(pair.rtp),
        ];
        if let Err(e) = self.registry.insert(&keys) {
            let _ = self.ports.release(pair.rtp);
            if let Some(ref mut isup) = self.isup {
                let _ = isup.release(cic, q850::NO_CIRCUIT_AVAILABLE);
            }
            return Err(e);
        }

        self.legs.insert(
            call_id.clone(),
            CallLeg {
                endpoint: format!("cic-{}", cic),
                direction: CallDirection::SipToTdm,
                invite,
                call_ref: None,
                cic: Some(cic),
                rtp_port: pair.rtp,
                calling: intent.calling,
                called: Some(intent.called),
                answered_at: None,
                setup_at: Utc::now(),
            },
        );
        self.cic_index.insert(cic, call_id.clone());
        let _ = self
            .event_tx
            .send(GatewayEvent::CallStarted { sip_call_id: call_id });
        Ok(())
    }

    fn on_sip_response(&mut self, response: rsip::Response) {
        let call_id = match response.call_id_header() {
            Ok(header) => header.to_string(),
            Err(_) => return,
        };
        let Some(leg) = self.legs.get(&call_id) else {
            debug!(%call_id, "response for unknown call");
            return;
        };
        // Responses matter for calls the gateway originated on the SIP side.
        if !matches!(leg.direction, CallDirection::TdmToSip) {
            return;
        }
        let status = response.status_code.code();
        let call_ref = leg.call_ref;
        let cic = leg.cic;
        let endpoint = leg.endpoint.clone();

        if status < 200 {
            match status {
                180 => self.drive_tdm(&endpoint, call_ref, cic, TdmAction::Alert),
                183 => self.drive_tdm(&endpoint, call_ref, cic, TdmAction::Progress),
                _ => self.drive_tdm(&endpoint, call_ref, cic, TdmAction::Proceed),
            }
        } else if status < 300 {
            if let Some(leg) = self.legs.get_mut(&call_id) {
                leg.answered_at = Some(Utc::now());
            }
            self.drive_tdm(&endpoint, call_ref, cic, TdmAction::Answer);
        } else {
            let cause = self.q931_translator.status_to_cause(status);
            self.drive_tdm(&endpoint, call_ref, cic, TdmAction::Release(cause));
            self.teardown(&call_id, cause);
        }
    }

    fn clear_tdm_leg(&mut self, call_id: &str, cause: u8) {
        let Some(leg) = self.legs.get(call_id) else {
            return;
        };
        let endpoint = leg.endpoint.clone();
        let call_ref = leg.call_ref;
        let cic = leg.cic;
        self.drive_tdm(&endpoint, call_ref, cic, TdmAction::Release(cause));
    }

    fn drive_tdm(
        &mut self,
        endpoint: &str,
        call_ref: Option<CallRef>,
        cic: Option<u16>,
        action: TdmAction,
    ) {
        if let Some(call_ref) = call_ref {
            if let Some(control) = self.endpoints.get_mut(endpoint) {
                match action {
                    TdmAction::Proceed => {
                        control.handle_command(CallCommand::Proceed { call_ref })
                    }
                    TdmAction::Alert => control.handle_command(CallCommand::Alert {
                        call_ref,
                        inband: false,
                    }),
                    TdmAction::Progress => control.handle_command(CallCommand::Alert {
                        call_ref,
                        inband: true,
                    }),
                    TdmAction::Answer => {
                        control.handle_command(CallCommand::Answer { call_ref })
                    }
                    TdmAction::Release(cause) => {
                        control.handle_command(CallCommand::Disconnect { call_ref, cause })
                    }
                }
            }
            return;
        }
        if let Some(cic) = cic {
            if let Some(ref mut isup) = self.isup {
                let result = match action {
                    TdmAction::Proceed | TdmAction::Progress | TdmAction::Alert => {
                        isup.send_progress(cic)
                    }
                    TdmAction::Answer => isup.send_answer(cic),
                    TdmAction::Release(cause) => isup.release(cic, cause),
                };
                if let Err(e) = result {
                    warn!(cic, "ISUP command failed: {}", e);
                }
            }
        }
    }

    // -- helpers ----------------------------------------------------------

    fn context(&self, endpoint: &str, rtp_port: u16, sip_call_id: &str) -> TranslationContext {
        TranslationContext {
            variant: self.config.pri.variant,
            endpoint: endpoint.to_string(),
            local_domain: self.config.sip.domain.clone(),
            media_addr: self.config.sip.media_addr,
            rtp_port,
            sip_call_id: sip_call_id.to_string(),
        }
    }

    fn leg_id(&self, endpoint: &str, call_ref: &CallRef) -> Option<String> {
        self.ref_index
            .get(&(endpoint.to_string(), call_ref.value))
            .cloned()
    }
}

enum TdmAction {
    Proceed,
    Alert,
    Progress,
    Answer,
    Release(u8),
}
