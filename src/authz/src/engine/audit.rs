//! Audit publishing for authorization decisions
//!
//! Every decision is handed to an [`AuditSink`]. Publishing is fire-and-forget:
//! a slow or full sink never delays or changes a decision.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::decision::{Decision, DecisionOutcome, DeterminingFactor};
use crate::types::AuthzRequest;

/// Audit record of one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub request_id: String,
    pub principal: String,
    pub action: String,
    pub resource: String,
    pub decision: DecisionOutcome,
    pub factors: Vec<DeterminingFactor>,
    pub cached: bool,
    pub latency_us: u64,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(request: &AuthzRequest, decision: &Decision, latency_us: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            request_id: decision.request_id.clone(),
            principal: request.principal.clone(),
            action: request.action.clone(),
            resource: request.resource.clone(),
            decision: decision.decision,
            factors: decision.determining_factors.clone(),
            cached: decision.cached,
            latency_us,
            timestamp,
        }
    }
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    /// Publish an event; must not block
    fn publish(&self, event: AuditEvent);
}

/// Writes one structured log line per decision
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn publish(&self, event: AuditEvent) {
        let factors: Vec<String> = event.factors.iter().map(|f| f.to_string()).collect();
        info!(
            target: "authz::audit",
            request_id = %event.request_id,
            principal = %event.principal,
            action = %event.action,
            resource = %event.resource,
            decision = %event.decision,
            cached = event.cached,
            latency_us = event.latency_us,
            "decision factors=[{}]",
            factors.join(", ")
        );
    }
}

/// Forwards events to a bounded channel; drops them when the channel is full
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Create a sink and the receiver that drains it
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn publish(&self, event: AuditEvent) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping audit event: {}", e);
        }
    }
}

/// Keeps the most recent events in memory
#[derive(Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
    max_events: usize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            max_events: max_events.max(1),
        }
    }

    /// Snapshot of recorded events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events for one principal
    pub fn events_for(&self, principal: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.principal == principal)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn publish(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        events.push(event);

        if events.len() > self.max_events {
            let excess = events.len() - self.max_events;
            events.drain(0..excess);
        }
    }
}
