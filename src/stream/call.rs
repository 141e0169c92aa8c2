//! Subscribe-call state machine and the upstream connector seam
//!
//! An ingestion worker owns one session per data source and drives a single
//! in-flight subscribe call through `Start -> Write -> Read* -> Finished`.
//! A read failure skips `Finished` and goes straight back to `Start`.

use async_trait::async_trait;
use std::fmt;

use crate::config::Commitment;
use crate::error::Result;

use super::event::TransactionEvent;

/// Where and how to reach a data source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEndpoint {
    pub address: String,
    pub x_token: Option<String>,
}

/// What the subscribe request asks for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscribeSpec {
    pub commitment: Commitment,
    pub include_votes: bool,
    pub include_failed: bool,
}

impl SubscribeSpec {
    /// Non-vote, non-failed transactions at the given commitment
    pub fn transactions(commitment: Commitment) -> Self {
        Self {
            commitment,
            include_votes: false,
            include_failed: false,
        }
    }
}

/// One decoded message from the subscribe stream
#[derive(Debug)]
pub enum StreamUpdate {
    Transaction(TransactionEvent),
    Ping,
    /// Account, slot, block and other update kinds are not batched
    Other,
}

/// Establishes sessions to a data source
#[async_trait]
pub trait GeyserConnector: Send + Sync {
    async fn connect(&self, endpoint: &SourceEndpoint) -> Result<Box<dyn GeyserSession>>;
}

/// An established channel that can carry subscribe calls
#[async_trait]
pub trait GeyserSession: Send {
    async fn open_call(&mut self) -> Result<Box<dyn SubscribeCall>>;
}

/// One bidirectional subscribe call
#[async_trait]
pub trait SubscribeCall: Send {
    async fn send_request(&mut self, spec: &SubscribeSpec) -> Result<()>;

    /// Answer a server ping on the same call so the server keeps it open
    async fn send_ping(&mut self) -> Result<()>;

    /// `None` means the server completed the stream
    async fn next_update(&mut self) -> Option<Result<StreamUpdate>>;
}

/// State of the in-flight call
pub enum CallState {
    Start,
    Write(Box<dyn SubscribeCall>),
    Read(Box<dyn SubscribeCall>),
    Finished,
}

/// Outcome of the last step, fed back into [`CallState::advance`]
pub enum CallEvent {
    Opened(Box<dyn SubscribeCall>),
    RequestSent,
    Received,
    Failed,
    Completed,
    Reinitiate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Start,
    Write,
    Read,
    Finished,
}

impl CallState {
    pub fn phase(&self) -> CallPhase {
        match self {
            CallState::Start => CallPhase::Start,
            CallState::Write(_) => CallPhase::Write,
            CallState::Read(_) => CallPhase::Read,
            CallState::Finished => CallPhase::Finished,
        }
    }

    /// Pure transition function; unexpected events leave the state unchanged
    pub fn advance(self, event: CallEvent) -> CallState {
        match (self, event) {
            (CallState::Start, CallEvent::Opened(call)) => CallState::Write(call),
            (CallState::Write(call), CallEvent::RequestSent) => CallState::Read(call),
            (CallState::Write(_), CallEvent::Failed) => CallState::Start,
            (CallState::Read(call), CallEvent::Received) => CallState::Read(call),
            (CallState::Read(_), CallEvent::Failed) => CallState::Start,
            (CallState::Read(_), CallEvent::Completed) => CallState::Finished,
            (CallState::Finished, CallEvent::Reinitiate) => CallState::Start,
            (state, _) => state,
        }
    }
}

impl fmt::Debug for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.phase())
    }
}
