//! Yellowstone gRPC implementation of the connector seam

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::sink::SinkExt;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use yellowstone_grpc_client::{ClientTlsConfig, GeyserGrpcClient, Interceptor};
use yellowstone_grpc_proto::prelude::{
    subscribe_update::UpdateOneof, CommitmentLevel, SubscribeRequest,
    SubscribeRequestFilterTransactions, SubscribeRequestPing, SubscribeUpdate,
};
use yellowstone_grpc_proto::prost::Message;

use crate::config::Commitment;
use crate::error::{Error, Result};

use super::call::{GeyserConnector, GeyserSession, SourceEndpoint, StreamUpdate, SubscribeCall, SubscribeSpec};
use super::event::TransactionEvent;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Filter name used in the subscribe request
const TRANSACTIONS_FILTER: &str = "monitor";

const PING_ID: i32 = 1;

/// Connects to Yellowstone Geyser endpoints
#[derive(Debug, Clone)]
pub struct YellowstoneConnector {
    connect_timeout: Duration,
    max_decoding_message_size: usize,
}

impl YellowstoneConnector {
    pub fn new(connect_timeout: Duration, max_decoding_message_size: usize) -> Self {
        Self {
            connect_timeout,
            max_decoding_message_size,
        }
    }
}

#[async_trait]
impl GeyserConnector for YellowstoneConnector {
    async fn connect(&self, endpoint: &SourceEndpoint) -> Result<Box<dyn GeyserSession>> {
        info!("Connecting to Geyser at {}", endpoint.address);

        let mut builder = GeyserGrpcClient::build_from_shared(endpoint.address.clone())
            .map_err(|e| Error::Connection(e.to_string()))?
            .x_token(endpoint.x_token.clone())
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true)
            .max_decoding_message_size(self.max_decoding_message_size);

        if endpoint.address.starts_with("https://") {
            builder = builder
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| Error::Connection(e.to_string()))?;
        }

        let client = builder
            .connect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        info!("Connected to Geyser at {}", endpoint.address);
        Ok(Box::new(YellowstoneSession { client }))
    }
}

struct YellowstoneSession<I> {
    client: GeyserGrpcClient<I>,
}

#[async_trait]
impl<I> GeyserSession for YellowstoneSession<I>
where
    I: Interceptor + Send + Sync + 'static,
{
    async fn open_call(&mut self) -> Result<Box<dyn SubscribeCall>> {
        // The request half stays open for the lifetime of the call
        let (requests, outbound) = mpsc::unbounded::<SubscribeRequest>();
        let response = self
            .client
            .geyser
            .subscribe(outbound)
            .await
            .map_err(|status| Error::Connection(status.to_string()))?;

        let stream = response
            .into_inner()
            .map(|item| item.map_err(|status| Error::StreamClosed(status.to_string())));

        Ok(Box::new(YellowstoneCall {
            requests,
            stream: stream.boxed(),
        }))
    }
}

struct YellowstoneCall {
    requests: mpsc::UnboundedSender<SubscribeRequest>,
    stream: BoxStream<'static, Result<SubscribeUpdate>>,
}

#[async_trait]
impl SubscribeCall for YellowstoneCall {
    async fn send_request(&mut self, spec: &SubscribeSpec) -> Result<()> {
        self.requests
            .send(build_request(spec))
            .await
            .map_err(|e| Error::StreamClosed(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.requests
            .send(ping_request())
            .await
            .map_err(|e| Error::StreamClosed(e.to_string()))
    }

    async fn next_update(&mut self) -> Option<Result<StreamUpdate>> {
        let update = match self.stream.next().await? {
            Ok(update) => update,
            Err(e) => return Some(Err(e)),
        };
        Some(decode_update(update))
    }
}

/// Pong written back on the subscribe stream
pub fn ping_request() -> SubscribeRequest {
    SubscribeRequest {
        ping: Some(SubscribeRequestPing { id: PING_ID }),
        ..Default::default()
    }
}

pub fn build_request(spec: &SubscribeSpec) -> SubscribeRequest {
    let mut transactions = HashMap::new();
    transactions.insert(
        TRANSACTIONS_FILTER.to_string(),
        SubscribeRequestFilterTransactions {
            vote: Some(spec.include_votes),
            failed: Some(spec.include_failed),
            ..Default::default()
        },
    );

    SubscribeRequest {
        transactions,
        commitment: Some(commitment_level(spec.commitment) as i32),
        ..Default::default()
    }
}

fn commitment_level(commitment: Commitment) -> CommitmentLevel {
    match commitment {
        Commitment::Processed => CommitmentLevel::Processed,
        Commitment::Confirmed => CommitmentLevel::Confirmed,
        Commitment::Finalized => CommitmentLevel::Finalized,
    }
}

fn decode_update(update: SubscribeUpdate) -> Result<StreamUpdate> {
    let payload = update.encode_to_vec();
    match update.update_oneof {
        Some(UpdateOneof::Transaction(tx)) => {
            TransactionEvent::from_update(&tx, payload).map(StreamUpdate::Transaction)
        }
        Some(UpdateOneof::Ping(_)) => Ok(StreamUpdate::Ping),
        Some(_) => Ok(StreamUpdate::Other),
        None => {
            debug!("Update without payload");
            Ok(StreamUpdate::Other)
        }
    }
}

/// Decode a persisted payload back into an update
pub fn decode_payload(bytes: &[u8]) -> Result<SubscribeUpdate> {
    SubscribeUpdate::decode(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Rebuild the event a stored payload came from
pub fn decode_stored(bytes: &[u8]) -> Result<TransactionEvent> {
    match decode_payload(bytes)?.update_oneof {
        Some(UpdateOneof::Transaction(tx)) => TransactionEvent::from_update(&tx, bytes.to_vec()),
        _ => Err(Error::MalformedUpdate("stored payload is not a transaction".to_string())),
    }
}
