//! `RouterService`: a brokered two-party stream splice.
//!
//! A router instance holds a process-local map `stream_id → pending half`.
//! The first party to authenticate under a stream ID parks itself; the
//! second is spliced onto it and frames are copied bidirectionally until
//! either side disconnects or sends `RST_STREAM`/`GOAWAY`. Nothing is
//! persisted: a restart loses all pending halves and both parties redial.
use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};
use uuid::Uuid;

use jumpstarter_auth::TokenService;

use crate::{
    auth::bearer,
    proto::{router_service_server::RouterService, FrameType, StreamRequest, StreamResponse},
};

/// Pending halves and pairing tombstones are garbage collected once the
/// ticket that admitted them can no longer be valid.
const ENTRY_LIFETIME: Duration = Duration::from_secs(30 * 60);
/// Per-direction in-flight frame buffer.
const CHANNEL_DEPTH: usize = 32;

type Inbound = Pin<Box<dyn Stream<Item = Result<StreamRequest, Status>> + Send>>;
type Outbound = mpsc::Sender<Result<StreamResponse, Status>>;

struct PendingHalf {
    tx: Outbound,
    inbound: Inbound,
    parked_at: Instant,
}

enum StreamEntry {
    Waiting(PendingHalf),
    /// Both parties arrived; kept as a tombstone so a third arrival under
    /// the same stream ID is rejected rather than parked.
    Paired { since: Instant },
}

pub struct Router {
    tokens: Arc<TokenService>,
    streams: Mutex<HashMap<Uuid, StreamEntry>>,
}

impl Router {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self {
            tokens,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn gc(streams: &mut HashMap<Uuid, StreamEntry>, now: Instant) {
        streams.retain(|_, entry| {
            let age = match entry {
                StreamEntry::Waiting(half) => now - half.parked_at,
                StreamEntry::Paired { since } => now - *since,
            };
            age < ENTRY_LIFETIME
        });
    }

    /// Attach one authenticated party to `stream_id`.
    ///
    /// The first arrival parks; the second splices and starts the copy
    /// loops. A third arrival is `FailedPrecondition`.
    pub fn attach(
        &self,
        stream_id: Uuid,
        inbound: Inbound,
    ) -> Result<mpsc::Receiver<Result<StreamResponse, Status>>, Status> {
        let now = Instant::now();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        let mut streams = self.streams.lock();
        Self::gc(&mut streams, now);
        match streams.remove(&stream_id) {
            None => {
                debug!(%stream_id, "first half parked");
                streams.insert(
                    stream_id,
                    StreamEntry::Waiting(PendingHalf {
                        tx,
                        inbound,
                        parked_at: now,
                    }),
                );
                Ok(rx)
            }
            Some(StreamEntry::Waiting(first)) => {
                info!(%stream_id, "stream paired");
                streams.insert(stream_id, StreamEntry::Paired { since: now });
                tokio::spawn(splice(stream_id, first.inbound, first.tx, inbound, tx));
                Ok(rx)
            }
            Some(paired @ StreamEntry::Paired { .. }) => {
                streams.insert(stream_id, paired);
                Err(Status::failed_precondition("stream id already paired"))
            }
        }
    }
}

/// Forward one frame to the peer. Returns false when the pairing must
/// close: the sender went away, the peer is gone, or the frame was a
/// terminal `RST_STREAM`/`GOAWAY` (which is still delivered first).
async fn forward(frame: Option<Result<StreamRequest, Status>>, peer: &Outbound) -> bool {
    match frame {
        Some(Ok(frame)) => {
            let terminal = matches!(frame.frame_type(), FrameType::RstStream | FrameType::Goaway);
            let delivered = peer
                .send(Ok(StreamResponse {
                    payload: frame.payload,
                    frame_type: frame.frame_type,
                }))
                .await
                .is_ok();
            delivered && !terminal
        }
        Some(Err(_)) | None => false,
    }
}

/// Copy frames between the two halves until either direction closes.
/// Dropping both senders on exit cancels both parties within one tick.
async fn splice(
    stream_id: Uuid,
    mut first_rx: Inbound,
    first_tx: Outbound,
    mut second_rx: Inbound,
    second_tx: Outbound,
) {
    loop {
        tokio::select! {
            frame = first_rx.next() => {
                if !forward(frame, &second_tx).await {
                    break;
                }
            }
            frame = second_rx.next() => {
                if !forward(frame, &first_tx).await {
                    break;
                }
            }
        }
    }
    debug!(%stream_id, "pairing closed");
}

#[tonic::async_trait]
impl RouterService for Router {
    type StreamStream = Pin<Box<dyn Stream<Item = Result<StreamResponse, Status>> + Send>>;

    async fn stream(
        &self,
        request: Request<Streaming<StreamRequest>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let ticket = bearer(&request)?;
        let stream_id = self
            .tokens
            .verify_router_ticket(&ticket)
            .map_err(|_| Status::unauthenticated("invalid router ticket"))?;

        let inbound: Inbound = Box::pin(request.into_inner());
        let rx = self.attach(stream_id, inbound)?;
        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::StreamStream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(bytes: &[u8]) -> StreamRequest {
        StreamRequest {
            payload: bytes.to_vec(),
            frame_type: FrameType::Data as i32,
        }
    }

    fn control(frame_type: FrameType) -> StreamRequest {
        StreamRequest {
            payload: vec![],
            frame_type: frame_type as i32,
        }
    }

    #[derive(Debug)]
    struct Party {
        tx: mpsc::Sender<Result<StreamRequest, Status>>,
        rx: mpsc::Receiver<Result<StreamResponse, Status>>,
    }

    fn connect(router: &Router, stream_id: Uuid) -> Result<Party, Status> {
        let (tx, inbound_rx) = mpsc::channel(8);
        let inbound: Inbound = Box::pin(ReceiverStream::new(inbound_rx));
        let rx = router.attach(stream_id, inbound)?;
        Ok(Party { tx, rx })
    }

    fn router() -> Router {
        Router::new(Arc::new(TokenService::new(
            "https://jumpstarter.example",
            b"controller-secret",
            b"router-secret",
        )))
    }

    #[tokio::test]
    async fn splices_bytes_in_both_directions() {
        let router = router();
        let stream_id = Uuid::new_v4();
        let mut client = connect(&router, stream_id).unwrap();
        let mut exporter = connect(&router, stream_id).unwrap();

        client.tx.send(Ok(data(b"to-exporter"))).await.unwrap();
        exporter.tx.send(Ok(data(b"to-client"))).await.unwrap();

        let at_exporter = exporter.rx.recv().await.unwrap().unwrap();
        assert_eq!(at_exporter.payload, b"to-exporter");
        assert_eq!(at_exporter.frame_type(), FrameType::Data);
        let at_client = client.rx.recv().await.unwrap().unwrap();
        assert_eq!(at_client.payload, b"to-client");
    }

    #[tokio::test]
    async fn preserves_order_within_a_direction() {
        let router = router();
        let stream_id = Uuid::new_v4();
        let client = connect(&router, stream_id).unwrap();
        let mut exporter = connect(&router, stream_id).unwrap();

        for i in 0..10u8 {
            client.tx.send(Ok(data(&[i]))).await.unwrap();
        }
        for i in 0..10u8 {
            let frame = exporter.rx.recv().await.unwrap().unwrap();
            assert_eq!(frame.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn third_arrival_is_rejected() {
        let router = router();
        let stream_id = Uuid::new_v4();
        let _first = connect(&router, stream_id).unwrap();
        let _second = connect(&router, stream_id).unwrap();

        let error = connect(&router, stream_id).unwrap_err();
        assert_eq!(error.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn rst_stream_closes_both_sides_after_delivery() {
        let router = router();
        let stream_id = Uuid::new_v4();
        let mut client = connect(&router, stream_id).unwrap();
        let mut exporter = connect(&router, stream_id).unwrap();

        client.tx.send(Ok(control(FrameType::RstStream))).await.unwrap();

        let frame = exporter.rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.frame_type(), FrameType::RstStream);
        // Both output streams terminate.
        assert!(exporter.rx.recv().await.is_none());
        assert!(client.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn peer_disconnect_cancels_the_other_half() {
        let router = router();
        let stream_id = Uuid::new_v4();
        let client = connect(&router, stream_id).unwrap();
        let mut exporter = connect(&router, stream_id).unwrap();

        drop(client.tx);
        assert!(exporter.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn ping_frames_pass_through() {
        let router = router();
        let stream_id = Uuid::new_v4();
        let client = connect(&router, stream_id).unwrap();
        let mut exporter = connect(&router, stream_id).unwrap();

        client.tx.send(Ok(control(FrameType::Ping))).await.unwrap();
        let frame = exporter.rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.frame_type(), FrameType::Ping);

        // The pairing stays up after a ping.
        client.tx.send(Ok(data(b"after-ping"))).await.unwrap();
        assert_eq!(exporter.rx.recv().await.unwrap().unwrap().payload, b"after-ping");
    }
}
