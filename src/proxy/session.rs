//! One proxied client connection
//!
//! Two loops share a [`Session`]: client→broker swaps tokens for real topics (and opens
//! sealed payloads), broker→client swaps real topics back to the token the client
//! subscribed with (and seals payloads). Whichever loop stops first tears down both.

use super::packet::{
    assemble_publish, assemble_subscribe, is_token_candidate, split_publish, split_subscribe,
};
use super::ProxyError;
use crate::aead::AeadKey;
use crate::auth::{AccessType, Token};
use crate::server::TokenVerifier;
use crate::wire::mqtt::{protocol_level, Frame, PacketType};
use crate::wire::{write_all_timeout, VerifiedKey, VerifierRequest, VerifierResponse, WireError};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Per read/write deadline on both connections
    pub timeout: Duration,
    /// How long either side may stay silent between frames
    pub idle_timeout: Duration,
    pub max_frame: usize,
}

struct AeadContext {
    key: AeadKey,
    /// Nonce input for the next sealed publish
    seq: u64,
}

/// A real topic the client only knows by its subscription token
struct HiddenTopic {
    alias: Vec<u8>,
    aead: Option<AeadContext>,
}

#[derive(Default)]
struct SessionState {
    protocol_level: Option<u8>,
    /// Keyed by real topic
    hidden: HashMap<Vec<u8>, HiddenTopic>,
}

pub struct Session {
    verifier: Arc<dyn TokenVerifier>,
    settings: SessionSettings,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(verifier: Arc<dyn TokenVerifier>, settings: SessionSettings) -> Self {
        Self {
            verifier,
            settings,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Relay until either side closes or fails
    pub async fn relay<C, B>(&self, client: C, broker: B) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        B: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let (mut broker_rx, mut broker_tx) = tokio::io::split(broker);

        tokio::select! {
            result = self.client_to_broker(&mut client_rx, &mut broker_tx) => result,
            result = self.broker_to_client(&mut broker_rx, &mut client_tx) => result,
        }
    }

    async fn client_to_broker<R, W>(&self, from: &mut R, to: &mut W) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let frame = match self.read_frame(from).await {
                Ok(frame) => frame,
                Err(e) if e.is_closed() => {
                    debug!("Client closed connection");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let frame = self.rewrite_upstream(frame).await?;
            write_all_timeout(to, &frame.encode()?, self.settings.timeout).await?;
        }
    }

    async fn broker_to_client<R, W>(&self, from: &mut R, to: &mut W) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let frame = match self.read_frame(from).await {
                Ok(frame) => frame,
                Err(e) if e.is_closed() => {
                    debug!("Broker closed connection");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let frame = self.rewrite_downstream(frame)?;
            write_all_timeout(to, &frame.encode()?, self.settings.timeout).await?;
        }
    }

    async fn read_frame<R>(&self, from: &mut R) -> Result<Frame, WireError>
    where
        R: AsyncRead + Unpin,
    {
        let settings = &self.settings;
        Frame::read_after_idle(from, settings.max_frame, settings.idle_timeout, settings.timeout).await
    }

    /// Rewrite a frame travelling from the client to the broker
    pub async fn rewrite_upstream(&self, frame: Frame) -> Result<Frame, ProxyError> {
        match frame.packet_type {
            PacketType::Connect => {
                let level = protocol_level(&frame.body)?;
                debug!(level, "Client CONNECT");
                self.state.lock().protocol_level = Some(level);
                Ok(frame)
            }
            PacketType::Publish => self.rewrite_client_publish(frame).await,
            PacketType::Subscribe => self.rewrite_subscribe(frame).await,
            _ => Ok(frame),
        }
    }

    /// Rewrite a frame travelling from the broker to the client
    pub fn rewrite_downstream(&self, frame: Frame) -> Result<Frame, ProxyError> {
        if frame.packet_type != PacketType::Publish {
            return Ok(frame);
        }

        let mut state = self.state.lock();
        let level = state.protocol_level.ok_or(ProxyError::NotConnected(frame.packet_type))?;
        let parts = split_publish(&frame.body, level, frame.qos())?;
        let Some(hidden) = state.hidden.get_mut(parts.topic) else {
            return Ok(frame);
        };

        let payload = match hidden.aead.as_mut() {
            Some(ctx) => {
                let sealed = ctx.key.seal(parts.payload, ctx.seq)?;
                ctx.seq += 1;
                Cow::Owned(sealed)
            }
            None => Cow::Borrowed(parts.payload),
        };
        let body = assemble_publish(&hidden.alias, parts.between, &payload)?;
        Ok(Frame::new(PacketType::Publish, frame.flags, body))
    }

    async fn rewrite_client_publish(&self, frame: Frame) -> Result<Frame, ProxyError> {
        let level = self.level(frame.packet_type)?;
        let parts = split_publish(&frame.body, level, frame.qos())?;
        if !is_token_candidate(parts.topic) {
            return Ok(frame);
        }

        let (topic, key) = self.verify(AccessType::Publish, parts.topic).await?;
        let payload = match &key {
            Some(k) => Cow::Owned(k.key.open(parts.payload, u64::from(k.index))?),
            None => Cow::Borrowed(parts.payload),
        };
        let body = assemble_publish(&topic, parts.between, &payload)?;
        Ok(Frame::new(PacketType::Publish, frame.flags, body))
    }

    async fn rewrite_subscribe(&self, frame: Frame) -> Result<Frame, ProxyError> {
        let level = self.level(frame.packet_type)?;
        let parts = split_subscribe(&frame.body, level)?;

        let mut filters = Vec::with_capacity(parts.filters.len());
        for &(filter, options) in &parts.filters {
            if !is_token_candidate(filter) {
                filters.push((filter.to_vec(), options));
                continue;
            }
            let (topic, key) = self.verify(AccessType::Subscribe, filter).await?;
            {
                let mut state = self.state.lock();
                let previous_seq = state
                    .hidden
                    .get(&topic)
                    .and_then(|h| h.aead.as_ref())
                    .map_or(0, |ctx| ctx.seq);
                let aead = key.map(|k| AeadContext {
                    key: k.key,
                    seq: previous_seq,
                });
                state.hidden.insert(
                    topic.clone(),
                    HiddenTopic {
                        alias: filter.to_vec(),
                        aead,
                    },
                );
            }
            filters.push((topic, options));
        }

        let body = assemble_subscribe(parts.before, &filters, parts.after)?;
        Ok(Frame::new(PacketType::Subscribe, frame.flags, body))
    }

    async fn verify(
        &self,
        access: AccessType,
        token_text: &[u8],
    ) -> Result<(Vec<u8>, Option<VerifiedKey>), ProxyError> {
        let token = Token::from_base64(token_text)?;
        let response = self
            .verifier
            .verify(&VerifierRequest::new(access, token))
            .await
            .map_err(ProxyError::Verifier)?;
        match response {
            VerifierResponse::Success {
                reload_needed,
                key,
                topic,
            } => {
                debug!(
                    access = %access,
                    topic = %String::from_utf8_lossy(&topic),
                    reload_needed,
                    "Token exchanged"
                );
                Ok((topic, key))
            }
            rejected => {
                info!(access = %access, code = ?rejected.code(), "Token rejected");
                Err(ProxyError::Rejected {
                    access,
                    code: rejected.code(),
                })
            }
        }
    }

    fn level(&self, packet_type: PacketType) -> Result<u8, ProxyError> {
        self.state
            .lock()
            .protocol_level
            .ok_or(ProxyError::NotConnected(packet_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::AeadType;
    use crate::auth::Secret;
    use crate::wire::ResultCode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOKEN_TEXT: &str = "AAAAAAAqBwcHBwcH";

    struct MockVerifier {
        calls: AtomicUsize,
        response: VerifierResponse,
    }

    impl MockVerifier {
        fn new(response: VerifierResponse) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response,
            })
        }
    }

    #[async_trait]
    impl TokenVerifier for MockVerifier {
        async fn verify(&self, _: &VerifierRequest) -> Result<VerifierResponse, WireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
            max_frame: 65536,
        }
    }

    fn connect(level: u8) -> Frame {
        Frame::new(
            PacketType::Connect,
            0,
            vec![0, 4, b'M', b'Q', b'T', b'T', level, 0x02, 0, 60, 0, 0],
        )
    }

    fn publish(topic: &[u8], payload: &[u8]) -> Frame {
        Frame::new(PacketType::Publish, 0, assemble_publish(topic, &[], payload).unwrap())
    }

    fn subscribe(filter: &[u8]) -> Frame {
        Frame::new(
            PacketType::Subscribe,
            0x02,
            assemble_subscribe(&[0, 1], &[(filter, 0x01)], &[]).unwrap(),
        )
    }

    fn success(topic: &str, key: Option<VerifiedKey>) -> VerifierResponse {
        VerifierResponse::Success {
            reload_needed: false,
            key,
            topic: topic.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_token_text_fixture_decodes() {
        let token = Token::from_base64(TOKEN_TEXT.as_bytes()).unwrap();
        assert_eq!(token.secret(), &Secret::new([7; 6]));
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_rejected() {
        let verifier = MockVerifier::new(success("t", None));
        let session = Session::new(verifier.clone(), settings());
        let err = session
            .rewrite_upstream(publish(TOKEN_TEXT.as_bytes(), b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotConnected(PacketType::Publish)));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_plain_topic_passes_without_verification() {
        let verifier = MockVerifier::new(success("t", None));
        let session = Session::new(verifier.clone(), settings());
        session.rewrite_upstream(connect(4)).await.unwrap();

        let frame = publish(b"sensors/temp1", b"21.5");
        let out = session.rewrite_upstream(frame.clone()).await.unwrap();
        assert_eq!(out, frame);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_token_replaced_by_real_topic() {
        let verifier = MockVerifier::new(success("sensors/temp", None));
        let session = Session::new(verifier.clone(), settings());
        session.rewrite_upstream(connect(4)).await.unwrap();

        let out = session
            .rewrite_upstream(publish(TOKEN_TEXT.as_bytes(), b"21.5"))
            .await
            .unwrap();
        let parts = split_publish(&out.body, 4, 0).unwrap();
        assert_eq!(parts.topic, b"sensors/temp");
        assert_eq!(parts.payload, b"21.5");
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_payload_opened_with_token_index() {
        let key = AeadKey::generate(AeadType::ChaCha20Poly1305).unwrap();
        let sealed = key.seal(b"secret reading", 3).unwrap();
        let verifier = MockVerifier::new(success(
            "sensors/temp",
            Some(VerifiedKey {
                index: 3,
                key: key.clone(),
            }),
        ));
        let session = Session::new(verifier, settings());
        session.rewrite_upstream(connect(4)).await.unwrap();

        let out = session
            .rewrite_upstream(publish(TOKEN_TEXT.as_bytes(), &sealed))
            .await
            .unwrap();
        let parts = split_publish(&out.body, 4, 0).unwrap();
        assert_eq!(parts.payload, b"secret reading");
    }

    #[tokio::test]
    async fn test_rejected_token_aborts() {
        let verifier = MockVerifier::new(VerifierResponse::Fail);
        let session = Session::new(verifier, settings());
        session.rewrite_upstream(connect(4)).await.unwrap();

        let err = session
            .rewrite_upstream(publish(TOKEN_TEXT.as_bytes(), b"x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Rejected {
                access: AccessType::Publish,
                code: ResultCode::Fail
            }
        ));
    }

    #[tokio::test]
    async fn test_undecodable_aligned_topic_aborts() {
        let verifier = MockVerifier::new(success("t", None));
        let session = Session::new(verifier.clone(), settings());
        session.rewrite_upstream(connect(4)).await.unwrap();

        let err = session
            .rewrite_upstream(publish(b"a/b/c/d/", b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Token(_)));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribe_hides_topic_and_seals_downstream() {
        let key = AeadKey::generate(AeadType::Aes128Gcm).unwrap();
        let verifier = MockVerifier::new(success(
            "sensors/temp",
            Some(VerifiedKey {
                index: 0,
                key: key.clone(),
            }),
        ));
        let session = Session::new(verifier, settings());
        session.rewrite_upstream(connect(5)).await.unwrap();

        let out = session
            .rewrite_upstream(Frame::new(
                PacketType::Subscribe,
                0x02,
                assemble_subscribe(&[0, 1, 0], &[(TOKEN_TEXT.as_bytes(), 0x01)], &[]).unwrap(),
            ))
            .await
            .unwrap();
        let parts = split_subscribe(&out.body, 5).unwrap();
        assert_eq!(parts.before, &[0, 1, 0]);
        assert_eq!(parts.filters, vec![(&b"sensors/temp"[..], 0x01)]);

        // broker -> client, v5 publish with an empty properties block
        for seq in 0..3u64 {
            let body = assemble_publish(b"sensors/temp", &[0], b"21.5").unwrap();
            let down = session
                .rewrite_downstream(Frame::new(PacketType::Publish, 0, body))
                .unwrap();
            let parts = split_publish(&down.body, 5, 0).unwrap();
            assert_eq!(parts.topic, TOKEN_TEXT.as_bytes());
            assert_eq!(parts.between, &[0]);
            assert_eq!(key.open(parts.payload, seq).unwrap(), b"21.5");
        }
    }

    /// Answers each call with the next scripted response
    struct ScriptedVerifier {
        responses: Mutex<std::collections::VecDeque<VerifierResponse>>,
    }

    #[async_trait]
    impl TokenVerifier for ScriptedVerifier {
        async fn verify(&self, _: &VerifierRequest) -> Result<VerifierResponse, WireError> {
            Ok(self
                .responses
                .lock()
                .pop_front()
                .unwrap_or(VerifierResponse::Fail))
        }
    }

    #[tokio::test]
    async fn test_each_hidden_topic_keeps_its_own_key() {
        const DOOR_TOKEN: &str = "AAAAAAArCAgICAgI";
        let key = AeadKey::generate(AeadType::Aes256Gcm).unwrap();
        let verifier = Arc::new(ScriptedVerifier {
            responses: Mutex::new(
                vec![
                    success(
                        "sensors/temp",
                        Some(VerifiedKey {
                            index: 0,
                            key: key.clone(),
                        }),
                    ),
                    success("sensors/door", None),
                ]
                .into(),
            ),
        });
        let session = Session::new(verifier, settings());
        session.rewrite_upstream(connect(4)).await.unwrap();
        session
            .rewrite_upstream(subscribe(TOKEN_TEXT.as_bytes()))
            .await
            .unwrap();
        session
            .rewrite_upstream(subscribe(DOOR_TOKEN.as_bytes()))
            .await
            .unwrap();

        let door = session
            .rewrite_downstream(publish(b"sensors/door", b"open"))
            .unwrap();
        let parts = split_publish(&door.body, 4, 0).unwrap();
        assert_eq!(parts.topic, DOOR_TOKEN.as_bytes());
        assert_eq!(parts.payload, b"open");

        let temp = session
            .rewrite_downstream(publish(b"sensors/temp", b"21.5"))
            .unwrap();
        let parts = split_publish(&temp.body, 4, 0).unwrap();
        assert_eq!(parts.topic, TOKEN_TEXT.as_bytes());
        assert_eq!(key.open(parts.payload, 0).unwrap(), b"21.5");
    }

    #[tokio::test]
    async fn test_silent_session_is_torn_down() {
        let verifier = MockVerifier::new(success("t", None));
        let session = Session::new(
            verifier,
            SessionSettings {
                idle_timeout: Duration::from_millis(50),
                ..settings()
            },
        );
        let (_client, proxy_client) = tokio::io::duplex(64);
        let (proxy_broker, _broker) = tokio::io::duplex(64);

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            session.relay(proxy_client, proxy_broker),
        )
        .await
        .expect("relay should stop once the idle timeout passes");
        assert!(matches!(result, Err(ProxyError::Wire(WireError::Timeout(_)))));
    }

    #[tokio::test]
    async fn test_unrelated_downstream_publish_untouched() {
        let verifier = MockVerifier::new(success("sensors/temp", None));
        let session = Session::new(verifier, settings());
        session.rewrite_upstream(connect(4)).await.unwrap();
        session
            .rewrite_upstream(subscribe(TOKEN_TEXT.as_bytes()))
            .await
            .unwrap();

        let frame = publish(b"other/topic", b"x");
        assert_eq!(session.rewrite_downstream(frame.clone()).unwrap(), frame);

        let hidden = session
            .rewrite_downstream(publish(b"sensors/temp", b"x"))
            .unwrap();
        let parts = split_publish(&hidden.body, 4, 0).unwrap();
        assert_eq!(parts.topic, TOKEN_TEXT.as_bytes());
        assert_eq!(parts.payload, b"x");
    }

    #[tokio::test]
    async fn test_non_mqtt_frames_pass_through() {
        let verifier = MockVerifier::new(success("t", None));
        let session = Session::new(verifier.clone(), settings());
        let ping = Frame::new(PacketType::Pingreq, 0, Vec::new());
        assert_eq!(session.rewrite_upstream(ping.clone()).await.unwrap(), ping);
        assert_eq!(session.rewrite_downstream(ping.clone()).unwrap(), ping);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_relay_forwards_and_stops_when_client_closes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let verifier = MockVerifier::new(success("sensors/temp", None));
        let session = Session::new(verifier, settings());
        let (mut client, proxy_client) = tokio::io::duplex(4096);
        let (proxy_broker, mut broker) = tokio::io::duplex(4096);

        let relay = tokio::spawn(async move { session.relay(proxy_client, proxy_broker).await });

        let connect_bytes = connect(4).encode().unwrap();
        let publish_bytes = publish(TOKEN_TEXT.as_bytes(), b"hi").encode().unwrap();
        client.write_all(&connect_bytes).await.unwrap();
        client.write_all(&publish_bytes).await.unwrap();

        let mut got = vec![0u8; connect_bytes.len()];
        broker.read_exact(&mut got).await.unwrap();
        assert_eq!(got, connect_bytes);
        let frame = Frame::read_from(&mut broker, 1024, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(split_publish(&frame.body, 4, 0).unwrap().topic, b"sensors/temp");

        drop(client);
        assert!(relay.await.unwrap().is_ok());
    }
}
