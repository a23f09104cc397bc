//! WebRTC transport: one Opus audio track each way plus a "control" data
//! channel carrying the JSON control events. Signaling is offer/answer SDP
//! exchanged out of band (the HTTP layer).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use dhwani_core::AudioFrame;

use crate::codec::{OpusDecoder, OpusEncoder};
use crate::traits::{ControlEvent, Transport};
use crate::TransportError;

#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceServer {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::default()],
        }
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 1,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Server-side WebRTC endpoint for one session.
pub struct WebRtcTransport {
    peer: Arc<RTCPeerConnection>,
    outbound_track: Arc<TrackLocalStaticSample>,
    encoder: OpusEncoder,
    inbound_audio: AsyncMutex<mpsc::Receiver<AudioFrame>>,
    inbound_events: AsyncMutex<mpsc::Receiver<ControlEvent>>,
    control_channel: Arc<RTCDataChannel>,
    frame_sequence: AtomicU64,
}

impl WebRtcTransport {
    /// Accept a client offer; returns the answer SDP once the local
    /// description is set.
    pub async fn accept(config: &WebRtcConfig, offer_sdp: &str) -> Result<Arc<Self>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    stats_id: String::new(),
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
        );

        peer.on_peer_connection_state_change(Box::new(|state: RTCPeerConnectionState| {
            tracing::debug!(?state, "peer connection state");
            Box::pin(async {})
        }));

        // Outbound audio track.
        let outbound_track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_string(),
            "dhwani".to_string(),
        ));
        peer.add_track(outbound_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Media(format!("add track: {}", e)))?;

        // Inbound audio: decode RTP payloads into pipeline frames.
        let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(256);
        peer.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let audio_tx = audio_tx.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                let decoder = match OpusDecoder::new() {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        tracing::error!("opus decoder init failed: {}", e);
                        return;
                    }
                };
                let mut sequence = 0u64;
                let mut ts_us = 0u64;
                while let Ok((packet, _)) = track.read_rtp().await {
                    match decoder.decode(&packet.payload, sequence, ts_us) {
                        Ok(frame) => {
                            ts_us += frame.duration_ms() * 1000;
                            sequence += 1;
                            if audio_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("opus packet dropped: {}", e);
                        }
                    }
                }
            })
        }));

        // Control data channel.
        let control_channel = peer
            .create_data_channel("control", None)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("data channel: {}", e)))?;

        let (event_tx, event_rx) = mpsc::channel::<ControlEvent>(64);
        control_channel.on_message(Box::new(move |message: DataChannelMessage| {
            let event_tx = event_tx.clone();
            Box::pin(async move {
                if let Ok(event) = serde_json::from_slice::<ControlEvent>(&message.data) {
                    let _ = event_tx.send(event).await;
                }
            })
        }));

        // Offer/answer exchange.
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| TransportError::ConnectionFailed(format!("bad offer: {}", e)))?;
        peer.set_remote_description(offer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let answer = peer
            .create_answer(None)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        peer.set_local_description(answer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Arc::new(Self {
            peer,
            outbound_track,
            encoder: OpusEncoder::new()?,
            inbound_audio: AsyncMutex::new(audio_rx),
            inbound_events: AsyncMutex::new(event_rx),
            control_channel,
            frame_sequence: AtomicU64::new(0),
        }))
    }

    /// The answer SDP set during `accept`.
    pub async fn answer_sdp(&self) -> Option<String> {
        self.peer.local_description().await.map(|d| d.sdp)
    }

    pub async fn close(&self) {
        let _ = self.peer.close().await;
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        self.frame_sequence.fetch_add(1, Ordering::Relaxed);
        for packet in self.encoder.encode(frame)? {
            let sample = Sample {
                data: packet.into(),
                duration: std::time::Duration::from_millis(20),
                ..Default::default()
            };
            self.outbound_track
                .write_sample(&sample)
                .await
                .map_err(|e| TransportError::Media(format!("write sample: {}", e)))?;
        }
        Ok(())
    }

    async fn recv_audio(&self) -> Result<Option<AudioFrame>, TransportError> {
        Ok(self.inbound_audio.lock().await.recv().await)
    }

    async fn send_event(&self, event: &ControlEvent) -> Result<(), TransportError> {
        let json = serde_json::to_string(event)
            .map_err(|e| TransportError::Internal(e.to_string()))?;
        self.control_channel
            .send_text(json)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("send event: {}", e)))?;
        Ok(())
    }

    async fn recv_event(&self) -> Result<Option<ControlEvent>, TransportError> {
        Ok(self.inbound_events.lock().await.recv().await)
    }
}
