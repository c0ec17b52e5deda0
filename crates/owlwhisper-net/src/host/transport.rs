use libp2p::{
    core::muxing::StreamMuxerBox,
    core::transport::{OrTransport, Transport},
    core::upgrade,
    identity::Keypair,
    noise, quic, relay, tcp, tls, websocket, webrtc, yamux, PeerId
};

use crate::config::NodeConfig;

pub(crate) type BoxedTransport =
    libp2p::core::transport::Boxed<(PeerId, StreamMuxerBox)>;

/// Composes the enabled transports into one boxed transport, per spec.md
/// 4.5: TCP (+ WS) and QUIC and WebRTC-direct, each independently
/// toggleable, secured with both Noise and TLS (the responder accepts
/// either) and multiplexed with yamux.
pub(crate) fn build_transport(
    keypair: &Keypair,
    config: &NodeConfig,
    relay_transport: Option<relay::client::Transport>
) -> Result<BoxedTransport, Box<dyn std::error::Error + Send + Sync>> {
    let security = upgrade::SelectUpgrade::new(
        noise::Config::new(keypair)?,
        tls::Config::new(keypair)?
    );

    let mut transport: Option<BoxedTransport> = None;

    if config.enable_tcp {
        let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
        let tcp_transport = if config.enable_websocket {
            OrTransport::new(websocket::WsConfig::new(tcp_transport.clone()), tcp_transport)
                .boxed()
        } else {
            tcp_transport.boxed()
        };
        let tcp_transport = tcp_transport
            .upgrade(upgrade::Version::V1Lazy)
            .authenticate(security.clone())
            .multiplex(yamux::Config::default())
            .boxed();
        transport = Some(combine(transport, tcp_transport));
    }

    if config.enable_quic {
        let quic_transport = quic::tokio::Transport::new(quic::Config::new(keypair))
            .map(|(peer_id, conn), _| (peer_id, StreamMuxerBox::new(conn)))
            .boxed();
        transport = Some(combine(transport, quic_transport));
    }

    if config.enable_webrtc {
        let mut rng = rand::thread_rng();
        let cert = webrtc::tokio::Certificate::generate(&mut rng)?;
        let webrtc_transport = webrtc::tokio::Transport::new(keypair.clone(), cert)
            .map(|(peer_id, conn), _| (peer_id, StreamMuxerBox::new(conn)))
            .boxed();
        transport = Some(combine(transport, webrtc_transport));
    }

    if let Some(relay_transport) = relay_transport {
        let relay_transport = relay_transport
            .upgrade(upgrade::Version::V1Lazy)
            .authenticate(security)
            .multiplex(yamux::Config::default())
            .boxed();
        transport = Some(combine(transport, relay_transport));
    }

    transport.ok_or_else(|| "no transport enabled in NodeConfig".into())
}

fn combine(existing: Option<BoxedTransport>, next: BoxedTransport) -> BoxedTransport {
    match existing {
        Some(existing) => OrTransport::new(existing, next).boxed(),
        None => next
    }
}
