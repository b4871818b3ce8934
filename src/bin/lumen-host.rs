use lumen_media::encoder::EncoderRegistry;
use lumen_media::Server;

#[tokio::main]
pub async fn main() {
    lumen_log::init();

    // Platform encoder backends register here before the transport plane
    // comes up; the RTSP front-end drives Server::launch once a client
    // completes its handshake.
    let encoders = EncoderRegistry::new();

    match Server::new(encoders).await {
        Ok(server) => server.run().await,
        Err(e) => tracing::error!(error = %e, "failed to start streaming core"),
    }
}
