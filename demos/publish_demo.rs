//! Publish a synthetic test pattern to an RTMP ingest.
//!
//! Usage: publish_demo rtmp://localhost/live/streamKey
//!
//! Sends the command handshake, stream metadata and a short run of
//! dummy video frames. Point it at nginx-rtmp to watch the exchange;
//! the "frames" are not decodable video, this demonstrates the
//! protocol path only.

use rtmp_publish::{AmfObject, ClientConfig, PublishClient, SessionEvent};

// A plausible-looking SPS/PPS pair for the config record
const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50];
const PPS: &[u8] = &[0x68, 0xEB, 0xE3, 0xCB, 0x22, 0xC0];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtmp_publish=debug".into()),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "rtmp://localhost/live/test".to_string());
    let config = ClientConfig::from_url(&url).ok_or("invalid RTMP URL")?;

    let (client, mut events) = PublishClient::launch(config)?;

    while let Some(event) = events.recv().await {
        println!("event: {:?}", event);
        match event {
            SessionEvent::ConnectedToApp => {
                client.begin_publishing().await?;
            }
            SessionEvent::PublisherReady => {
                let meta = AmfObject::new()
                    .with("width", 1280.0)
                    .with("height", 720.0)
                    .with("framerate", 30.0)
                    .with("videocodecid", 7.0);
                client.write_data_frame(meta).await?;
                client
                    .write_avc_config_record(SPS.to_vec(), PPS.to_vec())
                    .await?;

                for i in 0..90u32 {
                    let keyframe = i % 30 == 0;
                    let header = vec![if keyframe { 0x17 } else { 0x27 }, 0x01, 0, 0, 0];
                    let nal = vec![if keyframe { 0x65 } else { 0x41 }; 512];
                    client
                        .write_video_frame(i * 33, header, vec![nal])
                        .await?;
                }

                client.finish_publishing().await?;
                client.disconnect(true).await?;
            }
            SessionEvent::Error(kind) => {
                eprintln!("error: {}", kind);
            }
            SessionEvent::Disconnected => break,
            _ => {}
        }
    }
    Ok(())
}
