use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use vesper_realtime::channel::client::RealtimeChannelClient;
use vesper_realtime::channel::registry::{ClientEvent, EventKey};

fn main() -> Result<(), Box<dyn Error>> {
    let server_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:4000/socket/websocket".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RealtimeChannelClient::new();

        let (connected_tx, mut connected_rx) = tokio::sync::mpsc::unbounded_channel();
        client.add_callbacks(
            EventKey::Connect,
            Arc::new(move |_event: &ClientEvent| {
                let _ = connected_tx.send(());
            }),
        );
        client.add_callbacks(
            EventKey::Event("transcription_result".to_string()),
            Arc::new(|event: &ClientEvent| {
                if let ClientEvent::Push { frame } = event {
                    println!("transcription: {}", frame.payload);
                }
            }),
        );

        client.connect(server_url);
        connected_rx.recv().await;

        let joined = client.join_channel("prayer:stream").await?;
        println!("joined prayer:stream: {}", joined.response);

        let reply = client
            .send_to_channel(
                "prayer:stream",
                "audio:transcribe",
                json!({"audio": "REPLACE_WITH_BASE64_AUDIO"}),
            )
            .await?;
        println!("transcribe accepted: {}", reply.response);

        tokio::time::sleep(Duration::from_secs(30)).await;
        client.disconnect();

        Ok::<(), Box<dyn Error>>(())
    })
}
