use mqtt_reactor_client::{ClientEvent, ConnectionOptions, MqttClient, MqttError};

#[tokio::main]
async fn main() -> Result<(), MqttError> {
    tracing_subscriber::fmt().init();

    let options = ConnectionOptions::new()
        .with_client_id("mqtt-reactor-demo")
        .with_keep_alive(60);
    let (connection, mut events) = MqttClient::connect("127.0.0.1", 1883, options).await?;
    println!("connected");

    connection.subscribe("foo/bar", 0).await?;
    println!("subscribed to foo/bar");

    connection
        .publish("foo/bar", &b"Hello, MQTT!"[..], 1, false, false)
        .await?;
    println!("published to foo/bar");

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Publish(message) => {
                println!(
                    "{} (qos {}): {}",
                    message.topic,
                    message.qos,
                    String::from_utf8_lossy(&message.payload)
                );
            }
            ClientEvent::Fault(e) => {
                eprintln!("connection fault: {}", e);
                break;
            }
            ClientEvent::Closed => {
                println!("connection closed");
                break;
            }
        }
    }

    Ok(())
}
