use futures::StreamExt;

use coap_exchange::CoAPClient;

#[tokio::main]
async fn main() {
    let url = "127.0.0.1:5683";
    println!("Client request: coap://{}/hello", url);

    let client = CoAPClient::new_udp(url).await.unwrap();
    let response = client.get("hello").await.unwrap();
    println!("Server reply: {}", String::from_utf8_lossy(&response.message.payload));

    let response = client.put("notes", b"remember the milk".to_vec()).await.unwrap();
    println!("PUT notes: {:?}", response.get_status());

    let discovery = client.get(".well-known/core").await.unwrap();
    println!("Resources: {}", String::from_utf8_lossy(&discovery.message.payload));

    let mut ticks = client.observe("ticks").await.unwrap();
    for _ in 0..3 {
        match ticks.next().await {
            Some(notification) => {
                println!("ticks = {}", String::from_utf8_lossy(&notification.message.payload))
            }
            None => break,
        }
    }
    client.unobserve(ticks).await.unwrap();
}
