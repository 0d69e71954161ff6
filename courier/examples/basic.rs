//! Queue a few emails against the log mailer and print lifecycle events.
//!
//! ```sh
//! cargo run -p courier --example basic
//! ```

use courier::mail::LogMailer;
use courier::templates::NotificationVars;
use courier::{CourierConfig, EmailService};

#[tokio::main]
async fn main() -> courier::Result<()> {
    let config = CourierConfig {
        app_name: "Playdoo".into(),
        poll_interval_ms: 50,
        ..CourierConfig::load()?
    };
    let service = EmailService::in_memory(config, LogMailer);
    let mut events = service.subscribe();

    let ids = vec![
        service
            .send_otp("ada@example.com", "Ada", "123456", "10 minutes")
            .await?,
        service
            .send_welcome("grace@example.com", "Grace", "https://playdoo.app/home")
            .await?,
        service
            .send_notification(
                "ada@example.com",
                NotificationVars {
                    name: "Ada".into(),
                    title: "Court 3 is open again".into(),
                    message: "Maintenance finished early.".into(),
                    action_url: Some("https://playdoo.app/courts/3".into()),
                    action_label: None,
                    app_name: String::new(),
                },
            )
            .await?,
    ];

    let mut remaining = ids.len();
    while remaining > 0 {
        let Ok(event) = events.recv().await else {
            break;
        };
        println!("{}", serde_json::to_string(&event).unwrap_or_default());
        if matches!(event.name(), "job:completed" | "job:failed") {
            remaining -= 1;
        }
    }

    println!("{:?}", service.metrics().await?);
    service.close().await;
    Ok(())
}
