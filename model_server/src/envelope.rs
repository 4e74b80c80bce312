use model_server_proto::{Envelope, Session};
use std::time::Duration;

pub fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

/// Milliseconds with three decimals, e.g. `"12.345"`.
pub fn format_duration(elapsed: Duration) -> String {
    format!("{:.3}", elapsed.as_secs_f64() * 1000.0)
}

pub fn envelope(session: Session, timestamp: String, elapsed: Duration) -> Envelope {
    Envelope {
        session: Some(session),
        model_server_timestamp: timestamp,
        model_server_duration: format_duration(elapsed),
    }
}
