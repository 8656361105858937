//! Metric names shared by the lifecycle manager and the transport.
//!
//! Recording goes through the `metrics` facade; installing a recorder is
//! left to the hosting process.

/// Connections admitted (counter, labels: endpoint).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections refused at the ceiling (counter, labels: endpoint).
pub const WS_ADMISSION_REJECTED_TOTAL: &str = "ws_admission_rejected_total";
/// Connections closed by the handshake sweep (counter, labels: endpoint).
pub const WS_HANDSHAKE_TIMEOUTS_TOTAL: &str = "ws_handshake_timeouts_total";
/// Failed callback dispatches (counter, labels: endpoint, lifecycle).
pub const WS_DISPATCH_ERRORS_TOTAL: &str = "ws_dispatch_errors_total";
/// Connections removed (counter, labels: endpoint).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge, labels: endpoint).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime in seconds (histogram, labels: endpoint).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Failed `accept` calls on the listener (counter, labels: endpoint).
pub const WS_ACCEPT_ERRORS_TOTAL: &str = "ws_accept_errors_total";
/// Transport faults by kind (counter, labels: endpoint, kind).
pub const WS_TRANSPORT_FAULTS_TOTAL: &str = "ws_transport_faults_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_ADMISSION_REJECTED_TOTAL,
            WS_HANDSHAKE_TIMEOUTS_TOTAL,
            WS_DISPATCH_ERRORS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_ACCEPT_ERRORS_TOTAL,
            WS_TRANSPORT_FAULTS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
            assert!(name.starts_with("ws_"));
        }
    }
}
