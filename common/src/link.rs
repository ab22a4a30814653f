//! Broker connection state seen by the publishing loop.
//!
//! Both MQTT stacks reconnect on their own if left alone. The station does
//! not retry: the first disconnect or connection error ends the loop.

use crate::error::StationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Error(String),
    /// Any other traffic (acks, pings, outgoing packets).
    Activity,
}

#[derive(Debug, Default)]
pub struct LinkMonitor {
    connected: bool,
}

impl LinkMonitor {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn observe(&mut self, event: LinkEvent) -> Result<(), StationError> {
        match event {
            LinkEvent::Connected => {
                self.connected = true;
                Ok(())
            }
            LinkEvent::Activity => Ok(()),
            LinkEvent::Disconnected => {
                let message = if self.connected {
                    "broker closed the connection"
                } else {
                    "broker connection failed before CONNACK"
                };
                self.connected = false;
                Err(StationError::Transport(message.to_string()))
            }
            LinkEvent::Error(message) => {
                self.connected = false;
                Err(StationError::Transport(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoopControl;

    #[test]
    fn traffic_keeps_the_link_up() {
        let mut link = LinkMonitor::default();
        assert!(link.observe(LinkEvent::Connected).is_ok());
        assert!(link.observe(LinkEvent::Activity).is_ok());
        assert!(link.is_connected());
    }

    #[test]
    fn disconnect_after_connack_terminates() {
        let mut link = LinkMonitor::default();
        link.observe(LinkEvent::Connected).unwrap();

        let err = link.observe(LinkEvent::Disconnected).unwrap_err();

        assert_eq!(err.control(), LoopControl::Terminate);
        assert_eq!(
            err.to_string(),
            "transport failure: broker closed the connection"
        );
        assert!(!link.is_connected());
    }

    #[test]
    fn error_before_connack_terminates() {
        let mut link = LinkMonitor::default();

        let err = link
            .observe(LinkEvent::Error("connection refused".to_string()))
            .unwrap_err();

        assert!(matches!(err, StationError::Transport(ref m) if m == "connection refused"));
    }

    #[test]
    fn disconnect_without_connack_is_reported() {
        let mut link = LinkMonitor::default();
        let err = link.observe(LinkEvent::Disconnected).unwrap_err();
        assert!(err.to_string().contains("before CONNACK"));
    }
}
