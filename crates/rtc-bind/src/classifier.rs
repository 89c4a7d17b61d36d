/// Tells the bind which datagrams may open a session.
///
/// Only an initiation may start an outbound connection, and only a response
/// may answer an inbound offer; everything else needs an open data channel.
pub trait PacketClassifier: Send + Sync {
    fn is_initiation(&self, payload: &[u8]) -> bool;

    fn is_response(&self, payload: &[u8]) -> bool;
}

/// WireGuard message types: 1 is a handshake initiation, 2 a handshake
/// response.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireGuardClassifier;

const MESSAGE_INITIATION: u8 = 1;
const MESSAGE_RESPONSE: u8 = 2;

impl PacketClassifier for WireGuardClassifier {
    fn is_initiation(&self, payload: &[u8]) -> bool {
        payload.first() == Some(&MESSAGE_INITIATION)
    }

    fn is_response(&self, payload: &[u8]) -> bool {
        payload.first() == Some(&MESSAGE_RESPONSE)
    }
}
