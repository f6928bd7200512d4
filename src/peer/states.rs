/// Where a connection is in its life cycle, as the session sees it.
///
/// `Choked` and `Unchoked` describe whether the remote lets us download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Handshaking,
    Connected,
    Choked,
    Unchoked,
    Disconnected,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Choked | ConnectionState::Unchoked
        )
    }

    pub fn can_request(&self) -> bool {
        *self == ConnectionState::Unchoked
    }
}
