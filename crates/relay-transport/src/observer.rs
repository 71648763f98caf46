use relay_proto::Packet;

/// Receives lifecycle and data events from a [`crate::channel::PipeChannel`].
///
/// All methods have no-op defaults; implementors only override what they
/// care about. Called from the channel's read thread, so handlers must not
/// block for long.
pub trait PipeChannelObserver: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_data(&self, _data: &[u8]) {}
}

/// Receives decoded packets from a [`crate::client::ProtoClient`].
///
/// This is the seam the bridge multiplexer hangs off: it never touches the
/// wire format, only typed packets.
pub trait ProtoObserver: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_packet(&self, _packet: &Packet) {}
}
