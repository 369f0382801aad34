use crate::packet::Packet;

/// Seam between the service layer and the datagram plumbing underneath it.
/// Implementations own socket management, retransmission and flow control;
/// the service layer only hands over ready-made packets.
pub trait Transport: Send + Sync {
    fn send_packets(&self, packets: &[Packet]) -> anyhow::Result<()>;
}
