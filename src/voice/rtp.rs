use super::constants::{
    MAX_CONCEALED_FRAMES, RESYNC_BACKWARD_THRESHOLD, RTP_HEADER_LEN, RTP_OPUS_PAYLOAD_TYPE,
    RTP_VERSION_BYTE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION_BYTE;
        header[1] = RTP_OPUS_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }
}

/// Layout of an inbound RTP packet, read from its unencrypted prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    /// Fixed header plus CSRC list.
    pub header_len: usize,
    pub has_extension: bool,
}

impl RtpPacket {
    /// Returns `None` for anything that is not an RTP version 2 packet
    /// (keepalives, discovery replies, RTCP).
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != 2 {
            return None;
        }
        // RTCP shares the socket; its payload types sit in 200..=204.
        if (200..=204).contains(&packet[1]) {
            return None;
        }
        let csrc_count = usize::from(packet[0] & 0x0F);
        let header_len = RTP_HEADER_LEN + csrc_count * 4;
        if packet.len() < header_len {
            return None;
        }
        Some(Self {
            header: RtpHeader {
                sequence: u16::from_be_bytes([packet[2], packet[3]]),
                timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
                ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
            },
            header_len,
            has_extension: packet[0] & 0x10 != 0,
        })
    }
}

/// `true` if `next` comes after `last` in wrapping sequence space.
pub fn is_in_order(last: u16, next: u16) -> bool {
    let delta = next.wrapping_sub(last);
    delta != 0 && delta < 0x8000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    /// In order, with this many frames lost in between.
    Gap(u16),
    /// Duplicate or late; drop it.
    Stale,
    /// Discontinuity; restart decoding from this packet.
    Resync,
}

pub fn check_sequence(last: Option<u16>, next: u16) -> SequenceCheck {
    let Some(last) = last else {
        return SequenceCheck::InOrder;
    };
    if is_in_order(last, next) {
        match next.wrapping_sub(last) - 1 {
            0 => SequenceCheck::InOrder,
            lost if lost <= MAX_CONCEALED_FRAMES => SequenceCheck::Gap(lost),
            _ => SequenceCheck::Resync,
        }
    } else if last.wrapping_sub(next) > RESYNC_BACKWARD_THRESHOLD {
        SequenceCheck::Resync
    } else {
        SequenceCheck::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_parse() {
        let header = RtpHeader {
            sequence: 65_535,
            timestamp: 0xDEAD_BEEF,
            ssrc: 42,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x78);

        let parsed = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.header, header);
        assert_eq!(parsed.header_len, 12);
        assert!(!parsed.has_extension);
    }

    #[test]
    fn csrc_and_extension_bits_are_honoured() {
        let mut bytes = RtpHeader {
            sequence: 1,
            timestamp: 2,
            ssrc: 3,
        }
        .to_bytes()
        .to_vec();
        bytes[0] = 0x80 | 0x10 | 0x02;
        bytes.extend_from_slice(&[0u8; 8]);
        let parsed = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.header_len, 20);
        assert!(parsed.has_extension);
    }

    #[test]
    fn non_rtp_packets_are_rejected() {
        assert!(RtpPacket::parse(&[0x80, 0x78]).is_none());
        let mut rtcp = [0u8; 12];
        rtcp[0] = 0x80;
        rtcp[1] = 201;
        assert!(RtpPacket::parse(&rtcp).is_none());
    }

    #[test]
    fn ordering_wraps_around() {
        assert!(is_in_order(65_535, 0));
        assert!(is_in_order(10, 11));
        assert!(!is_in_order(11, 11));
        assert!(!is_in_order(11, 10));
    }

    #[test]
    fn sequence_classification() {
        assert_eq!(check_sequence(None, 7), SequenceCheck::InOrder);
        assert_eq!(check_sequence(Some(7), 8), SequenceCheck::InOrder);
        assert_eq!(check_sequence(Some(65_534), 1), SequenceCheck::Gap(2));
        assert_eq!(check_sequence(Some(7), 7), SequenceCheck::Stale);
        assert_eq!(check_sequence(Some(7), 3), SequenceCheck::Stale);
        assert_eq!(check_sequence(Some(7), 100), SequenceCheck::Resync);
        assert_eq!(check_sequence(Some(5_000), 10), SequenceCheck::Resync);
    }
}
