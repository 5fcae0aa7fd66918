//! Transport encryption of RTP payloads.
//!
//! | Mode | Nonce | Packet layout |
//! |---|---|---|
//! | `aead_aes256_gcm_rtpsize` | 32-bit counter, big-endian, zero-padded to 12 bytes | header, ciphertext, tag, counter |
//! | `xsalsa20_poly1305` | RTP header zero-padded to 24 bytes | header, tag, ciphertext |

use davey::{AeadInPlace as AesAeadInPlace, Aes256Gcm, KeyInit as AesKeyInit};
use thiserror::Error;
use xsalsa20poly1305::XSalsa20Poly1305;

use super::{constants::RTP_HEADER_LEN, rtp::RtpPacket};

const TAG_LEN: usize = 16;
const AES_NONCE_SUFFIX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    AeadAes256GcmRtpSize,
    XSalsa20Poly1305,
}

impl EncryptionMode {
    /// In order of preference.
    pub const SUPPORTED: [EncryptionMode; 2] = [Self::AeadAes256GcmRtpSize, Self::XSalsa20Poly1305];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AeadAes256GcmRtpSize => "aead_aes256_gcm_rtpsize",
            Self::XSalsa20Poly1305 => "xsalsa20_poly1305",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::SUPPORTED.into_iter().find(|m| m.as_str() == name)
    }

    /// Picks the most preferred mode the server offers.
    pub fn negotiate<'a>(offered: impl IntoIterator<Item = &'a str> + Clone) -> Option<Self> {
        Self::SUPPORTED
            .into_iter()
            .find(|mode| offered.clone().into_iter().any(|name| name == mode.as_str()))
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("packet too short for {0}")]
    Truncated(EncryptionMode),
    #[error("{0} encryption failed")]
    Seal(EncryptionMode),
    #[error("{0} authentication failed")]
    Open(EncryptionMode),
}

/// Exactly one cipher is active per transport session.
enum ActiveCipher {
    XSalsa20Poly1305(XSalsa20Poly1305),
    Aes256Gcm(Aes256Gcm),
}

pub struct PacketCipher {
    cipher: ActiveCipher,
    nonce: u32,
}

impl PacketCipher {
    pub fn new(mode: EncryptionMode, secret_key: &[u8; 32]) -> Self {
        let key = *secret_key;
        let cipher = match mode {
            EncryptionMode::AeadAes256GcmRtpSize => {
                ActiveCipher::Aes256Gcm(Aes256Gcm::new(&key.into()))
            }
            EncryptionMode::XSalsa20Poly1305 => {
                ActiveCipher::XSalsa20Poly1305(XSalsa20Poly1305::new(&key.into()))
            }
        };
        Self { cipher, nonce: 0 }
    }

    pub fn mode(&self) -> EncryptionMode {
        match self.cipher {
            ActiveCipher::XSalsa20Poly1305(_) => EncryptionMode::XSalsa20Poly1305,
            ActiveCipher::Aes256Gcm(_) => EncryptionMode::AeadAes256GcmRtpSize,
        }
    }

    /// Appends the encrypted packet for `header` + `payload` to `out`.
    pub fn seal(
        &mut self,
        header: &[u8; RTP_HEADER_LEN],
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let mode = self.mode();
        out.extend_from_slice(header);
        let body_start = out.len();

        match &self.cipher {
            ActiveCipher::XSalsa20Poly1305(cipher) => {
                let mut nonce = [0u8; 24];
                nonce[..RTP_HEADER_LEN].copy_from_slice(header);

                out.extend_from_slice(&[0u8; TAG_LEN]);
                out.extend_from_slice(payload);
                let tag = cipher
                    .encrypt_in_place_detached(
                        &nonce.into(),
                        b"",
                        &mut out[body_start + TAG_LEN..],
                    )
                    .map_err(|_| CryptoError::Seal(mode))?;
                out[body_start..body_start + TAG_LEN].copy_from_slice(&tag);
            }
            ActiveCipher::Aes256Gcm(cipher) => {
                self.nonce = self.nonce.wrapping_add(1);
                let counter = self.nonce.to_be_bytes();
                let mut nonce = [0u8; 12];
                nonce[..AES_NONCE_SUFFIX_LEN].copy_from_slice(&counter);

                out.extend_from_slice(payload);
                let tag = cipher
                    .encrypt_in_place_detached(&nonce.into(), header, &mut out[body_start..])
                    .map_err(|_| CryptoError::Seal(mode))?;
                out.extend_from_slice(&tag);
                out.extend_from_slice(&counter);
            }
        }
        Ok(())
    }

    /// Decrypts `packet` and returns its Opus payload with any header
    /// extension body removed.
    pub fn open(&self, packet: &[u8], rtp: &RtpPacket) -> Result<Vec<u8>, CryptoError> {
        let mode = self.mode();
        match &self.cipher {
            ActiveCipher::XSalsa20Poly1305(cipher) => {
                if packet.len() < RTP_HEADER_LEN + TAG_LEN {
                    return Err(CryptoError::Truncated(mode));
                }
                let mut nonce = [0u8; 24];
                nonce[..RTP_HEADER_LEN].copy_from_slice(&packet[..RTP_HEADER_LEN]);
                let tag: [u8; TAG_LEN] = packet[RTP_HEADER_LEN..RTP_HEADER_LEN + TAG_LEN]
                    .try_into()
                    .map_err(|_| CryptoError::Truncated(mode))?;

                let mut plain = packet[RTP_HEADER_LEN + TAG_LEN..].to_vec();
                cipher
                    .decrypt_in_place_detached(&nonce.into(), b"", &mut plain, &tag.into())
                    .map_err(|_| CryptoError::Open(mode))?;

                // CSRCs and the whole extension are inside the ciphertext.
                let mut offset = rtp.header_len - RTP_HEADER_LEN;
                if rtp.has_extension {
                    let words =
                        extension_words(&plain, offset).ok_or(CryptoError::Truncated(mode))?;
                    offset += 4 + words * 4;
                }
                strip_prefix(plain, offset).ok_or(CryptoError::Truncated(mode))
            }
            ActiveCipher::Aes256Gcm(cipher) => {
                let aad_len = rtp.header_len + if rtp.has_extension { 4 } else { 0 };
                if packet.len() < aad_len + TAG_LEN + AES_NONCE_SUFFIX_LEN {
                    return Err(CryptoError::Truncated(mode));
                }
                let tag_start = packet.len() - AES_NONCE_SUFFIX_LEN - TAG_LEN;
                let mut nonce = [0u8; 12];
                nonce[..AES_NONCE_SUFFIX_LEN]
                    .copy_from_slice(&packet[packet.len() - AES_NONCE_SUFFIX_LEN..]);
                let tag: [u8; TAG_LEN] = packet[tag_start..tag_start + TAG_LEN]
                    .try_into()
                    .map_err(|_| CryptoError::Truncated(mode))?;

                let mut plain = packet[aad_len..tag_start].to_vec();
                cipher
                    .decrypt_in_place_detached(
                        &nonce.into(),
                        &packet[..aad_len],
                        &mut plain,
                        &tag.into(),
                    )
                    .map_err(|_| CryptoError::Open(mode))?;

                // Only the extension header is authenticated in the clear;
                // its body leads the plaintext.
                let skip = if rtp.has_extension {
                    extension_words(packet, rtp.header_len)
                        .ok_or(CryptoError::Truncated(mode))?
                        * 4
                } else {
                    0
                };
                strip_prefix(plain, skip).ok_or(CryptoError::Truncated(mode))
            }
        }
    }
}

fn extension_words(buf: &[u8], at: usize) -> Option<usize> {
    let bytes = buf.get(at + 2..at + 4)?;
    Some(usize::from(u16::from_be_bytes([bytes[0], bytes[1]])))
}

fn strip_prefix(mut plain: Vec<u8>, len: usize) -> Option<Vec<u8>> {
    if plain.len() < len {
        return None;
    }
    plain.drain(..len);
    Some(plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::rtp::RtpHeader;

    const KEY: [u8; 32] = [7u8; 32];

    fn header() -> [u8; RTP_HEADER_LEN] {
        RtpHeader {
            sequence: 10,
            timestamp: 9_600,
            ssrc: 1234,
        }
        .to_bytes()
    }

    fn seal_and_open(mode: EncryptionMode) {
        let mut cipher = PacketCipher::new(mode, &KEY);
        let mut packet = Vec::new();
        cipher.seal(&header(), b"opus payload", &mut packet).unwrap();
        assert_eq!(&packet[..RTP_HEADER_LEN], &header());
        assert_ne!(&packet[RTP_HEADER_LEN..], b"opus payload");

        let rtp = RtpPacket::parse(&packet).unwrap();
        let receiver = PacketCipher::new(mode, &KEY);
        assert_eq!(receiver.open(&packet, &rtp).unwrap(), b"opus payload");
    }

    #[test]
    fn aes_gcm_round_trip() {
        seal_and_open(EncryptionMode::AeadAes256GcmRtpSize);
    }

    #[test]
    fn xsalsa_round_trip() {
        seal_and_open(EncryptionMode::XSalsa20Poly1305);
    }

    #[test]
    fn aes_counter_is_appended_and_increments() {
        let mut cipher = PacketCipher::new(EncryptionMode::AeadAes256GcmRtpSize, &KEY);
        let mut first = Vec::new();
        let mut second = Vec::new();
        cipher.seal(&header(), b"a", &mut first).unwrap();
        cipher.seal(&header(), b"a", &mut second).unwrap();
        assert_eq!(&first[first.len() - 4..], &1u32.to_be_bytes());
        assert_eq!(&second[second.len() - 4..], &2u32.to_be_bytes());
        assert_eq!(first.len(), RTP_HEADER_LEN + 1 + TAG_LEN + 4);
    }

    #[test]
    fn tampered_packets_fail_authentication() {
        for mode in EncryptionMode::SUPPORTED {
            let mut cipher = PacketCipher::new(mode, &KEY);
            let mut packet = Vec::new();
            cipher.seal(&header(), b"payload", &mut packet).unwrap();
            packet[2] ^= 0x01;
            let rtp = RtpPacket::parse(&packet).unwrap();
            assert_eq!(cipher.open(&packet, &rtp), Err(CryptoError::Open(mode)));
        }
    }

    #[test]
    fn aes_extension_body_is_stripped() {
        let cipher = PacketCipher::new(EncryptionMode::AeadAes256GcmRtpSize, &KEY);
        let aes = Aes256Gcm::new(&KEY.into());

        let mut prefix = header().to_vec();
        prefix[0] |= 0x10;
        prefix.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01]);
        let mut body = vec![0xAA, 0xBB, 0xCC, 0xDD];
        body.extend_from_slice(b"opus");

        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&5u32.to_be_bytes());
        let tag = aes
            .encrypt_in_place_detached(&nonce.into(), &prefix, &mut body)
            .unwrap();

        let mut packet = prefix;
        packet.extend_from_slice(&body);
        packet.extend_from_slice(&tag);
        packet.extend_from_slice(&5u32.to_be_bytes());

        let rtp = RtpPacket::parse(&packet).unwrap();
        assert_eq!(cipher.open(&packet, &rtp).unwrap(), b"opus");
    }

    #[test]
    fn negotiation_prefers_aes() {
        let offered = [
            "xsalsa20_poly1305",
            "aead_aes256_gcm_rtpsize",
            "aead_xchacha20_poly1305_rtpsize",
        ];
        assert_eq!(
            EncryptionMode::negotiate(offered.iter().copied()),
            Some(EncryptionMode::AeadAes256GcmRtpSize)
        );
        assert_eq!(
            EncryptionMode::negotiate(["xsalsa20_poly1305"].iter().copied()),
            Some(EncryptionMode::XSalsa20Poly1305)
        );
        assert_eq!(EncryptionMode::negotiate(["none"].iter().copied()), None);
    }
}
